//! Machine lifecycle: creation and deletion tied to address allocation.
//!
//! A machine is created either with a static IPv4 address or with a network
//! to draw one from. The network path is a sequence of separate writes
//! (insert machine, lease address, store address on the machine), so each
//! failure undoes the steps already taken on a best-effort basis.

use std::net::Ipv4Addr;

use tracing::{info, warn};

use crate::allocator::Allocator;
use crate::error::{Error, Result};
use crate::model::Machine;
use crate::repository::{LeaseRepository, MachineRepository};

#[derive(Clone)]
pub struct MachineService {
    machines: MachineRepository,
    leases: LeaseRepository,
    allocator: Allocator,
}

impl MachineService {
    pub fn new(machines: MachineRepository, leases: LeaseRepository, allocator: Allocator) -> Self {
        Self {
            machines,
            leases,
            allocator,
        }
    }

    /// Registers a new machine.
    ///
    /// Exactly one of `ipv4` and `network_id` must be set. With a network,
    /// the machine is stored first, then leased an address which is written
    /// back onto it.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if both or neither addressing mode is given
    /// - [`Error::Conflict`] if a static address is already in use
    /// - any allocator error, after the new machine row has been removed
    pub async fn create(&self, machine: Machine) -> Result<Machine> {
        let machine = Machine { id: 0, ..machine };

        match (machine.ipv4, machine.network_id) {
            (Some(_), Some(_)) => Err(Error::Validation(
                "provide either a static IPv4 address or a network ID, not both".to_string(),
            )),
            (None, None) => Err(Error::Validation(
                "either a static IPv4 address or a network ID is required".to_string(),
            )),
            (Some(ipv4), None) => self.create_static(machine, ipv4).await,
            (None, Some(network_id)) => self.create_on_network(machine, network_id).await,
        }
    }

    async fn create_static(&self, machine: Machine, ipv4: Ipv4Addr) -> Result<Machine> {
        self.ensure_address_unused(ipv4).await?;

        let saved = self.machines.save(machine).await?;
        info!("Created machine '{}' with static address {}", saved.name, ipv4);
        Ok(saved)
    }

    async fn create_on_network(&self, machine: Machine, network_id: i64) -> Result<Machine> {
        let mut saved = self.machines.save(machine).await?;

        let lease = match self.allocator.allocate_ip_address(saved.id, network_id).await {
            Ok(lease) => lease,
            Err(error) => {
                if let Err(delete_error) = self.machines.delete_by_id(saved.id).await {
                    warn!(
                        "Failed to delete machine {} after IP allocation failure: {}",
                        saved.id, delete_error
                    );
                }
                return Err(error);
            }
        };

        saved.ipv4 = Some(lease.ip_address);
        match self.machines.save(saved.clone()).await {
            Ok(updated) => {
                info!(
                    "Created machine '{}' with address {} on network {}",
                    updated.name, lease.ip_address, network_id
                );
                Ok(updated)
            }
            Err(error) => {
                if let Err(release_error) = self
                    .allocator
                    .deallocate_ip_address(saved.id, network_id)
                    .await
                {
                    warn!(
                        "Failed to deallocate IP after machine {} update failure: {}",
                        saved.id, release_error
                    );
                }
                Err(error)
            }
        }
    }

    async fn ensure_address_unused(&self, ipv4: Ipv4Addr) -> Result<()> {
        match self.machines.find_by_ipv4(ipv4).await {
            Ok(existing) => {
                return Err(Error::Conflict(format!(
                    "IP address {} is already assigned to machine '{}'",
                    ipv4, existing.name
                )));
            }
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error),
        }

        match self.leases.find_by_ip_address(ipv4).await {
            Ok(lease) => Err(Error::Conflict(format!(
                "IP address {} is leased to machine {}",
                ipv4, lease.machine_id
            ))),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Updates name and hostname, and the address of statically addressed
    /// machines.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the machine does not exist
    /// - [`Error::Validation`] if the address or network of a machine with
    ///   a network lease would change
    /// - [`Error::Conflict`] if a new static address is already in use
    pub async fn update(&self, machine: Machine) -> Result<Machine> {
        let existing = self.machines.find_by_id(machine.id).await?;

        if existing.network_id.is_some() {
            if machine.ipv4 != existing.ipv4 || machine.network_id != existing.network_id {
                return Err(Error::Validation(format!(
                    "address of machine {} is managed by network {}",
                    existing.id,
                    existing.network_id.unwrap_or_default()
                )));
            }
        } else if machine.network_id.is_some() {
            return Err(Error::Validation(
                "a statically addressed machine cannot join a network".to_string(),
            ));
        } else if let Some(ipv4) = machine.ipv4
            && machine.ipv4 != existing.ipv4
        {
            self.ensure_address_unused(ipv4).await?;
        }

        self.machines.save(machine).await
    }

    /// Removes a machine, releasing its network lease first.
    ///
    /// A failed release is logged and the delete proceeds. Deleting a
    /// machine that does not exist succeeds.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let machine = match self.machines.find_by_id(id).await {
            Ok(machine) => machine,
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) => return Err(error),
        };

        if let (Some(network_id), Some(_)) = (machine.network_id, machine.ipv4)
            && let Err(error) = self
                .allocator
                .deallocate_ip_address(machine.id, network_id)
                .await
        {
            warn!(
                "Failed to deallocate IP for machine {}: {}",
                machine.id, error
            );
        }

        self.machines.delete_by_id(id).await?;
        info!("Deleted machine '{}'", machine.name);
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<Machine>> {
        optional(self.machines.find_by_id(id).await)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Machine>> {
        optional(self.machines.find_by_name(name).await)
    }

    /// Looks up the machine that owns `ipv4`, as metadata requests do by
    /// source address.
    pub async fn find_by_ipv4(&self, ipv4: Ipv4Addr) -> Result<Option<Machine>> {
        optional(self.machines.find_by_ipv4(ipv4).await)
    }

    pub async fn list(&self) -> Result<Vec<Machine>> {
        self.machines.find_all().await
    }
}

fn optional(result: Result<Machine>) -> Result<Option<Machine>> {
    match result {
        Ok(machine) => Ok(Some(machine)),
        Err(error) if error.is_not_found() => Ok(None),
        Err(error) => Err(error),
    }
}
