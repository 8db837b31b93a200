use std::collections::HashSet;
use std::net::Ipv4Addr;

use sqlx::Statement;
use tracing::warn;

use crate::db::Database;
use crate::error::{
    Error, Result, StorageContext, is_foreign_key_violation, is_unique_violation,
};
use crate::model::{IpAddressLease, now, parse_lease_time};

const SELECT_BY_ID: &str = "SELECT id, machine_id, network_id, ip_address, lease_time, created_at, updated_at
    FROM ip_address_leases WHERE id = ?";
const SELECT_ALL: &str = "SELECT id, machine_id, network_id, ip_address, lease_time, created_at, updated_at
    FROM ip_address_leases ORDER BY created_at DESC, id DESC";
const SELECT_BY_MACHINE: &str = "SELECT id, machine_id, network_id, ip_address, lease_time, created_at, updated_at
    FROM ip_address_leases WHERE machine_id = ? ORDER BY created_at DESC, id DESC";
const SELECT_BY_NETWORK: &str = "SELECT id, machine_id, network_id, ip_address, lease_time, created_at, updated_at
    FROM ip_address_leases WHERE network_id = ? ORDER BY created_at DESC, id DESC";
const SELECT_BY_ADDRESS: &str = "SELECT id, machine_id, network_id, ip_address, lease_time, created_at, updated_at
    FROM ip_address_leases WHERE ip_address = ?";
const SELECT_ADDRESSES_BY_NETWORK: &str =
    "SELECT ip_address FROM ip_address_leases WHERE network_id = ?";
const SELECT_ALL_ADDRESSES: &str = "SELECT ip_address FROM ip_address_leases";
const COUNT_BY_ID: &str = "SELECT COUNT(*) FROM ip_address_leases WHERE id = ?";
const COUNT_NETWORK_ADDRESS: &str =
    "SELECT COUNT(*) FROM ip_address_leases WHERE network_id = ? AND ip_address = ?";
const COUNT_MACHINE_ADDRESS: &str = "SELECT COUNT(*) FROM machines WHERE ipv4 = ?";
const INSERT: &str = "INSERT INTO ip_address_leases
    (machine_id, network_id, ip_address, lease_time, created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?)";
const UPDATE: &str = "UPDATE ip_address_leases
    SET machine_id = ?, network_id = ?, ip_address = ?, lease_time = ?, updated_at = ?
    WHERE id = ?";
const DELETE: &str = "DELETE FROM ip_address_leases WHERE id = ?";
const DELETE_BY_MACHINE_AND_NETWORK: &str =
    "DELETE FROM ip_address_leases WHERE machine_id = ? AND network_id = ?";

/// Persistence for [`IpAddressLease`] records.
///
/// The store enforces that an address is leased at most once system-wide
/// and that a machine holds at most one lease per network. Inserts check
/// [`LeaseRepository::is_ip_address_available`] first so that ordinary
/// collisions are reported before they reach those constraints.
#[derive(Clone)]
pub struct LeaseRepository {
    db: Database,
}

impl LeaseRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts the lease when `id == 0`, otherwise updates it in place.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the machine or network id is zero or does
    ///   not reference an existing row
    /// - [`Error::Conflict`] if the address is already leased or statically
    ///   assigned, or the machine already holds a lease on the network
    /// - [`Error::NotFound`] when updating an id that does not exist
    pub async fn save(&self, lease: IpAddressLease) -> Result<IpAddressLease> {
        if lease.machine_id == 0 {
            return Err(Error::Validation("machine ID is required".to_string()));
        }
        if lease.network_id == 0 {
            return Err(Error::Validation("network ID is required".to_string()));
        }
        parse_lease_time(&lease.lease_time)?;

        if lease.id == 0 {
            self.create(lease).await
        } else {
            self.update(lease).await
        }
    }

    fn map_write_error(error: sqlx::Error, lease: &IpAddressLease, context: &str) -> Error {
        if is_unique_violation(&error) {
            Error::Conflict(format!(
                "IP address {} is already leased, or machine {} already holds a lease on network {}",
                lease.ip_address, lease.machine_id, lease.network_id
            ))
        } else if is_foreign_key_violation(&error) {
            Error::Validation(format!(
                "machine {} or network {} does not exist",
                lease.machine_id, lease.network_id
            ))
        } else {
            Error::Storage {
                context: context.to_string(),
                source: error,
            }
        }
    }

    async fn create(&self, mut lease: IpAddressLease) -> Result<IpAddressLease> {
        if !self
            .is_ip_address_available(lease.network_id, lease.ip_address)
            .await?
        {
            return Err(Error::Conflict(format!(
                "IP address {} is already leased",
                lease.ip_address
            )));
        }

        let timestamp = now();
        lease.created_at = timestamp;
        lease.updated_at = timestamp;

        let statement = self.db.statement(INSERT).await?;
        let result = statement
            .query()
            .bind(lease.machine_id)
            .bind(lease.network_id)
            .bind(lease.ip_address.to_string())
            .bind(&lease.lease_time)
            .bind(lease.created_at)
            .bind(lease.updated_at)
            .execute(self.db.pool())
            .await
            .map_err(|error| Self::map_write_error(error, &lease, "failed to create IP lease"))?;

        lease.id = result.last_insert_rowid();
        Ok(lease)
    }

    async fn update(&self, mut lease: IpAddressLease) -> Result<IpAddressLease> {
        lease.updated_at = now();

        let statement = self.db.statement(UPDATE).await?;
        let result = statement
            .query()
            .bind(lease.machine_id)
            .bind(lease.network_id)
            .bind(lease.ip_address.to_string())
            .bind(&lease.lease_time)
            .bind(lease.updated_at)
            .bind(lease.id)
            .execute(self.db.pool())
            .await
            .map_err(|error| Self::map_write_error(error, &lease, "failed to update IP lease"))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("IP lease", lease.id));
        }
        Ok(lease)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<IpAddressLease> {
        let statement = self.db.statement(SELECT_BY_ID).await?;
        statement
            .query_as::<IpAddressLease>()
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .context("failed to find IP lease")?
            .ok_or_else(|| Error::not_found("IP lease", id))
    }

    /// All leases, newest first.
    pub async fn find_all(&self) -> Result<Vec<IpAddressLease>> {
        let statement = self.db.statement(SELECT_ALL).await?;
        statement
            .query_as::<IpAddressLease>()
            .fetch_all(self.db.pool())
            .await
            .context("failed to list IP leases")
    }

    pub async fn find_by_machine_id(&self, machine_id: i64) -> Result<Vec<IpAddressLease>> {
        let statement = self.db.statement(SELECT_BY_MACHINE).await?;
        statement
            .query_as::<IpAddressLease>()
            .bind(machine_id)
            .fetch_all(self.db.pool())
            .await
            .context("failed to find IP leases for machine")
    }

    pub async fn find_by_network_id(&self, network_id: i64) -> Result<Vec<IpAddressLease>> {
        let statement = self.db.statement(SELECT_BY_NETWORK).await?;
        statement
            .query_as::<IpAddressLease>()
            .bind(network_id)
            .fetch_all(self.db.pool())
            .await
            .context("failed to find IP leases for network")
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no lease holds this address.
    pub async fn find_by_ip_address(&self, ip_address: Ipv4Addr) -> Result<IpAddressLease> {
        let statement = self.db.statement(SELECT_BY_ADDRESS).await?;
        statement
            .query_as::<IpAddressLease>()
            .bind(ip_address.to_string())
            .fetch_optional(self.db.pool())
            .await
            .context("failed to find IP lease by address")?
            .ok_or_else(|| Error::not_found("IP lease for address", ip_address))
    }

    pub async fn exists_by_id(&self, id: i64) -> Result<bool> {
        let statement = self.db.statement(COUNT_BY_ID).await?;
        let count: i64 = statement
            .query_scalar()
            .bind(id)
            .fetch_one(self.db.pool())
            .await
            .context("failed to check IP lease existence")?;
        Ok(count > 0)
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no lease has this id.
    pub async fn delete_by_id(&self, id: i64) -> Result<()> {
        let statement = self.db.statement(DELETE).await?;
        let result = statement
            .query()
            .bind(id)
            .execute(self.db.pool())
            .await
            .context("failed to delete IP lease")?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("IP lease", id));
        }
        Ok(())
    }

    /// Deletes the lease held by `machine_id` on `network_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the machine holds no lease there.
    pub async fn delete_by_machine_and_network(
        &self,
        machine_id: i64,
        network_id: i64,
    ) -> Result<()> {
        let statement = self.db.statement(DELETE_BY_MACHINE_AND_NETWORK).await?;
        let result = statement
            .query()
            .bind(machine_id)
            .bind(network_id)
            .execute(self.db.pool())
            .await
            .context("failed to deallocate IP")?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(
                "IP lease",
                format!("for machine {} on network {}", machine_id, network_id),
            ));
        }
        Ok(())
    }

    /// True only if no lease on `network_id` holds the address and no
    /// machine anywhere has it as its IPv4.
    pub async fn is_ip_address_available(
        &self,
        network_id: i64,
        ip_address: Ipv4Addr,
    ) -> Result<bool> {
        let address = ip_address.to_string();

        let statement = self.db.statement(COUNT_NETWORK_ADDRESS).await?;
        let leased: i64 = statement
            .query_scalar()
            .bind(network_id)
            .bind(&address)
            .fetch_one(self.db.pool())
            .await
            .context("failed to check IP lease availability")?;

        let statement = self.db.statement(COUNT_MACHINE_ADDRESS).await?;
        let assigned: i64 = statement
            .query_scalar()
            .bind(&address)
            .fetch_one(self.db.pool())
            .await
            .context("failed to check machine IP availability")?;

        Ok(leased == 0 && assigned == 0)
    }

    /// Addresses leased on `network_id`.
    pub async fn leased_addresses(&self, network_id: i64) -> Result<HashSet<Ipv4Addr>> {
        let statement = self.db.statement(SELECT_ADDRESSES_BY_NETWORK).await?;
        let addresses: Vec<String> = statement
            .query_scalar()
            .bind(network_id)
            .fetch_all(self.db.pool())
            .await
            .context("failed to get leased IPs")?;
        Ok(parse_addresses(addresses, "ip_address_leases"))
    }

    /// Addresses leased on any network.
    pub async fn all_leased_addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        let statement = self.db.statement(SELECT_ALL_ADDRESSES).await?;
        let addresses: Vec<String> = statement
            .query_scalar()
            .fetch_all(self.db.pool())
            .await
            .context("failed to get all leased IPs")?;
        Ok(parse_addresses(addresses, "ip_address_leases"))
    }
}

/// Parses stored address text, logging and skipping anything malformed.
pub(crate) fn parse_addresses(addresses: Vec<String>, table: &str) -> HashSet<Ipv4Addr> {
    addresses
        .into_iter()
        .filter_map(|address| match address.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!("Ignoring malformed address '{}' in {}", address, table);
                None
            }
        })
        .collect()
}
