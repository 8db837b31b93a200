use std::collections::HashSet;
use std::net::Ipv4Addr;

use sqlx::Statement;

use crate::db::Database;
use crate::error::{Error, Result, StorageContext, is_unique_violation};
use crate::model::Machine;

use super::lease::parse_addresses;

const SELECT_BY_ID: &str = "SELECT id, name, hostname, ipv4, network_id FROM machines WHERE id = ?";
const SELECT_BY_NAME: &str =
    "SELECT id, name, hostname, ipv4, network_id FROM machines WHERE name = ?";
const SELECT_BY_IPV4: &str =
    "SELECT id, name, hostname, ipv4, network_id FROM machines WHERE ipv4 = ?";
const SELECT_ALL: &str = "SELECT id, name, hostname, ipv4, network_id FROM machines ORDER BY id";
const SELECT_ADDRESSES: &str =
    "SELECT ipv4 FROM machines WHERE ipv4 IS NOT NULL AND ipv4 != ''";
const COUNT_BY_ID: &str = "SELECT COUNT(*) FROM machines WHERE id = ?";
const INSERT: &str = "INSERT INTO machines (name, hostname, ipv4, network_id) VALUES (?, ?, ?, ?)";
const UPDATE: &str = "UPDATE machines
    SET name = ?, hostname = ?, ipv4 = ?, network_id = ?, updated_at = CURRENT_TIMESTAMP
    WHERE id = ?";
const DELETE: &str = "DELETE FROM machines WHERE id = ?";

/// Persistence for [`Machine`] records.
///
/// Deleting a machine removes its SSH keys and IP leases with it.
#[derive(Clone)]
pub struct MachineRepository {
    db: Database,
}

impl MachineRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts the machine when `id == 0`, otherwise updates it in place.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if name or hostname is empty
    /// - [`Error::Conflict`] if the name or IPv4 address is taken
    /// - [`Error::NotFound`] when updating an id that does not exist
    pub async fn save(&self, machine: Machine) -> Result<Machine> {
        if machine.name.trim().is_empty() {
            return Err(Error::Validation("machine name is required".to_string()));
        }
        if machine.hostname.trim().is_empty() {
            return Err(Error::Validation("machine hostname is required".to_string()));
        }

        if machine.id == 0 {
            self.create(machine).await
        } else {
            self.update(machine).await
        }
    }

    fn map_write_error(error: sqlx::Error, machine: &Machine, context: &str) -> Error {
        if is_unique_violation(&error) {
            let address = machine
                .ipv4
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "-".to_string());
            return Error::Conflict(format!(
                "machine name '{}' or address {} is already in use",
                machine.name, address
            ));
        }
        Error::Storage {
            context: context.to_string(),
            source: error,
        }
    }

    async fn create(&self, mut machine: Machine) -> Result<Machine> {
        let statement = self.db.statement(INSERT).await?;
        let result = statement
            .query()
            .bind(&machine.name)
            .bind(&machine.hostname)
            .bind(machine.ipv4.map(|ip| ip.to_string()))
            .bind(machine.network_id)
            .execute(self.db.pool())
            .await
            .map_err(|error| Self::map_write_error(error, &machine, "failed to create machine"))?;

        machine.id = result.last_insert_rowid();
        Ok(machine)
    }

    async fn update(&self, machine: Machine) -> Result<Machine> {
        let statement = self.db.statement(UPDATE).await?;
        let result = statement
            .query()
            .bind(&machine.name)
            .bind(&machine.hostname)
            .bind(machine.ipv4.map(|ip| ip.to_string()))
            .bind(machine.network_id)
            .bind(machine.id)
            .execute(self.db.pool())
            .await
            .map_err(|error| Self::map_write_error(error, &machine, "failed to update machine"))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("machine", machine.id));
        }
        Ok(machine)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Machine> {
        let statement = self.db.statement(SELECT_BY_ID).await?;
        statement
            .query_as::<Machine>()
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .context("failed to find machine")?
            .ok_or_else(|| Error::not_found("machine", id))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Machine> {
        let statement = self.db.statement(SELECT_BY_NAME).await?;
        statement
            .query_as::<Machine>()
            .bind(name)
            .fetch_optional(self.db.pool())
            .await
            .context("failed to find machine by name")?
            .ok_or_else(|| Error::not_found("machine", name))
    }

    pub async fn find_by_ipv4(&self, ipv4: Ipv4Addr) -> Result<Machine> {
        let statement = self.db.statement(SELECT_BY_IPV4).await?;
        statement
            .query_as::<Machine>()
            .bind(ipv4.to_string())
            .fetch_optional(self.db.pool())
            .await
            .context("failed to find machine by address")?
            .ok_or_else(|| Error::not_found("machine with address", ipv4))
    }

    pub async fn find_all(&self) -> Result<Vec<Machine>> {
        let statement = self.db.statement(SELECT_ALL).await?;
        statement
            .query_as::<Machine>()
            .fetch_all(self.db.pool())
            .await
            .context("failed to list machines")
    }

    pub async fn exists_by_id(&self, id: i64) -> Result<bool> {
        let statement = self.db.statement(COUNT_BY_ID).await?;
        let count: i64 = statement
            .query_scalar()
            .bind(id)
            .fetch_one(self.db.pool())
            .await
            .context("failed to check machine existence")?;
        Ok(count > 0)
    }

    /// Deletes the machine together with its SSH keys and leases.
    ///
    /// Deleting a machine that does not exist is not an error.
    pub async fn delete_by_id(&self, id: i64) -> Result<()> {
        let statement = self.db.statement(DELETE).await?;
        statement
            .query()
            .bind(id)
            .execute(self.db.pool())
            .await
            .context("failed to delete machine")?;
        Ok(())
    }

    /// Every IPv4 address currently recorded on a machine.
    pub async fn assigned_addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        let statement = self.db.statement(SELECT_ADDRESSES).await?;
        let addresses: Vec<String> = statement
            .query_scalar()
            .fetch_all(self.db.pool())
            .await
            .context("failed to get machine IPs")?;
        Ok(parse_addresses(addresses, "machines"))
    }
}
