use sqlx::Statement;
use tracing::info;

use crate::db::Database;
use crate::error::{Error, Result, StorageContext, is_unique_violation};
use crate::model::{DhcpRange, Network};

const SELECT_BY_ID: &str = "SELECT id, name, bridge, subnet, gateway, dns_servers, description
    FROM networks WHERE id = ?";
const SELECT_BY_NAME: &str = "SELECT id, name, bridge, subnet, gateway, dns_servers, description
    FROM networks WHERE name = ?";
const SELECT_BY_BRIDGE: &str = "SELECT id, name, bridge, subnet, gateway, dns_servers, description
    FROM networks WHERE bridge = ? ORDER BY id LIMIT 1";
const SELECT_ALL: &str = "SELECT id, name, bridge, subnet, gateway, dns_servers, description
    FROM networks ORDER BY name";
const COUNT_NAME: &str = "SELECT COUNT(*) FROM networks WHERE name = ? AND id != ?";
const COUNT_BY_ID: &str = "SELECT COUNT(*) FROM networks WHERE id = ?";
const INSERT: &str = "INSERT INTO networks (name, bridge, subnet, gateway, dns_servers, description)
    VALUES (?, ?, ?, ?, ?, ?)";
const UPDATE: &str = "UPDATE networks
    SET name = ?, bridge = ?, subnet = ?, gateway = ?, dns_servers = ?, description = ?,
        updated_at = CURRENT_TIMESTAMP
    WHERE id = ?";
const DELETE: &str = "DELETE FROM networks WHERE id = ?";

/// Persistence for [`Network`] records.
#[derive(Clone)]
pub struct NetworkRepository {
    db: Database,
}

impl NetworkRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts the network when `id == 0`, otherwise updates it in place.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if name, bridge or subnet is empty
    /// - [`Error::Conflict`] if another network already uses the name
    /// - [`Error::NotFound`] when updating an id that does not exist
    pub async fn save(&self, network: Network) -> Result<Network> {
        Self::validate(&network)?;
        self.ensure_unique_name(&network).await?;

        if network.id == 0 {
            self.create(network).await
        } else {
            self.update(network).await
        }
    }

    fn validate(network: &Network) -> Result<()> {
        if network.name.trim().is_empty() {
            return Err(Error::Validation("network name is required".to_string()));
        }
        if network.bridge.trim().is_empty() {
            return Err(Error::Validation("network bridge is required".to_string()));
        }
        if network.subnet.trim().is_empty() {
            return Err(Error::Validation("network subnet is required".to_string()));
        }
        Ok(())
    }

    async fn ensure_unique_name(&self, network: &Network) -> Result<()> {
        let statement = self.db.statement(COUNT_NAME).await?;
        let count: i64 = statement
            .query_scalar()
            .bind(&network.name)
            .bind(network.id)
            .fetch_one(self.db.pool())
            .await
            .context("failed to check for duplicate network name")?;

        if count > 0 {
            return Err(Self::duplicate_name(&network.name));
        }
        Ok(())
    }

    fn duplicate_name(name: &str) -> Error {
        Error::Conflict(format!("network with name '{}' already exists", name))
    }

    async fn create(&self, mut network: Network) -> Result<Network> {
        let statement = self.db.statement(INSERT).await?;
        let result = statement
            .query()
            .bind(&network.name)
            .bind(&network.bridge)
            .bind(&network.subnet)
            .bind(network.gateway.map(|gateway| gateway.to_string()))
            .bind(&network.dns_servers)
            .bind(&network.description)
            .execute(self.db.pool())
            .await;

        let result = match result {
            Err(error) if is_unique_violation(&error) => {
                return Err(Self::duplicate_name(&network.name));
            }
            other => other.context("failed to create network")?,
        };

        network.id = result.last_insert_rowid();
        info!("Created network {} ({})", network.name, network.id);
        Ok(network)
    }

    async fn update(&self, network: Network) -> Result<Network> {
        let statement = self.db.statement(UPDATE).await?;
        let result = statement
            .query()
            .bind(&network.name)
            .bind(&network.bridge)
            .bind(&network.subnet)
            .bind(network.gateway.map(|gateway| gateway.to_string()))
            .bind(&network.dns_servers)
            .bind(&network.description)
            .bind(network.id)
            .execute(self.db.pool())
            .await;

        let result = match result {
            Err(error) if is_unique_violation(&error) => {
                return Err(Self::duplicate_name(&network.name));
            }
            other => other.context("failed to update network")?,
        };

        if result.rows_affected() == 0 {
            return Err(Error::not_found("network", network.id));
        }
        Ok(network)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Network> {
        let statement = self.db.statement(SELECT_BY_ID).await?;
        statement
            .query_as::<Network>()
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .context("failed to find network")?
            .ok_or_else(|| Error::not_found("network", id))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Network> {
        let statement = self.db.statement(SELECT_BY_NAME).await?;
        statement
            .query_as::<Network>()
            .bind(name)
            .fetch_optional(self.db.pool())
            .await
            .context("failed to find network by name")?
            .ok_or_else(|| Error::not_found("network", format!("'{}'", name)))
    }

    /// Finds the network attached to `bridge`.
    ///
    /// Bridge names are not unique; the oldest matching network wins.
    pub async fn find_by_bridge(&self, bridge: &str) -> Result<Network> {
        let statement = self.db.statement(SELECT_BY_BRIDGE).await?;
        statement
            .query_as::<Network>()
            .bind(bridge)
            .fetch_optional(self.db.pool())
            .await
            .context("failed to find network by bridge")?
            .ok_or_else(|| Error::not_found("network with bridge", format!("'{}'", bridge)))
    }

    pub async fn find_all(&self) -> Result<Vec<Network>> {
        let statement = self.db.statement(SELECT_ALL).await?;
        statement
            .query_as::<Network>()
            .fetch_all(self.db.pool())
            .await
            .context("failed to list networks")
    }

    pub async fn exists_by_id(&self, id: i64) -> Result<bool> {
        let statement = self.db.statement(COUNT_BY_ID).await?;
        let count: i64 = statement
            .query_scalar()
            .bind(id)
            .fetch_one(self.db.pool())
            .await
            .context("failed to check network existence")?;
        Ok(count > 0)
    }

    /// Deletes the network together with its ranges and leases.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if no network has this id
    /// - [`Error::Validation`] if foreign key enforcement is off, since the
    ///   cascade to ranges and leases would silently not happen
    pub async fn delete_by_id(&self, id: i64) -> Result<()> {
        let statement = self.db.statement(DELETE).await?;
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .context("failed to acquire connection")?;

        Database::require_foreign_keys(&mut conn).await?;

        let result = statement
            .query()
            .bind(id)
            .execute(&mut *conn)
            .await
            .context("failed to delete network")?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("network", id));
        }

        info!("Deleted network {}", id);
        Ok(())
    }

    /// Ranges owned by the network, in ascending start address order.
    pub async fn dhcp_ranges(&self, network_id: i64) -> Result<Vec<DhcpRange>> {
        super::DhcpRangeRepository::new(self.db.clone())
            .find_by_network_id(network_id)
            .await
    }
}
