use sqlx::Statement;
use tracing::info;

use crate::db::Database;
use crate::error::{Error, Result, StorageContext, is_foreign_key_violation};
use crate::model::{DEFAULT_LEASE_TIME, DhcpRange, parse_lease_time};

const SELECT_BY_ID: &str = "SELECT id, network_id, start_ip, end_ip, lease_time
    FROM dhcp_ranges WHERE id = ?";
const SELECT_BY_NETWORK: &str = "SELECT id, network_id, start_ip, end_ip, lease_time
    FROM dhcp_ranges WHERE network_id = ?";
const SELECT_ALL: &str = "SELECT id, network_id, start_ip, end_ip, lease_time
    FROM dhcp_ranges";
const COUNT_BY_ID: &str = "SELECT COUNT(*) FROM dhcp_ranges WHERE id = ?";
const INSERT: &str = "INSERT INTO dhcp_ranges (network_id, start_ip, end_ip, lease_time)
    VALUES (?, ?, ?, ?)";
const UPDATE: &str = "UPDATE dhcp_ranges
    SET network_id = ?, start_ip = ?, end_ip = ?, lease_time = ?, updated_at = CURRENT_TIMESTAMP
    WHERE id = ?";
const DELETE: &str = "DELETE FROM dhcp_ranges WHERE id = ?";

/// Orders ranges by network, then by the numeric value of the start address.
///
/// Addresses are stored as text, so `ORDER BY start_ip` would put
/// `10.0.0.100` before `10.0.0.20`.
fn sort_ranges(ranges: &mut [DhcpRange]) {
    ranges.sort_by_key(|range| (range.network_id, u32::from(range.start_ip), range.id));
}

/// Persistence for [`DhcpRange`] records.
///
/// Ranges are accepted as given: bounds outside the parent network's subnet,
/// reversed bounds and ranges overlapping a sibling are all stored.
#[derive(Clone)]
pub struct DhcpRangeRepository {
    db: Database,
    default_lease_time: String,
}

impl DhcpRangeRepository {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            default_lease_time: DEFAULT_LEASE_TIME.to_string(),
        }
    }

    /// Lease time given to ranges saved without one.
    pub fn with_default_lease_time(mut self, lease_time: impl Into<String>) -> Self {
        self.default_lease_time = lease_time.into();
        self
    }

    /// Inserts the range when `id == 0`, otherwise updates it in place.
    ///
    /// An empty lease time is replaced with the repository default
    /// ([`DEFAULT_LEASE_TIME`] unless configured otherwise).
    pub async fn save(&self, mut range: DhcpRange) -> Result<DhcpRange> {
        if range.network_id == 0 {
            return Err(Error::Validation(
                "DHCP range network ID is required".to_string(),
            ));
        }

        if range.lease_time.trim().is_empty() {
            range.lease_time = self.default_lease_time.clone();
        }
        parse_lease_time(&range.lease_time)?;

        if range.id == 0 {
            self.create(range).await
        } else {
            self.update(range).await
        }
    }

    fn missing_network(network_id: i64) -> Error {
        Error::Validation(format!("network {} does not exist", network_id))
    }

    async fn create(&self, mut range: DhcpRange) -> Result<DhcpRange> {
        let statement = self.db.statement(INSERT).await?;
        let result = statement
            .query()
            .bind(range.network_id)
            .bind(range.start_ip.to_string())
            .bind(range.end_ip.to_string())
            .bind(&range.lease_time)
            .execute(self.db.pool())
            .await;

        let result = match result {
            Err(error) if is_foreign_key_violation(&error) => {
                return Err(Self::missing_network(range.network_id));
            }
            other => other.context("failed to create DHCP range")?,
        };

        range.id = result.last_insert_rowid();
        info!(
            "Created DHCP range {} - {} on network {}",
            range.start_ip, range.end_ip, range.network_id
        );
        Ok(range)
    }

    async fn update(&self, range: DhcpRange) -> Result<DhcpRange> {
        let statement = self.db.statement(UPDATE).await?;
        let result = statement
            .query()
            .bind(range.network_id)
            .bind(range.start_ip.to_string())
            .bind(range.end_ip.to_string())
            .bind(&range.lease_time)
            .bind(range.id)
            .execute(self.db.pool())
            .await;

        let result = match result {
            Err(error) if is_foreign_key_violation(&error) => {
                return Err(Self::missing_network(range.network_id));
            }
            other => other.context("failed to update DHCP range")?,
        };

        if result.rows_affected() == 0 {
            return Err(Error::not_found("DHCP range", range.id));
        }
        Ok(range)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<DhcpRange> {
        let statement = self.db.statement(SELECT_BY_ID).await?;
        statement
            .query_as::<DhcpRange>()
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .context("failed to find DHCP range")?
            .ok_or_else(|| Error::not_found("DHCP range", id))
    }

    pub async fn find_all(&self) -> Result<Vec<DhcpRange>> {
        let statement = self.db.statement(SELECT_ALL).await?;
        let mut ranges = statement
            .query_as::<DhcpRange>()
            .fetch_all(self.db.pool())
            .await
            .context("failed to list DHCP ranges")?;
        sort_ranges(&mut ranges);
        Ok(ranges)
    }

    /// Ranges owned by `network_id` in ascending start address order.
    ///
    /// Returns an empty list when the network has no ranges or does not exist.
    pub async fn find_by_network_id(&self, network_id: i64) -> Result<Vec<DhcpRange>> {
        let statement = self.db.statement(SELECT_BY_NETWORK).await?;
        let mut ranges = statement
            .query_as::<DhcpRange>()
            .bind(network_id)
            .fetch_all(self.db.pool())
            .await
            .context("failed to find DHCP ranges for network")?;
        sort_ranges(&mut ranges);
        Ok(ranges)
    }

    pub async fn exists_by_id(&self, id: i64) -> Result<bool> {
        let statement = self.db.statement(COUNT_BY_ID).await?;
        let count: i64 = statement
            .query_scalar()
            .bind(id)
            .fetch_one(self.db.pool())
            .await
            .context("failed to check DHCP range existence")?;
        Ok(count > 0)
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no range has this id.
    pub async fn delete_by_id(&self, id: i64) -> Result<()> {
        let statement = self.db.statement(DELETE).await?;
        let result = statement
            .query()
            .bind(id)
            .execute(self.db.pool())
            .await
            .context("failed to delete DHCP range")?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("DHCP range", id));
        }
        Ok(())
    }
}
