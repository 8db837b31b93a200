//! Entity records shared by the repositories and the orchestration layer.
//!
//! Every entity uses `id == 0` to mean "not yet stored". Repositories insert
//! such records and assign the id; any other id is an update of that row.
//!
//! Addresses are stored as dotted-quad text and decoded into [`Ipv4Addr`]
//! when rows are read, so a malformed value surfaces as a decode error
//! instead of propagating through the allocator.

use std::net::{AddrParseError, Ipv4Addr};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::error::{Error, Result};

/// Lease time applied to DHCP ranges saved without one.
pub const DEFAULT_LEASE_TIME: &str = "24h";

/// Lease time value meaning the lease never expires.
pub const INFINITE_LEASE_TIME: &str = "infinite";

/// Parses a lease time such as `"24h"` or `"90m"`.
///
/// Returns `Ok(None)` for [`INFINITE_LEASE_TIME`].
pub fn parse_lease_time(value: &str) -> Result<Option<Duration>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case(INFINITE_LEASE_TIME) {
        return Ok(None);
    }
    humantime::parse_duration(value)
        .map(Some)
        .map_err(|error| Error::Validation(format!("invalid lease time '{}': {}", value, error)))
}

/// Current time at the precision the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

fn decode_ipv4(row: &SqliteRow, column: &str) -> sqlx::Result<Ipv4Addr> {
    let text: String = row.try_get(column)?;
    text.parse().map_err(|error: AddrParseError| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(error),
    })
}

fn decode_optional_ipv4(row: &SqliteRow, column: &str) -> sqlx::Result<Option<Ipv4Addr>> {
    match row.try_get::<Option<String>, _>(column)? {
        Some(text) if !text.is_empty() => text.parse().map(Some).map_err(
            |error: AddrParseError| sqlx::Error::ColumnDecode {
                index: column.to_string(),
                source: Box::new(error),
            },
        ),
        _ => Ok(None),
    }
}

/// A named bridge/subnet that addresses are drawn from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Network {
    pub id: i64,
    /// Unique, case-sensitive.
    pub name: String,
    /// Bridge interface name, e.g. `br0`.
    pub bridge: String,
    /// Subnet in CIDR form. Not checked against the network's ranges.
    pub subnet: String,
    pub gateway: Option<Ipv4Addr>,
    /// Comma-separated DNS server addresses.
    pub dns_servers: Option<String>,
    pub description: Option<String>,
}

impl Network {
    /// Parses [`Network::dns_servers`], skipping entries that are not addresses.
    pub fn dns_server_addrs(&self) -> Vec<Ipv4Addr> {
        self.dns_servers
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter_map(|server| server.trim().parse().ok())
            .collect()
    }
}

impl<'r> FromRow<'r, SqliteRow> for Network {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            bridge: row.try_get("bridge")?,
            subnet: row.try_get("subnet")?,
            gateway: decode_optional_ipv4(row, "gateway")?,
            dns_servers: row.try_get("dns_servers")?,
            description: row.try_get("description")?,
        })
    }
}

/// An inclusive address interval within a network.
///
/// `start_ip > end_ip` is accepted and simply yields no addresses, and the
/// bounds are not required to lie inside the network's subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub id: i64,
    pub network_id: i64,
    pub start_ip: Ipv4Addr,
    pub end_ip: Ipv4Addr,
    /// Lease duration handed to leases drawn from this range.
    pub lease_time: String,
}

impl DhcpRange {
    pub fn new(network_id: i64, start_ip: Ipv4Addr, end_ip: Ipv4Addr) -> Self {
        Self {
            id: 0,
            network_id,
            start_ip,
            end_ip,
            lease_time: DEFAULT_LEASE_TIME.to_string(),
        }
    }

    pub fn with_lease_time(mut self, lease_time: impl Into<String>) -> Self {
        self.lease_time = lease_time.into();
        self
    }

    /// Number of addresses in the range, zero when the bounds are reversed.
    pub fn size(&self) -> u64 {
        let start = u32::from(self.start_ip) as u64;
        let end = u32::from(self.end_ip) as u64;
        if start > end { 0 } else { end - start + 1 }
    }
}

impl<'r> FromRow<'r, SqliteRow> for DhcpRange {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            network_id: row.try_get("network_id")?,
            start_ip: decode_ipv4(row, "start_ip")?,
            end_ip: decode_ipv4(row, "end_ip")?,
            lease_time: row.try_get("lease_time")?,
        })
    }
}

/// A durable binding of one machine to one address within one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddressLease {
    pub id: i64,
    pub machine_id: i64,
    pub network_id: i64,
    pub ip_address: Ipv4Addr,
    pub lease_time: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IpAddressLease {
    /// Builds an unsaved lease; timestamps are assigned when it is stored.
    pub fn new(machine_id: i64, network_id: i64, ip_address: Ipv4Addr, lease_time: &str) -> Self {
        let now = now();
        Self {
            id: 0,
            machine_id,
            network_id,
            ip_address,
            lease_time: lease_time.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// When the lease runs out, or `None` for an infinite lease.
    pub fn expires_at(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(duration) = parse_lease_time(&self.lease_time)? else {
            return Ok(None);
        };
        let delta = chrono::TimeDelta::from_std(duration)
            .map_err(|error| Error::Validation(format!("lease time out of range: {}", error)))?;
        Ok(Some(self.updated_at + delta))
    }
}

impl<'r> FromRow<'r, SqliteRow> for IpAddressLease {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            machine_id: row.try_get("machine_id")?,
            network_id: row.try_get("network_id")?,
            ip_address: decode_ipv4(row, "ip_address")?,
            lease_time: row.try_get("lease_time")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A registered virtual machine.
///
/// `ipv4` holds either a static address supplied at creation or the address
/// written back after allocation from `network_id`. It is `None` only
/// between creating the row and storing the leased address.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Machine {
    pub id: i64,
    /// Unique.
    pub name: String,
    pub hostname: String,
    pub ipv4: Option<Ipv4Addr>,
    pub network_id: Option<i64>,
}

impl<'r> FromRow<'r, SqliteRow> for Machine {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            hostname: row.try_get("hostname")?,
            ipv4: decode_optional_ipv4(row, "ipv4")?,
            network_id: row.try_get("network_id")?,
        })
    }
}

/// An SSH public key served to a machine through its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SshKey {
    pub id: i64,
    pub machine_id: i64,
    pub key_text: String,
}

impl<'r> FromRow<'r, SqliteRow> for SshKey {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            machine_id: row.try_get("machine_id")?,
            key_text: row.try_get("key_text")?,
        })
    }
}
