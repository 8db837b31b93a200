//! # nook
//!
//! Network and IP lease bookkeeping for a virtual machine metadata service.
//!
//! ## Features
//!
//! - Networks with DHCP-style address ranges
//! - Deterministic allocation: lowest free address, ranges in ascending order
//! - Conflict-free leases backed by SQLite uniqueness constraints
//! - Static and network-allocated machines with compensating rollback
//! - Cascading cleanup when networks or machines are deleted
//! - Async/await with Tokio and sqlx
//!
//! ## Quick Start
//!
//! ```no_run
//! use nook::{Config, Machine, Store};
//!
//! #[tokio::main]
//! async fn main() -> nook::Result<()> {
//!     let config = Config::load_or_create("nook.json")?;
//!     let store = Store::open(&config).await?;
//!
//!     let network = store.networks().find_by_name("lab").await?;
//!     let machine = store
//!         .machines()
//!         .create(Machine {
//!             name: "vm1".to_string(),
//!             hostname: "vm1.lab".to_string(),
//!             network_id: Some(network.id),
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("{} -> {:?}", machine.name, machine.ipv4);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Database location, pool sizing, lease defaults
//! - [`Store`] - Opens the database and hands out repositories and services
//! - [`Allocator`] - Scans ranges and persists leases
//! - [`MachineService`] - Machine creation and deletion tied to allocation
//! - [`repository`] - CRUD per entity
//! - [`StatementCache`] - Prepared statements shared across connections

pub mod allocator;
pub mod config;
pub mod db;
pub mod error;
pub mod machines;
pub mod model;
pub mod repository;
pub mod schema;
pub mod statement_cache;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use allocator::Allocator;
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use machines::MachineService;
pub use model::{DhcpRange, IpAddressLease, Machine, Network, SshKey};
pub use statement_cache::StatementCache;
pub use store::Store;
