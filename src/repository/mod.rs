//! Repositories over the metadata store.
//!
//! Each repository owns the SQL for one table. `save` inserts records with
//! `id == 0` and updates the rest; finders that return a single record fail
//! with [`Error::NotFound`](crate::Error::NotFound) while list finders
//! return an empty `Vec`.

mod dhcp_range;
mod lease;
mod machine;
mod network;
mod ssh_key;

pub use dhcp_range::DhcpRangeRepository;
pub use lease::LeaseRepository;
pub use machine::MachineRepository;
pub use network::NetworkRepository;
pub use ssh_key::SshKeyRepository;
