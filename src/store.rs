use crate::allocator::Allocator;
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::machines::MachineService;
use crate::repository::{
    DhcpRangeRepository, LeaseRepository, MachineRepository, NetworkRepository, SshKeyRepository,
};

/// Every repository and service over one shared [`Database`].
///
/// # Example
///
/// ```no_run
/// use nook::{Config, Store};
///
/// # async fn example() -> nook::Result<()> {
/// let store = Store::open(&Config::default()).await?;
/// for network in store.networks().find_all().await? {
///     println!("{} on {}", network.name, network.bridge);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Store {
    db: Database,
    networks: NetworkRepository,
    dhcp_ranges: DhcpRangeRepository,
    leases: LeaseRepository,
    ssh_keys: SshKeyRepository,
    allocator: Allocator,
    machines: MachineService,
}

impl Store {
    /// Connects to the configured database and migrates it.
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let db = Database::connect(config).await?;
        Ok(Self::from_database(db, config))
    }

    pub fn from_database(db: Database, config: &Config) -> Self {
        let leases = LeaseRepository::new(db.clone());
        let allocator = Allocator::new(db.clone()).with_max_attempts(config.allocation_retries);
        let machines = MachineService::new(
            MachineRepository::new(db.clone()),
            leases.clone(),
            allocator.clone(),
        );

        Self {
            networks: NetworkRepository::new(db.clone()),
            dhcp_ranges: DhcpRangeRepository::new(db.clone())
                .with_default_lease_time(config.default_lease_time.clone()),
            leases,
            ssh_keys: SshKeyRepository::new(db.clone()),
            allocator,
            machines,
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn networks(&self) -> &NetworkRepository {
        &self.networks
    }

    pub fn dhcp_ranges(&self) -> &DhcpRangeRepository {
        &self.dhcp_ranges
    }

    pub fn leases(&self) -> &LeaseRepository {
        &self.leases
    }

    pub fn ssh_keys(&self) -> &SshKeyRepository {
        &self.ssh_keys
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn machines(&self) -> &MachineService {
        &self.machines
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}
