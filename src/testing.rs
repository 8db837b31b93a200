use std::net::Ipv4Addr;

use tempfile::TempDir;

use crate::config::Config;
use crate::db::Database;
use crate::model::{Machine, Network};
use crate::repository::{MachineRepository, NetworkRepository};

/// A migrated database in a temporary directory, removed on drop.
pub(crate) struct TestDatabase {
    pub db: Database,
    _dir: TempDir,
}

impl TestDatabase {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            database_path: dir.path().join("test.db").display().to_string(),
            max_connections: 4,
            ..Default::default()
        };
        let db = Database::connect(&config).await.unwrap();
        Self { db, _dir: dir }
    }

    /// Stores a network on `br0` with subnet 192.168.1.0/24.
    pub async fn network(&self, name: &str) -> Network {
        NetworkRepository::new(self.db.clone())
            .save(Network {
                name: name.to_string(),
                bridge: "br0".to_string(),
                subnet: "192.168.1.0/24".to_string(),
                gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    pub async fn machine(&self, name: &str, ipv4: Option<Ipv4Addr>) -> Machine {
        MachineRepository::new(self.db.clone())
            .save(Machine {
                name: name.to_string(),
                hostname: format!("{}.local", name),
                ipv4,
                ..Default::default()
            })
            .await
            .unwrap()
    }
}
