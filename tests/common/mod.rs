#![allow(dead_code)]

use std::net::Ipv4Addr;

use tempfile::TempDir;

use nook::repository::MachineRepository;
use nook::{Config, DhcpRange, Machine, Network, Store};

pub struct TestStore {
    pub store: Store,
    _dir: TempDir,
}

impl TestStore {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            database_path: dir.path().join("nook.db").display().to_string(),
            max_connections: 4,
            ..Default::default()
        };
        let store = Store::open(&config).await.unwrap();
        Self { store, _dir: dir }
    }

    /// Stores a network and one DHCP range `start..=end` inside it.
    pub async fn network_with_range(&self, name: &str, start: Ipv4Addr, end: Ipv4Addr) -> Network {
        let network = self
            .store
            .networks()
            .save(Network {
                name: name.to_string(),
                bridge: "br0".to_string(),
                subnet: "192.168.1.0/24".to_string(),
                gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
                dns_servers: Some("1.1.1.1,8.8.8.8".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        self.store
            .dhcp_ranges()
            .save(DhcpRange::new(network.id, start, end).with_lease_time("24h"))
            .await
            .unwrap();
        network
    }

    /// Machine row with no address, as allocation sees it before write-back.
    pub async fn bare_machine(&self, name: &str) -> Machine {
        MachineRepository::new(self.store.database().clone())
            .save(Machine {
                name: name.to_string(),
                hostname: name.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
    }
}

pub fn lab(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 1, last)
}
