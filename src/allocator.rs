//! Address allocation from a network's DHCP ranges.
//!
//! Allocation scans the network's ranges in ascending start order and
//! leases the first address that is neither leased on that network nor
//! recorded on any machine. Scan and insert are separate statements, so
//! allocations on one network are serialized in-process. An insert that
//! collides with an existing lease excludes every address leased anywhere
//! in the store and rescans.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::model::{DhcpRange, IpAddressLease};
use crate::repository::{DhcpRangeRepository, LeaseRepository, MachineRepository};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct Allocator {
    leases: LeaseRepository,
    ranges: DhcpRangeRepository,
    machines: MachineRepository,
    network_locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
    max_attempts: u32,
}

impl Allocator {
    pub fn new(db: Database) -> Self {
        Self {
            leases: LeaseRepository::new(db.clone()),
            ranges: DhcpRangeRepository::new(db.clone()),
            machines: MachineRepository::new(db),
            network_locks: Arc::new(Mutex::new(HashMap::new())),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Number of scan-and-insert attempts before giving up with
    /// [`Error::Conflict`]. Clamped to at least one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn network_lock(&self, network_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.network_locks.lock().await;
        Arc::clone(locks.entry(network_id).or_default())
    }

    /// Drops the lock entry for `network_id` once no other caller holds it.
    async fn release_network_lock(&self, network_id: i64, lock: Arc<Mutex<()>>) {
        let mut locks = self.network_locks.lock().await;
        // One reference in the map, one in `lock`.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&network_id);
        }
    }

    #[cfg(test)]
    async fn tracked_networks(&self) -> usize {
        self.network_locks.lock().await.len()
    }

    /// Leases the first free address in `network_id` to `machine_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if either id is zero
    /// - [`Error::NoRanges`] if the network has no DHCP ranges
    /// - [`Error::Exhausted`] if every range is fully used
    /// - [`Error::Conflict`] if the machine already holds a lease on the
    ///   network, or every attempt lost its address to another writer
    pub async fn allocate_ip_address(
        &self,
        machine_id: i64,
        network_id: i64,
    ) -> Result<IpAddressLease> {
        if machine_id == 0 {
            return Err(Error::Validation("machine ID is required".to_string()));
        }
        if network_id == 0 {
            return Err(Error::Validation("network ID is required".to_string()));
        }

        let lock = self.network_lock(network_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.allocate_locked(machine_id, network_id).await
        };
        self.release_network_lock(network_id, lock).await;
        result
    }

    async fn allocate_locked(&self, machine_id: i64, network_id: i64) -> Result<IpAddressLease> {
        let ranges = self.ranges.find_by_network_id(network_id).await?;
        if ranges.is_empty() {
            return Err(Error::NoRanges(network_id));
        }

        if self
            .leases
            .find_by_machine_id(machine_id)
            .await?
            .iter()
            .any(|lease| lease.network_id == network_id)
        {
            return Err(Error::Conflict(format!(
                "machine {} already holds a lease on network {}",
                machine_id, network_id
            )));
        }

        let mut lost = HashSet::new();
        for attempt in 1..=self.max_attempts {
            let leased = self.leases.leased_addresses(network_id).await?;
            let assigned = self.machines.assigned_addresses().await?;

            let Some((ip_address, range)) = first_free_address(&ranges, |ip| {
                leased.contains(&ip) || assigned.contains(&ip) || lost.contains(&ip)
            }) else {
                return Err(Error::Exhausted(network_id));
            };

            let lease = IpAddressLease::new(machine_id, network_id, ip_address, &range.lease_time);
            match self.leases.save(lease).await {
                Ok(lease) => {
                    info!(
                        "Leased {} to machine {} on network {} ({})",
                        lease.ip_address, machine_id, network_id, lease.lease_time
                    );
                    return Ok(lease);
                }
                Err(Error::Conflict(reason)) => {
                    warn!(
                        "Attempt {}/{} to lease {} on network {} lost: {}",
                        attempt, self.max_attempts, ip_address, network_id, reason
                    );
                    // Addresses are unique store-wide, so anything leased on
                    // another network collides too. Skip all of them at once.
                    lost.insert(ip_address);
                    lost.extend(self.leases.all_leased_addresses().await?);
                }
                Err(error) => return Err(error),
            }
        }

        Err(Error::Conflict(format!(
            "could not lease an address on network {} after {} attempts",
            network_id, self.max_attempts
        )))
    }

    /// Releases the lease `machine_id` holds on `network_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if there is no such lease.
    pub async fn deallocate_ip_address(&self, machine_id: i64, network_id: i64) -> Result<()> {
        self.leases
            .delete_by_machine_and_network(machine_id, network_id)
            .await?;
        info!(
            "Released lease for machine {} on network {}",
            machine_id, network_id
        );
        Ok(())
    }

    pub async fn is_ip_address_available(
        &self,
        network_id: i64,
        ip_address: Ipv4Addr,
    ) -> Result<bool> {
        self.leases
            .is_ip_address_available(network_id, ip_address)
            .await
    }

    pub async fn find_by_ip_address(&self, ip_address: Ipv4Addr) -> Result<IpAddressLease> {
        self.leases.find_by_ip_address(ip_address).await
    }

    pub async fn find_by_machine_id(&self, machine_id: i64) -> Result<Vec<IpAddressLease>> {
        self.leases.find_by_machine_id(machine_id).await
    }

    pub async fn find_by_network_id(&self, network_id: i64) -> Result<Vec<IpAddressLease>> {
        self.leases.find_by_network_id(network_id).await
    }
}

/// First address, scanning `ranges` in order and each range from start to
/// end inclusive, for which `taken` is false.
///
/// Reversed ranges yield nothing.
fn first_free_address(
    ranges: &[DhcpRange],
    taken: impl Fn(Ipv4Addr) -> bool,
) -> Option<(Ipv4Addr, &DhcpRange)> {
    for range in ranges {
        let start = u32::from(range.start_ip);
        let end = u32::from(range.end_ip);
        if start > end {
            continue;
        }

        let mut current = start;
        loop {
            let ip = Ipv4Addr::from(current);
            if !taken(ip) {
                return Some((ip, range));
            }
            if current == end {
                break;
            }
            current += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Machine;
    use crate::repository::NetworkRepository;
    use crate::testing::TestDatabase;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, last)
    }

    fn range(start: Ipv4Addr, end: Ipv4Addr) -> DhcpRange {
        DhcpRange::new(1, start, end)
    }

    async fn add_range(test_db: &TestDatabase, network_id: i64, start: u8, end: u8) {
        DhcpRangeRepository::new(test_db.db.clone())
            .save(DhcpRange::new(network_id, ip(start), ip(end)))
            .await
            .unwrap();
    }

    #[test]
    fn test_first_free_skips_taken() {
        let ranges = vec![range(ip(100), ip(102))];
        let (found, _) = first_free_address(&ranges, |candidate| candidate == ip(100)).unwrap();
        assert_eq!(found, ip(101));
    }

    #[test]
    fn test_first_free_moves_to_next_range() {
        let ranges = vec![range(ip(10), ip(11)), range(ip(50), ip(51))];
        let (found, chosen) =
            first_free_address(&ranges, |candidate| candidate <= ip(11)).unwrap();
        assert_eq!(found, ip(50));
        assert_eq!(chosen.start_ip, ip(50));
    }

    #[test]
    fn test_first_free_ignores_reversed_range() {
        let ranges = vec![range(ip(20), ip(10))];
        assert!(first_free_address(&ranges, |_| false).is_none());
    }

    #[test]
    fn test_first_free_at_top_of_address_space() {
        let top = Ipv4Addr::new(255, 255, 255, 255);
        let ranges = vec![range(Ipv4Addr::new(255, 255, 255, 254), top)];
        let (found, _) = first_free_address(&ranges, |candidate| candidate != top).unwrap();
        assert_eq!(found, top);
        assert!(first_free_address(&ranges, |_| true).is_none());
    }

    #[tokio::test]
    async fn test_sequential_allocation_and_exhaustion() {
        let test_db = TestDatabase::new().await;
        let network = test_db.network("N1").await;
        add_range(&test_db, network.id, 100, 102).await;
        let allocator = Allocator::new(test_db.db.clone());

        let mut issued = Vec::new();
        for name in ["m1", "m2", "m3"] {
            let machine = test_db.machine(name, None).await;
            let lease = allocator
                .allocate_ip_address(machine.id, network.id)
                .await
                .unwrap();
            assert_eq!(lease.lease_time, "24h");
            issued.push(lease.ip_address);
        }
        assert_eq!(issued, vec![ip(100), ip(101), ip(102)]);

        let m4 = test_db.machine("m4", None).await;
        let error = allocator
            .allocate_ip_address(m4.id, network.id)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Exhausted(id) if id == network.id));
        assert_eq!(
            error.to_string(),
            format!("No available IP addresses in network {}", network.id)
        );
    }

    #[tokio::test]
    async fn test_requires_ranges_and_ids() {
        let test_db = TestDatabase::new().await;
        let network = test_db.network("empty").await;
        let machine = test_db.machine("m1", None).await;
        let allocator = Allocator::new(test_db.db.clone());

        assert!(matches!(
            allocator.allocate_ip_address(0, network.id).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            allocator.allocate_ip_address(machine.id, network.id).await,
            Err(Error::NoRanges(_))
        ));
    }

    #[tokio::test]
    async fn test_reissues_released_address() {
        let test_db = TestDatabase::new().await;
        let network = test_db.network("N1").await;
        add_range(&test_db, network.id, 100, 101).await;
        let allocator = Allocator::new(test_db.db.clone());

        let m1 = test_db.machine("m1", None).await;
        let m2 = test_db.machine("m2", None).await;
        let m3 = test_db.machine("m3", None).await;
        allocator.allocate_ip_address(m1.id, network.id).await.unwrap();
        allocator.allocate_ip_address(m2.id, network.id).await.unwrap();

        allocator.deallocate_ip_address(m1.id, network.id).await.unwrap();
        let lease = allocator.allocate_ip_address(m3.id, network.id).await.unwrap();
        assert_eq!(lease.ip_address, ip(100));

        let error = allocator.deallocate_ip_address(m1.id, network.id).await;
        assert!(error.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_skips_machine_addresses() {
        let test_db = TestDatabase::new().await;
        let network = test_db.network("N1").await;
        add_range(&test_db, network.id, 100, 105).await;
        test_db.machine("static", Some(ip(100))).await;
        let allocator = Allocator::new(test_db.db.clone());

        let machine = test_db.machine("m1", None).await;
        let lease = allocator.allocate_ip_address(machine.id, network.id).await.unwrap();
        assert_eq!(lease.ip_address, ip(101));
    }

    #[tokio::test]
    async fn test_uses_range_lease_time() {
        let test_db = TestDatabase::new().await;
        let network = test_db.network("N1").await;
        DhcpRangeRepository::new(test_db.db.clone())
            .save(DhcpRange::new(network.id, ip(10), ip(20)).with_lease_time("90m"))
            .await
            .unwrap();
        let allocator = Allocator::new(test_db.db.clone());

        let machine = test_db.machine("m1", None).await;
        let lease = allocator.allocate_ip_address(machine.id, network.id).await.unwrap();
        assert_eq!(lease.lease_time, "90m");
        assert!(lease.expires_at().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_lease_on_same_network_rejected() {
        let test_db = TestDatabase::new().await;
        let network = test_db.network("N1").await;
        add_range(&test_db, network.id, 100, 110).await;
        let allocator = Allocator::new(test_db.db.clone());

        let machine = test_db.machine("m1", None).await;
        allocator.allocate_ip_address(machine.id, network.id).await.unwrap();
        assert!(matches!(
            allocator.allocate_ip_address(machine.id, network.id).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_retries_after_losing_address() {
        let test_db = TestDatabase::new().await;
        let lab = test_db.network("lab").await;
        let prod = test_db.network("prod").await;
        add_range(&test_db, lab.id, 100, 102).await;
        add_range(&test_db, prod.id, 100, 102).await;
        let allocator = Allocator::new(test_db.db.clone());

        let m1 = test_db.machine("m1", None).await;
        let m2 = test_db.machine("m2", None).await;
        allocator.allocate_ip_address(m1.id, lab.id).await.unwrap();

        // .100 is only leased on lab, so the prod scan picks it and the
        // store-wide uniqueness rejects the insert.
        let lease = allocator.allocate_ip_address(m2.id, prod.id).await.unwrap();
        assert_eq!(lease.ip_address, ip(101));
    }

    #[tokio::test]
    async fn test_overlapping_leases_elsewhere_do_not_exhaust_attempts() {
        let test_db = TestDatabase::new().await;
        let lab = test_db.network("lab").await;
        let prod = test_db.network("prod").await;
        add_range(&test_db, lab.id, 100, 110).await;
        add_range(&test_db, prod.id, 100, 110).await;
        let allocator = Allocator::new(test_db.db.clone());

        // More collisions than attempts: .100 to .103 are taken on lab.
        for index in 0..4 {
            let machine = test_db.machine(&format!("lab-{}", index), None).await;
            allocator.allocate_ip_address(machine.id, lab.id).await.unwrap();
        }

        let machine = test_db.machine("prod-0", None).await;
        let lease = allocator.allocate_ip_address(machine.id, prod.id).await.unwrap();
        assert_eq!(lease.ip_address, ip(104));
    }

    #[tokio::test]
    async fn test_network_locks_are_released() {
        let test_db = TestDatabase::new().await;
        let network = test_db.network("N1").await;
        add_range(&test_db, network.id, 100, 102).await;
        let allocator = Allocator::new(test_db.db.clone());
        let machine = test_db.machine("m1", None).await;

        allocator.allocate_ip_address(machine.id, network.id).await.unwrap();
        assert_eq!(allocator.tracked_networks().await, 0);

        // Unknown networks must not leave entries behind either.
        let result = allocator.allocate_ip_address(machine.id, 9999).await;
        assert!(matches!(result, Err(Error::NoRanges(9999))));
        assert_eq!(allocator.tracked_networks().await, 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let test_db = TestDatabase::new().await;
        let lab = test_db.network("lab").await;
        let prod = test_db.network("prod").await;
        add_range(&test_db, lab.id, 100, 102).await;
        add_range(&test_db, prod.id, 100, 102).await;
        let allocator = Allocator::new(test_db.db.clone()).with_max_attempts(1);

        let m1 = test_db.machine("m1", None).await;
        let m2 = test_db.machine("m2", None).await;
        allocator.allocate_ip_address(m1.id, lab.id).await.unwrap();

        assert!(matches!(
            allocator.allocate_ip_address(m2.id, prod.id).await,
            Err(Error::Conflict(_))
        ));
        assert!(allocator.find_by_network_id(prod.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_allocations() {
        let test_db = TestDatabase::new().await;
        let network = test_db.network("N1").await;
        add_range(&test_db, network.id, 100, 120).await;
        let allocator = Allocator::new(test_db.db.clone());

        let mut handles = vec![];
        for index in 0..8 {
            let machine = test_db.machine(&format!("vm{}", index), None).await;
            let allocator = allocator.clone();
            let network_id = network.id;
            handles.push(tokio::spawn(async move {
                allocator.allocate_ip_address(machine.id, network_id).await
            }));
        }

        let mut allocated = HashSet::new();
        for handle in handles {
            let lease = handle.await.unwrap().unwrap();
            assert!(
                allocated.insert(lease.ip_address),
                "Duplicate IP allocated: {}",
                lease.ip_address
            );
        }
        assert_eq!(allocated.len(), 8);
    }

    #[tokio::test]
    async fn test_finders_delegate() {
        let test_db = TestDatabase::new().await;
        let network = test_db.network("N1").await;
        add_range(&test_db, network.id, 100, 102).await;
        let allocator = Allocator::new(test_db.db.clone());
        let machine = test_db.machine("m1", None).await;

        assert!(allocator.is_ip_address_available(network.id, ip(100)).await.unwrap());
        let lease = allocator.allocate_ip_address(machine.id, network.id).await.unwrap();
        assert!(!allocator.is_ip_address_available(network.id, ip(100)).await.unwrap());

        assert_eq!(allocator.find_by_ip_address(ip(100)).await.unwrap(), lease);
        assert_eq!(allocator.find_by_machine_id(machine.id).await.unwrap(), vec![lease]);
        assert!(allocator.find_by_ip_address(ip(101)).await.unwrap_err().is_not_found());
        assert!(allocator.find_by_machine_id(machine.id + 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_delete_removes_leases() {
        let test_db = TestDatabase::new().await;
        let network = test_db.network("N1").await;
        add_range(&test_db, network.id, 100, 102).await;
        let allocator = Allocator::new(test_db.db.clone());
        let machine = test_db.machine("m1", None).await;
        allocator.allocate_ip_address(machine.id, network.id).await.unwrap();

        NetworkRepository::new(test_db.db.clone())
            .delete_by_id(network.id)
            .await
            .unwrap();

        assert!(allocator.find_by_network_id(network.id).await.unwrap().is_empty());
        assert!(allocator.find_by_machine_id(machine.id).await.unwrap().is_empty());
        let still_there: Machine = MachineRepository::new(test_db.db.clone())
            .find_by_id(machine.id)
            .await
            .unwrap();
        assert_eq!(still_there.name, "m1");
    }
}
