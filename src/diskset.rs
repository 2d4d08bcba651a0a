//! Disk Set: the ordered collection of Disk States, plus the rotating-cap
//! subset used for incremental key registration on large fleets.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use indexmap::{IndexMap, IndexSet};

use crate::{
    batch::{BatchExecutor, CAP},
    disk::{Disk, DiskOp, DiskOpResult},
};

/// `name -> Disk State`, in insertion order, plus the rotation bookkeeping
/// for [`register_keys`](DiskSet::register_keys).
#[derive(Default)]
pub struct DiskSet {
    disks: IndexMap<String, Arc<Mutex<Disk>>>,
    set_disks: IndexSet<String>,
}

impl DiskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.disks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }

    pub fn add(&mut self, disk: Disk) {
        let name = disk.name().to_string();
        self.disks.insert(name, Arc::new(Mutex::new(disk)));
    }

    pub fn remove(&mut self, name: &str) {
        self.disks.shift_remove(name);
        self.set_disks.shift_remove(name);
    }

    pub fn clear(&mut self) {
        self.disks.clear();
        self.set_disks.clear();
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.disks.keys().map(|s| s.as_str())
    }

    pub fn log_info(&self) -> Vec<(String, crate::disk::LogInfo)> {
        self.disks
            .iter()
            .map(|(name, handle)| (name.clone(), handle.lock().unwrap().log_info.clone()))
            .collect()
    }

    fn all_handles(&self) -> Vec<Arc<Mutex<Disk>>> {
        self.disks.values().cloned().collect()
    }

    /// The rotating-cap policy: which disks should have their key rotated
    /// this tick. If `|disks| <= CAP` this is every disk. Otherwise, each
    /// call advances `set_disks` to cover a fresh slice of at most `CAP`
    /// disks that have not been rotated "recently", topping up from the
    /// full set when fewer than `CAP` are fresh, and resetting once full
    /// coverage has been reached.
    fn rotate(&mut self) -> Vec<Arc<Mutex<Disk>>> {
        if self.disks.len() <= CAP {
            return self.all_handles();
        }

        let fresh: IndexSet<String> = self
            .disks
            .keys()
            .filter(|n| !self.set_disks.contains(*n))
            .cloned()
            .collect();

        // `selected` is this tick's rotation batch; it need not equal
        // `set_disks` afterwards (the ">CAP" branch only ever accumulates
        // bookkeeping, it does not rotate the whole accumulated history in
        // one go).
        let selected: IndexSet<String> = if fresh.is_empty() {
            // Full coverage reached: start a new rotation window.
            let next: IndexSet<String> = self.disks.keys().take(CAP).cloned().collect();
            self.set_disks = next.clone();
            next
        } else if fresh.len() > CAP {
            let chosen: IndexSet<String> = fresh.into_iter().take(CAP).collect();
            self.set_disks.extend(chosen.iter().cloned());
            chosen
        } else {
            let need = CAP - fresh.len();
            let mut chosen = fresh;
            for n in self.disks.keys().take(need) {
                chosen.insert(n.clone());
            }
            self.set_disks = chosen.clone();
            chosen
        };

        selected.iter().map(|n| self.disks[n].clone()).collect()
    }

    /// Batch `get_keys` over every disk. Returns the union of host keys,
    /// the union of remote keys, and the set of disks that failed (either
    /// erroring or reporting no host key of their own).
    pub fn get_keys(&self) -> (HashSet<u64>, HashSet<u64>, HashSet<String>) {
        let handles = self.all_handles();
        let host_keys = Mutex::new(HashSet::new());
        let remote_keys = Mutex::new(HashSet::new());

        let failed = BatchExecutor::run_full(DiskOp::GetKeys, &handles, |_name, result| {
            match result {
                Some(Ok(DiskOpResult::Keys(host, remote))) => {
                    remote_keys.lock().unwrap().extend(remote);
                    match host {
                        Some(k) => {
                            host_keys.lock().unwrap().insert(k);
                            false
                        }
                        None => true,
                    }
                }
                _ => true,
            }
        });

        (
            host_keys.into_inner().unwrap(),
            remote_keys.into_inner().unwrap(),
            failed,
        )
    }

    /// Batch `register_key` over the rotating-cap subset only.
    pub fn register_keys(&mut self, counter: u32) -> HashSet<String> {
        let handles = self.rotate();
        BatchExecutor::run(DiskOp::RegisterKey(counter), &handles)
    }

    /// Batch `reset_keys` over every disk.
    pub fn reset_keys(&self, counter: u32) -> HashSet<String> {
        let handles = self.all_handles();
        BatchExecutor::run(DiskOp::ResetKeys(counter), &handles)
    }

    /// Batch `get_reservation` over the given disk names (used by failure
    /// handling, which only needs to re-check the disks that just failed
    /// `register_key`).
    pub fn get_reservation(
        &self,
        names: &HashSet<String>,
    ) -> HashMap<String, Option<crate::transport::ReservationRecord>> {
        let handles: Vec<_> = names
            .iter()
            .filter_map(|n| self.disks.get(n).cloned())
            .collect();
        let results = Mutex::new(HashMap::new());
        BatchExecutor::run_full(DiskOp::GetReservation, &handles, |name, result| {
            let value = match result {
                Some(Ok(DiskOpResult::Reservation(r))) => Some(r),
                _ => None,
            };
            results.lock().unwrap().insert(name.to_string(), value);
            value.is_none()
        });
        results.into_inner().unwrap()
    }

    /// Run `reset_keys` for a single disk directly (used by failure
    /// handling, which resets one disk at a time rather than batching).
    pub fn reset_one(&self, name: &str, counter: u32) -> bool {
        match self.disks.get(name) {
            Some(handle) => {
                let mut d = handle.lock().unwrap();
                d.reset_keys(counter).is_ok()
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        disk::LogInfo,
        transport::fake::{FakeState, FakeTransport},
    };

    fn disk(name: &str) -> Disk {
        Disk::new(
            name,
            0xC0FFEE01,
            Box::new(FakeTransport::with_state(name, FakeState::default())),
            LogInfo::default(),
        )
    }

    #[test]
    fn subset_equals_full_set_at_or_under_cap() {
        let mut set = DiskSet::new();
        for i in 0..CAP {
            set.add(disk(&format!("d{i}")));
        }
        let failed = set.register_keys(1);
        assert!(failed.is_empty());
        assert_eq!(set.set_disks.len(), 0, "no rotation bookkeeping needed at/under cap");
    }

    #[test]
    fn rotation_covers_every_disk_within_expected_ticks() {
        let mut set = DiskSet::new();
        for i in 0..90 {
            set.add(disk(&format!("d{i}")));
        }
        let mut covered: IndexSet<String> = IndexSet::new();
        for tick in 1..=3 {
            let before = set.rotate();
            let names: IndexSet<String> = before
                .iter()
                .map(|d| d.lock().unwrap().name().to_string())
                .collect();
            assert!(names.len() <= CAP, "tick {tick} exceeded CAP");
            covered.extend(names);
        }
        assert_eq!(covered.len(), 90, "every disk rotated within 3 ticks of CAP=30");
    }

    #[test]
    fn remove_drops_disk_from_all_bookkeeping() {
        let mut set = DiskSet::new();
        set.add(disk("sda"));
        set.add(disk("sdb"));
        set.remove("sda");
        assert_eq!(set.len(), 1);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["sdb"]);
    }

    #[test]
    fn get_keys_aggregates_across_disks() {
        let mut set = DiskSet::new();
        let remote = crate::key::compose(0xDEADBEEF, 1);
        set.add(Disk::new(
            "sda",
            0xC0FFEE01,
            Box::new(FakeTransport::with_state(
                "sda",
                FakeState {
                    keys: vec![crate::key::compose(0xC0FFEE01, 1), remote],
                    ..Default::default()
                },
            )),
            LogInfo::default(),
        ));
        set.add(disk("sdb")); // no keys at all -> no host key -> failed
        let (host, remote_keys, failed) = set.get_keys();
        assert_eq!(host, HashSet::from([crate::key::compose(0xC0FFEE01, 1)]));
        assert_eq!(remote_keys, HashSet::from([remote]));
        assert_eq!(failed, HashSet::from(["sdb".to_string()]));
    }
}
