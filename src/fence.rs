//! Fence Controller: host id derivation, initial takeover, and the steady
//! state tick that keeps this host's reservation fresh and notices when a
//! peer has preempted it.

use std::{
    collections::HashSet,
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    config::FenceConfig,
    disk::{Disk, LogInfo},
    diskset::DiskSet,
    enumerate::Enumerator,
    error::FenceError,
    key,
    transport::PrTransport,
};

const ID_FILE: &str = "/etc/machine-id";

/// Abstracts wall-clock reads and sleeping so init/loop scenarios can be
/// driven deterministically in tests.
pub trait Clock: Send + Sync {
    fn now_epoch(&self) -> u64;
    fn sleep(&self, d: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d)
    }
}

/// Builds a [`PrTransport`] for a given device name. Real deployments wire
/// this to pick `ScsiTransport` vs `NvmeTransport` by name pattern; tests
/// wire it to `FakeTransport`.
pub type TransportFactory = Box<dyn Fn(&str) -> Box<dyn PrTransport> + Send + Sync>;

/// Flags flipped only by signal handlers; the steady-state loop polls them
/// once per tick. Never touched from inside a handler beyond a relaxed
/// store, per the usual async-signal-safety discipline.
#[derive(Clone, Default)]
pub struct SignalFlags {
    pub reload: Arc<AtomicBool>,
    pub dump_info: Arc<AtomicBool>,
}

pub struct FenceController {
    config: FenceConfig,
    enumerator: Box<dyn Enumerator>,
    transport: TransportFactory,
    clock: Box<dyn Clock>,
    disks: DiskSet,
    hostid: u32,
    pub signals: SignalFlags,
}

impl FenceController {
    pub fn new(
        config: FenceConfig,
        enumerator: Box<dyn Enumerator>,
        transport: TransportFactory,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            config,
            enumerator,
            transport,
            clock,
            disks: DiskSet::new(),
            hostid: 0,
            signals: SignalFlags::default(),
        }
    }

    pub fn hostid(&self) -> u32 {
        self.hostid
    }

    fn derive_hostid(&self) -> Result<u32, FenceError> {
        let contents = fs::read_to_string(ID_FILE).map_err(|source| FenceError::HostId { source })?;
        let head = contents.get(0..8).unwrap_or(&contents);
        u32::from_str_radix(head, 16)
            .map_err(|_| FenceError::HostId {
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, "machine-id is not hex"),
            })
    }

    /// Enumerates disks, builds a fresh Disk State per eligible device and
    /// primes `curkey` from whatever already-registered key matches our
    /// host id, retrying `READ KEYS` once per disk (some SSD firmware
    /// transiently errors the very first PR-IN after boot). Returns the
    /// union of every remote (non-ours) key observed, used by the peer
    /// liveness probe.
    fn load_disks(&mut self) -> Result<HashSet<u64>, FenceError> {
        info!("loading disks");
        self.disks.clear();

        let found = self
            .enumerator
            .enumerate(&self.config.exclude_disks)
            .map_err(|_| FenceError::ExcludeDisks)?;

        let mut remote_keys = HashSet::new();
        let mut unsupported = Vec::new();

        for d in found {
            let transport = (self.transport)(&d.name);
            let disk = Disk::new(&d.name, self.hostid, transport, d.log_info);

            let mut got_keys = false;
            for attempt in 0..2 {
                match disk.get_keys() {
                    Ok((_, remote)) => {
                        remote_keys.extend(remote);
                        got_keys = true;
                        break;
                    }
                    Err(e) if attempt == 0 => {
                        warn!(disk = %d.name, error = %e, "retrying to read keys");
                    }
                    Err(e) => {
                        error!(disk = %d.name, error = %e, "giving up reading keys");
                    }
                }
            }

            if got_keys {
                self.disks.add(disk);
            } else {
                unsupported.push(d.name);
            }
        }

        if !unsupported.is_empty() {
            warn!(disks = ?unsupported, "disks without usable SCSI-3/NVMe PR support");
        }

        Ok(remote_keys)
    }

    /// Recovery / takeover path. Converges every disk's reservation to this
    /// host regardless of starting state, verifying first (unless `force`)
    /// that no peer is actively holding the pool.
    pub fn init(&mut self, force: bool) -> Result<u32, FenceError> {
        self.hostid = self.derive_hostid()?;
        info!(hostid = %format!("0x{:x}", self.hostid), "derived host id");

        let remote_keys = self.load_disks()?;
        if self.disks.is_empty() {
            error!("no disks available, exiting");
            return Err(FenceError::NoDisks);
        }

        if !force {
            let wait = Duration::from_secs(2 * self.config.interval_secs + 1);
            info!(seconds = wait.as_secs(), "verifying reservation keys are stable");
            self.clock.sleep(wait);
            let (_, new_remote_keys, _) = self.disks.get_keys();
            if !new_remote_keys.is_subset(&remote_keys) {
                error!("reservation keys changed during the liveness probe, a peer is live");
                return Err(FenceError::RemoteRunning);
            }
            info!("reservation keys unchanged");
        }

        let newkey = (self.clock.now_epoch() & 0xffff_ffff) as u32;
        let failed = self.disks.reset_keys(newkey);
        if !failed.is_empty() {
            let total = self.disks.len();
            let rate = ((failed.len() * 100) / total) as u32;
            if rate > 10 {
                error!(rate, "failed to reset reservations on too many disks");
                return Err(FenceError::ReserveError {
                    failed: failed.len(),
                    total,
                    rate,
                });
            }
            for name in &failed {
                self.disks.remove(name);
            }
        }

        info!(disks = self.disks.len(), "persistent reservation set");
        Ok(newkey)
    }

    /// One steady-state tick: rotate/refresh the key on the active subset,
    /// and for any disk that failed, decide between "it was ours all
    /// along and just needs a reset", "a peer now holds it" (fatal), or
    /// "drop it from the set".
    pub fn tick(&mut self, key: u32) -> Result<u32, FenceError> {
        if self.signals.reload.swap(false, Ordering::SeqCst) {
            info!("SIGHUP received, reloading");
            return self.init(true);
        }
        if self.signals.dump_info.swap(false, Ordering::SeqCst) {
            self.dump_info();
        }

        let next_key = key::next_counter(key);
        debug!(key = %format!("0x{next_key:x}"), "setting new key");

        let mut failed = self.disks.register_keys(next_key);
        if !failed.is_empty() {
            let reservations = self.disks.get_reservation(&failed);
            let mut to_remove = Vec::new();

            for name in failed.clone() {
                match reservations.get(&name) {
                    Some(Some(r)) => {
                        if let Some(held) = r.reservation {
                            let peer = key::hostid_of(held);
                            if peer != self.hostid {
                                return Err(FenceError::Preempted {
                                    disk: name,
                                    peer_hostid: peer,
                                });
                            }
                        }
                        warn!(disk = %name, "trying to reset reservation");
                        if self.disks.reset_one(&name, next_key) {
                            failed.remove(&name);
                        } else {
                            to_remove.push(name);
                        }
                    }
                    _ => to_remove.push(name),
                }
            }

            if !failed.is_empty() {
                warn!(disks = ?failed, "failed to set reservations, removing from the set");
            }
            for name in to_remove {
                self.disks.remove(&name);
            }
        }

        Ok(next_key)
    }

    fn dump_info(&self) {
        for (name, info) in self.disks.log_info() {
            tracing_info_line(&name, &info);
        }
    }
}

fn tracing_info_line(name: &str, info: &LogInfo) {
    info!(disk = name, log_info = ?info.0, "SIGUSR1 diagnostic dump");
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use crate::{
        enumerate::{EnumeratedDisk, EnumerationError},
        transport::fake::{FakeState, FakeTransport},
    };
    use std::sync::Mutex;

    struct FakeClock {
        epoch: u64,
        slept: Mutex<Vec<Duration>>,
    }

    impl Clock for FakeClock {
        fn now_epoch(&self) -> u64 {
            self.epoch
        }
        fn sleep(&self, d: Duration) {
            self.slept.lock().unwrap().push(d);
        }
    }

    struct FixedEnumerator(Vec<&'static str>);

    impl Enumerator for FixedEnumerator {
        fn enumerate(
            &self,
            exclude: &HashSet<String>,
        ) -> Result<Vec<EnumeratedDisk>, EnumerationError> {
            Ok(self
                .0
                .iter()
                .filter(|n| !exclude.contains(**n))
                .map(|n| EnumeratedDisk {
                    name: n.to_string(),
                    log_info: LogInfo::default(),
                })
                .collect())
        }
    }

    fn config(interval: u64) -> FenceConfig {
        FenceConfig {
            force: false,
            foreground: true,
            no_panic: false,
            interval_secs: interval,
            exclude_disks: HashSet::new(),
            use_zpools: false,
        }
    }

    fn fresh_transport_factory() -> TransportFactory {
        Box::new(|name| Box::new(FakeTransport::new(name)) as Box<dyn PrTransport>)
    }

    #[test]
    fn init_force_sets_reservation_on_every_disk() {
        let mut fc = FenceController::new(
            config(5),
            Box::new(FixedEnumerator(vec!["sda", "sdb"])),
            fresh_transport_factory(),
            Box::new(FakeClock {
                epoch: 1_000,
                slept: Mutex::new(Vec::new()),
            }),
        );
        let key = fc.init(true).unwrap();
        assert_eq!(key, 1_000);
        assert_eq!(fc.disks.len(), 2);
    }

    #[test]
    fn init_without_force_waits_and_checks_liveness() {
        let mut fc = FenceController::new(
            config(2),
            Box::new(FixedEnumerator(vec!["sda"])),
            fresh_transport_factory(),
            Box::new(FakeClock {
                epoch: 42,
                slept: Mutex::new(Vec::new()),
            }),
        );
        fc.init(false).unwrap();
    }

    #[test]
    fn init_fails_when_no_disks_found() {
        let mut fc = FenceController::new(
            config(5),
            Box::new(FixedEnumerator(vec![])),
            fresh_transport_factory(),
            Box::new(FakeClock {
                epoch: 1,
                slept: Mutex::new(Vec::new()),
            }),
        );
        assert_matches!(fc.init(true), Err(FenceError::NoDisks));
    }

    #[test]
    fn tick_advances_and_wraps_the_key() {
        let mut fc = FenceController::new(
            config(5),
            Box::new(FixedEnumerator(vec!["sda"])),
            fresh_transport_factory(),
            Box::new(FakeClock {
                epoch: 1,
                slept: Mutex::new(Vec::new()),
            }),
        );
        fc.init(true).unwrap();
        let next = fc.tick(0xffff_ffff).unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn tick_reports_preemption_by_a_different_host() {
        let peer_key = key::compose(0xDEADBEEF, 9);
        let state = FakeState {
            keys: vec![peer_key],
            reservation: Some((peer_key, 0x07)),
            ..Default::default()
        };
        let mut fc = FenceController::new(
            config(5),
            Box::new(FixedEnumerator(vec!["sda"])),
            Box::new(move |name| {
                Box::new(FakeTransport::with_state(name, state.clone())) as Box<dyn PrTransport>
            }),
            Box::new(FakeClock {
                epoch: 1,
                slept: Mutex::new(Vec::new()),
            }),
        );
        // Seed this host's own disk set without going through init's
        // reset-to-ours dance, so the registered key on disk stays peer-held.
        fc.hostid = 0xC0FFEE01;
        fc.disks.add(Disk::new(
            "sda",
            fc.hostid,
            Box::new(FakeTransport::with_state(
                "sda",
                FakeState {
                    keys: vec![peer_key],
                    reservation: Some((peer_key, 0x07)),
                    fail_countdown: u32::MAX,
                    ..Default::default()
                },
            )),
            LogInfo::default(),
        ));

        let err = fc.tick(1).unwrap_err();
        match err {
            FenceError::Preempted { peer_hostid, .. } => assert_eq!(peer_hostid, 0xDEADBEEF),
            other => panic!("expected Preempted, got {other:?}"),
        }
    }
}
