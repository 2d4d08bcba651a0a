//! Disk State: the per-device PR state machine.
//!
//! States are implicit from `(curkey set?, on-disk keys, on-disk
//! reservation)`: empty, mine, peer-held, registered-but-unreserved. See
//! `reset_keys` for the full decision table.

use std::collections::HashSet;

use tracing::debug;

use crate::{
    error::TransportError,
    key,
    transport::{PrTransport, ReservationRecord},
};

/// Arbitrary, opaque diagnostic payload surfaced on SIGUSR1. Content varies
/// by enumerator (zpool membership vs. serial/type); the fence controller
/// never interprets it.
#[derive(Debug, Clone, Default)]
pub struct LogInfo(pub Vec<(String, String)>);

/// One eligible block device and its PR state.
pub struct Disk {
    name: String,
    hostid: u32,
    transport: Box<dyn PrTransport>,
    curkey: Option<u64>,
    pub log_info: LogInfo,
}

impl Disk {
    pub fn new(
        name: impl Into<String>,
        hostid: u32,
        transport: Box<dyn PrTransport>,
        log_info: LogInfo,
    ) -> Self {
        Self {
            name: name.into(),
            hostid,
            transport,
            curkey: None,
            log_info,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The most recently successfully written key for this disk, or `None`
    /// if no write has succeeded since this Disk State was created.
    pub fn curkey(&self) -> Option<u64> {
        self.curkey
    }

    /// PR-IN READ KEYS, partitioned by whether the high 32 bits match our
    /// host id. If more than one of our own keys is registered (should not
    /// happen under the monotonic-key discipline, but the wire format does
    /// not forbid it) any one of them is returned; which one is
    /// unspecified.
    pub fn get_keys(
        &self,
    ) -> Result<(Option<u64>, HashSet<u64>), TransportError> {
        let keys = self.transport.read_keys()?;
        let mut host_key = None;
        let mut remote_keys = HashSet::new();
        for k in keys {
            if key::hostid_of(k) == self.hostid {
                host_key = Some(k);
            } else {
                remote_keys.insert(k);
            }
        }
        Ok((host_key, remote_keys))
    }

    pub fn get_reservation(&self) -> Result<ReservationRecord, TransportError> {
        self.transport.read_reservation()
    }

    /// The hot path: one `update_key` per disk per tick in steady state.
    pub fn register_key(
        &mut self,
        newkey_counter: u32,
    ) -> Result<(), TransportError> {
        let k = key::compose(self.hostid, newkey_counter);
        self.transport.update_key(self.curkey, k)?;
        self.curkey = Some(k);
        Ok(())
    }

    /// Recovery / init path. Converges to state `M` (`curkey = k`,
    /// reservation held by `curkey`) regardless of the disk's starting
    /// state, including when run twice in succession.
    pub fn reset_keys(
        &mut self,
        newkey_counter: u32,
    ) -> Result<(), TransportError> {
        let k = key::compose(self.hostid, newkey_counter);
        let reservation = self.transport.read_reservation()?;

        match reservation.reservation {
            Some(held) if key::hostid_of(held) != self.hostid => {
                // Reservation looks peer-held. Register ourselves, ignoring
                // any existing registration for this nexus, then try to
                // preempt. We cannot directly ask "am I the holder?" (that
                // would require READ FULL STATUS); a reservation conflict
                // on preempt means `held` was in fact our own key, so we
                // fall back to a plain reserve instead.
                self.transport.register_ignore_key(k)?;
                match self.transport.preempt_key(held, k) {
                    Ok(()) => {}
                    Err(e) if e.is_reservation_conflict() => {
                        debug!(
                            disk = %self.name,
                            "preempt conflicted, reservation was ours; falling back to reserve"
                        );
                        self.transport.reserve_key(k)?;
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(_held) => {
                // Reservation is already ours: just update the key.
                self.transport.update_key(self.curkey, k)?;
            }
            None => {
                let keys = self.transport.read_keys()?;
                if keys.is_empty() {
                    self.transport.register_new_key(k)?;
                } else {
                    self.transport.register_ignore_key(k)?;
                }
                self.transport.reserve_key(k)?;
            }
        }

        self.curkey = Some(k);
        Ok(())
    }
}

/// The batch executor dispatches disk work through this tagged variant
/// rather than string-keyed method names.
#[derive(Debug, Clone, Copy)]
pub enum DiskOp {
    GetKeys,
    RegisterKey(u32),
    ResetKeys(u32),
    GetReservation,
}

/// The result of running one [`DiskOp`] against a [`Disk`]. `GetKeys`
/// additionally carries the partitioned key sets so the batch can fold them
/// into the Disk Set's aggregate view.
pub enum DiskOpResult {
    Keys(Option<u64>, HashSet<u64>),
    Reservation(ReservationRecord),
    Done,
}

impl Disk {
    pub fn apply(
        &mut self,
        op: DiskOp,
    ) -> Result<DiskOpResult, TransportError> {
        match op {
            DiskOp::GetKeys => {
                let (host, remote) = self.get_keys()?;
                Ok(DiskOpResult::Keys(host, remote))
            }
            DiskOp::RegisterKey(c) => {
                self.register_key(c)?;
                Ok(DiskOpResult::Done)
            }
            DiskOp::ResetKeys(c) => {
                self.reset_keys(c)?;
                Ok(DiskOpResult::Done)
            }
            DiskOp::GetReservation => {
                let r = self.get_reservation()?;
                Ok(DiskOpResult::Reservation(r))
            }
        }
    }
}
