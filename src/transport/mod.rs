//! PR Transport: a thin, synchronous verb interface to a single block
//! device. Implementations issue SCSI-3 or NVMe Persistent Reservation
//! commands directly via ioctl; callers never see the wire format.

pub mod nvme;
pub mod scsi;

#[cfg(test)]
pub mod fake;

pub use crate::error::TransportError;

/// The PR reservation type. Only Write-Exclusive-Registrants-Only is used by
/// this daemon, but the wire type is still round-tripped for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrType {
    WriteExclusiveRegistrantsOnly,
    Other(u8),
}

/// The reservation state of a disk as reported by PR-IN READ RESERVATION /
/// NVMe Reservation Report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReservationRecord {
    pub reservation: Option<u64>,
    pub pr_type: Option<PrType>,
}

/// Synchronous PR verb interface to one block device. Every operation either
/// succeeds or fails with a [`TransportError`]; `preempt_key` additionally
/// distinguishes the reservation-conflict case the caller relies on to
/// disambiguate "the reservation is ours" from "a peer holds it".
pub trait PrTransport: Send + Sync {
    /// Device name this handle was opened against, for logging.
    fn name(&self) -> &str;

    /// PR-IN READ KEYS: every key currently registered for this device.
    fn read_keys(&self) -> Result<Vec<u64>, TransportError>;

    /// PR-IN READ RESERVATION.
    fn read_reservation(&self) -> Result<ReservationRecord, TransportError>;

    /// PR-OUT REGISTER, service action REGISTER: register `key` only if no
    /// key is yet registered for this I_T nexus.
    fn register_new_key(&self, key: u64) -> Result<(), TransportError>;

    /// PR-OUT REGISTER with the IGNORE EXISTING KEY bit set.
    fn register_ignore_key(&self, key: u64) -> Result<(), TransportError>;

    /// PR-OUT REGISTER AND IGNORE EXISTING KEY / REGISTER service action with
    /// an explicit reservation key: atomically replace `old` with `new` for
    /// this nexus.
    fn update_key(
        &self,
        old: Option<u64>,
        new: u64,
    ) -> Result<(), TransportError>;

    /// PR-OUT RESERVE: acquire a Write-Exclusive-Registrants-Only reservation
    /// using the already-registered key `key`.
    fn reserve_key(&self, key: u64) -> Result<(), TransportError>;

    /// PR-OUT PREEMPT: preempt `victim`'s registration/reservation and
    /// install `key`. Returns a [`TransportError::ReservationConflict`] when
    /// the caller is in fact the current holder.
    fn preempt_key(&self, victim: u64, key: u64) -> Result<(), TransportError>;
}
