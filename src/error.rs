//! Error taxonomy for the fencing daemon, mapped to the stable process exit
//! codes documented in the CLI contract.

use snafu::Snafu;

/// Stable process exit codes. Values are part of the external contract and
/// must never be renumbered.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    RegisterError = 1,
    RemoteRunning = 2,
    ReserveError = 3,
    ExcludeDisksError = 4,
    Unknown = 5,
    AlreadyRunning = 6,
    NoPanic = 7,
}

/// Errors raised by the PR transport layer (SCSI/NVMe verb failures).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("ioctl {verb} failed on {device}: {source}"))]
    Ioctl {
        verb: &'static str,
        device: String,
        source: nix::Error,
    },
    #[snafu(display("{verb} on {device} returned a reservation conflict"))]
    ReservationConflict { verb: &'static str, device: String },
    #[snafu(display("failed to open {device}: {source}"))]
    Open {
        device: String,
        source: std::io::Error,
    },
    #[snafu(display("unexpected short response from {device} for {verb}"))]
    ShortResponse { verb: &'static str, device: String },
}

impl TransportError {
    /// True when the kernel reported a reservation conflict, i.e. the
    /// operation targeted a reservation held by a different key than
    /// expected. `preempt_key` relies on this to disambiguate "peer holds
    /// it" from "we already hold it".
    pub fn is_reservation_conflict(&self) -> bool {
        matches!(self, TransportError::ReservationConflict { .. })
    }
}

/// Top level error type for the fence controller. Every variant that can
/// terminate the process carries its own exit code via [`FenceError::exit_code`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FenceError {
    #[snafu(display("failed to derive a host id: {source}"))]
    HostId { source: std::io::Error },

    #[snafu(display("no disks available after enumeration"))]
    NoDisks,

    #[snafu(display("excluding every detected disk is not allowed"))]
    ExcludeDisks,

    #[snafu(display("remote reservation keys changed during the liveness probe: peer is live"))]
    RemoteRunning,

    #[snafu(display(
        "failed to reset reservations on {failed}/{total} disks ({rate}%), exceeding the 10% budget"
    ))]
    ReserveError {
        failed: usize,
        total: usize,
        rate: u32,
    },

    #[snafu(display("a fenced process is already running"))]
    AlreadyRunning,

    #[snafu(display(
        "disk {disk} reservation was preempted by a peer host (0x{peer_hostid:08x})"
    ))]
    Preempted { disk: String, peer_hostid: u32 },

    #[snafu(display("unhandled error: {source}"))]
    Unknown { source: std::io::Error },
}

impl FenceError {
    /// Maps this error onto the stable exit code contract. [`FenceError::Preempted`]
    /// is special: the caller decides whether to panic the kernel or, under
    /// `--no-panic`, exit with [`ExitCode::NoPanic`] instead.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            FenceError::HostId { .. } => ExitCode::Unknown,
            FenceError::NoDisks => ExitCode::RegisterError,
            FenceError::ExcludeDisks => ExitCode::ExcludeDisksError,
            FenceError::RemoteRunning => ExitCode::RemoteRunning,
            FenceError::ReserveError { .. } => ExitCode::ReserveError,
            FenceError::AlreadyRunning => ExitCode::AlreadyRunning,
            FenceError::Preempted { .. } => ExitCode::NoPanic,
            FenceError::Unknown { .. } => ExitCode::Unknown,
        }
    }
}
