//! Storage fencing: SCSI-3/NVMe Persistent-Reservation based I/O fencing
//! for dual-controller HA storage appliances. One controller's reservation
//! on every shared disk is kept fresh on a tick; if a peer ever preempts
//! it, this host immediately panics rather than risk driving I/O a peer
//! believes it owns exclusively.

pub mod batch;
pub mod config;
pub mod daemonize;
pub mod disk;
pub mod diskset;
pub mod enumerate;
pub mod error;
pub mod fence;
pub mod key;
pub mod logging;
pub mod transport;
