//! NVMe Persistent Reservation transport, issued via the
//! `NVME_IOCTL_IO_CMD` passthru ioctl against namespace 1 of
//! `/dev/<name>`.
//!
//! Opcode and field layout follow NVMe Base Specification 2.0 §6.14:
//! Reservation Register (0x0d), Reservation Report (0x0e), Reservation
//! Acquire (0x11).

use std::{
    fs::{File, OpenOptions},
    os::unix::io::AsRawFd,
};

use nix::errno::Errno;

use super::{PrTransport, PrType, ReservationRecord};
use crate::error::TransportError;

const NVME_IOCTL_IO_CMD: u64 = 0x4e43;

const OPC_RESERVATION_REGISTER: u8 = 0x0d;
const OPC_RESERVATION_REPORT: u8 = 0x0e;
const OPC_RESERVATION_ACQUIRE: u8 = 0x11;

const RREGA_REGISTER: u32 = 0;
const RREGA_REPLACE: u32 = 2;
const IEKEY_BIT: u32 = 1 << 3;

const RACQA_ACQUIRE: u32 = 0;
const RACQA_PREEMPT: u32 = 1;

const RESV_TYPE_WERO: u32 = 3;
const NAMESPACE_ID: u32 = 1;

const NVME_SC_RESERVATION_CONFLICT: u16 = 0x83;

#[repr(C)]
#[derive(Default)]
struct NvmePassthruCmd {
    opcode: u8,
    flags: u8,
    rsvd1: u16,
    nsid: u32,
    cdw2: u32,
    cdw3: u32,
    metadata: u64,
    addr: u64,
    metadata_len: u32,
    data_len: u32,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
    cdw13: u32,
    cdw14: u32,
    cdw15: u32,
    timeout_ms: u32,
    result: u32,
}

/// A PR transport handle bound to one NVMe namespace device.
pub struct NvmeTransport {
    name: String,
    file: File,
}

impl NvmeTransport {
    pub fn open(name: &str) -> Result<Self, TransportError> {
        let path = format!("/dev/{name}");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| TransportError::Open {
                device: name.to_string(),
                source,
            })?;
        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    fn submit(
        &self,
        mut cmd: NvmePassthruCmd,
        buf: Option<&mut [u8]>,
        verb: &'static str,
    ) -> Result<(), TransportError> {
        cmd.nsid = NAMESPACE_ID;
        cmd.timeout_ms = 30_000;
        if let Some(buf) = &buf {
            cmd.addr = buf.as_ptr() as u64;
            cmd.data_len = buf.len() as u32;
        }

        let ret = unsafe {
            nix::libc::ioctl(
                self.file.as_raw_fd(),
                NVME_IOCTL_IO_CMD as nix::libc::c_ulong,
                &mut cmd as *mut NvmePassthruCmd,
            )
        };
        if ret < 0 {
            return Err(TransportError::Ioctl {
                verb,
                device: self.name.clone(),
                source: Errno::last(),
            });
        }
        if ret as u16 == NVME_SC_RESERVATION_CONFLICT {
            return Err(TransportError::ReservationConflict {
                verb,
                device: self.name.clone(),
            });
        }
        if ret != 0 {
            return Err(TransportError::Ioctl {
                verb,
                device: self.name.clone(),
                source: Errno::EIO,
            });
        }
        Ok(())
    }

    fn register(
        &self,
        rrega: u32,
        iekey: bool,
        current_key: u64,
        new_key: u64,
    ) -> Result<(), TransportError> {
        let mut cmd = NvmePassthruCmd {
            opcode: OPC_RESERVATION_REGISTER,
            ..Default::default()
        };
        cmd.cdw10 = rrega | if iekey { IEKEY_BIT } else { 0 };
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&current_key.to_le_bytes());
        buf[8..16].copy_from_slice(&new_key.to_le_bytes());
        self.submit(cmd, Some(&mut buf), "Reservation Register")
    }

    fn acquire(
        &self,
        racqa: u32,
        current_key: u64,
        preempt_key: u64,
    ) -> Result<(), TransportError> {
        let mut cmd = NvmePassthruCmd {
            opcode: OPC_RESERVATION_ACQUIRE,
            ..Default::default()
        };
        cmd.cdw10 = racqa | (RESV_TYPE_WERO << 8);
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&current_key.to_le_bytes());
        buf[8..16].copy_from_slice(&preempt_key.to_le_bytes());
        self.submit(cmd, Some(&mut buf), "Reservation Acquire")
    }
}

impl PrTransport for NvmeTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_keys(&self) -> Result<Vec<u64>, TransportError> {
        let mut cmd = NvmePassthruCmd {
            opcode: OPC_RESERVATION_REPORT,
            ..Default::default()
        };
        let mut buf = vec![0u8; 4096];
        cmd.cdw10 = ((buf.len() >> 2) as u32).saturating_sub(1);
        self.submit(cmd, Some(&mut buf), "Reservation Report")?;

        if buf.len() < 24 {
            return Err(TransportError::ShortResponse {
                verb: "Reservation Report",
                device: self.name.clone(),
            });
        }
        let regctl = u16::from_le_bytes(buf[0..2].try_into().unwrap()) as usize;
        let mut keys = Vec::with_capacity(regctl);
        for i in 0..regctl {
            let off = 24 + i * 24;
            if off + 8 > buf.len() {
                break;
            }
            keys.push(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
        }
        Ok(keys)
    }

    fn read_reservation(&self) -> Result<ReservationRecord, TransportError> {
        let mut cmd = NvmePassthruCmd {
            opcode: OPC_RESERVATION_REPORT,
            ..Default::default()
        };
        let mut buf = vec![0u8; 4096];
        cmd.cdw10 = ((buf.len() >> 2) as u32).saturating_sub(1);
        self.submit(cmd, Some(&mut buf), "Reservation Report")?;

        if buf.len() < 24 {
            return Err(TransportError::ShortResponse {
                verb: "Reservation Report",
                device: self.name.clone(),
            });
        }
        let rtype = buf[4];
        let regctl = u16::from_le_bytes(buf[0..2].try_into().unwrap());
        if regctl == 0 || rtype == 0 {
            return Ok(ReservationRecord::default());
        }
        // The holder's key is the first registrant marked `rkey` in its
        // entry; for an all-registrants-style report we surface the first
        // entry, matching the "any-one-of" semantics used for host keys.
        let reservation = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        Ok(ReservationRecord {
            reservation: Some(reservation),
            pr_type: Some(if u32::from(rtype) == RESV_TYPE_WERO {
                PrType::WriteExclusiveRegistrantsOnly
            } else {
                PrType::Other(rtype)
            }),
        })
    }

    fn register_new_key(&self, key: u64) -> Result<(), TransportError> {
        self.register(RREGA_REGISTER, false, 0, key)
    }

    fn register_ignore_key(&self, key: u64) -> Result<(), TransportError> {
        self.register(RREGA_REGISTER, true, 0, key)
    }

    fn update_key(
        &self,
        old: Option<u64>,
        new: u64,
    ) -> Result<(), TransportError> {
        self.register(RREGA_REPLACE, false, old.unwrap_or(0), new)
    }

    fn reserve_key(&self, key: u64) -> Result<(), TransportError> {
        self.acquire(RACQA_ACQUIRE, key, 0)
    }

    fn preempt_key(&self, victim: u64, key: u64) -> Result<(), TransportError> {
        self.acquire(RACQA_PREEMPT, key, victim)
    }
}
