//! SCSI-3 Persistent Reservation transport, issued via the Linux `SG_IO`
//! ioctl against a `/dev/<name>` SCSI generic-capable block device.
//!
//! CDB layout follows SPC-3: PERSISTENT RESERVE IN is opcode `0x5E`,
//! PERSISTENT RESERVE OUT is `0x5F`. We only ever request a
//! Write-Exclusive-Registrants-Only (`WERO`, type `0x07`) reservation.

use std::{
    fs::{File, OpenOptions},
    os::unix::io::AsRawFd,
};

use nix::errno::Errno;

use super::{PrTransport, PrType, ReservationRecord};
use crate::error::TransportError;

const SG_IO: u64 = 0x2285;
const SG_DXFER_NONE: i32 = -1;
const SG_DXFER_TO_DEV: i32 = -2;
const SG_DXFER_FROM_DEV: i32 = -3;

const SCSI_STATUS_RESERVATION_CONFLICT: u8 = 0x18;
const SCSI_STATUS_CHECK_CONDITION: u8 = 0x02;

const PR_IN: u8 = 0x5e;
const PR_OUT: u8 = 0x5f;

const PR_IN_READ_KEYS: u8 = 0x00;
const PR_IN_READ_RESERVATION: u8 = 0x01;

const PR_OUT_REGISTER: u8 = 0x00;
const PR_OUT_RESERVE: u8 = 0x01;
const PR_OUT_PREEMPT: u8 = 0x04;
const PR_OUT_REGISTER_IGNORE: u8 = 0x06;

const RESV_TYPE_WERO: u8 = 0x07;

#[repr(C)]
struct SgIoHdr {
    interface_id: i32,
    dxfer_direction: i32,
    cmd_len: u8,
    mx_sb_len: u8,
    iovec_count: u16,
    dxfer_len: u32,
    dxferp: u64,
    cmdp: u64,
    sbp: u64,
    timeout: u32,
    flags: u32,
    pack_id: i32,
    usr_ptr: u64,
    status: u8,
    masked_status: u8,
    msg_status: u8,
    sb_len_wr: u8,
    host_status: u16,
    driver_status: u16,
    resid: i32,
    duration: u32,
    info: u32,
}

impl Default for SgIoHdr {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

/// A PR transport handle bound to one SCSI block device.
pub struct ScsiTransport {
    name: String,
    file: File,
}

impl ScsiTransport {
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

    fn pr_in(
        &self,
        service_action: u8,
        alloc_len: u16,
    ) -> Result<Vec<u8>, TransportError> {
        let mut cdb = [0u8; 10];
        cdb[0] = PR_IN;
        cdb[1] = service_action;
        cdb[7..9].copy_from_slice(&alloc_len.to_be_bytes());

        let mut buf = vec![0u8; alloc_len as usize];
        self.sg_io(
            &cdb,
            SG_DXFER_FROM_DEV,
            Some(&mut buf),
            "PERSISTENT RESERVE IN",
        )?;
        Ok(buf)
    }

    fn pr_out(
        &self,
        service_action: u8,
        resv_type: u8,
        params: &[u8; 24],
        verb: &'static str,
    ) -> Result<(), TransportError> {
        let mut cdb = [0u8; 10];
        cdb[0] = PR_OUT;
        cdb[1] = service_action;
        cdb[2] = resv_type & 0x0f;
        cdb[7..9].copy_from_slice(&(params.len() as u16).to_be_bytes());

        let mut buf = *params;
        self.sg_io(&cdb, SG_DXFER_TO_DEV, Some(&mut buf), verb)
    }

    fn sg_io(
        &self,
        cdb: &[u8],
        direction: i32,
        data: Option<&mut [u8]>,
        verb: &'static str,
    ) -> Result<(), TransportError> {
        let mut sense = [0u8; 32];
        let mut hdr = SgIoHdr {
            interface_id: 'S' as i32,
            dxfer_direction: if data.is_some() {
                direction
            } else {
                SG_DXFER_NONE
            },
            cmd_len: cdb.len() as u8,
            mx_sb_len: sense.len() as u8,
            dxfer_len: data.as_ref().map(|d| d.len()).unwrap_or(0) as u32,
            dxferp: data
                .map(|d| d.as_mut_ptr() as u64)
                .unwrap_or(0),
            cmdp: cdb.as_ptr() as u64,
            sbp: sense.as_mut_ptr() as u64,
            timeout: 30_000,
            ..Default::default()
        };

        let ret = unsafe {
            nix::libc::ioctl(
                self.file.as_raw_fd(),
                SG_IO as nix::libc::c_ulong,
                &mut hdr as *mut SgIoHdr,
            )
        };
        if ret < 0 {
            return Err(TransportError::Ioctl {
                verb,
                device: self.name.clone(),
                source: Errno::last(),
            });
        }

        if hdr.status == SCSI_STATUS_RESERVATION_CONFLICT {
            return Err(TransportError::ReservationConflict {
                verb,
                device: self.name.clone(),
            });
        }
        if hdr.status == SCSI_STATUS_CHECK_CONDITION || hdr.host_status != 0 {
            return Err(TransportError::Ioctl {
                verb,
                device: self.name.clone(),
                source: Errno::EIO,
            });
        }
        Ok(())
    }

    fn params_for(reservation_key: u64, service_action_key: u64) -> [u8; 24] {
        let mut p = [0u8; 24];
        p[0..8].copy_from_slice(&reservation_key.to_be_bytes());
        p[8..16].copy_from_slice(&service_action_key.to_be_bytes());
        p
    }
}

impl PrTransport for ScsiTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_keys(&self) -> Result<Vec<u64>, TransportError> {
        let buf = self.pr_in(PR_IN_READ_KEYS, 4096)?;
        if buf.len() < 8 {
            return Err(TransportError::ShortResponse {
                verb: "PERSISTENT RESERVE IN (READ KEYS)",
                device: self.name.clone(),
            });
        }
        let additional_len =
            u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        let n = additional_len / 8;
        let mut keys = Vec::with_capacity(n);
        for i in 0..n {
            let off = 8 + i * 8;
            if off + 8 > buf.len() {
                break;
            }
            keys.push(u64::from_be_bytes(buf[off..off + 8].try_into().unwrap()));
        }
        Ok(keys)
    }

    fn read_reservation(&self) -> Result<ReservationRecord, TransportError> {
        let buf = self.pr_in(PR_IN_READ_RESERVATION, 4096)?;
        if buf.len() < 8 {
            return Err(TransportError::ShortResponse {
                verb: "PERSISTENT RESERVE IN (READ RESERVATION)",
                device: self.name.clone(),
            });
        }
        let additional_len =
            u32::from_be_bytes(buf[4..8].try_into().unwrap());
        if additional_len == 0 || buf.len() < 22 {
            return Ok(ReservationRecord::default());
        }
        let reservation = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        let pr_type = buf[21] & 0x0f;
        Ok(ReservationRecord {
            reservation: Some(reservation),
            pr_type: Some(if pr_type == RESV_TYPE_WERO {
                PrType::WriteExclusiveRegistrantsOnly
            } else {
                PrType::Other(pr_type)
            }),
        })
    }

    fn register_new_key(&self, key: u64) -> Result<(), TransportError> {
        let params = Self::params_for(0, key);
        self.pr_out(PR_OUT_REGISTER, 0, &params, "PERSISTENT RESERVE OUT (REGISTER)")
    }

    fn register_ignore_key(&self, key: u64) -> Result<(), TransportError> {
        let params = Self::params_for(0, key);
        self.pr_out(
            PR_OUT_REGISTER_IGNORE,
            0,
            &params,
            "PERSISTENT RESERVE OUT (REGISTER AND IGNORE EXISTING KEY)",
        )
    }

    fn update_key(
        &self,
        old: Option<u64>,
        new: u64,
    ) -> Result<(), TransportError> {
        let params = Self::params_for(old.unwrap_or(0), new);
        self.pr_out(PR_OUT_REGISTER, 0, &params, "PERSISTENT RESERVE OUT (REGISTER)")
    }

    fn reserve_key(&self, key: u64) -> Result<(), TransportError> {
        let params = Self::params_for(key, 0);
        self.pr_out(
            PR_OUT_RESERVE,
            RESV_TYPE_WERO,
            &params,
            "PERSISTENT RESERVE OUT (RESERVE)",
        )
    }

    fn preempt_key(&self, victim: u64, key: u64) -> Result<(), TransportError> {
        let params = Self::params_for(key, victim);
        self.pr_out(
            PR_OUT_PREEMPT,
            RESV_TYPE_WERO,
            &params,
            "PERSISTENT RESERVE OUT (PREEMPT)",
        )
    }
}
