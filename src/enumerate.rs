//! Enumerator Adapter: discovers eligible block devices and hands back the
//! per-disk diagnostic payload surfaced on SIGUSR1.
//!
//! The default implementation scans `/sys/block` rather than `libudev` or
//! `/dev` globbing: by the time fencing starts the system has been booted
//! into multi-user mode for a while, and sysfs does not flap the way
//! userspace rescans can.

use std::{
    collections::HashSet,
    fs,
    path::Path,
};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, warn};

use crate::disk::LogInfo;

static SD_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^sd[a-z]+$").unwrap());
static NVME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^nvme\d+n\d+$").unwrap());

/// One disk handed back by enumeration, with whatever diagnostic payload
/// the enumerator considers relevant (serial/type, or zpool membership).
#[derive(Debug, Clone)]
pub struct EnumeratedDisk {
    pub name: String,
    pub log_info: LogInfo,
}

#[derive(Debug, snafu::Snafu)]
pub enum EnumerationError {
    #[snafu(display("excluding every detected disk is not allowed"))]
    AllExcluded,
}

/// Abstraction over disk discovery so the fence controller can be driven by
/// a fake enumerator in tests.
pub trait Enumerator {
    fn enumerate(
        &self,
        exclude: &HashSet<String>,
    ) -> Result<Vec<EnumeratedDisk>, EnumerationError>;
}

/// sysfs-backed default. `use_zpools` is accepted and logged but otherwise a
/// no-op: restricting the reservation set to zpool membership would require
/// shelling out to `zpool`/`libzfs`, a true external collaborator that is
/// out of scope here.
pub struct SysfsEnumerator {
    use_zpools: bool,
}

impl SysfsEnumerator {
    pub fn new(use_zpools: bool) -> Self {
        if use_zpools {
            warn!("--use-zpools requested but the sysfs enumerator treats it as a no-op");
        }
        Self { use_zpools }
    }

    fn is_eligible(entry: &Path, name: &str) -> bool {
        // /sys/block entries are symlinks into /sys/devices/...; a plain
        // file or directory here would not be a real block device.
        if !fs::symlink_metadata(entry).map(|m| m.is_symlink()).unwrap_or(false) {
            return false;
        }
        if name.starts_with("pmem") {
            return false;
        }
        if !(SD_PATTERN.is_match(name) || NVME_PATTERN.is_match(name)) {
            return false;
        }
        entry.join("dev").exists()
    }
}

impl Enumerator for SysfsEnumerator {
    fn enumerate(
        &self,
        exclude: &HashSet<String>,
    ) -> Result<Vec<EnumeratedDisk>, EnumerationError> {
        let _ = self.use_zpools;
        let mut found = Vec::new();

        let entries = match fs::read_dir("/sys/block") {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "failed to enumerate /sys/block");
                return Ok(found);
            }
        };

        let mut candidates = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if Self::is_eligible(&entry.path(), &name) {
                candidates.push(name);
            }
        }

        if !candidates.is_empty() && candidates.iter().all(|n| exclude.contains(n)) {
            return Err(EnumerationError::AllExcluded);
        }

        let names: Vec<String> = candidates.into_iter().filter(|n| !exclude.contains(n)).collect();
        for name in names {
            found.push(EnumeratedDisk {
                log_info: LogInfo(vec![("name".to_string(), name.clone())]),
                name,
            });
        }
        Ok(found)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sd_and_nvme_patterns_match() {
        assert!(SD_PATTERN.is_match("sda"));
        assert!(SD_PATTERN.is_match("sdaa"));
        assert!(!SD_PATTERN.is_match("sd1"));
        assert!(NVME_PATTERN.is_match("nvme0n1"));
        assert!(!NVME_PATTERN.is_match("nvme0"));
    }

    #[test]
    fn pmem_is_never_eligible() {
        assert!(!SysfsEnumerator::is_eligible(Path::new("/sys/block/pmem0"), "pmem0"));
    }

    #[test]
    fn non_matching_name_is_not_eligible() {
        assert!(!SysfsEnumerator::is_eligible(Path::new("/sys/block/loop0"), "loop0"));
    }
}
