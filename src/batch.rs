//! Batch Executor: parallel fan-out of one [`DiskOp`] over a set of disks,
//! capped concurrency, bounded per-round timeout, no cancellation.
//!
//! Disks are held behind `Arc<Mutex<Disk>>` so that an abandoned (timed
//! out) worker can keep running after the round deadline passes without
//! the Disk State itself being lost from the owning Disk Set: the mutex,
//! still locked by the stray worker, simply makes that disk's next
//! operation block until the kernel's previous ioctl actually completes,
//! which mirrors what would happen on the real block device anyway.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel;
use tracing::warn;

use crate::{
    disk::{Disk, DiskOp, DiskOpResult},
    error::TransportError,
};

/// Maximum concurrent worker threads per batch, regardless of `|disks|`.
pub const CAP: usize = 30;

/// Per-round deadline. A worker that has not reported back by this point is
/// classified as failed for this round; it is not interrupted.
pub const ROUND_TIMEOUT: Duration = Duration::from_secs(30);

/// One completed (or timed-out-never-completed) disk call.
pub struct Completion {
    pub name: String,
    pub result: Option<Result<DiskOpResult, TransportError>>,
}

pub struct BatchExecutor;

impl BatchExecutor {
    /// Run `op` against every disk in `disks`, returning the set of disk
    /// names whose call errored or did not complete within
    /// [`ROUND_TIMEOUT`]. Timeouts are classified as failures.
    pub fn run(op: DiskOp, disks: &[Arc<Mutex<Disk>>]) -> HashSet<String> {
        Self::run_full(op, disks, |name, result| match result {
            Some(Ok(_)) => false,
            Some(Err(_)) => true,
            None => {
                warn!(disk = name, "batch round timed out waiting for disk");
                true
            }
        })
    }

    /// Richer variant used by `get_keys`: the callback receives every
    /// completion (including unreported timeouts, as `None`) and decides
    /// failure itself, the same shape the original per-completion callback
    /// had.
    pub fn run_full(
        op: DiskOp,
        disks: &[Arc<Mutex<Disk>>],
        mut on_completion: impl FnMut(&str, Option<Result<DiskOpResult, TransportError>>) -> bool,
    ) -> HashSet<String> {
        let completions = Self::dispatch(op, disks);
        let mut failed = HashSet::new();
        for c in completions {
            if on_completion(&c.name, c.result) {
                failed.insert(c.name);
            }
        }
        failed
    }

    fn dispatch(op: DiskOp, disks: &[Arc<Mutex<Disk>>]) -> Vec<Completion> {
        let deadline = Instant::now() + ROUND_TIMEOUT;
        let total = disks.len();

        let (job_tx, job_rx) = channel::unbounded::<Arc<Mutex<Disk>>>();
        let (res_tx, res_rx) =
            channel::unbounded::<(String, Result<DiskOpResult, TransportError>)>();

        for d in disks {
            job_tx.send(d.clone()).expect("receiver outlives this fn");
        }
        drop(job_tx);

        let workers = CAP.min(total.max(1));
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            thread::spawn(move || {
                while let Ok(disk) = job_rx.recv() {
                    let name = disk.lock().unwrap().name().to_string();
                    let result = disk.lock().unwrap().apply(op);
                    if res_tx.send((name, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(res_tx);

        let mut pending: HashSet<String> =
            disks.iter().map(|d| d.lock().unwrap().name().to_string()).collect();
        let mut completions = Vec::with_capacity(total);

        while !pending.is_empty() {
            match res_rx.recv_deadline(deadline) {
                Ok((name, result)) => {
                    pending.remove(&name);
                    completions.push(Completion {
                        name,
                        result: Some(result),
                    });
                }
                Err(_) => break, // deadline exceeded, or every worker exited
            }
        }

        if !pending.is_empty() {
            warn!(
                count = pending.len(),
                "batch round timed out; abandoning in-flight workers"
            );
        }
        for name in pending {
            completions.push(Completion {
                name,
                result: None,
            });
        }
        completions
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        disk::LogInfo,
        transport::fake::{FakeState, FakeTransport},
    };

    fn disk(name: &str, hostid: u32, state: FakeState) -> Arc<Mutex<Disk>> {
        let t = FakeTransport::with_state(name, state);
        Arc::new(Mutex::new(Disk::new(name, hostid, Box::new(t), LogInfo::default())))
    }

    #[test]
    fn all_succeed_within_cap() {
        let disks: Vec<_> = (0..5)
            .map(|i| disk(&format!("d{i}"), 1, FakeState::default()))
            .collect();
        let failed = BatchExecutor::run(DiskOp::RegisterKey(5), &disks);
        assert!(failed.is_empty());
        for d in &disks {
            assert!(d.lock().unwrap().curkey().is_some());
        }
    }

    #[test]
    fn a_single_erroring_disk_is_reported_failed() {
        let good = disk("good", 1, FakeState::default());
        let bad = disk(
            "bad",
            1,
            FakeState {
                fail_countdown: u32::MAX,
                ..Default::default()
            },
        );
        let disks = vec![good.clone(), bad.clone()];
        let failed = BatchExecutor::run(DiskOp::RegisterKey(1), &disks);
        assert_eq!(failed, HashSet::from(["bad".to_string()]));
        assert!(good.lock().unwrap().curkey().is_some());
    }

    #[test]
    fn exceeds_cap_disk_count_still_completes() {
        let disks: Vec<_> = (0..(CAP + 10))
            .map(|i| disk(&format!("d{i}"), 1, FakeState::default()))
            .collect();
        let failed = BatchExecutor::run(DiskOp::RegisterKey(1), &disks);
        assert!(failed.is_empty());
    }
}
