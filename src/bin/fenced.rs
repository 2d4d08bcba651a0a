//! Process entry point: CLI parsing, daemonization, signal wiring, and the
//! exit-code/panic boundary. Everything else lives in the library crate so
//! it can be driven from tests without a real process.

use std::{fs, io::Write, path::Path, sync::atomic::Ordering, time::Duration};

use clap::Parser;
use fenced::{
    config::{FenceArgs, FenceConfig},
    daemonize::{self, RunningCheck},
    enumerate::SysfsEnumerator,
    error::{ExitCode, FenceError},
    fence::{FenceController, SystemClock},
    logging,
    transport::{nvme::NvmeTransport, scsi::ScsiTransport, PrTransport},
};
use tracing::{error, info, warn};

const PID_FILE: &str = "/var/run/fenced.pid";
const ALERT_FILE: &str = "/var/run/fenced_alert";

fn build_transport(name: &str) -> Box<dyn PrTransport> {
    let transport: Result<Box<dyn PrTransport>, _> = if name.starts_with("nvme") {
        NvmeTransport::open(name).map(|t| Box::new(t) as Box<dyn PrTransport>)
    } else {
        ScsiTransport::open(name).map(|t| Box::new(t) as Box<dyn PrTransport>)
    };
    match transport {
        Ok(t) => t,
        Err(e) => {
            // A disk that fails to even open is indistinguishable, from the
            // batch executor's point of view, from one that fails every
            // verb; FakeTransport-style "always error" stands in for it so
            // load_disks' retry-then-drop path handles it uniformly.
            warn!(disk = name, error = %e, "failed to open device, treating as unsupported");
            Box::new(AlwaysFails)
        }
    }
}

struct AlwaysFails;

impl PrTransport for AlwaysFails {
    fn name(&self) -> &str {
        "unopened"
    }
    fn read_keys(&self) -> Result<Vec<u64>, fenced::error::TransportError> {
        Err(open_failed())
    }
    fn read_reservation(
        &self,
    ) -> Result<fenced::transport::ReservationRecord, fenced::error::TransportError> {
        Err(open_failed())
    }
    fn register_new_key(&self, _key: u64) -> Result<(), fenced::error::TransportError> {
        Err(open_failed())
    }
    fn register_ignore_key(&self, _key: u64) -> Result<(), fenced::error::TransportError> {
        Err(open_failed())
    }
    fn update_key(
        &self,
        _old: Option<u64>,
        _new: u64,
    ) -> Result<(), fenced::error::TransportError> {
        Err(open_failed())
    }
    fn reserve_key(&self, _key: u64) -> Result<(), fenced::error::TransportError> {
        Err(open_failed())
    }
    fn preempt_key(&self, _victim: u64, _key: u64) -> Result<(), fenced::error::TransportError> {
        Err(open_failed())
    }
}

fn open_failed() -> fenced::error::TransportError {
    fenced::error::TransportError::Open {
        device: "unopened".to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "device was never opened"),
    }
}

/// An unclean reboot is about to happen. Write the alert sentinel so
/// whatever watches `ALERT_FILE` can correlate the reboot with fencing,
/// then trip the kernel's sysrq-trigger to force it immediately.
fn panic_now(reason: &str) -> ! {
    if let Err(e) = daemonize::write_alert_sentinel(Path::new(ALERT_FILE)) {
        warn!(error = %e, "failed to write alert sentinel file");
    }

    error!(reason, "FATAL: issuing an immediate panic");

    let sysrq = fs::OpenOptions::new().write(true).open("/proc/sys/kernel/sysrq");
    if let Ok(mut f) = sysrq {
        let _ = f.write_all(b"1");
    }
    let trigger = fs::OpenOptions::new().write(true).open("/proc/sysrq-trigger");
    if let Ok(mut f) = trigger {
        let _ = f.write_all(b"b");
    }

    // If we got here, the running kernel doesn't support sysrq (e.g. a
    // container or test host). There is nothing safer left to do than
    // exit loudly.
    std::process::exit(ExitCode::Unknown as i32);
}

fn run(config: FenceConfig, force: bool) -> Result<(), FenceError> {
    let enumerator = Box::new(SysfsEnumerator::new(config.use_zpools));
    let mut fc = FenceController::new(
        config.clone(),
        enumerator,
        Box::new(build_transport),
        Box::new(SystemClock),
    );

    let signals = fc.signals.clone();
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGHUP, {
            let reload = signals.reload.clone();
            move || reload.store(true, Ordering::SeqCst)
        })
        .ok();
        signal_hook::low_level::register(signal_hook::consts::SIGUSR1, {
            let dump = signals.dump_info.clone();
            move || dump.store(true, Ordering::SeqCst)
        })
        .ok();
    }

    let mut key = fc.init(force)?;
    let interval = Duration::from_secs(config.interval_secs.max(1));
    loop {
        key = fc.tick(key)?;
        std::thread::sleep(interval);
    }
}

fn main() {
    let args = FenceArgs::parse();
    let config: FenceConfig = args.clone().into();

    logging::init(config.foreground);

    if daemonize::PidFileCheck::new(PID_FILE).already_running() {
        error!("a fenced process is already running");
        std::process::exit(ExitCode::AlreadyRunning as i32);
    }

    if let Err(e) = daemonize::raise_nofile_limit() {
        warn!(error = %e, "failed to raise RLIMIT_NOFILE");
    }

    if config.foreground {
        info!("running in foreground mode");
    } else {
        info!("entering daemon mode");
        if let Err(e) = daemonize::daemonize() {
            error!(error = %e, "failed to daemonize");
            std::process::exit(ExitCode::Unknown as i32);
        }
    }

    daemonize::write_pid_file(Path::new(PID_FILE));

    let no_panic = config.no_panic;
    match run(config, args.force) {
        Ok(()) => unreachable!("the fencing loop only returns via an error"),
        Err(FenceError::Preempted { disk, peer_hostid }) => {
            let reason = format!(
                "reservation for disk {disk} was preempted by host 0x{peer_hostid:08x}"
            );
            if no_panic {
                warn!(reason, "no-panic set, exiting instead of panicking");
                std::process::exit(ExitCode::NoPanic as i32);
            }
            panic_now(&reason);
        }
        Err(e) => {
            error!(error = %e, "fatal error");
            std::process::exit(e.exit_code() as i32);
        }
    }
}
