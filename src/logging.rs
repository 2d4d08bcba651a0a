//! Tracing setup. `RUST_LOG` wins when set; otherwise falls back to
//! `debug` in foreground mode (so an operator attached to a terminal sees
//! everything) or `info` when daemonized.

use tracing_subscriber::EnvFilter;

pub fn init(foreground: bool) {
    let default = if foreground { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if foreground {
        subscriber.init();
    } else {
        subscriber.with_ansi(false).init();
    }
}
