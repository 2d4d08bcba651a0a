//! Command-line surface and the internal configuration derived from it.

use std::collections::HashSet;

use clap::Parser;

fn parse_exclude_disks(value: &str) -> Result<HashSet<String>, std::convert::Infallible> {
    Ok(value
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

/// Storage fencing daemon: places SCSI-3/NVMe persistent reservations on
/// every eligible disk and panics the kernel if a peer controller ever
/// preempts this host's reservation.
#[derive(Debug, Clone, Parser)]
#[clap(name = "fenced", about)]
pub struct FenceArgs {
    /// Do not check existing disk reservations before taking over.
    #[clap(short = 'f', long)]
    pub force: bool,

    /// Run in the foreground instead of daemonizing.
    #[clap(short = 'F', long)]
    pub foreground: bool,

    /// Do not panic the kernel on a fatal reservation loss; exit instead.
    #[clap(short = 'n', long = "no-panic", visible_alias = "np")]
    pub no_panic: bool,

    /// Seconds between each reservation set/check tick.
    #[clap(short = 'i', long, default_value_t = 5)]
    pub interval: u64,

    /// Disks to exclude from reservations, comma- or whitespace-separated.
    #[clap(
        short = 'e',
        long = "exclude-disks",
        visible_alias = "ed",
        default_value = "",
        value_parser = parse_exclude_disks
    )]
    pub exclude_disks: HashSet<String>,

    /// Restrict reservations to disks backing a detected zpool.
    #[clap(short = 'u', long = "use-zpools", visible_alias = "uz")]
    pub use_zpools: bool,
}

/// Configuration actually consumed by the fence controller, decoupled from
/// the CLI's string/flag representation.
#[derive(Debug, Clone)]
pub struct FenceConfig {
    pub force: bool,
    pub foreground: bool,
    pub no_panic: bool,
    pub interval_secs: u64,
    pub exclude_disks: HashSet<String>,
    pub use_zpools: bool,
}

impl From<FenceArgs> for FenceConfig {
    fn from(args: FenceArgs) -> Self {
        Self {
            force: args.force,
            foreground: args.foreground,
            no_panic: args.no_panic,
            interval_secs: args.interval,
            exclude_disks: args.exclude_disks,
            use_zpools: args.use_zpools,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_comma_and_whitespace_separated_excludes() {
        let got = parse_exclude_disks("sda, sdb sdc,, sdd").unwrap();
        assert_eq!(
            got,
            HashSet::from([
                "sda".to_string(),
                "sdb".to_string(),
                "sdc".to_string(),
                "sdd".to_string(),
            ])
        );
    }

    #[test]
    fn empty_exclude_string_yields_empty_set() {
        assert!(parse_exclude_disks("").unwrap().is_empty());
    }
}
