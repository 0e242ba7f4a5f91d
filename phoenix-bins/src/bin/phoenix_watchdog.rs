//! External watchdog for the Phoenix supervisor
//!
//! Runs as a separate process and reads the beacon file the supervisor
//! refreshes on every liveness interval. A beacon older than the silence
//! bound (or missing altogether) means the supervisor itself has stopped;
//! the watchdog logs an error and exits non-zero so the process manager can
//! act on it.

use anyhow::{bail, Result};
use clap::Parser;
use phoenix_bins::common::CommonArgs;
use phoenix_core::core::{CancelToken, Clock, SystemClock};
use phoenix_core::resilience::SupervisorBeacon;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Watch the Phoenix supervisor beacon")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Beacon file, overrides `heartbeat.beacon_path`
    #[arg(long)]
    beacon: Option<PathBuf>,

    /// Silence bound in seconds, overrides `heartbeat.liveness_silence_bound_secs`
    #[arg(long)]
    bound_secs: Option<u64>,

    /// Seconds between checks
    #[arg(long, default_value = "5")]
    check_interval_secs: u64,

    /// Check once and exit
    #[arg(long)]
    once: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Alive(Duration),
    Silent(Duration),
    Missing(String),
}

fn check(path: &Path, bound: Duration, now_ms: u64) -> Verdict {
    match SupervisorBeacon::read_file(path) {
        Ok(last_ms) => {
            let silence = Duration::from_millis(now_ms.saturating_sub(last_ms));
            if silence > bound {
                Verdict::Silent(silence)
            } else {
                Verdict::Alive(silence)
            }
        }
        Err(e) => Verdict::Missing(e.to_string()),
    }
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = args.common.init()?;

    let Some(path) = args.beacon.clone().or(config.heartbeat.beacon_path.clone()) else {
        bail!("no beacon file: pass --beacon or set heartbeat.beacon_path");
    };
    let bound = Duration::from_secs(
        args.bound_secs
            .unwrap_or(config.heartbeat.liveness_silence_bound_secs),
    );
    let interval = Duration::from_secs(args.check_interval_secs.max(1));
    let clock = SystemClock;

    info!(
        "Watching supervisor beacon {} (silence bound {:?})",
        path.display(),
        bound
    );

    let stop = CancelToken::new();
    let stop_ctrlc = stop.clone();
    ctrlc::set_handler(move || stop_ctrlc.cancel())?;

    // a fresh supervisor gets one bound of grace before a missing file counts
    let grace_until = clock.wall_millis() + bound.as_millis() as u64;

    loop {
        let now_ms = clock.wall_millis();
        match check(&path, bound, now_ms) {
            Verdict::Alive(silence) => debug!("Supervisor alive (last beacon {:?} ago)", silence),
            Verdict::Silent(silence) => {
                error!(
                    "SUPERVISOR SILENT: last beacon {:?} ago exceeds bound {:?}",
                    silence, bound
                );
                return Ok(ExitCode::from(2));
            }
            Verdict::Missing(reason) if args.once || now_ms >= grace_until => {
                error!("Supervisor beacon unreadable at {}: {}", path.display(), reason);
                return Ok(ExitCode::from(3));
            }
            Verdict::Missing(reason) => warn!("Beacon not yet readable: {}", reason),
        }
        if args.once || stop.wait_for(interval) {
            break;
        }
    }

    info!("Watchdog stopped");
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdicts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beacon");
        let bound = Duration::from_secs(30);

        assert!(matches!(check(&path, bound, 1_000), Verdict::Missing(_)));

        let beacon = SupervisorBeacon::new(Some(path.clone()));
        beacon.touch(1_700_000_000_000);
        assert_eq!(
            check(&path, bound, 1_700_000_030_000),
            Verdict::Alive(Duration::from_secs(30))
        );
        assert_eq!(
            check(&path, bound, 1_700_000_030_001),
            Verdict::Silent(Duration::from_millis(30_001))
        );
    }
}
