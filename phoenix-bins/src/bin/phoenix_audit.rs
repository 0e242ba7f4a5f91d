//! Offline audit log tool
//!
//! `verify` replays a persisted JSONL audit file and checks every hash link.
//! `query` prints the matching records as JSON lines on stdout.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use phoenix_core::audit::{verify_chain, AuditLog, AuditQuery, AuditRecord, AuditRecordType};
use phoenix_core::utils::init_stderr_logger;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Verify and query Phoenix audit logs")]
struct Cli {
    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the hash chain of an audit file
    Verify { path: PathBuf },

    /// Print records matching a filter as JSON lines
    Query {
        path: PathBuf,

        /// Record type, e.g. TIER_CHANGE
        #[arg(long = "type")]
        record_type: Option<String>,

        /// Emitting component
        #[arg(long)]
        component: Option<String>,

        /// Inclusive lower bound, Unix millis
        #[arg(long)]
        from_ms: Option<u64>,

        /// Inclusive upper bound, Unix millis
        #[arg(long)]
        to_ms: Option<u64>,

        /// Print records even if the chain does not verify
        #[arg(long)]
        allow_broken: bool,
    },
}

fn build_query(
    record_type: Option<&str>,
    component: Option<String>,
    from_ms: Option<u64>,
    to_ms: Option<u64>,
) -> Result<AuditQuery> {
    let mut query = match record_type {
        Some(name) => AuditQuery::of_type(
            AuditRecordType::parse(name).ok_or_else(|| anyhow!("unknown record type {name}"))?,
        ),
        None => AuditQuery::all(),
    };
    if let Some(component) = component {
        query = query.component(component);
    }
    query.from_ms = from_ms;
    query.to_ms = to_ms;
    Ok(query)
}

fn select<'a>(records: &'a [AuditRecord], query: &AuditQuery) -> Vec<&'a AuditRecord> {
    records.iter().filter(|r| query.matches(r)).collect()
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    // stdout carries only records
    init_stderr_logger(&cli.log_level);

    match cli.command {
        Command::Verify { path } => {
            let records = AuditLog::load_file(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match verify_chain(&records) {
                Ok(()) => {
                    info!("{}: chain intact ({} records)", path.display(), records.len());
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    error!("{}: {}", path.display(), e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Query {
            path,
            record_type,
            component,
            from_ms,
            to_ms,
            allow_broken,
        } => {
            let query = build_query(record_type.as_deref(), component, from_ms, to_ms)?;
            let records = AuditLog::load_file(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            if let Err(e) = verify_chain(&records) {
                if !allow_broken {
                    error!("{}: {} (pass --allow-broken to print anyway)", path.display(), e);
                    return Ok(ExitCode::FAILURE);
                }
                warn!("{}: {}", path.display(), e);
            }

            let stdout = io::stdout();
            let mut out = stdout.lock();
            let selected = select(&records, &query);
            for record in &selected {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            info!("{} of {} records matched", selected.len(), records.len());
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_core::core::{Clock, ManualClock};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_query_filters() {
        let clock: Arc<dyn Clock> = ManualClock::shared();
        let log = AuditLog::in_memory(clock);
        log.append(AuditRecordType::TierChange, "coordinator", &json!({})).unwrap();
        log.append(AuditRecordType::HaltEngaged, "halt", &json!({})).unwrap();
        log.append(AuditRecordType::TierChange, "operator", &json!({})).unwrap();
        let records = log.records();

        let q = build_query(Some("tier_change"), None, None, None).unwrap();
        assert_eq!(select(&records, &q).len(), 2);

        let q = build_query(Some("TIER_CHANGE"), Some("operator".into()), None, None).unwrap();
        let hits = select(&records, &q);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 3);

        assert!(build_query(Some("NOT_A_TYPE"), None, None, None).is_err());
    }
}
