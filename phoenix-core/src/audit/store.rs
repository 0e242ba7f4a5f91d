//! Append-only audit log with optional JSONL persistence
//!
//! One line per record, flushed on every append. Reopening a file replays and
//! verifies the existing chain before new records are linked onto it.
//!
//! The in-memory chain is authoritative. A line the sink refuses stays in a
//! backlog, tracked to the byte, and is written ahead of the next record, so
//! the file never holds a torn, repeated or out-of-order line.

use super::record::{verify_chain, AuditRecord, AuditRecordType, ChainError, GENESIS_HASH};
use crate::core::clock::Clock;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("audit payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit file line {line} unreadable: {message}")]
    Parse { line: usize, message: String },

    #[error("audit chain invalid: {0}")]
    Chain(#[from] ChainError),
}

/// Filter for [`AuditLog::query`]; every unset field matches everything
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Inclusive lower bound, Unix millis
    pub from_ms: Option<u64>,
    /// Inclusive upper bound, Unix millis
    pub to_ms: Option<u64>,
    pub record_type: Option<AuditRecordType>,
    pub component: Option<String>,
}

impl AuditQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of_type(record_type: AuditRecordType) -> Self {
        Self {
            record_type: Some(record_type),
            ..Default::default()
        }
    }

    pub fn between(mut self, from_ms: u64, to_ms: u64) -> Self {
        self.from_ms = Some(from_ms);
        self.to_ms = Some(to_ms);
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.from_ms.map_or(true, |from| record.timestamp_ms >= from)
            && self.to_ms.map_or(true, |to| record.timestamp_ms <= to)
            && self.record_type.map_or(true, |t| record.record_type == t)
            && self
                .component
                .as_deref()
                .map_or(true, |c| record.component == c)
    }
}

/// Serialized lines not yet accepted by the sink
#[derive(Default)]
struct Backlog {
    lines: VecDeque<Vec<u8>>,
    /// Bytes of the front line already written
    offset: usize,
}

impl Backlog {
    fn drain(&mut self, sink: &mut (dyn Write + Send)) -> io::Result<()> {
        while let Some(line) = self.lines.front() {
            while self.offset < line.len() {
                match sink.write(&line[self.offset..]) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => self.offset += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            self.lines.pop_front();
            self.offset = 0;
        }
        sink.flush()
    }
}

struct AuditInner {
    records: Vec<AuditRecord>,
    last_hash: String,
    next_id: u64,
    sink: Option<Box<dyn Write + Send>>,
    backlog: Backlog,
    write_failures: u64,
}

impl AuditInner {
    fn new(records: Vec<AuditRecord>, sink: Option<Box<dyn Write + Send>>) -> Self {
        let last_hash = records
            .last()
            .map_or_else(|| GENESIS_HASH.to_string(), |r| r.hash.clone());
        let next_id = records.last().map_or(1, |r| r.id + 1);
        Self {
            records,
            last_hash,
            next_id,
            sink,
            backlog: Backlog::default(),
            write_failures: 0,
        }
    }
}

/// The global append-only audit store
pub struct AuditLog {
    clock: Arc<dyn Clock>,
    path: Option<PathBuf>,
    inner: Mutex<AuditInner>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

impl AuditLog {
    /// Memory-only log (tests, dry runs)
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            path: None,
            inner: Mutex::new(AuditInner::new(Vec::new(), None)),
        }
    }

    /// Fresh chain persisted to an arbitrary sink
    pub fn with_sink(sink: impl Write + Send + 'static, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            path: None,
            inner: Mutex::new(AuditInner::new(Vec::new(), Some(Box::new(sink)))),
        }
    }

    /// Open (or create) a JSONL-backed log, verifying any existing chain
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            Self::load_file(&path)?
        } else {
            Vec::new()
        };
        verify_chain(&records)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(
            "Audit log opened at {} ({} existing records)",
            path.display(),
            records.len()
        );

        Ok(Self {
            clock,
            path: Some(path),
            inner: Mutex::new(AuditInner::new(records, Some(Box::new(file)))),
        })
    }

    /// Read every record of a JSONL audit file without verifying it
    pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, AuditError> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| AuditError::Parse {
                line: idx + 1,
                message: e.to_string(),
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Append one record, chained to its predecessor
    ///
    /// The record joins the in-memory chain even when the sink fails; its line
    /// waits in the backlog and `write_failures` is bumped.
    pub fn append<P: Serialize + ?Sized>(
        &self,
        record_type: AuditRecordType,
        component: &str,
        payload: &P,
    ) -> Result<u64, AuditError> {
        let payload = serde_json::to_value(payload)?;
        let timestamp_ms = self.clock.wall_millis();

        let mut inner = self.inner.lock();
        let record = AuditRecord::seal(
            inner.next_id,
            record_type,
            timestamp_ms,
            component.to_string(),
            payload,
            inner.last_hash.clone(),
        );

        if inner.sink.is_some() {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            inner.backlog.lines.push_back(line);
        }

        let id = record.id;
        inner.last_hash = record.hash.clone();
        inner.next_id += 1;
        inner.records.push(record);

        let AuditInner {
            sink,
            backlog,
            write_failures,
            ..
        } = &mut *inner;
        if let Some(sink) = sink.as_mut() {
            if let Err(e) = backlog.drain(&mut **sink) {
                *write_failures += 1;
                error!(
                    "Audit record {} not persisted ({} lines pending): {}",
                    id,
                    backlog.lines.len(),
                    e
                );
            }
        }
        Ok(id)
    }

    /// Append and log (rather than propagate) a failure
    ///
    /// Used on transition paths where the state change has already happened.
    pub fn record<P: Serialize + ?Sized>(
        &self,
        record_type: AuditRecordType,
        component: &str,
        payload: &P,
    ) -> Option<u64> {
        match self.append(record_type, component, payload) {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Audit append failed for {} from {}: {}", record_type, component, e);
                None
            }
        }
    }

    pub fn query(&self, query: &AuditQuery) -> Vec<AuditRecord> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect()
    }

    pub fn count(&self, query: &AuditQuery) -> usize {
        self.inner.lock().records.iter().filter(|r| query.matches(r)).count()
    }

    /// Snapshot of every record
    pub fn records(&self) -> Vec<AuditRecord> {
        self.inner.lock().records.clone()
    }

    /// Verify the in-memory chain
    pub fn verify(&self) -> Result<(), ChainError> {
        verify_chain(&self.inner.lock().records)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_hash(&self) -> String {
        self.inner.lock().last_hash.clone()
    }

    pub fn write_failures(&self) -> u64 {
        self.inner.lock().write_failures
    }

    /// Records chained in memory but not yet accepted by the sink
    pub fn unpersisted(&self) -> usize {
        self.inner.lock().backlog.lines.len()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    fn clock() -> Arc<ManualClock> {
        ManualClock::shared()
    }

    /// Accepts at most `budget` bytes, then refuses every write
    #[derive(Clone, Default)]
    struct FlakySink {
        out: Arc<Mutex<Vec<u8>>>,
        budget: Arc<Mutex<usize>>,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut budget = self.budget.lock();
            if *budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(*budget);
            *budget -= n;
            self.out.lock().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_append_chains_records() {
        let log = AuditLog::in_memory(clock());
        let a = log.append(AuditRecordType::TierChange, "coordinator", &json!({"to": "T1"})).unwrap();
        let b = log.append(AuditRecordType::TierChange, "coordinator", &json!({"to": "T0"})).unwrap();
        assert_eq!((a, b), (1, 2));

        let records = log.records();
        assert_eq!(records[0].prior_hash, GENESIS_HASH);
        assert_eq!(records[1].prior_hash, records[0].hash);
        assert_eq!(log.last_hash(), records[1].hash);
        assert!(log.verify().is_ok());
    }

    #[test]
    fn test_query_filters() {
        let clock = clock();
        let log = AuditLog::in_memory(clock.clone());
        let start = clock.wall_millis();

        log.record(AuditRecordType::HaltEngaged, "halt", &json!({}));
        clock.advance(Duration::from_secs(10));
        log.record(AuditRecordType::TierChange, "coordinator", &json!({}));
        clock.advance(Duration::from_secs(10));
        log.record(AuditRecordType::TierChange, "coordinator", &json!({}));

        assert_eq!(log.count(&AuditQuery::of_type(AuditRecordType::TierChange)), 2);
        assert_eq!(log.count(&AuditQuery::all().component("halt")), 1);
        let window = AuditQuery::all().between(start + 5_000, start + 15_000);
        let hits = log.query(&window);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 2);
    }

    #[test]
    fn test_reopen_continues_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let log = AuditLog::open(&path, clock()).unwrap();
            log.append(AuditRecordType::ConfigApplied, "config", &json!({"v": 1})).unwrap();
            log.append(AuditRecordType::TierChange, "coordinator", &json!({"to": "T2"})).unwrap();
        }

        let log = AuditLog::open(&path, clock()).unwrap();
        assert_eq!(log.len(), 2);
        let id = log.append(AuditRecordType::HaltEngaged, "halt", &json!({})).unwrap();
        assert_eq!(id, 3);

        let on_disk = AuditLog::load_file(&path).unwrap();
        assert_eq!(on_disk.len(), 3);
        assert!(verify_chain(&on_disk).is_ok());
    }

    #[test]
    fn test_failed_write_is_retried_without_forking_the_file() {
        let sink = FlakySink::default();
        *sink.budget.lock() = usize::MAX;
        let log = AuditLog::with_sink(sink.clone(), clock());
        log.append(AuditRecordType::TierChange, "coordinator", &json!({"to": "T2"})).unwrap();

        // the next line is cut off partway through
        *sink.budget.lock() = 10;
        let id = log.append(AuditRecordType::TierChange, "coordinator", &json!({"to": "T1"})).unwrap();
        assert_eq!(id, 2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.write_failures(), 1);
        assert_eq!(log.unpersisted(), 1);

        *sink.budget.lock() = usize::MAX;
        let id = log.append(AuditRecordType::HaltEngaged, "halt", &json!({})).unwrap();
        assert_eq!(id, 3);
        assert_eq!(log.unpersisted(), 0);

        let text = String::from_utf8(sink.out.lock().clone()).unwrap();
        let on_disk: Vec<AuditRecord> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(on_disk.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(verify_chain(&on_disk).is_ok());
        assert_eq!(on_disk, log.records());
    }

    #[test]
    fn test_reopen_rejects_tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(&path, clock()).unwrap();
            log.append(AuditRecordType::TierChange, "coordinator", &json!({"to": "T1"})).unwrap();
            log.append(AuditRecordType::TierChange, "coordinator", &json!({"to": "T0"})).unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replacen("\"T1\"", "\"T2\"", 1)).unwrap();

        match AuditLog::open(&path, clock()) {
            Err(AuditError::Chain(ChainError::HashMismatch { id })) => assert_eq!(id, 1),
            other => panic!("expected hash mismatch, got {other:?}"),
        }
    }
}
