//! Any edit to a persisted audit record is detectable

use phoenix_core::audit::{verify_chain, AuditError, AuditLog, AuditQuery, AuditRecordType, ChainError};
use phoenix_core::core::{Clock, ManualClock, Side};
use phoenix_core::testing::Harness;
use rust_decimal_macros::dec;
use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

fn write_log(path: &std::path::Path, n: u64) {
    let clock: Arc<dyn Clock> = ManualClock::shared();
    let log = AuditLog::open(path, clock).unwrap();
    for i in 0..n {
        log.append(AuditRecordType::TierChange, "coordinator", &json!({ "seq": i }))
            .unwrap();
    }
}

fn rewrite_line(path: &std::path::Path, index: usize, edit: impl Fn(&mut serde_json::Value)) {
    let text = fs::read_to_string(path).unwrap();
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let mut value: serde_json::Value = serde_json::from_str(&lines[index]).unwrap();
    edit(&mut value);
    lines[index] = serde_json::to_string(&value).unwrap();
    fs::write(path, lines.join("\n") + "\n").unwrap();
}

#[test]
fn test_harness_activity_verifies() {
    let h = Harness::new();
    h.connect().unwrap();
    let id = h.approved("AAPL", Side::Buy, dec!(1)).unwrap();
    h.book.submit(id).unwrap();
    h.run_for(Duration::from_secs(45), Duration::from_millis(500));

    assert!(h.audit.len() > 5);
    assert_eq!(h.audit.verify(), Ok(()));
    let ids: Vec<u64> = h.audit.records().iter().map(|r| r.id).collect();
    assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));
}

#[test]
fn test_payload_edit_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    write_log(&path, 10);
    assert_eq!(verify_chain(&AuditLog::load_file(&path).unwrap()), Ok(()));

    rewrite_line(&path, 4, |v| v["payload"]["seq"] = json!(999));

    let records = AuditLog::load_file(&path).unwrap();
    assert_eq!(verify_chain(&records), Err(ChainError::HashMismatch { id: 5 }));
}

#[test]
fn test_rehashed_edit_breaks_the_next_link() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    write_log(&path, 10);

    // a forger who also recomputes the edited record's own hash
    let mut records = AuditLog::load_file(&path).unwrap();
    records[4].payload = json!({ "seq": 999 });
    records[4].hash = records[4].expected_hash();
    assert_eq!(verify_chain(&records), Err(ChainError::BrokenLink { id: 6 }));
}

#[test]
fn test_deleted_record_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    write_log(&path, 6);

    let mut records = AuditLog::load_file(&path).unwrap();
    records.remove(2);
    assert_eq!(
        verify_chain(&records),
        Err(ChainError::IdGap { expected: 3, found: 4 })
    );
}

#[test]
fn test_reopen_refuses_tampered_file_and_resumes_clean_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    write_log(&path, 3);

    let clock: Arc<dyn Clock> = ManualClock::shared();
    let log = AuditLog::open(&path, clock.clone()).unwrap();
    assert_eq!(log.len(), 3);
    let id = log
        .append(AuditRecordType::ConfigApplied, "config", &json!({ "reason": "test" }))
        .unwrap();
    assert_eq!(id, 4);
    assert_eq!(log.count(&AuditQuery::of_type(AuditRecordType::ConfigApplied)), 1);
    drop(log);

    rewrite_line(&path, 0, |v| v["component"] = json!("someone"));
    assert!(matches!(
        AuditLog::open(&path, clock),
        Err(AuditError::Chain(ChainError::HashMismatch { id: 1 }))
    ));
}
