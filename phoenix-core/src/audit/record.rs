//! Audit record and hash-chain primitives

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// `prior_hash` of the first record in a chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Kind of state change an audit record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditRecordType {
    BreakerTransition,
    HealthTransition,
    HealthEpisode,
    HeartbeatStatus,
    ReconnectAttempt,
    ReconnectValidated,
    ReconnectExhausted,
    ReconnectParked,
    SupervisorLiveness,
    TierChange,
    PositionTransition,
    PositionTransitionRejected,
    PositionFill,
    ReconciliationDrift,
    ReconciliationResolved,
    HaltEngaged,
    HaltReleased,
    ConfigApplied,
}

impl AuditRecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditRecordType::BreakerTransition => "BREAKER_TRANSITION",
            AuditRecordType::HealthTransition => "HEALTH_TRANSITION",
            AuditRecordType::HealthEpisode => "HEALTH_EPISODE",
            AuditRecordType::HeartbeatStatus => "HEARTBEAT_STATUS",
            AuditRecordType::ReconnectAttempt => "RECONNECT_ATTEMPT",
            AuditRecordType::ReconnectValidated => "RECONNECT_VALIDATED",
            AuditRecordType::ReconnectExhausted => "RECONNECT_EXHAUSTED",
            AuditRecordType::ReconnectParked => "RECONNECT_PARKED",
            AuditRecordType::SupervisorLiveness => "SUPERVISOR_LIVENESS",
            AuditRecordType::TierChange => "TIER_CHANGE",
            AuditRecordType::PositionTransition => "POSITION_TRANSITION",
            AuditRecordType::PositionTransitionRejected => "POSITION_TRANSITION_REJECTED",
            AuditRecordType::PositionFill => "POSITION_FILL",
            AuditRecordType::ReconciliationDrift => "RECONCILIATION_DRIFT",
            AuditRecordType::ReconciliationResolved => "RECONCILIATION_RESOLVED",
            AuditRecordType::HaltEngaged => "HALT_ENGAGED",
            AuditRecordType::HaltReleased => "HALT_RELEASED",
            AuditRecordType::ConfigApplied => "CONFIG_APPLIED",
        }
    }

    /// Parse the wire name (`BREAKER_TRANSITION`, ...)
    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(Value::String(name.to_ascii_uppercase())).ok()
    }
}

impl fmt::Display for AuditRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable, hash-chained audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: u64,
    pub record_type: AuditRecordType,
    /// Wall-clock milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub component: String,
    pub payload: Value,
    pub prior_hash: String,
    pub hash: String,
}

impl AuditRecord {
    /// Build a record and seal it with its hash
    pub fn seal(
        id: u64,
        record_type: AuditRecordType,
        timestamp_ms: u64,
        component: String,
        payload: Value,
        prior_hash: String,
    ) -> Self {
        let hash = compute_hash(id, record_type, timestamp_ms, &component, &payload, &prior_hash);
        Self {
            id,
            record_type,
            timestamp_ms,
            component,
            payload,
            prior_hash,
            hash,
        }
    }

    /// Recompute the hash from the record's fields
    pub fn expected_hash(&self) -> String {
        compute_hash(
            self.id,
            self.record_type,
            self.timestamp_ms,
            &self.component,
            &self.payload,
            &self.prior_hash,
        )
    }
}

/// sha256 over `id|type|timestamp|component|payload|prior_hash`, hex encoded
pub fn compute_hash(
    id: u64,
    record_type: AuditRecordType,
    timestamp_ms: u64,
    component: &str,
    payload: &Value,
    prior_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(record_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(timestamp_ms.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(component.as_bytes());
    hasher.update(b"|");
    hasher.update(payload.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(prior_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// First integrity violation found in a chain
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("record {id}: stored hash does not match contents")]
    HashMismatch { id: u64 },

    #[error("record {id}: prior_hash does not match predecessor")]
    BrokenLink { id: u64 },

    #[error("expected record id {expected}, found {found}")]
    IdGap { expected: u64, found: u64 },
}

/// Verify a full chain starting at genesis
pub fn verify_chain(records: &[AuditRecord]) -> Result<(), ChainError> {
    verify_from(records, 1, GENESIS_HASH)
}

/// Verify a segment whose first record should have `first_id` and link to `prior`
pub fn verify_from(records: &[AuditRecord], first_id: u64, prior: &str) -> Result<(), ChainError> {
    let mut expected_id = first_id;
    let mut prior_hash = prior;
    for record in records {
        if record.id != expected_id {
            return Err(ChainError::IdGap {
                expected: expected_id,
                found: record.id,
            });
        }
        if record.prior_hash != prior_hash {
            return Err(ChainError::BrokenLink { id: record.id });
        }
        if record.expected_hash() != record.hash {
            return Err(ChainError::HashMismatch { id: record.id });
        }
        prior_hash = &record.hash;
        expected_id += 1;
    }
    Ok(())
}
