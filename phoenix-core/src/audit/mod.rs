//! Hash-chained audit substrate
//!
//! Every state change in the governance layer lands here as exactly one
//! [`AuditRecord`]. Records are strictly forward-appended; each stores only
//! its predecessor's hash, so altering any record breaks verification from
//! that point on.

pub mod record;
pub mod store;

pub use record::{
    compute_hash, verify_chain, verify_from, AuditRecord, AuditRecordType, ChainError,
    GENESIS_HASH,
};
pub use store::{AuditError, AuditLog, AuditQuery};
