//! Monitoring and observability
//!
//! Operator alert channel, Prometheus metrics and the HTTP status surface.

pub mod alerts;
pub mod metrics;
pub mod server;

pub use alerts::{
    Alert, AlertClass, AlertConfig, AlertDispatcher, AlertOutcome, AlertSeverity, AlertSink,
    AlertStats, JsonlFileSink, LogSink, RecordingSink,
};
pub use metrics::{GovernanceMetrics, LifecycleMetrics, MetricsRegistry, SystemMetrics};
pub use server::{encode_metrics, route, StatusServer, StatusServerConfig, StatusSource};
