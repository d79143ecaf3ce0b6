//! Observability — request metrics and structured access logging

pub mod access_log;
pub mod metrics;

pub use access_log::{AccessLog, AccessLogEntry, RequestTracker};
pub use metrics::RouterMetrics;
