//! Structured access log — JSON-formatted invocation logging
//!
//! One entry per proxied invocation, emitted through `tracing` under the
//! `access_log` target so aggregation pipelines can split it off.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A single access log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    /// ISO 8601 timestamp
    pub timestamp: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub status: u16,
    pub response_bytes: u64,
    pub duration_ms: u64,
    /// Backend URL the invocation was forwarded to
    pub backend: Option<String>,
    pub trigger: Option<String>,
    pub function_name: Option<String>,
    pub function_uid: Option<String>,
    pub req_uid: Option<String>,
    /// Whether the backend came from the function-service map
    pub cached: bool,
}

/// Access log manager
pub struct AccessLog {
    total_entries: AtomicU64,
}

impl AccessLog {
    pub fn new() -> Self {
        Self {
            total_entries: AtomicU64::new(0),
        }
    }

    /// Start tracking a request. Returns a tracker to measure duration.
    pub fn start_request(&self) -> RequestTracker {
        RequestTracker {
            start: Instant::now(),
        }
    }

    /// Record and emit a log entry
    pub fn record(&self, entry: &AccessLogEntry) {
        self.total_entries.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "access_log",
            client_ip = entry.client_ip,
            method = entry.method,
            path = entry.path,
            status = entry.status,
            duration_ms = entry.duration_ms,
            response_bytes = entry.response_bytes,
            backend = entry.backend.as_deref().unwrap_or("-"),
            function = entry.function_name.as_deref().unwrap_or("-"),
            req_uid = entry.req_uid.as_deref().unwrap_or("-"),
            cached = entry.cached,
            "{}",
            serde_json::to_string(entry).unwrap_or_default()
        );
    }

    pub fn total_entries(&self) -> u64 {
        self.total_entries.load(Ordering::Relaxed)
    }
}

impl Default for AccessLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks invocation duration
pub struct RequestTracker {
    start: Instant,
}

impl RequestTracker {
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Build an access log entry from the tracked invocation
    #[allow(clippy::too_many_arguments)]
    pub fn build_entry(
        &self,
        client_ip: String,
        method: String,
        path: String,
        host: Option<String>,
        status: u16,
        response_bytes: u64,
        backend: Option<String>,
        trigger: Option<String>,
        function_name: Option<String>,
        function_uid: Option<String>,
        req_uid: Option<String>,
        cached: bool,
    ) -> AccessLogEntry {
        AccessLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            client_ip,
            method,
            path,
            host,
            status,
            response_bytes,
            duration_ms: self.elapsed_ms(),
            backend,
            trigger,
            function_name,
            function_uid,
            req_uid,
            cached,
        }
    }
}
