//! Router metrics — lightweight counters and gauges
//!
//! In-process metric tracking without external dependencies. Series are
//! keyed by `{cached, functionName, functionUID, path, code, method}` and
//! rendered in Prometheus text exposition format on demand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

/// Label set identifying one invocation series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Whether the backend came from the function-service map
    pub cached: bool,
    pub function_name: String,
    pub function_uid: String,
    pub path: String,
    pub code: u16,
    pub method: String,
}

impl SeriesKey {
    fn label_pairs(&self) -> String {
        format!(
            "cached=\"{}\",functionName=\"{}\",functionUID=\"{}\",path=\"{}\",code=\"{}\",method=\"{}\"",
            self.cached, self.function_name, self.function_uid, self.path, self.code, self.method
        )
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Series {
    count: u64,
    latency_us: u64,
    response_bytes: u64,
}

/// Metrics snapshot — a point-in-time view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub status_classes: BTreeMap<String, u64>,
    pub active_requests: i64,
    pub cold_starts: u64,
    pub cache_hits: u64,
    pub error_kinds: BTreeMap<String, u64>,
    series: BTreeMap<SeriesKey, Series>,
}

/// Router metrics collector
pub struct RouterMetrics {
    total_requests: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    active_requests: AtomicI64,
    cold_starts: AtomicU64,
    cache_hits: AtomicU64,
    error_kinds: RwLock<BTreeMap<String, u64>>,
    series: RwLock<BTreeMap<SeriesKey, Series>>,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            status_2xx: AtomicU64::new(0),
            status_3xx: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
            active_requests: AtomicI64::new(0),
            cold_starts: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            error_kinds: RwLock::new(BTreeMap::new()),
            series: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one completed invocation
    pub fn record_invocation(&self, key: SeriesKey, latency_us: u64, response_bytes: u64) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match key.code / 100 {
            2 => self.status_2xx.fetch_add(1, Ordering::Relaxed),
            3 => self.status_3xx.fetch_add(1, Ordering::Relaxed),
            4 => self.status_4xx.fetch_add(1, Ordering::Relaxed),
            5 => self.status_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        if key.cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cold_starts.fetch_add(1, Ordering::Relaxed);
        }

        let mut series = self.series.write().unwrap();
        let entry = series.entry(key).or_default();
        entry.count += 1;
        entry.latency_us += latency_us;
        entry.response_bytes += response_bytes;
    }

    /// Record a router-generated failure by error kind
    pub fn record_error(&self, kind: &str) {
        let mut kinds = self.error_kinds.write().unwrap();
        *kinds.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut status_classes = BTreeMap::new();
        status_classes.insert("2xx".into(), self.status_2xx.load(Ordering::Relaxed));
        status_classes.insert("3xx".into(), self.status_3xx.load(Ordering::Relaxed));
        status_classes.insert("4xx".into(), self.status_4xx.load(Ordering::Relaxed));
        status_classes.insert("5xx".into(), self.status_5xx.load(Ordering::Relaxed));

        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            status_classes,
            active_requests: self.active_requests.load(Ordering::Relaxed),
            cold_starts: self.cold_starts.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            error_kinds: self.error_kinds.read().unwrap().clone(),
            series: self.series.read().unwrap().clone(),
        }
    }

    /// Render metrics in Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP funcgate_requests_total Total function invocations\n");
        output.push_str("# TYPE funcgate_requests_total counter\n");
        output.push_str(&format!("funcgate_requests_total {}\n", snap.total_requests));

        output.push_str("# HELP funcgate_responses_total Responses by status class\n");
        output.push_str("# TYPE funcgate_responses_total counter\n");
        for class in ["2xx", "3xx", "4xx", "5xx"] {
            let count = snap.status_classes.get(class).unwrap_or(&0);
            output.push_str(&format!(
                "funcgate_responses_total{{status_class=\"{}\"}} {}\n",
                class, count
            ));
        }

        output.push_str("# HELP funcgate_active_requests In-flight invocations\n");
        output.push_str("# TYPE funcgate_active_requests gauge\n");
        output.push_str(&format!("funcgate_active_requests {}\n", snap.active_requests));

        output.push_str("# HELP funcgate_cold_starts_total Invocations served by a fresh backend\n");
        output.push_str("# TYPE funcgate_cold_starts_total counter\n");
        output.push_str(&format!("funcgate_cold_starts_total {}\n", snap.cold_starts));

        output.push_str("# HELP funcgate_cache_hits_total Invocations served from the function-service map\n");
        output.push_str("# TYPE funcgate_cache_hits_total counter\n");
        output.push_str(&format!("funcgate_cache_hits_total {}\n", snap.cache_hits));

        if !snap.error_kinds.is_empty() {
            output.push_str("# HELP funcgate_errors_total Router-generated failures by kind\n");
            output.push_str("# TYPE funcgate_errors_total counter\n");
            for (kind, count) in &snap.error_kinds {
                output.push_str(&format!(
                    "funcgate_errors_total{{kind=\"{}\"}} {}\n",
                    kind, count
                ));
            }
        }

        if !snap.series.is_empty() {
            output.push_str("# HELP funcgate_function_requests_total Invocations per function series\n");
            output.push_str("# TYPE funcgate_function_requests_total counter\n");
            for (key, series) in &snap.series {
                output.push_str(&format!(
                    "funcgate_function_requests_total{{{}}} {}\n",
                    key.label_pairs(),
                    series.count
                ));
            }

            output.push_str("# HELP funcgate_function_latency_microseconds_total Cumulative latency per function series\n");
            output.push_str("# TYPE funcgate_function_latency_microseconds_total counter\n");
            for (key, series) in &snap.series {
                output.push_str(&format!(
                    "funcgate_function_latency_microseconds_total{{{}}} {}\n",
                    key.label_pairs(),
                    series.latency_us
                ));
            }

            output.push_str("# HELP funcgate_function_response_bytes_total Response bytes per function series\n");
            output.push_str("# TYPE funcgate_function_response_bytes_total counter\n");
            for (key, series) in &snap.series {
                output.push_str(&format!(
                    "funcgate_function_response_bytes_total{{{}}} {}\n",
                    key.label_pairs(),
                    series.response_bytes
                ));
            }
        }

        output
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: u16, cached: bool) -> SeriesKey {
        SeriesKey {
            cached,
            function_name: "hello".into(),
            function_uid: "uid-1".into(),
            path: "/hello".into(),
            code,
            method: "GET".into(),
        }
    }

    #[test]
    fn test_record_invocation_counts() {
        let m = RouterMetrics::new();
        m.request_started();
        m.record_invocation(key(200, true), 1500, 64);
        m.request_started();
        m.record_invocation(key(200, false), 90_000, 64);

        let snap = m.snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.status_classes["2xx"], 2);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cold_starts, 1);
        assert_eq!(snap.active_requests, 0);
    }

    #[test]
    fn test_error_kinds_accumulate() {
        let m = RouterMetrics::new();
        m.record_error("not-found");
        m.record_error("not-found");
        m.record_error("cold-start-timeout");

        let snap = m.snapshot();
        assert_eq!(snap.error_kinds["not-found"], 2);
        assert_eq!(snap.error_kinds["cold-start-timeout"], 1);
    }

    #[test]
    fn test_prometheus_has_help_and_type() {
        let m = RouterMetrics::new();
        m.request_started();
        m.record_invocation(key(200, true), 10, 5);
        let output = m.render_prometheus();
        assert!(output.contains("# HELP funcgate_requests_total"));
        assert!(output.contains("# TYPE funcgate_requests_total counter"));
        assert!(output.contains("funcgate_requests_total 1"));
    }

    #[test]
    fn test_prometheus_series_labels() {
        let m = RouterMetrics::new();
        m.request_started();
        m.record_invocation(key(502, false), 10, 0);
        let output = m.render_prometheus();
        assert!(output.contains("cached=\"false\""));
        assert!(output.contains("functionName=\"hello\""));
        assert!(output.contains("code=\"502\""));
    }
}
