//! Mux — immutable compiled table of HTTP trigger routes
//!
//! Built in full from the current trigger list and swapped in atomically by
//! the trigger set. Matching is method + optional host + path prefix; the
//! longest registered prefix wins and the trailing suffix is handed to the
//! function untouched.

use crate::types::HttpTrigger;

/// Result of matching a request against the mux
#[derive(Debug)]
pub struct MatchedRoute<'a> {
    pub trigger: &'a HttpTrigger,
    /// Path remainder past the trigger's relative URL, leading `/` kept
    pub path_suffix: String,
}

/// Immutable routing table
pub struct Mux {
    /// Sorted longest-prefix-first, then by trigger name
    routes: Vec<HttpTrigger>,
}

impl Mux {
    pub fn build(mut triggers: Vec<HttpTrigger>) -> Self {
        triggers.sort_by(|a, b| {
            b.spec
                .relative_url
                .len()
                .cmp(&a.spec.relative_url.len())
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        Self { routes: triggers }
    }

    pub fn empty() -> Self {
        Self { routes: Vec::new() }
    }

    /// Match a request; first hit in prefix-length order wins
    pub fn match_request(
        &self,
        method: &http::Method,
        host: Option<&str>,
        path: &str,
    ) -> Option<MatchedRoute<'_>> {
        for trigger in &self.routes {
            if !trigger.spec.method.eq_ignore_ascii_case(method.as_str()) {
                continue;
            }
            if let Some(expected) = &trigger.spec.host {
                let matches = host
                    .map(|h| h.eq_ignore_ascii_case(expected))
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            if let Some(suffix) = match_prefix(&trigger.spec.relative_url, path) {
                return Some(MatchedRoute {
                    trigger,
                    path_suffix: suffix,
                });
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Path prefix match at segment boundaries; returns the trailing suffix
fn match_prefix(prefix: &str, path: &str) -> Option<String> {
    if prefix == "/" {
        return Some(if path == "/" {
            String::new()
        } else {
            path.to_string()
        });
    }
    let prefix = prefix.trim_end_matches('/');
    if path == prefix {
        return Some(String::new());
    }
    path.strip_prefix(prefix)
        .filter(|rest| rest.starts_with('/'))
        .map(|rest| rest.to_string())
}
