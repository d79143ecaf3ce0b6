//! Non-HTTP trigger controllers: cron schedules, message-queue
//! subscriptions, and orchestrator object watches. Each controller turns
//! its event source into invocations of the router's internal dispatch
//! endpoint.

pub mod mq;
pub mod timer;
pub mod watch;

pub use mq::{start_mq_controller, MemoryQueue, MessageQueue, MqController};
pub use timer::{start_timer_controller, TimerController};
pub use watch::{start_watch_controller, WatchController};

use crate::error::{Error, Result};
use crate::types::FunctionReference;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Outcome of one invocation through the router
#[derive(Debug)]
pub struct InvocationOutcome {
    pub status: u16,
    pub body: Bytes,
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

/// Posts trigger payloads to the router's `/invoke/{namespace}/{name}`
/// endpoint. Weighted references are drawn locally with a counter walk so
/// repeated firings land on functions in proportion to their weights.
pub struct FunctionInvoker {
    router_url: String,
    client: reqwest::Client,
    pick_counter: AtomicUsize,
}

impl FunctionInvoker {
    pub fn new(router_url: impl Into<String>) -> Self {
        Self {
            router_url: router_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            pick_counter: AtomicUsize::new(0),
        }
    }

    pub async fn invoke(
        &self,
        namespace: &str,
        reference: &FunctionReference,
        body: Bytes,
        content_type: &str,
        extra_headers: &[(&str, String)],
    ) -> Result<InvocationOutcome> {
        let name = self.target_name(reference)?;
        let url = format!("{}/invoke/{}/{}", self.router_url, namespace, name);

        let mut request = self
            .client
            .post(&url)
            .header(http::header::CONTENT_TYPE, content_type)
            .body(body);
        for (key, value) in extra_headers {
            request = request.header(*key, value.as_str());
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(InvocationOutcome { status, body })
    }

    /// Pick the function this firing targets
    fn target_name<'a>(&self, reference: &'a FunctionReference) -> Result<&'a str> {
        match reference {
            FunctionReference::Name(name) => Ok(name),
            FunctionReference::WeightedNames(weights) => {
                let total: u32 = weights.values().sum();
                if total == 0 {
                    return Err(Error::Invalid(
                        "weighted reference has zero total weight".into(),
                    ));
                }
                let tick = self.pick_counter.fetch_add(1, Ordering::Relaxed) as u32 % total;
                let mut cumulative = 0u32;
                for (name, weight) in weights {
                    cumulative += weight;
                    if tick < cumulative {
                        return Ok(name);
                    }
                }
                unreachable!("tick is below the weight total")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_named_reference_targets_that_function() {
        let invoker = FunctionInvoker::new("http://127.0.0.1:1");
        let reference = FunctionReference::name("hello");
        assert_eq!(invoker.target_name(&reference).unwrap(), "hello");
    }

    #[test]
    fn test_weighted_reference_draws_match_weights() {
        let invoker = FunctionInvoker::new("http://127.0.0.1:1");
        let reference = FunctionReference::WeightedNames(BTreeMap::from([
            ("stable".to_string(), 75),
            ("canary".to_string(), 25),
        ]));

        let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
        for _ in 0..100 {
            *counts
                .entry(invoker.target_name(&reference).unwrap())
                .or_default() += 1;
        }
        // Counter walk is exact over a full cycle of the weight total
        assert_eq!(counts["stable"], 75);
        assert_eq!(counts["canary"], 25);
    }

    #[test]
    fn test_zero_total_weight_is_rejected() {
        let invoker = FunctionInvoker::new("http://127.0.0.1:1");
        let reference =
            FunctionReference::WeightedNames(BTreeMap::from([("a".to_string(), 0)]));
        assert!(matches!(
            invoker.target_name(&reference),
            Err(Error::Invalid(_))
        ));
    }
}
