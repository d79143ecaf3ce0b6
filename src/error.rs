//! Centralized error types for the dispatch core
//!
//! Errors are categorised by kind, not by source type: the router maps a
//! kind to an HTTP status, controllers decide between local retry and
//! recording the failure on the owning resource.

use std::time::Duration;
use thiserror::Error;

/// Dispatch core error types
#[derive(Debug, Error)]
pub enum Error {
    /// No such function, trigger, package, or environment
    #[error("not found: {0}")]
    NotFound(String),

    /// Spec validation failed
    #[error("invalid: {0}")]
    Invalid(String),

    /// Executor did not produce a ready backend within the timeout
    #[error("cold start timed out after {0:?}")]
    ColdStartTimeout(Duration),

    /// Pod returned non-2xx to the specialize call
    #[error("specialization failed: {0}")]
    SpecializationFailed(String),

    /// Build command exited non-zero
    #[error("build failed: {0}")]
    BuildFailed(String),

    /// Pool full and acquire queue full
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Proxy transport error talking to a backend
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    /// Orchestrator or network hiccup; safe to retry
    #[error("transient: {0}")]
    Transient(String),

    /// Optimistic-concurrency conflict on the declarative store
    #[error("conflict: {0}")]
    Conflict(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable kind string, used in metrics labels and the error-kind
    /// response header.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not-found",
            Self::Invalid(_) => "invalid",
            Self::ColdStartTimeout(_) => "cold-start-timeout",
            Self::SpecializationFailed(_) => "specialization-failed",
            Self::BuildFailed(_) => "build-failed",
            Self::CapacityExhausted(_) => "capacity-exhausted",
            Self::BackendUnreachable(_) => "backend-unreachable",
            Self::Transient(_) => "transient",
            Self::Conflict(_) => "conflict",
            Self::Config(_) => "config",
            Self::Http(_) => "http",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Other(_) => "internal",
        }
    }

    /// HTTP status the router surfaces for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Invalid(_) => 400,
            Self::ColdStartTimeout(_) => 503,
            Self::SpecializationFailed(_) => 500,
            Self::BuildFailed(_) => 503,
            Self::CapacityExhausted(_) => 503,
            Self::BackendUnreachable(_) => 502,
            Self::Transient(_) => 503,
            Self::Conflict(_) => 409,
            _ => 500,
        }
    }

    /// Whether a local retry with back-off is appropriate
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Conflict(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Io(_) => true,
            _ => false,
        }
    }
}

/// Capped exponential back-off for transient errors.
///
/// Retries `op` until it succeeds, returns a terminal error, or `max_retries`
/// transient failures have been consumed. Delay doubles from `initial` and
/// is capped at `cap`.
pub async fn retry_transient<T, F, Fut>(
    max_retries: u32,
    initial: Duration,
    cap: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial;
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                tracing::debug!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying transient error"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(cap);
            }
            Err(e) => return Err(e),
        }
    }
}
