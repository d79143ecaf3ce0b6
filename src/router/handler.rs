//! Router request handler — the dispatch pipeline
//!
//! Pipeline per invocation: mux match, reference resolution, function-service
//! map lookup (single-flight acquire on miss), reverse proxy, one retry on
//! backend failure. Reserved paths serve health, metrics, the storage and
//! log proxies, and the internal invocation endpoint used by the non-HTTP
//! trigger controllers.

use crate::cache::{FnServiceEntry, FnServiceMap, LockOutcome, UpdateLocks};
use crate::error::{Error, Result};
use crate::executor::ExecutorSet;
use crate::observability::{AccessLog, RouterMetrics};
use crate::observability::metrics::SeriesKey;
use crate::orchestrator::Orchestrator;
use crate::proxy::{FunctionProxy, ProxyResponse, RoutingContext};
use crate::resolver::FunctionResolver;
use crate::router::TriggerSet;
use crate::store::ObjectStore;
use crate::types::{Fingerprint, Function, FunctionReference};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub const HEADER_ERROR_KIND: &str = "X-Funcgate-Error-Kind";

/// Everything the dispatch pipeline needs, shared across connections
pub struct RouterState {
    pub triggers: Arc<TriggerSet>,
    pub resolver: Arc<FunctionResolver>,
    pub services: Arc<FnServiceMap>,
    pub locks: Arc<UpdateLocks>,
    pub executors: Arc<ExecutorSet>,
    pub proxy: FunctionProxy,
    pub store: Arc<dyn ObjectStore>,
    pub orchestrator: Arc<dyn Orchestrator>,
    /// Base URL of the blob service, for the CLI upload proxy
    pub storage_url: Option<String>,
    pub storage_client: reqwest::Client,
    pub default_namespace: String,
    pub metrics: Arc<RouterMetrics>,
    pub access_log: Arc<AccessLog>,
}

/// Result of a successful dispatch, with the metadata the access log wants
pub struct DispatchOutcome {
    pub response: ProxyResponse,
    pub function_name: String,
    pub function_uid: String,
    pub backend_url: String,
    pub req_uid: String,
    /// Whether the first attempt was served from the function-service map
    pub cached: bool,
}

impl RouterState {
    /// Resolve a reference, obtain a backend, proxy the request. Retries
    /// exactly once on backend 5xx or transport error, with a fresh backend.
    pub async fn dispatch(
        &self,
        namespace: &str,
        reference: &FunctionReference,
        method: &http::Method,
        path_suffix: &str,
        headers: &http::HeaderMap,
        body: Bytes,
    ) -> Result<DispatchOutcome> {
        let targets = self.resolver.resolve(namespace, reference).await?;
        let target = self.resolver.choose(&targets)?;
        let function = target.function.clone();
        let fp = function.metadata.fingerprint();
        let timeout = Duration::from_secs(function.spec.execution_timeout_secs);
        let ctx = RoutingContext::for_function(&function, self.proxy.next_req_uid());

        let mut cached = true;
        let mut entry = match self.services.lookup(&fp) {
            Some(entry) => entry,
            None => {
                cached = false;
                self.acquire_backend(&function, &fp).await?
            }
        };
        let first_was_cached = cached;

        let mut attempt = 0;
        loop {
            let result = self
                .proxy
                .forward(
                    &entry.backend_url,
                    method,
                    path_suffix,
                    headers,
                    body.clone(),
                    timeout,
                    &ctx,
                )
                .await;

            let failed = match &result {
                Ok(response) => response.is_backend_failure(),
                Err(Error::BackendUnreachable(_)) => true,
                Err(_) => false,
            };

            if failed && attempt == 0 {
                tracing::warn!(
                    fingerprint = %fp,
                    backend = entry.backend_url,
                    req_uid = ctx.req_uid,
                    "Backend failed; evicting and retrying once"
                );
                self.evict(&fp);
                attempt = 1;
                cached = false;
                entry = self.acquire_backend(&function, &fp).await?;
                continue;
            }

            let response = result?;
            if response.status.is_success() {
                self.services.tap(&entry.backend_url);
            }
            return Ok(DispatchOutcome {
                response,
                function_name: function.metadata.name.clone(),
                function_uid: function.metadata.uid.clone(),
                backend_url: entry.backend_url.clone(),
                req_uid: ctx.req_uid.clone(),
                cached: first_was_cached,
            });
        }
    }

    /// Single-flight backend acquisition: the winner runs the executor and
    /// publishes the entry; everyone else waits and re-reads the map. A
    /// waiter that still misses after the wait fails fast — the holder
    /// already ran the executor and reported whatever went wrong, so a
    /// second acquire for the same fingerprint is never issued.
    async fn acquire_backend(&self, function: &Function, fp: &Fingerprint) -> Result<FnServiceEntry> {
        let key = fp.to_string();
        if let Some(entry) = self.services.lookup(fp) {
            return Ok(entry);
        }
        match self.locks.run_or_wait(&key).await? {
            LockOutcome::Acquired(guard) => {
                let executor = self.executors.for_function(function);
                match executor.acquire(function).await {
                    Ok(entry) => {
                        self.services.assign(fp.clone(), entry.clone(), &guard);
                        guard.release();
                        Ok(entry)
                    }
                    Err(e) => {
                        guard.release();
                        if matches!(e, Error::SpecializationFailed(_)) {
                            // Force a reload of function and package
                            self.resolver.invalidate(
                                &function.metadata.namespace,
                                &function.metadata.name,
                            );
                        }
                        Err(e)
                    }
                }
            }
            LockOutcome::Waited => self.services.lookup(fp).ok_or_else(|| {
                Error::Transient("backend was not published after lock wait".into())
            }),
        }
    }

    /// Drop a cached backend and hand it to its executor's release port
    fn evict(&self, fp: &Fingerprint) {
        if let Some(old) = self.services.remove(fp) {
            let executors = self.executors.clone();
            let fp = fp.clone();
            tokio::spawn(async move {
                let executor = executors.for_type(old.executor_type);
                if let Err(e) = executor.release(&fp, &old).await {
                    tracing::warn!(fingerprint = %fp, error = %e, "Backend release failed");
                }
            });
        }
    }
}

/// Bind the router listener; returns the bound address and the accept-loop
/// task handle.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<RouterState>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Other(format!("failed to bind {}: {}", addr, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::Other(format!("no local addr: {}", e)))?;

    tracing::info!(address = %local_addr, "Router listening");

    let handle = tokio::spawn(async move {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let state = state.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let _ = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(move |req| handle_request(req, remote_addr, state.clone())),
                    )
                    .await;
            });
        }
    });

    Ok((local_addr, handle))
}

async fn handle_request(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    state: Arc<RouterState>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();

    // Reserved surface first
    if method == http::Method::GET && path == "/healthz" {
        return Ok(text_response(200, "ok"));
    }
    if method == http::Method::GET && path == "/metrics" {
        return Ok(text_response(200, &state.metrics.render_prometheus()));
    }
    if let Some(subpath) = path.strip_prefix("/proxy/storage/") {
        return Ok(proxy_storage(req, subpath.to_string(), state).await);
    }
    if let Some(rest) = path.strip_prefix("/proxy/logs/") {
        return Ok(proxy_logs(rest, state).await);
    }
    if let Some(rest) = path.strip_prefix("/invoke/") {
        return Ok(invoke_direct(req, rest.to_string(), remote_addr, state).await);
    }

    invoke_matched(req, remote_addr, state).await
}

/// Trigger-matched user invocation
async fn invoke_matched(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    state: Arc<RouterState>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string());

    // The mux snapshot is held for the whole request; a concurrent republish
    // never mixes rulesets mid-flight
    let mux = state.triggers.mux();
    let Some(matched) = mux.match_request(&method, host.as_deref(), &path) else {
        state.metrics.record_error("not-found");
        return Ok(error_response(&Error::NotFound(format!(
            "no trigger matches {} {}",
            method, path
        ))));
    };

    let trigger_name = matched.trigger.metadata.name.clone();
    let namespace = matched.trigger.metadata.namespace.clone();
    let reference = matched.trigger.spec.function_reference.clone();
    let suffix = match uri.query() {
        Some(query) => format!("{}?{}", matched.path_suffix, query),
        None => matched.path_suffix.clone(),
    };
    drop(mux);

    let headers = req.headers().clone();
    let body = req.into_body().collect().await?.to_bytes();

    state.metrics.request_started();
    let tracker = state.access_log.start_request();
    let outcome = state
        .dispatch(&namespace, &reference, &method, &suffix, &headers, body)
        .await;

    Ok(finish_invocation(
        &state,
        tracker,
        remote_addr,
        &method,
        &path,
        host,
        Some(trigger_name),
        outcome,
    ))
}

/// Internal invocation endpoint, `/invoke/{namespace}/{name}`. The non-HTTP
/// trigger controllers use it so all dispatch goes through one path.
async fn invoke_direct(
    req: Request<Incoming>,
    rest: String,
    remote_addr: SocketAddr,
    state: Arc<RouterState>,
) -> Response<Full<Bytes>> {
    let (namespace, name) = match rest.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {
            (ns.to_string(), name.to_string())
        }
        _ => (state.default_namespace.clone(), rest),
    };
    if name.is_empty() {
        return error_response(&Error::Invalid("missing function name".into()));
    }

    let method = req.method().clone();
    let path = format!("/invoke/{}/{}", namespace, name);
    let headers = req.headers().clone();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return error_response(&Error::Invalid(format!("bad request body: {}", e))),
    };

    state.metrics.request_started();
    let tracker = state.access_log.start_request();
    let reference = FunctionReference::Name(name);
    let outcome = state
        .dispatch(&namespace, &reference, &method, "", &headers, body)
        .await;

    finish_invocation(
        &state, tracker, remote_addr, &method, &path, None, None, outcome,
    )
}

/// Convert a dispatch outcome into the client response, recording metrics
/// and the access log either way.
#[allow(clippy::too_many_arguments)]
fn finish_invocation(
    state: &RouterState,
    tracker: crate::observability::RequestTracker,
    remote_addr: SocketAddr,
    method: &http::Method,
    path: &str,
    host: Option<String>,
    trigger_name: Option<String>,
    outcome: Result<DispatchOutcome>,
) -> Response<Full<Bytes>> {
    match outcome {
        Ok(outcome) => {
            let status = outcome.response.status.as_u16();
            let bytes = outcome.response.body.len() as u64;
            state.metrics.record_invocation(
                SeriesKey {
                    cached: outcome.cached,
                    function_name: outcome.function_name.clone(),
                    function_uid: outcome.function_uid.clone(),
                    path: path.to_string(),
                    code: status,
                    method: method.to_string(),
                },
                tracker.elapsed_us(),
                bytes,
            );
            let entry = tracker.build_entry(
                remote_addr.ip().to_string(),
                method.to_string(),
                path.to_string(),
                host,
                status,
                bytes,
                Some(outcome.backend_url.clone()),
                trigger_name,
                Some(outcome.function_name.clone()),
                Some(outcome.function_uid.clone()),
                Some(outcome.req_uid.clone()),
                outcome.cached,
            );
            state.access_log.record(&entry);

            let mut builder = Response::builder().status(status);
            for (key, value) in outcome.response.headers.iter() {
                builder = builder.header(key, value);
            }
            builder
                .body(Full::new(outcome.response.body))
                .unwrap_or_else(|_| text_response(500, "response build failed"))
        }
        Err(e) => {
            state.metrics.record_error(e.kind());
            state.metrics.record_invocation(
                SeriesKey {
                    cached: false,
                    function_name: String::new(),
                    function_uid: String::new(),
                    path: path.to_string(),
                    code: e.status_code(),
                    method: method.to_string(),
                },
                tracker.elapsed_us(),
                0,
            );
            let entry = tracker.build_entry(
                remote_addr.ip().to_string(),
                method.to_string(),
                path.to_string(),
                host,
                e.status_code(),
                0,
                None,
                trigger_name,
                None,
                None,
                None,
                false,
            );
            state.access_log.record(&entry);
            error_response(&e)
        }
    }
}

/// Reverse proxy to the blob service for CLI archive upload
async fn proxy_storage(
    req: Request<Incoming>,
    subpath: String,
    state: Arc<RouterState>,
) -> Response<Full<Bytes>> {
    let Some(base) = &state.storage_url else {
        return error_response(&Error::Invalid("no storage service configured".into()));
    };
    let url = format!("{}/{}", base.trim_end_matches('/'), subpath);
    let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return error_response(&Error::Invalid("bad method".into())),
    };
    let content_type = req
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return error_response(&Error::Invalid(format!("bad request body: {}", e))),
    };

    let mut builder = state.storage_client.request(method, &url).body(body);
    if let Some(ct) = content_type {
        builder = builder.header(http::header::CONTENT_TYPE, ct);
    }
    match builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let bytes = response.bytes().await.unwrap_or_default();
            Response::builder()
                .status(status)
                .body(Full::new(bytes))
                .unwrap_or_else(|_| text_response(502, "bad storage response"))
        }
        Err(e) => error_response(&Error::BackendUnreachable(format!(
            "storage service: {}",
            e
        ))),
    }
}

/// Recent pod logs for a function, `/proxy/logs/{name}` or
/// `/proxy/logs/{namespace}/{name}`
async fn proxy_logs(rest: &str, state: Arc<RouterState>) -> Response<Full<Bytes>> {
    let (namespace, name) = match rest.split_once('/') {
        Some((ns, name)) if !name.is_empty() => (ns.to_string(), name.to_string()),
        _ => (state.default_namespace.clone(), rest.to_string()),
    };
    if name.is_empty() {
        return error_response(&Error::Invalid("missing function name".into()));
    }

    let mut selector = BTreeMap::new();
    selector.insert("functionName".to_string(), name);
    match state.orchestrator.pod_logs(&namespace, &selector).await {
        Ok(logs) => text_response(200, &logs),
        Err(e) => error_response(&e),
    }
}

fn text_response(status: u16, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn error_response(e: &Error) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(e.status_code())
        .header(HEADER_ERROR_KIND, e.kind());
    // A cold-start timeout is worth retrying after roughly one more
    // specialization window
    if let Error::ColdStartTimeout(waited) = e {
        builder = builder.header(http::header::RETRY_AFTER, waited.as_secs().max(1).to_string());
    }
    builder
        .body(Full::new(Bytes::from(e.to_string())))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_start_timeout_carries_retry_after() {
        let response = error_response(&Error::ColdStartTimeout(Duration::from_secs(30)));
        assert_eq!(response.status(), 503);
        assert_eq!(
            response.headers().get(HEADER_ERROR_KIND).unwrap(),
            "cold-start-timeout"
        );
        assert_eq!(
            response.headers().get(http::header::RETRY_AFTER).unwrap(),
            "30"
        );
    }

    #[test]
    fn test_other_errors_carry_no_retry_after() {
        let response = error_response(&Error::NotFound("f".into()));
        assert_eq!(response.status(), 404);
        assert!(response.headers().get(http::header::RETRY_AFTER).is_none());
    }
}
