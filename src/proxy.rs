//! HTTP reverse proxy — forwards invocations to specialized backends

use crate::error::{Error, Result};
use crate::types::Function;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const HEADER_FUNCTION_NAME: &str = "X-Fission-Function-Name";
pub const HEADER_FUNCTION_UID: &str = "X-Fission-Function-Uid";
pub const HEADER_FUNCTION_RV: &str = "X-Fission-Function-ResourceVersion";
pub const HEADER_REQ_UID: &str = "X-Fission-ReqUID";

/// Identity headers stamped on every forwarded invocation
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub function_name: String,
    pub function_uid: String,
    pub resource_version: String,
    pub req_uid: String,
}

impl RoutingContext {
    pub fn for_function(function: &Function, req_uid: String) -> Self {
        Self {
            function_name: function.metadata.name.clone(),
            function_uid: function.metadata.uid.clone(),
            resource_version: function.metadata.resource_version.clone(),
            req_uid,
        }
    }
}

/// HTTP reverse proxy in front of function backends
pub struct FunctionProxy {
    client: reqwest::Client,
    req_counter: AtomicU64,
}

impl FunctionProxy {
    pub fn new() -> Self {
        // Per-request timeouts come from each function's spec, so the
        // client carries none of its own
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .build()
            .unwrap_or_default();
        Self {
            client,
            req_counter: AtomicU64::new(1),
        }
    }

    /// Mint a request id unique within this router instance
    pub fn next_req_uid(&self) -> String {
        let seq = self.req_counter.fetch_add(1, Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp_millis();
        format!("req-{:x}-{:x}", now, seq)
    }

    /// Forward one invocation to a backend. `path_and_query` is the suffix
    /// past the trigger prefix, passed through untouched.
    pub async fn forward(
        &self,
        backend_url: &str,
        method: &http::Method,
        path_and_query: &str,
        headers: &http::HeaderMap,
        body: Bytes,
        timeout: Duration,
        ctx: &RoutingContext,
    ) -> Result<ProxyResponse> {
        let upstream_url = join_url(backend_url, path_and_query);

        let mut req_builder = self
            .client
            .request(method.clone(), &upstream_url)
            .timeout(timeout);

        for (key, value) in headers.iter() {
            if !is_hop_by_hop(key.as_str()) {
                req_builder = req_builder.header(key.clone(), value.clone());
            }
        }

        if let Some(host) = headers.get(http::header::HOST) {
            req_builder = req_builder.header("X-Forwarded-Host", value_or_empty(host));
        }
        req_builder = req_builder
            .header(HEADER_FUNCTION_NAME, &ctx.function_name)
            .header(HEADER_FUNCTION_UID, &ctx.function_uid)
            .header(HEADER_FUNCTION_RV, &ctx.resource_version)
            .header(HEADER_REQ_UID, &ctx.req_uid)
            .body(body);

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::BackendUnreachable(format!(
                    "backend {} timed out after {:?}",
                    backend_url, timeout
                ))
            } else if e.is_connect() {
                Error::BackendUnreachable(format!(
                    "cannot connect to backend {}: {}",
                    backend_url, e
                ))
            } else {
                Error::Http(e)
            }
        })?;

        let status = response.status();
        let resp_headers = response.headers().clone();
        let resp_body = response.bytes().await.map_err(Error::Http)?;

        Ok(ProxyResponse {
            status,
            headers: resp_headers,
            body: resp_body,
        })
    }
}

impl Default for FunctionProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Response from a function backend
pub struct ProxyResponse {
    pub status: reqwest::StatusCode,
    pub headers: reqwest::header::HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    /// Backend failure demanding eviction of the cached backend: any 5xx
    /// means the pod is unhealthy, not that the function politely errored
    pub fn is_backend_failure(&self) -> bool {
        self.status.is_server_error()
    }
}

fn join_url(base: &str, path_and_query: &str) -> String {
    let base = base.trim_end_matches('/');
    if path_and_query.is_empty() || path_and_query == "/" {
        base.to_string()
    } else if path_and_query.starts_with('/') || path_and_query.starts_with('?') {
        format!("{}{}", base, path_and_query)
    } else {
        format!("{}/{}", base, path_and_query)
    }
}

fn value_or_empty(value: &http::HeaderValue) -> &str {
    value.to_str().unwrap_or("")
}

/// Hop-by-hop headers never forwarded upstream
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;
    use http_body_util::{BodyExt, Full};
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("Upgrade"));

        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("X-Fission-Function-Name"));
        assert!(!is_hop_by_hop("Host"));
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://x:8080/", "/a/b?q=1"), "http://x:8080/a/b?q=1");
        assert_eq!(join_url("http://x:8080", "/"), "http://x:8080");
        assert_eq!(join_url("http://x:8080", ""), "http://x:8080");
        assert_eq!(join_url("http://x:8080", "?q=1"), "http://x:8080?q=1");
    }

    #[test]
    fn test_any_5xx_is_a_backend_failure() {
        let response = |status: u16| ProxyResponse {
            status: reqwest::StatusCode::from_u16(status).unwrap(),
            headers: reqwest::header::HeaderMap::new(),
            body: Bytes::new(),
        };
        for status in [500, 501, 502, 503, 504, 505] {
            assert!(response(status).is_backend_failure(), "{}", status);
        }
        for status in [200, 204, 301, 400, 404, 429] {
            assert!(!response(status).is_backend_failure(), "{}", status);
        }
    }

    #[test]
    fn test_req_uids_are_unique() {
        let proxy = FunctionProxy::new();
        let a = proxy.next_req_uid();
        let b = proxy.next_req_uid();
        assert_ne!(a, b);
    }

    fn ctx() -> RoutingContext {
        let mut metadata = Metadata::new("hello", "default");
        metadata.uid = "uid-1".into();
        metadata.resource_version = "7".into();
        RoutingContext {
            function_name: metadata.name,
            function_uid: metadata.uid,
            resource_version: metadata.resource_version,
            req_uid: "req-1".into(),
        }
    }

    /// Echo server that records the headers of the last request
    async fn spawn_echo(seen: Arc<Mutex<Option<http::HeaderMap>>>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let seen = seen.clone();
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(
                            TokioIo::new(stream),
                            service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                                let seen = seen.clone();
                                async move {
                                    *seen.lock().await = Some(req.headers().clone());
                                    let body = req.into_body().collect().await.unwrap().to_bytes();
                                    Ok::<_, hyper::Error>(
                                        hyper::Response::new(Full::new(body)),
                                    )
                                }
                            }),
                        )
                        .await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_forward_stamps_routing_headers_and_echoes_body() {
        let seen = Arc::new(Mutex::new(None));
        let url = spawn_echo(seen.clone()).await;
        let proxy = FunctionProxy::new();

        let mut headers = http::HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        headers.insert("connection", "close".parse().unwrap());

        let response = proxy
            .forward(
                &url,
                &http::Method::POST,
                "/sub/path",
                &headers,
                Bytes::from("payload"),
                Duration::from_secs(5),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(response.status, reqwest::StatusCode::OK);
        assert_eq!(response.body, Bytes::from("payload"));

        let seen = seen.lock().await.clone().unwrap();
        assert_eq!(seen.get(HEADER_FUNCTION_NAME).unwrap(), "hello");
        assert_eq!(seen.get(HEADER_FUNCTION_UID).unwrap(), "uid-1");
        assert_eq!(seen.get(HEADER_REQ_UID).unwrap(), "req-1");
        assert_eq!(seen.get("content-type").unwrap(), "text/plain");
        // Hop-by-hop never crosses the proxy
        assert!(seen.get("proxy-authorization").is_none());
    }

    #[tokio::test]
    async fn test_connect_error_is_backend_unreachable() {
        let proxy = FunctionProxy::new();
        let result = proxy
            .forward(
                "http://127.0.0.1:1",
                &http::Method::GET,
                "/",
                &http::HeaderMap::new(),
                Bytes::new(),
                Duration::from_secs(1),
                &ctx(),
            )
            .await;
        assert!(matches!(result, Err(Error::BackendUnreachable(_))));
    }

    #[tokio::test]
    async fn test_timeout_is_backend_unreachable() {
        // Listener that accepts but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _sock = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let proxy = FunctionProxy::new();
        let result = proxy
            .forward(
                &format!("http://{}", addr),
                &http::Method::GET,
                "/",
                &http::HeaderMap::new(),
                Bytes::new(),
                Duration::from_millis(100),
                &ctx(),
            )
            .await;
        assert!(matches!(result, Err(Error::BackendUnreachable(_))));
    }
}
