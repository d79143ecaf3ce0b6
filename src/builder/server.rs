//! Builder server — runs build commands against a shared volume
//!
//! HTTP surface (intra-cluster): `POST /` with `{srcPkgFilename, command}`
//! returns `{artifactFilename, buildLogs}`; `DELETE /clean/{name}` reclaims
//! scratch space; `GET /version`; `GET /healthz`.
//!
//! The build command is split on whitespace — the first token is the
//! executable, the rest are argv. Shell metacharacters are not interpreted.

use crate::error::{Error, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::Command;

pub const BUILDER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub src_pkg_filename: String,
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResponse {
    pub artifact_filename: String,
    pub build_logs: String,
}

/// Builder sidecar state
pub struct BuilderServer {
    /// Volume shared with the fetcher; sources land here, artifacts go here
    shared_volume: PathBuf,
    counter: AtomicU64,
}

impl BuilderServer {
    pub fn new(shared_volume: impl Into<PathBuf>) -> Self {
        Self {
            shared_volume: shared_volume.into(),
            counter: AtomicU64::new(1),
        }
    }

    /// Artifact name `<srcName>-<random6>`; the suffix keeps concurrent
    /// builds of the same source from colliding on disk
    fn artifact_name(&self, src: &str) -> String {
        format!("{}-{}", src, self.random6())
    }

    fn random6(&self) -> String {
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        let mut x = nanos
            ^ self
                .counter
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_mul(0x9e37_79b9_7f4a_7c15);
        let mut out = String::with_capacity(6);
        for _ in 0..6 {
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            out.push(CHARSET[(x % CHARSET.len() as u64) as usize] as char);
        }
        out
    }

    /// Run one build. Returns the artifact name and interleaved build logs;
    /// a non-zero exit is terminal and carries the logs in the error.
    pub async fn build(&self, request: &BuildRequest) -> Result<BuildResponse> {
        if request.src_pkg_filename.contains('/') {
            return Err(Error::Invalid(format!(
                "srcPkgFilename '{}' must not contain path separators",
                request.src_pkg_filename
            )));
        }
        let src_path = self.shared_volume.join(&request.src_pkg_filename);
        if !src_path.exists() {
            return Err(Error::NotFound(format!(
                "source package '{}'",
                request.src_pkg_filename
            )));
        }

        let artifact = self.artifact_name(&request.src_pkg_filename);
        let deploy_path = self.shared_volume.join(&artifact);

        let mut tokens = request.command.split_whitespace();
        let Some(program) = tokens.next() else {
            return Err(Error::Invalid("empty build command".into()));
        };
        let args: Vec<&str> = tokens.collect();

        // The source path doubles as the working directory when it is a
        // directory (extracted package); otherwise the volume root is used
        let workdir = if src_path.is_dir() {
            src_path.clone()
        } else {
            self.shared_volume.clone()
        };

        tracing::info!(
            src = request.src_pkg_filename,
            artifact,
            command = request.command,
            "Starting build"
        );

        let mut child = Command::new(program)
            .args(&args)
            .env("SRC_PKG", &src_path)
            .env("DEPLOY_PKG", &deploy_path)
            .current_dir(&workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::BuildFailed(format!("spawn '{}': {}", program, e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let logs = Arc::new(std::sync::Mutex::new(String::new()));

        let out_task = spawn_line_reader(stdout, logs.clone());
        let err_task = spawn_line_reader(stderr, logs.clone());

        let status = child
            .wait()
            .await
            .map_err(|e| Error::BuildFailed(format!("wait: {}", e)))?;
        let _ = out_task.await;
        let _ = err_task.await;

        let build_logs = logs.lock().unwrap().clone();
        if !status.success() {
            return Err(Error::BuildFailed(format!(
                "command exited with {}:\n{}",
                status, build_logs
            )));
        }
        if !deploy_path.exists() {
            return Err(Error::BuildFailed(format!(
                "command succeeded but produced no artifact at {}:\n{}",
                deploy_path.display(),
                build_logs
            )));
        }

        Ok(BuildResponse {
            artifact_filename: artifact,
            build_logs,
        })
    }

    /// Delete a source or artifact and everything derived from it
    pub fn clean(&self, name: &str) -> Result<usize> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::Invalid(format!("bad clean target '{}'", name)));
        }
        let mut removed = 0;
        let entries = std::fs::read_dir(&self.shared_volume).map_err(Error::Io)?;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name == name || file_name.starts_with(&format!("{}-", name)) {
                let path = entry.path();
                let result = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                if result.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub fn shared_volume(&self) -> &Path {
        &self.shared_volume
    }
}

fn spawn_line_reader<R>(
    reader: Option<R>,
    logs: Arc<std::sync::Mutex<String>>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(reader) = reader else { return };
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut logs = logs.lock().unwrap();
            logs.push_str(&line);
            logs.push('\n');
        }
    })
}

/// Bind the builder listener; returns the bound address and accept-loop task
pub async fn serve(
    addr: SocketAddr,
    server: Arc<BuilderServer>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Other(format!("failed to bind {}: {}", addr, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::Other(format!("no local addr: {}", e)))?;

    tracing::info!(address = %local_addr, volume = %server.shared_volume().display(), "Builder listening");

    let handle = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            let server = server.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let _ = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(move |req| handle_request(req, server.clone())),
                    )
                    .await;
            });
        }
    });

    Ok((local_addr, handle))
}

async fn handle_request(
    req: Request<Incoming>,
    server: Arc<BuilderServer>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method.as_str(), path.as_str()) {
        ("GET", "/healthz") => Ok(text(200, "ok")),
        ("GET", "/version") => Ok(text(200, BUILDER_VERSION)),
        ("POST", "/") => {
            let body = req.into_body().collect().await?.to_bytes();
            let request: BuildRequest = match serde_json::from_slice(&body) {
                Ok(r) => r,
                Err(e) => return Ok(text(400, &format!("bad build request: {}", e))),
            };
            match server.build(&request).await {
                Ok(response) => Ok(json(200, &response)),
                Err(e) => Ok(text(e.status_code(), &e.to_string())),
            }
        }
        _ => {
            if method == http::Method::DELETE {
                if let Some(name) = path.strip_prefix("/clean/") {
                    return match server.clean(name) {
                        Ok(removed) => Ok(text(200, &format!("removed {}", removed))),
                        Err(e) => Ok(text(e.status_code(), &e.to_string())),
                    };
                }
            }
            Ok(text(404, "not found"))
        }
    }
}

fn text(status: u16, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn json<T: Serialize>(status: u16, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
