//! Pool-based executor — warm generic pods, specialised on demand
//!
//! Each environment keeps a pool of identical pods running its runtime image
//! in an unspecialised state. `acquire` picks any ready-generic pod, refills
//! the pool with exactly one replacement, and POSTs the function's deploy
//! archive to the pod's specialize endpoint. A specialised pod is never
//! reused for a different fingerprint; eviction drains it.

use crate::cache::FnServiceEntry;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::orchestrator::{Orchestrator, PodRequest};
use crate::storage::{self, BlobStore};
use crate::store::{self, ObjectStore};
use crate::types::{Archive, BuildStatus, Environment, ExecutorType, Fingerprint, Function};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// Body of a `/v2/specialize` call
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpecializeRequest {
    function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fetch_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

struct PoolState {
    /// Pods that passed readiness and await specialisation
    generic: Vec<String>,
    /// In-flight generic pod creations
    creating: usize,
}

/// Per-environment pool of generic pods. Owns the handles its creation
/// tasks need so they can outlive any single acquire call.
struct EnvPool {
    env: Environment,
    namespace: String,
    orchestrator: Arc<dyn Orchestrator>,
    state: Mutex<PoolState>,
    /// Signalled when a pod reaches ready-generic
    ready: Notify,
    /// Bounds concurrent acquire requests per environment
    queue: Arc<Semaphore>,
    counter: Arc<AtomicU64>,
}

impl EnvPool {
    fn next_pod_name(&self) -> String {
        format!(
            "pool-{}-{:x}",
            self.env.metadata.name,
            self.counter.fetch_add(1, Ordering::SeqCst)
        )
    }

    /// Start one generic pod creation. `state.creating` was already bumped
    /// by the caller under the lock.
    fn spawn_creation(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let name = pool.next_pod_name();
            let request = PodRequest {
                name: name.clone(),
                namespace: pool.namespace.clone(),
                image: pool.env.spec.runtime_image.clone(),
                labels: [
                    ("environmentName".to_string(), pool.env.metadata.name.clone()),
                    ("poolRole".to_string(), "generic".to_string()),
                ]
                .into_iter()
                .collect(),
                fetch_url: None,
            };

            let result: Result<()> = async {
                pool.orchestrator.create_pod(request).await?;
                pool.orchestrator
                    .wait_pod_ready(&pool.namespace, &name, Duration::from_secs(120))
                    .await?;
                Ok(())
            }
            .await;

            let mut state = pool.state.lock().unwrap();
            state.creating -= 1;
            match result {
                Ok(()) => {
                    state.generic.push(name);
                    drop(state);
                    pool.ready.notify_waiters();
                }
                Err(e) => {
                    drop(state);
                    tracing::warn!(
                        environment = pool.env.metadata.name,
                        error = %e,
                        "Generic pod creation failed"
                    );
                }
            }
        });
    }

    /// Take a ready-generic pod, creating pool members up to the
    /// environment's pool size while the pool is empty.
    async fn take_generic(self: &Arc<Self>, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(pod) = state.generic.pop() {
                    // Exactly one replacement per consumed pod
                    state.creating += 1;
                    drop(state);
                    self.spawn_creation();
                    return Ok(pod);
                }
                if state.creating < self.env.spec.pool_size as usize {
                    state.creating += 1;
                    drop(state);
                    self.spawn_creation();
                }
            }

            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(Error::ColdStartTimeout(timeout))?;
            if tokio::time::timeout(remaining, self.ready.notified())
                .await
                .is_err()
            {
                return Err(Error::ColdStartTimeout(timeout));
            }
        }
    }
}

/// Executor that taps pre-warmed generic pods
pub struct PoolExecutor {
    orchestrator: Arc<dyn Orchestrator>,
    store: Arc<dyn ObjectStore>,
    blob: Arc<dyn BlobStore>,
    client: reqwest::Client,
    /// Namespace function pods run in
    runtime_namespace: String,
    /// Acquire queue bound per environment
    max_queue: usize,
    pools: Mutex<HashMap<String, Arc<EnvPool>>>,
    pod_counter: Arc<AtomicU64>,
}

impl PoolExecutor {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        store: Arc<dyn ObjectStore>,
        blob: Arc<dyn BlobStore>,
        runtime_namespace: impl Into<String>,
        max_queue: usize,
    ) -> Self {
        Self {
            orchestrator,
            store,
            blob,
            client: reqwest::Client::new(),
            runtime_namespace: runtime_namespace.into(),
            max_queue,
            pools: Mutex::new(HashMap::new()),
            pod_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    fn pool_for(&self, env: &Environment) -> Arc<EnvPool> {
        let key = format!("{}/{}", env.metadata.namespace, env.metadata.name);
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(key)
            .or_insert_with(|| {
                Arc::new(EnvPool {
                    env: env.clone(),
                    namespace: self.runtime_namespace.clone(),
                    orchestrator: self.orchestrator.clone(),
                    state: Mutex::new(PoolState {
                        generic: Vec::new(),
                        creating: 0,
                    }),
                    ready: Notify::new(),
                    queue: Arc::new(Semaphore::new(self.max_queue)),
                    counter: self.pod_counter.clone(),
                })
            })
            .clone()
    }

    /// Load the function's deploy artifact: inline bytes, or a verified
    /// download when the archive lives in the blob service.
    async fn deploy_artifact(
        &self,
        function: &Function,
    ) -> Result<(Bytes, Option<(String, String)>)> {
        let package = store::get_package(
            self.store.as_ref(),
            &function.spec.package.namespace,
            &function.spec.package.name,
        )
        .await?;

        match package.status.build_status {
            BuildStatus::Failed => {
                return Err(Error::BuildFailed(format!(
                    "package '{}' build failed: {}",
                    package.metadata.name,
                    package.status.build_logs.lines().last().unwrap_or("")
                )))
            }
            BuildStatus::Pending | BuildStatus::Running => {
                return Err(Error::Transient(format!(
                    "package '{}' build is {}",
                    package.metadata.name, package.status.build_status
                )))
            }
            BuildStatus::None | BuildStatus::Succeeded => {}
        }

        let archive = package.spec.deployment.as_ref().ok_or_else(|| {
            Error::Invalid(format!(
                "package '{}' has no deploy archive",
                package.metadata.name
            ))
        })?;

        match archive {
            Archive::Literal { literal } => Ok((Bytes::from(literal.clone()), None)),
            Archive::Url { url, checksum } => {
                let id = url.rsplit('/').next().unwrap_or(url);
                let data = storage::download_verified(self.blob.as_ref(), id, checksum).await?;
                Ok((data, Some((url.clone(), checksum.sum.clone()))))
            }
        }
    }

    /// POST the deploy archive to the pod's specialize endpoint. Protocol
    /// version comes from the environment: v2 runtimes fetch the archive
    /// themselves from a URL, v1 runtimes take raw bytes.
    async fn specialize(
        &self,
        pod_url: &str,
        env: &Environment,
        function: &Function,
        artifact: &(Bytes, Option<(String, String)>),
        timeout: Duration,
    ) -> Result<()> {
        let response = if env.spec.version >= 2 {
            let (fetch_url, checksum) = match &artifact.1 {
                Some((url, sum)) => (Some(url.clone()), Some(sum.clone())),
                None => (None, None),
            };
            let body = SpecializeRequest {
                function_name: function.metadata.name.clone(),
                fetch_url,
                checksum,
            };
            self.client
                .post(format!("{}/v2/specialize", pod_url.trim_end_matches('/')))
                .timeout(timeout)
                .json(&body)
                .send()
                .await
        } else {
            self.client
                .post(format!("{}/specialize", pod_url.trim_end_matches('/')))
                .timeout(timeout)
                .body(artifact.0.clone())
                .send()
                .await
        };

        let response = response
            .map_err(|e| Error::SpecializationFailed(format!("specialize call failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SpecializationFailed(format!(
                "pod returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for PoolExecutor {
    async fn acquire(&self, function: &Function) -> Result<FnServiceEntry> {
        let env = store::get_environment(
            self.store.as_ref(),
            &function.spec.environment.namespace,
            &function.spec.environment.name,
        )
        .await?;
        let pool = self.pool_for(&env);

        // Bounded queue; overflow is capacity-exhausted, not an unbounded
        // pile-up of waiters
        let Ok(_permit) = pool.queue.clone().try_acquire_owned() else {
            return Err(Error::CapacityExhausted(format!(
                "environment '{}' acquire queue is full",
                env.metadata.name
            )));
        };

        let timeout =
            Duration::from_secs(function.spec.invoke_strategy.specialization_timeout_secs);
        let artifact = self.deploy_artifact(function).await?;
        let fp = function.metadata.fingerprint();

        // A failed specialisation is never retried on the same pod; the pod
        // drains and one fresh generic pod gets the second (final) attempt.
        let mut last_err = None;
        for attempt in 0..2u32 {
            let pod = pool.take_generic(timeout).await?;
            let info = self
                .orchestrator
                .wait_pod_ready(&self.runtime_namespace, &pod, timeout)
                .await?;

            match self
                .specialize(&info.url, &env, function, &artifact, timeout)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        fingerprint = %fp,
                        pod,
                        url = info.url,
                        attempt,
                        "Pod specialized"
                    );
                    return Ok(FnServiceEntry::new(info.url, Some(pod))
                        .with_executor(ExecutorType::PoolBased));
                }
                Err(e) => {
                    tracing::warn!(
                        fingerprint = %fp,
                        pod,
                        error = %e,
                        "Specialization failed; draining pod"
                    );
                    let _ = self
                        .orchestrator
                        .delete_pod(&self.runtime_namespace, &pod)
                        .await;
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::SpecializationFailed("no attempt made".into())))
    }

    async fn release(&self, fp: &Fingerprint, entry: &FnServiceEntry) -> Result<()> {
        if let Some(pod) = &entry.owning_pod {
            tracing::debug!(fingerprint = %fp, pod, "Draining specialized pod");
            self.orchestrator
                .delete_pod(&self.runtime_namespace, pod)
                .await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "pool"
    }
}
