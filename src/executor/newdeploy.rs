//! New-deployment executor — a dedicated deployment per function
//!
//! Instead of tapping a shared pool, each function gets its own deployment,
//! a stable service in front of it, and a CPU autoscaler between minScale
//! and maxScale. First invocation waits for at least one ready replica;
//! idle eviction scales the deployment back to minScale (possibly zero)
//! but never deletes it, so the autoscaler's knowledge survives.

use crate::cache::FnServiceEntry;
use crate::error::{Error, Result};
use crate::executor::{function_labels, Executor};
use crate::orchestrator::{AutoscalerRequest, DeploymentRequest, Orchestrator};
use crate::storage::BlobStore;
use crate::store::{self, ObjectStore};
use crate::types::{Archive, BuildStatus, ExecutorType, Fingerprint, Function};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Executor that materialises one deployment per function
pub struct NewDeployExecutor {
    orchestrator: Arc<dyn Orchestrator>,
    store: Arc<dyn ObjectStore>,
    blob: Arc<dyn BlobStore>,
    /// Namespace function deployments run in
    runtime_namespace: String,
    /// Fingerprint -> minScale, so eviction knows the floor to scale to
    min_scales: Mutex<HashMap<String, u32>>,
}

impl NewDeployExecutor {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        store: Arc<dyn ObjectStore>,
        blob: Arc<dyn BlobStore>,
        runtime_namespace: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            store,
            blob,
            runtime_namespace: runtime_namespace.into(),
            min_scales: Mutex::new(HashMap::new()),
        }
    }

    /// Deployment/service name for a function. Includes a uid suffix so a
    /// recreated function with the same name gets fresh workloads.
    fn deployment_name(function: &Function) -> String {
        let uid_suffix: String = function
            .metadata
            .uid
            .chars()
            .rev()
            .take(8)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("newdeploy-{}-{}", function.metadata.name, uid_suffix)
    }

    /// Resolve the deploy archive to a fetcher URL + checksum pair. Literal
    /// archives are staged in the blob store first so the fetcher init
    /// container has something to pull.
    async fn fetch_source(&self, function: &Function) -> Result<(String, String)> {
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
            Archive::Url { url, checksum } => Ok((url.clone(), checksum.sum.clone())),
            Archive::Literal { literal } => {
                let checksum = crate::types::Checksum::sha256(literal);
                let id = self
                    .blob
                    .upload(bytes::Bytes::from(literal.clone()))
                    .await?;
                Ok((self.blob.url(&id), checksum.sum))
            }
        }
    }

    /// Poll until the deployment has at least one ready replica
    async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self
                .orchestrator
                .ready_replicas(&self.runtime_namespace, name)
                .await?
                >= 1
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                // The deployment stays; the autoscaler may still bring it up
                return Err(Error::ColdStartTimeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[async_trait]
impl Executor for NewDeployExecutor {
    async fn acquire(&self, function: &Function) -> Result<FnServiceEntry> {
        let env = store::get_environment(
            self.store.as_ref(),
            &function.spec.environment.namespace,
            &function.spec.environment.name,
        )
        .await?;

        let strategy = &function.spec.invoke_strategy;
        let name = Self::deployment_name(function);
        let labels = function_labels(function, &env);
        let (fetch_url, fetch_checksum) = self.fetch_source(function).await?;

        self.orchestrator
            .ensure_deployment(DeploymentRequest {
                name: name.clone(),
                namespace: self.runtime_namespace.clone(),
                image: env.spec.runtime_image.clone(),
                // First invocation needs a pod even when minScale is 0
                replicas: strategy.min_scale.max(1),
                labels: labels.clone(),
                fetch_url: Some(fetch_url),
                fetch_checksum: Some(fetch_checksum),
                cpu_millis: function.spec.resources.cpu_millis,
                memory_mb: function.spec.resources.memory_mb,
            })
            .await?;

        let service_url = self
            .orchestrator
            .ensure_service(&self.runtime_namespace, &name, labels)
            .await?;

        self.orchestrator
            .ensure_autoscaler(AutoscalerRequest {
                name: name.clone(),
                namespace: self.runtime_namespace.clone(),
                min_replicas: strategy.min_scale.max(1),
                max_replicas: strategy.max_scale,
                target_cpu_percent: strategy.target_cpu_percent,
            })
            .await?;

        let fp = function.metadata.fingerprint();
        self.min_scales
            .lock()
            .unwrap()
            .insert(fp.to_string(), strategy.min_scale);

        let timeout = Duration::from_secs(strategy.specialization_timeout_secs);
        self.wait_ready(&name, timeout).await?;

        tracing::info!(
            fingerprint = %fp,
            deployment = name,
            url = service_url,
            "Deployment ready"
        );
        Ok(FnServiceEntry::new(service_url, Some(name)).with_executor(ExecutorType::NewDeployment))
    }

    async fn release(&self, fp: &Fingerprint, entry: &FnServiceEntry) -> Result<()> {
        let Some(name) = &entry.owning_pod else {
            return Ok(());
        };
        let min_scale = self
            .min_scales
            .lock()
            .unwrap()
            .get(&fp.to_string())
            .copied()
            .unwrap_or(0);
        tracing::debug!(fingerprint = %fp, deployment = name, min_scale, "Scaling idle deployment down");
        self.orchestrator
            .scale_deployment(&self.runtime_namespace, name, min_scale)
            .await
    }

    fn name(&self) -> &str {
        "newdeploy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::MockOrchestrator;
    use crate::storage::MemoryBlobStore;
    use crate::store::{MemoryStore, Object};
    use crate::types::{
        Environment, EnvironmentSpec, FunctionSpec, InvokeStrategy, Metadata, ObjectRef, Package,
        PackageRef, PackageSpec, PackageStatus, Resources,
    };

    async fn seed(store: &MemoryStore, min_scale: u32, max_scale: u32) -> Function {
        store
            .create(Object::Environment(Environment {
                metadata: Metadata::new("go", "default"),
                spec: EnvironmentSpec {
                    runtime_image: "golang:1.22".into(),
                    builder_image: None,
                    build_command: None,
                    pool_size: 3,
                    version: 2,
                },
            }))
            .await
            .unwrap();

        store
            .create(Object::Package(Package {
                metadata: Metadata::new("p1", "default"),
                spec: PackageSpec {
                    environment: ObjectRef::new("go", "default"),
                    source: None,
                    deployment: Some(Archive::literal(b"binary".to_vec())),
                    build_command: None,
                },
                status: PackageStatus {
                    build_status: BuildStatus::Succeeded,
                    build_logs: String::new(),
                },
            }))
            .await
            .unwrap();

        let created = store
            .create(Object::Function(Function {
                metadata: Metadata::new("hello", "default"),
                spec: FunctionSpec {
                    environment: ObjectRef::new("go", "default"),
                    package: PackageRef {
                        name: "p1".into(),
                        namespace: "default".into(),
                        resource_version: "1".into(),
                    },
                    resources: Resources {
                        cpu_millis: Some(100),
                        memory_mb: Some(128),
                    },
                    secrets: vec![],
                    config_maps: vec![],
                    invoke_strategy: InvokeStrategy {
                        executor_type: ExecutorType::NewDeployment,
                        min_scale,
                        max_scale,
                        target_cpu_percent: 80,
                        specialization_timeout_secs: 2,
                    },
                    execution_timeout_secs: 60,
                },
            }))
            .await
            .unwrap();
        match created {
            Object::Function(f) => f,
            _ => unreachable!(),
        }
    }

    fn make_executor(
        orch: Arc<MockOrchestrator>,
        store: Arc<MemoryStore>,
    ) -> Arc<NewDeployExecutor> {
        Arc::new(NewDeployExecutor::new(
            orch,
            store,
            Arc::new(MemoryBlobStore::new()),
            "funcgate-fn",
        ))
    }

    #[tokio::test]
    async fn test_acquire_creates_deployment_service_autoscaler() {
        let orch = Arc::new(MockOrchestrator::new());
        let store = Arc::new(MemoryStore::new());
        let function = seed(&store, 0, 5).await;
        let executor = make_executor(orch.clone(), store);

        let entry = executor.acquire(&function).await.unwrap();
        assert_eq!(entry.executor_type, ExecutorType::NewDeployment);

        let name = entry.owning_pod.clone().unwrap();
        assert!(name.starts_with("newdeploy-hello-"));
        // minScale 0 still starts one replica for the first call
        assert_eq!(orch.deployment_state("funcgate-fn", &name), Some((1, 1)));

        let hpa = orch.autoscaler("funcgate-fn", &name).unwrap();
        assert_eq!(hpa.max_replicas, 5);
        assert_eq!(hpa.target_cpu_percent, 80);
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent_per_function() {
        let orch = Arc::new(MockOrchestrator::new());
        let store = Arc::new(MemoryStore::new());
        let function = seed(&store, 1, 3).await;
        let executor = make_executor(orch.clone(), store);

        let first = executor.acquire(&function).await.unwrap();
        let second = executor.acquire(&function).await.unwrap();
        // Same stable service URL both times
        assert_eq!(first.backend_url, second.backend_url);
    }

    #[tokio::test]
    async fn test_release_scales_to_min_without_deleting() {
        let orch = Arc::new(MockOrchestrator::new());
        let store = Arc::new(MemoryStore::new());
        let function = seed(&store, 0, 5).await;
        let executor = make_executor(orch.clone(), store);

        let entry = executor.acquire(&function).await.unwrap();
        let fp = function.metadata.fingerprint();
        executor.release(&fp, &entry).await.unwrap();

        let name = entry.owning_pod.unwrap();
        // Scaled down to minScale 0, deployment still present
        let (replicas, _) = orch.deployment_state("funcgate-fn", &name).unwrap();
        assert_eq!(replicas, 0);
    }

    #[tokio::test]
    async fn test_cold_start_timeout_keeps_deployment() {
        let orch = Arc::new(MockOrchestrator::new());
        orch.set_auto_ready(false);
        let store = Arc::new(MemoryStore::new());
        let function = seed(&store, 0, 5).await;
        let executor = make_executor(orch.clone(), store);

        let result = executor.acquire(&function).await;
        assert!(matches!(result, Err(Error::ColdStartTimeout(_))));

        let name = NewDeployExecutor::deployment_name(&function);
        assert!(orch.deployment_state("funcgate-fn", &name).is_some());
    }

    #[tokio::test]
    async fn test_literal_archive_is_staged_in_blob_store() {
        let orch = Arc::new(MockOrchestrator::new());
        let store = Arc::new(MemoryStore::new());
        let function = seed(&store, 1, 2).await;
        let blob = Arc::new(MemoryBlobStore::new());
        let executor = Arc::new(NewDeployExecutor::new(
            orch,
            store,
            blob.clone(),
            "funcgate-fn",
        ));

        let (url, checksum) = executor.fetch_source(&function).await.unwrap();
        assert!(!url.is_empty());
        assert_eq!(checksum, crate::types::Checksum::sha256(b"binary").sum);
    }
}
