//! Build manager — drives packages from `pending` to `succeeded`/`failed`
//!
//! Watches the package stream, takes an advisory lease per package
//! fingerprint so at most one controller builds a given resource version,
//! stages the source in the builder's shared volume, issues the build over
//! HTTP, uploads the artifact, and transitions the package status with
//! optimistic concurrency.

use crate::builder::server::{BuildRequest, BuildResponse};
use crate::error::{retry_transient, Error, Result};
use crate::orchestrator::{DeploymentRequest, Orchestrator};
use crate::storage::{self, BlobStore};
use crate::store::{self, Kind, Object, ObjectStore, WatchEvent};
use crate::types::{Archive, BuildStatus, Checksum, Environment, Package};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Advisory build leases keyed by package fingerprint. Cooperative: a
/// controller that cannot take the lease skips the build; a dead holder's
/// lease expires after the timeout.
pub struct BuildLeases {
    leases: Mutex<HashMap<String, Instant>>,
    timeout: Duration,
}

impl BuildLeases {
    pub fn new(timeout: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Take the lease if free or expired
    pub fn try_acquire(&self, key: &str) -> bool {
        let mut leases = self.leases.lock().unwrap();
        let now = Instant::now();
        match leases.get(key) {
            Some(expires) if *expires > now => false,
            _ => {
                leases.insert(key.to_string(), now + self.timeout);
                true
            }
        }
    }

    pub fn release(&self, key: &str) {
        self.leases.lock().unwrap().remove(key);
    }

    pub fn held(&self, key: &str) -> bool {
        self.leases
            .lock()
            .unwrap()
            .get(key)
            .map(|expires| *expires > Instant::now())
            .unwrap_or(false)
    }
}

/// Controller that owns the build pipeline
pub struct BuildManager {
    store: Arc<dyn ObjectStore>,
    blob: Arc<dyn BlobStore>,
    orchestrator: Arc<dyn Orchestrator>,
    client: reqwest::Client,
    /// Volume shared with builder pods; sources staged here, artifacts read
    /// back from here
    shared_volume: PathBuf,
    /// Namespace builder workloads run in
    builder_namespace: String,
    leases: BuildLeases,
}

impl BuildManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        blob: Arc<dyn BlobStore>,
        orchestrator: Arc<dyn Orchestrator>,
        shared_volume: impl Into<PathBuf>,
        builder_namespace: impl Into<String>,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            store,
            blob,
            orchestrator,
            client: reqwest::Client::new(),
            shared_volume: shared_volume.into(),
            builder_namespace: builder_namespace.into(),
            leases: BuildLeases::new(lease_timeout),
        }
    }

    /// Build one pending package end to end. Skips silently when another
    /// controller holds the lease for this resource version.
    pub async fn process_pending(&self, package: Package) -> Result<()> {
        if package.status.build_status != BuildStatus::Pending {
            return Ok(());
        }
        let fingerprint = package.metadata.fingerprint().to_string();
        if !self.leases.try_acquire(&fingerprint) {
            tracing::debug!(
                package = package.metadata.name,
                fingerprint,
                "Build lease held elsewhere; skipping"
            );
            return Ok(());
        }

        let namespace = package.metadata.namespace.clone();
        let name = package.metadata.name.clone();
        let result = self.run_build(&package).await;
        self.leases.release(&fingerprint);

        match result {
            Ok(response) => {
                tracing::info!(
                    package = name,
                    artifact = response.artifact_filename,
                    "Build succeeded"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(package = name, error = %e, "Build failed");
                self.set_status(&namespace, &name, BuildStatus::Failed, e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    async fn run_build(&self, package: &Package) -> Result<BuildResponse> {
        let env = store::get_environment(
            self.store.as_ref(),
            &package.spec.environment.namespace,
            &package.spec.environment.name,
        )
        .await?;
        let Some(builder_image) = env.spec.builder_image.clone() else {
            return Err(Error::Invalid(format!(
                "environment '{}' has no builder image",
                env.metadata.name
            )));
        };

        self.set_status(
            &package.metadata.namespace,
            &package.metadata.name,
            BuildStatus::Running,
            String::new(),
        )
        .await?;

        let src_filename = self.stage_source(package).await?;
        let builder_url = self.ensure_builder(&env, &builder_image).await?;

        let command = package
            .spec
            .build_command
            .clone()
            .or_else(|| env.spec.build_command.clone())
            .ok_or_else(|| {
                Error::Invalid(format!(
                    "package '{}' has no build command and environment '{}' sets no default",
                    package.metadata.name, env.metadata.name
                ))
            })?;

        let request = BuildRequest {
            src_pkg_filename: src_filename,
            command,
        };
        let client = self.client.clone();
        let url = builder_url.clone();
        let response = retry_transient(3, Duration::from_millis(100), Duration::from_secs(2), || {
            let client = client.clone();
            let url = url.clone();
            let request = request.clone();
            async move {
                let response = client.post(&url).json(&request).send().await?;
                if response.status().as_u16() == 503 {
                    return Err(Error::Transient(format!(
                        "builder busy: {}",
                        response.status()
                    )));
                }
                if !response.status().is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(Error::BuildFailed(body));
                }
                let parsed: BuildResponse = response.json().await?;
                Ok(parsed)
            }
        })
        .await?;

        let artifact_path = self.shared_volume.join(&response.artifact_filename);
        let data = tokio::fs::read(&artifact_path).await.map_err(Error::Io)?;
        let checksum = Checksum::sha256(&data);
        let id = self.blob.upload(Bytes::from(data)).await?;
        let archive = Archive::url(self.blob.url(&id), checksum);

        self.finish_success(package, archive, response.build_logs.clone())
            .await?;
        Ok(response)
    }

    /// Write the source archive into the shared volume under a
    /// per-resource-version name
    async fn stage_source(&self, package: &Package) -> Result<String> {
        let source = package.spec.source.as_ref().ok_or_else(|| {
            Error::Invalid(format!(
                "package '{}' is pending but has no source archive",
                package.metadata.name
            ))
        })?;
        let data = match source {
            Archive::Literal { literal } => Bytes::from(literal.clone()),
            Archive::Url { url, checksum } => {
                let id = url.rsplit('/').next().unwrap_or(url);
                storage::download_verified(self.blob.as_ref(), id, checksum).await?
            }
        };
        let filename = format!(
            "{}-{}-src",
            package.metadata.name, package.metadata.resource_version
        );
        tokio::fs::write(self.shared_volume.join(&filename), &data)
            .await
            .map_err(Error::Io)?;
        Ok(filename)
    }

    /// Materialise the environment's builder deployment + service and return
    /// the service URL
    async fn ensure_builder(&self, env: &Environment, builder_image: &str) -> Result<String> {
        let name = format!("builder-{}", env.metadata.name);
        let labels = [
            ("environmentName".to_string(), env.metadata.name.clone()),
            ("component".to_string(), "builder".to_string()),
        ]
        .into_iter()
        .collect::<std::collections::BTreeMap<_, _>>();

        self.orchestrator
            .ensure_deployment(DeploymentRequest {
                name: name.clone(),
                namespace: self.builder_namespace.clone(),
                image: builder_image.to_string(),
                replicas: 1,
                labels: labels.clone(),
                fetch_url: None,
                fetch_checksum: None,
                cpu_millis: None,
                memory_mb: None,
            })
            .await?;
        self.orchestrator
            .ensure_service(&self.builder_namespace, &name, labels)
            .await
    }

    /// `running → succeeded` with the deploy archive attached
    async fn finish_success(&self, package: &Package, archive: Archive, logs: String) -> Result<()> {
        let namespace = package.metadata.namespace.clone();
        let name = package.metadata.name.clone();
        for _ in 0..3 {
            let mut fresh =
                store::get_package(self.store.as_ref(), &namespace, &name).await?;
            fresh.spec.deployment = Some(archive.clone());
            fresh.status.build_status = BuildStatus::Succeeded;
            fresh.status.build_logs = logs.clone();
            match self.store.update(Object::Package(fresh)).await {
                Ok(_) => return Ok(()),
                Err(Error::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!(
            "kept losing update races on package '{}/{}'",
            namespace, name
        )))
    }

    /// Transition the build status with optimistic concurrency
    async fn set_status(
        &self,
        namespace: &str,
        name: &str,
        status: BuildStatus,
        logs: String,
    ) -> Result<()> {
        for _ in 0..3 {
            let mut fresh = store::get_package(self.store.as_ref(), namespace, name).await?;
            fresh.status.build_status = status;
            fresh.status.build_logs = logs.clone();
            match self.store.update(Object::Package(fresh)).await {
                Ok(_) => return Ok(()),
                Err(Error::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!(
            "kept losing update races on package '{}/{}'",
            namespace, name
        )))
    }
}

/// Watch the package stream and build everything pending. Scans existing
/// packages once at startup so builds owed from before the restart run.
pub fn start(manager: Arc<BuildManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = manager.store.watch(Kind::Package);

        if let Ok(objects) = manager.store.list(Kind::Package, None).await {
            for object in objects {
                if let Object::Package(package) = object {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        let _ = manager.process_pending(package).await;
                    });
                }
            }
        }

        loop {
            match events.recv().await {
                Ok(WatchEvent::Added(Object::Package(package)))
                | Ok(WatchEvent::Modified(Object::Package(package))) => {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        let _ = manager.process_pending(package).await;
                    });
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Package watch lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::server::{serve, BuilderServer};
    use crate::orchestrator::MockOrchestrator;
    use crate::storage::MemoryBlobStore;
    use crate::store::MemoryStore;
    use crate::types::{EnvironmentSpec, Metadata, ObjectRef, PackageSpec};

    #[test]
    fn test_lease_exclusivity_and_release() {
        let leases = BuildLeases::new(Duration::from_secs(60));
        assert!(leases.try_acquire("fp1"));
        assert!(!leases.try_acquire("fp1"));
        assert!(leases.try_acquire("fp2"));

        leases.release("fp1");
        assert!(leases.try_acquire("fp1"));
    }

    #[test]
    fn test_expired_lease_can_be_retaken() {
        let leases = BuildLeases::new(Duration::from_millis(10));
        assert!(leases.try_acquire("fp1"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(!leases.held("fp1"));
        assert!(leases.try_acquire("fp1"));
    }

    async fn seed_package(
        store: &MemoryStore,
        builder_image: Option<&str>,
        command: &str,
    ) -> Package {
        store
            .create(Object::Environment(Environment {
                metadata: Metadata::new("py", "default"),
                spec: EnvironmentSpec {
                    runtime_image: "python:3.11".into(),
                    builder_image: builder_image.map(str::to_string),
                    build_command: None,
                    pool_size: 3,
                    version: 1,
                },
            }))
            .await
            .unwrap();

        let created = store
            .create(Object::Package(Package {
                metadata: Metadata::new("p1", "default"),
                spec: PackageSpec {
                    environment: ObjectRef::new("py", "default"),
                    source: Some(Archive::literal(b"def main(): pass".to_vec())),
                    deployment: None,
                    build_command: Some(command.to_string()),
                },
                status: Default::default(),
            }))
            .await
            .unwrap();
        match created {
            Object::Package(mut p) => {
                // Freshly created source-only packages owe a build
                p.status.build_status = BuildStatus::Pending;
                match store.update(Object::Package(p)).await.unwrap() {
                    Object::Package(p) => p,
                    _ => unreachable!(),
                }
            }
            _ => unreachable!(),
        }
    }

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_pipeline_success_transitions_and_artifact_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _handle) = serve(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(BuilderServer::new(dir.path())),
        )
        .await
        .unwrap();

        let orch = Arc::new(MockOrchestrator::new());
        orch.set_backend_url(format!("http://{}", addr));
        let store = Arc::new(MemoryStore::new());
        let blob = Arc::new(MemoryBlobStore::new());

        let script = write_script(
            dir.path(),
            "build.sh",
            "#!/bin/sh\ncp \"$SRC_PKG\" \"$DEPLOY_PKG\"\necho compiled\n",
        );
        let package = seed_package(&store, Some("builder:latest"), &script).await;

        let manager = BuildManager::new(
            store.clone(),
            blob.clone(),
            orch,
            dir.path(),
            "funcgate-builder",
            Duration::from_secs(60),
        );
        manager.process_pending(package).await.unwrap();

        let built = store::get_package(store.as_ref(), "default", "p1")
            .await
            .unwrap();
        assert_eq!(built.status.build_status, BuildStatus::Succeeded);
        assert!(built.status.build_logs.contains("compiled"));
        let Some(Archive::Url { url, checksum }) = built.spec.deployment else {
            panic!("deploy archive missing");
        };
        assert!(!url.is_empty());

        // The uploaded artifact round-trips the source bytes
        let id = url.rsplit('/').next().unwrap();
        let data = blob.download(id).await.unwrap();
        assert_eq!(&data[..], b"def main(): pass");
        assert_eq!(Checksum::sha256(&data), checksum);
    }

    #[tokio::test]
    async fn test_pipeline_failure_records_logs() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _handle) = serve(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(BuilderServer::new(dir.path())),
        )
        .await
        .unwrap();

        let orch = Arc::new(MockOrchestrator::new());
        orch.set_backend_url(format!("http://{}", addr));
        let store = Arc::new(MemoryStore::new());

        let script = write_script(
            dir.path(),
            "fail.sh",
            "#!/bin/sh\necho missing dependency >&2\nexit 1\n",
        );
        let package = seed_package(&store, Some("builder:latest"), &script).await;

        let manager = BuildManager::new(
            store.clone(),
            Arc::new(MemoryBlobStore::new()),
            orch,
            dir.path(),
            "funcgate-builder",
            Duration::from_secs(60),
        );
        let result = manager.process_pending(package).await;
        assert!(result.is_err());

        let failed = store::get_package(store.as_ref(), "default", "p1")
            .await
            .unwrap();
        assert_eq!(failed.status.build_status, BuildStatus::Failed);
        assert!(failed.status.build_logs.contains("missing dependency"));
    }

    #[tokio::test]
    async fn test_environment_without_builder_fails_terminally() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Arc::new(MockOrchestrator::new());
        let store = Arc::new(MemoryStore::new());
        let package = seed_package(&store, None, "true").await;

        let manager = BuildManager::new(
            store.clone(),
            Arc::new(MemoryBlobStore::new()),
            orch,
            dir.path(),
            "funcgate-builder",
            Duration::from_secs(60),
        );
        let result = manager.process_pending(package).await;
        assert!(matches!(result, Err(Error::Invalid(_))));

        let failed = store::get_package(store.as_ref(), "default", "p1")
            .await
            .unwrap();
        assert_eq!(failed.status.build_status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn test_non_pending_package_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut package = seed_package(&store, Some("builder:latest"), "true").await;
        package.status.build_status = BuildStatus::Succeeded;

        let manager = BuildManager::new(
            store,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MockOrchestrator::new()),
            dir.path(),
            "funcgate-builder",
            Duration::from_secs(60),
        );
        manager.process_pending(package).await.unwrap();
    }
}
