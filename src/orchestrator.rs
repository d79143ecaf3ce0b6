//! Orchestrator port — pods, deployments, services, autoscalers
//!
//! The executors drive the cluster exclusively through this trait.
//! `MockOrchestrator` records every call and serves readiness out of memory
//! so the whole dispatch path is testable without a cluster; the real
//! Kubernetes backend lives behind the `kube` feature.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Pod creation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRequest {
    pub name: String,
    pub namespace: String,
    pub image: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Blob URL the fetcher sidecar downloads before the runtime starts
    #[serde(default)]
    pub fetch_url: Option<String>,
}

/// A running pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    /// Base URL the runtime listens on
    pub url: String,
}

/// Deployment materialisation request; `ensure` semantics, idempotent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Init-container fetch: deploy archive URL + expected checksum
    #[serde(default)]
    pub fetch_url: Option<String>,
    #[serde(default)]
    pub fetch_checksum: Option<String>,
    #[serde(default)]
    pub cpu_millis: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

/// Horizontal autoscaler request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerRequest {
    pub name: String,
    pub namespace: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub target_cpu_percent: u32,
}

/// Event from an orchestrator object watch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEvent {
    /// "added", "modified" or "deleted"
    pub event_type: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Cluster operations consumed by the executors and trigger controllers
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn create_pod(&self, req: PodRequest) -> Result<()>;

    /// Block until the named pod passes its readiness probe
    async fn wait_pod_ready(&self, namespace: &str, name: &str, timeout: Duration)
        -> Result<PodInfo>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create or update a deployment; concurrent callers converge via the
    /// orchestrator's optimistic concurrency
    async fn ensure_deployment(&self, req: DeploymentRequest) -> Result<()>;

    async fn ready_replicas(&self, namespace: &str, name: &str) -> Result<u32>;

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: u32) -> Result<()>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create or update a stable service in front of a deployment; returns
    /// the stable URL
    async fn ensure_service(&self, namespace: &str, name: &str, selector: BTreeMap<String, String>)
        -> Result<String>;

    async fn ensure_autoscaler(&self, req: AutoscalerRequest) -> Result<()>;

    /// Recent logs for pods matching the label selector
    async fn pod_logs(&self, namespace: &str, selector: &BTreeMap<String, String>)
        -> Result<String>;

    /// Watch objects of `kind` in `namespace` matching `selector`
    fn watch_objects(
        &self,
        namespace: &str,
        kind: &str,
        selector: &BTreeMap<String, String>,
    ) -> broadcast::Receiver<ObjectEvent>;
}

// ---------------------------------------------------------------------------
// MockOrchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MockPod {
    req: PodRequest,
    url: String,
}

#[derive(Debug, Clone)]
struct MockDeployment {
    req: DeploymentRequest,
    ready: u32,
}

/// In-memory orchestrator that records every call (test double and
/// single-process mode)
pub struct MockOrchestrator {
    pods: Mutex<HashMap<(String, String), MockPod>>,
    deployments: Mutex<HashMap<(String, String), MockDeployment>>,
    autoscalers: Mutex<HashMap<(String, String), AutoscalerRequest>>,
    deleted_pods: Mutex<Vec<String>>,
    pod_counter: AtomicU64,
    /// Base URL minted for every pod and service; points at a test server
    backend_url: Mutex<String>,
    /// When true, pods report ready immediately
    auto_ready: Mutex<bool>,
    events: broadcast::Sender<ObjectEvent>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self {
            pods: Mutex::new(HashMap::new()),
            deployments: Mutex::new(HashMap::new()),
            autoscalers: Mutex::new(HashMap::new()),
            deleted_pods: Mutex::new(Vec::new()),
            pod_counter: AtomicU64::new(1),
            backend_url: Mutex::new("http://127.0.0.1:0".to_string()),
            auto_ready: Mutex::new(true),
            events: broadcast::channel(64).0,
        }
    }

    /// Point all minted pod/service URLs at a real listener (tests)
    pub fn set_backend_url(&self, url: impl Into<String>) {
        *self.backend_url.lock().unwrap() = url.into();
    }

    /// Make `wait_pod_ready` block until `mark_deployment_ready` style
    /// nudges (tests of timeout paths)
    pub fn set_auto_ready(&self, ready: bool) {
        *self.auto_ready.lock().unwrap() = ready;
    }

    /// Pod names created so far, in creation order
    pub fn created_pods(&self) -> Vec<String> {
        let mut names: Vec<(u64, String)> = self
            .pods
            .lock()
            .unwrap()
            .values()
            .map(|p| {
                let seq = p
                    .url
                    .rsplit('-')
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                (seq, p.req.name.clone())
            })
            .collect();
        names.sort();
        names.into_iter().map(|(_, n)| n).collect()
    }

    pub fn pod_count(&self) -> usize {
        self.pods.lock().unwrap().len()
    }

    pub fn deleted_pods(&self) -> Vec<String> {
        self.deleted_pods.lock().unwrap().clone()
    }

    /// Deployment state for assertions: `(replicas, ready)`
    pub fn deployment_state(&self, namespace: &str, name: &str) -> Option<(u32, u32)> {
        self.deployments
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .map(|d| (d.req.replicas, d.ready))
    }

    pub fn autoscaler(&self, namespace: &str, name: &str) -> Option<AutoscalerRequest> {
        self.autoscalers
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Mark a deployment's pods ready (the mock has no kubelet)
    pub fn mark_deployment_ready(&self, namespace: &str, name: &str, ready: u32) {
        if let Some(d) = self
            .deployments
            .lock()
            .unwrap()
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            d.ready = ready;
        }
    }

    /// Publish an object event to watchers (tests of watch triggers)
    pub fn emit_event(&self, event: ObjectEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for MockOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn create_pod(&self, req: PodRequest) -> Result<()> {
        let seq = self.pod_counter.fetch_add(1, Ordering::SeqCst);
        let base = self.backend_url.lock().unwrap().clone();
        let url = format!("{}?pod={}-{}", base, req.name, seq);
        let key = (req.namespace.clone(), req.name.clone());
        self.pods.lock().unwrap().insert(key, MockPod { req, url });
        Ok(())
    }

    async fn wait_pod_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<PodInfo> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let pods = self.pods.lock().unwrap();
                if let Some(pod) = pods.get(&(namespace.to_string(), name.to_string())) {
                    if *self.auto_ready.lock().unwrap() {
                        return Ok(PodInfo {
                            name: name.to_string(),
                            url: pod.url.clone(),
                        });
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::ColdStartTimeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        self.deleted_pods.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn ensure_deployment(&self, req: DeploymentRequest) -> Result<()> {
        let key = (req.namespace.clone(), req.name.clone());
        // Mock pods are instantly schedulable unless auto_ready is off
        let ready = if *self.auto_ready.lock().unwrap() {
            req.replicas
        } else {
            0
        };
        let mut deployments = self.deployments.lock().unwrap();
        match deployments.get_mut(&key) {
            Some(existing) => {
                existing.ready = ready;
                existing.req = req;
            }
            None => {
                deployments.insert(key, MockDeployment { req, ready });
            }
        }
        Ok(())
    }

    async fn ready_replicas(&self, namespace: &str, name: &str) -> Result<u32> {
        self.deployments
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .map(|d| d.ready)
            .ok_or_else(|| Error::NotFound(format!("deployment '{}/{}'", namespace, name)))
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: u32) -> Result<()> {
        let mut deployments = self.deployments.lock().unwrap();
        match deployments.get_mut(&(namespace.to_string(), name.to_string())) {
            Some(d) => {
                d.req.replicas = replicas;
                d.ready = replicas;
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "deployment '{}/{}'",
                namespace, name
            ))),
        }
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        self.deployments
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn ensure_service(
        &self,
        _namespace: &str,
        name: &str,
        _selector: BTreeMap<String, String>,
    ) -> Result<String> {
        let base = self.backend_url.lock().unwrap().clone();
        Ok(format!("{}?service={}", base, name))
    }

    async fn ensure_autoscaler(&self, req: AutoscalerRequest) -> Result<()> {
        let key = (req.namespace.clone(), req.name.clone());
        self.autoscalers.lock().unwrap().insert(key, req);
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<String> {
        let pods = self.pods.lock().unwrap();
        let matching: Vec<String> = pods
            .values()
            .filter(|p| {
                p.req.namespace == namespace
                    && selector
                        .iter()
                        .all(|(k, v)| p.req.labels.get(k) == Some(v))
            })
            .map(|p| format!("[{}] (no log output captured)", p.req.name))
            .collect();
        if matching.is_empty() {
            return Err(Error::NotFound(format!(
                "no pods in '{}' match {:?}",
                namespace, selector
            )));
        }
        Ok(matching.join("\n"))
    }

    fn watch_objects(
        &self,
        _namespace: &str,
        _kind: &str,
        _selector: &BTreeMap<String, String>,
    ) -> broadcast::Receiver<ObjectEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// K8sOrchestrator — real cluster backend (feature-gated)
// ---------------------------------------------------------------------------

#[cfg(feature = "kube")]
pub use k8s_impl::K8sOrchestrator;

#[cfg(feature = "kube")]
mod k8s_impl {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
    use k8s_openapi::api::core::v1::{Pod, Service};
    use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};

    const FIELD_MANAGER: &str = "funcgate";

    /// Orchestrator backed by a Kubernetes cluster
    pub struct K8sOrchestrator {
        client: kube::Client,
        /// Port the environment runtimes listen on
        runtime_port: u16,
        events: broadcast::Sender<ObjectEvent>,
    }

    impl K8sOrchestrator {
        pub async fn new(runtime_port: u16) -> Result<Self> {
            let client = kube::Client::try_default().await.map_err(|e| {
                Error::Config(format!("failed to create Kubernetes client: {}", e))
            })?;
            Ok(Self {
                client,
                runtime_port,
                events: broadcast::channel(256).0,
            })
        }

        fn deployment_manifest(&self, req: &DeploymentRequest) -> serde_json::Value {
            let labels = serde_json::to_value(&req.labels).unwrap_or_default();
            let mut container = serde_json::json!({
                "name": "runtime",
                "image": req.image,
            });
            if req.cpu_millis.is_some() || req.memory_mb.is_some() {
                let mut requests = serde_json::Map::new();
                if let Some(cpu) = req.cpu_millis {
                    requests.insert("cpu".into(), format!("{}m", cpu).into());
                }
                if let Some(mem) = req.memory_mb {
                    requests.insert("memory".into(), format!("{}Mi", mem).into());
                }
                container["resources"] = serde_json::json!({ "requests": requests });
            }

            let mut pod_spec = serde_json::json!({ "containers": [container] });
            if let Some(fetch_url) = &req.fetch_url {
                pod_spec["initContainers"] = serde_json::json!([{
                    "name": "fetcher",
                    "image": req.image,
                    "command": ["fetcher", fetch_url,
                        req.fetch_checksum.clone().unwrap_or_default(),
                        "/userfunc/deployarchive"],
                    "volumeMounts": [{ "name": "userfunc", "mountPath": "/userfunc" }],
                }]);
                pod_spec["volumes"] = serde_json::json!([
                    { "name": "userfunc", "emptyDir": {} }
                ]);
            }

            serde_json::json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": { "name": req.name, "labels": labels },
                "spec": {
                    "replicas": req.replicas,
                    "selector": { "matchLabels": labels },
                    "template": {
                        "metadata": { "labels": labels },
                        "spec": pod_spec,
                    }
                }
            })
        }
    }

    #[async_trait]
    impl Orchestrator for K8sOrchestrator {
        async fn create_pod(&self, req: PodRequest) -> Result<()> {
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), &req.namespace);
            let manifest = serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": req.name, "labels": req.labels },
                "spec": { "containers": [{ "name": "runtime", "image": req.image }] }
            });
            let pod: Pod = serde_json::from_value(manifest)?;
            pods.create(&PostParams::default(), &pod)
                .await
                .map_err(|e| Error::Transient(format!("pod create failed: {}", e)))?;
            Ok(())
        }

        async fn wait_pod_ready(
            &self,
            namespace: &str,
            name: &str,
            timeout: Duration,
        ) -> Result<PodInfo> {
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let pod = pods
                    .get(name)
                    .await
                    .map_err(|e| Error::Transient(format!("pod get failed: {}", e)))?;
                let ready = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conds| {
                        conds
                            .iter()
                            .any(|c| c.type_ == "Ready" && c.status == "True")
                    })
                    .unwrap_or(false);
                if ready {
                    let ip = pod
                        .status
                        .and_then(|s| s.pod_ip)
                        .ok_or_else(|| Error::Transient("ready pod has no IP".into()))?;
                    return Ok(PodInfo {
                        name: name.to_string(),
                        url: format!("http://{}:{}", ip, self.runtime_port),
                    });
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::ColdStartTimeout(timeout));
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }

        async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            pods.delete(name, &Default::default())
                .await
                .map_err(|e| Error::Transient(format!("pod delete failed: {}", e)))?;
            Ok(())
        }

        async fn ensure_deployment(&self, req: DeploymentRequest) -> Result<()> {
            let api: Api<Deployment> = Api::namespaced(self.client.clone(), &req.namespace);
            let manifest = self.deployment_manifest(&req);
            api.patch(
                &req.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Apply(&manifest),
            )
            .await
            .map_err(|e| Error::Transient(format!("deployment apply failed: {}", e)))?;
            Ok(())
        }

        async fn ready_replicas(&self, namespace: &str, name: &str) -> Result<u32> {
            let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
            let deploy = api
                .get(name)
                .await
                .map_err(|e| Error::Transient(format!("deployment get failed: {}", e)))?;
            Ok(deploy
                .status
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0) as u32)
        }

        async fn scale_deployment(
            &self,
            namespace: &str,
            name: &str,
            replicas: u32,
        ) -> Result<()> {
            let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
            let patch = serde_json::json!({ "spec": { "replicas": replicas } });
            api.patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| Error::Transient(format!("deployment scale failed: {}", e)))?;
            Ok(())
        }

        async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
            let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
            api.delete(name, &Default::default())
                .await
                .map_err(|e| Error::Transient(format!("deployment delete failed: {}", e)))?;
            Ok(())
        }

        async fn ensure_service(
            &self,
            namespace: &str,
            name: &str,
            selector: BTreeMap<String, String>,
        ) -> Result<String> {
            let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
            let manifest = serde_json::json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": { "name": name },
                "spec": {
                    "selector": selector,
                    "ports": [{ "port": 80, "targetPort": self.runtime_port }],
                }
            });
            api.patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Apply(&manifest),
            )
            .await
            .map_err(|e| Error::Transient(format!("service apply failed: {}", e)))?;
            Ok(format!("http://{}.{}.svc.cluster.local", name, namespace))
        }

        async fn ensure_autoscaler(&self, req: AutoscalerRequest) -> Result<()> {
            let api: Api<HorizontalPodAutoscaler> =
                Api::namespaced(self.client.clone(), &req.namespace);
            let manifest = serde_json::json!({
                "apiVersion": "autoscaling/v1",
                "kind": "HorizontalPodAutoscaler",
                "metadata": { "name": req.name },
                "spec": {
                    "scaleTargetRef": {
                        "apiVersion": "apps/v1",
                        "kind": "Deployment",
                        "name": req.name,
                    },
                    "minReplicas": req.min_replicas,
                    "maxReplicas": req.max_replicas,
                    "targetCPUUtilizationPercentage": req.target_cpu_percent,
                }
            });
            api.patch(
                &req.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Apply(&manifest),
            )
            .await
            .map_err(|e| Error::Transient(format!("autoscaler apply failed: {}", e)))?;
            Ok(())
        }

        async fn pod_logs(
            &self,
            namespace: &str,
            selector: &BTreeMap<String, String>,
        ) -> Result<String> {
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            let label_selector = selector
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            let listed = pods
                .list(&ListParams::default().labels(&label_selector))
                .await
                .map_err(|e| Error::Transient(format!("pod list failed: {}", e)))?;

            let mut out = String::new();
            for pod in listed.items {
                let Some(name) = pod.metadata.name else { continue };
                match pods.logs(&name, &Default::default()).await {
                    Ok(logs) => {
                        out.push_str(&format!("=== {} ===\n{}\n", name, logs));
                    }
                    Err(e) => {
                        out.push_str(&format!("=== {} === (logs unavailable: {})\n", name, e));
                    }
                }
            }
            Ok(out)
        }

        fn watch_objects(
            &self,
            _namespace: &str,
            _kind: &str,
            _selector: &BTreeMap<String, String>,
        ) -> broadcast::Receiver<ObjectEvent> {
            // Cluster watches are driven by a reflector task started at
            // wiring time; this shares its broadcast output.
            self.events.subscribe()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_request(name: &str) -> PodRequest {
        PodRequest {
            name: name.into(),
            namespace: "funcgate".into(),
            image: "python:3.11".into(),
            labels: BTreeMap::new(),
            fetch_url: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_wait_pod() {
        let orch = MockOrchestrator::new();
        orch.create_pod(pod_request("pod-1")).await.unwrap();
        let info = orch
            .wait_pod_ready("funcgate", "pod-1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(info.name, "pod-1");
        assert!(info.url.contains("pod-1"));
    }

    #[tokio::test]
    async fn test_wait_missing_pod_times_out() {
        let orch = MockOrchestrator::new();
        let result = orch
            .wait_pod_ready("funcgate", "ghost", Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(Error::ColdStartTimeout(_))));
    }

    #[tokio::test]
    async fn test_delete_pod_is_recorded() {
        let orch = MockOrchestrator::new();
        orch.create_pod(pod_request("pod-1")).await.unwrap();
        orch.delete_pod("funcgate", "pod-1").await.unwrap();
        assert_eq!(orch.pod_count(), 0);
        assert_eq!(orch.deleted_pods(), vec!["pod-1".to_string()]);
    }

    #[tokio::test]
    async fn test_ensure_deployment_is_idempotent() {
        let orch = MockOrchestrator::new();
        let req = DeploymentRequest {
            name: "fn-f1".into(),
            namespace: "funcgate".into(),
            image: "python:3.11".into(),
            replicas: 2,
            labels: BTreeMap::new(),
            fetch_url: None,
            fetch_checksum: None,
            cpu_millis: None,
            memory_mb: None,
        };
        orch.ensure_deployment(req.clone()).await.unwrap();
        orch.ensure_deployment(req).await.unwrap();
        assert_eq!(orch.deployment_state("funcgate", "fn-f1"), Some((2, 2)));
        assert_eq!(orch.ready_replicas("funcgate", "fn-f1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_scale_deployment() {
        let orch = MockOrchestrator::new();
        let req = DeploymentRequest {
            name: "fn-f1".into(),
            namespace: "funcgate".into(),
            image: "python:3.11".into(),
            replicas: 1,
            labels: BTreeMap::new(),
            fetch_url: None,
            fetch_checksum: None,
            cpu_millis: None,
            memory_mb: None,
        };
        orch.ensure_deployment(req).await.unwrap();
        orch.scale_deployment("funcgate", "fn-f1", 0).await.unwrap();
        assert_eq!(orch.ready_replicas("funcgate", "fn-f1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_service_url_is_stable() {
        let orch = MockOrchestrator::new();
        orch.set_backend_url("http://127.0.0.1:9999");
        let a = orch
            .ensure_service("funcgate", "fn-f1", BTreeMap::new())
            .await
            .unwrap();
        let b = orch
            .ensure_service("funcgate", "fn-f1", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_watch_objects_receives_emitted_events() {
        let orch = MockOrchestrator::new();
        let mut rx = orch.watch_objects("default", "Pod", &BTreeMap::new());
        orch.emit_event(ObjectEvent {
            event_type: "added".into(),
            kind: "Pod".into(),
            namespace: "default".into(),
            name: "p".into(),
            labels: BTreeMap::new(),
            payload: serde_json::Value::Null,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "added");
        assert_eq!(event.kind, "Pod");
    }

    #[tokio::test]
    async fn test_pod_logs_selector() {
        let orch = MockOrchestrator::new();
        let mut req = pod_request("pod-1");
        req.labels.insert("functionName".into(), "f1".into());
        orch.create_pod(req).await.unwrap();

        let mut selector = BTreeMap::new();
        selector.insert("functionName".to_string(), "f1".to_string());
        let logs = orch.pod_logs("funcgate", &selector).await.unwrap();
        assert!(logs.contains("pod-1"));

        selector.insert("functionName".to_string(), "other".to_string());
        assert!(orch.pod_logs("funcgate", &selector).await.is_err());
    }
}
