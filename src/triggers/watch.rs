//! Orchestrator object watches.
//!
//! One task per watch trigger filters the orchestrator's event stream by
//! namespace, kind, and label selector, and posts each matching event as
//! JSON to the referenced function.

use crate::orchestrator::{ObjectEvent, Orchestrator};
use crate::store::{Kind, Object, ObjectStore, WatchEvent};
use crate::triggers::FunctionInvoker;
use crate::types::WatchTrigger;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub const HEADER_WATCH_KIND: &str = "X-Fission-Watch-Kind";
pub const HEADER_WATCH_NAMESPACE: &str = "X-Fission-Watch-Namespace";
pub const HEADER_WATCH_EVENT_TYPE: &str = "X-Fission-Watch-Event-Type";

pub struct WatchController {
    store: Arc<dyn ObjectStore>,
    orchestrator: Arc<dyn Orchestrator>,
    invoker: Arc<FunctionInvoker>,
    watches: Mutex<HashMap<(String, String), tokio::task::JoinHandle<()>>>,
}

impl WatchController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        orchestrator: Arc<dyn Orchestrator>,
        invoker: Arc<FunctionInvoker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            orchestrator,
            invoker,
            watches: Mutex::new(HashMap::new()),
        })
    }

    /// (Re)start the watch task for a trigger
    pub fn install(&self, trigger: WatchTrigger) {
        let key = (
            trigger.metadata.namespace.clone(),
            trigger.metadata.name.clone(),
        );
        let mut events = self.orchestrator.watch_objects(
            &trigger.spec.watch_namespace,
            &trigger.spec.kind,
            &trigger.spec.label_selector,
        );
        let invoker = self.invoker.clone();

        let handle = tokio::spawn(async move {
            let name = trigger.metadata.name.clone();
            loop {
                let event = match events.recv().await {
                    Ok(e) => e,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(trigger = name, missed, "Object watch lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !matches(&trigger, &event) {
                    continue;
                }

                let body = match serde_json::to_vec(&event) {
                    Ok(b) => Bytes::from(b),
                    Err(e) => {
                        tracing::warn!(trigger = name, error = %e, "Unencodable object event");
                        continue;
                    }
                };
                let headers = [
                    (HEADER_WATCH_KIND, event.kind.clone()),
                    (HEADER_WATCH_NAMESPACE, event.namespace.clone()),
                    (HEADER_WATCH_EVENT_TYPE, event.event_type.clone()),
                ];
                let result = invoker
                    .invoke(
                        &trigger.metadata.namespace,
                        &trigger.spec.function_reference,
                        body,
                        "application/json",
                        &headers,
                    )
                    .await;
                if let Err(e) = result {
                    tracing::warn!(trigger = name, error = %e, "Watch invocation failed");
                }
            }
        });

        if let Some(previous) = self.watches.lock().unwrap().insert(key, handle) {
            previous.abort();
        }
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        if let Some(handle) = self
            .watches
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
        {
            handle.abort();
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watches.lock().unwrap().len()
    }
}

/// Orchestrator backends may deliver a wider stream than requested, so the
/// trigger's filter is applied here as well.
fn matches(trigger: &WatchTrigger, event: &ObjectEvent) -> bool {
    let spec = &trigger.spec;
    if !event.kind.eq_ignore_ascii_case(&spec.kind) {
        return false;
    }
    if event.namespace != spec.watch_namespace {
        return false;
    }
    spec.label_selector
        .iter()
        .all(|(k, v)| event.labels.get(k) == Some(v))
}

/// Sync watch tasks with the watch-trigger stream
pub fn start_watch_controller(controller: Arc<WatchController>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = controller.store.watch(Kind::WatchTrigger);

        if let Ok(objects) = controller.store.list(Kind::WatchTrigger, None).await {
            for object in objects {
                if let Object::WatchTrigger(trigger) = object {
                    controller.install(trigger);
                }
            }
        }

        loop {
            match events.recv().await {
                Ok(WatchEvent::Added(Object::WatchTrigger(trigger)))
                | Ok(WatchEvent::Modified(Object::WatchTrigger(trigger))) => {
                    controller.install(trigger);
                }
                Ok(WatchEvent::Deleted(Object::WatchTrigger(trigger))) => {
                    controller.remove(&trigger.metadata.namespace, &trigger.metadata.name);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Watch-trigger watch lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::MockOrchestrator;
    use crate::store::MemoryStore;
    use crate::types::{FunctionReference, Metadata, WatchTriggerSpec};
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Captured {
        body: Bytes,
        kind: Option<String>,
        event_type: Option<String>,
    }

    async fn spawn_capture_server() -> (String, Arc<Mutex<Vec<Captured>>>) {
        use http_body_util::{BodyExt, Full};
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;

        let captured: Arc<Mutex<Vec<Captured>>> = Arc::new(Mutex::new(Vec::new()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sink = captured.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let sink = sink.clone();
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(
                            TokioIo::new(stream),
                            service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                                let sink = sink.clone();
                                async move {
                                    let kind = req
                                        .headers()
                                        .get(HEADER_WATCH_KIND)
                                        .and_then(|v| v.to_str().ok())
                                        .map(str::to_string);
                                    let event_type = req
                                        .headers()
                                        .get(HEADER_WATCH_EVENT_TYPE)
                                        .and_then(|v| v.to_str().ok())
                                        .map(str::to_string);
                                    let body =
                                        req.into_body().collect().await.unwrap().to_bytes();
                                    sink.lock().unwrap().push(Captured {
                                        body,
                                        kind,
                                        event_type,
                                    });
                                    Ok::<_, hyper::Error>(
                                        hyper::Response::new(Full::new(Bytes::from("ok"))),
                                    )
                                }
                            }),
                        )
                        .await;
                });
            }
        });
        (format!("http://{}", addr), captured)
    }

    fn pod_watch_trigger(selector: BTreeMap<String, String>) -> WatchTrigger {
        WatchTrigger {
            metadata: Metadata::new("podwatch", "default"),
            spec: WatchTriggerSpec {
                watch_namespace: "apps".into(),
                kind: "Pod".into(),
                label_selector: selector,
                function_reference: FunctionReference::name("on-pod"),
            },
        }
    }

    fn pod_event(name: &str, labels: BTreeMap<String, String>) -> ObjectEvent {
        ObjectEvent {
            event_type: "added".into(),
            kind: "Pod".into(),
            namespace: "apps".into(),
            name: name.into(),
            labels,
            payload: serde_json::json!({ "name": name }),
        }
    }

    #[tokio::test]
    async fn test_matching_event_reaches_the_function() {
        let (url, captured) = spawn_capture_server().await;
        let orch = Arc::new(MockOrchestrator::new());
        let controller = WatchController::new(
            Arc::new(MemoryStore::new()),
            orch.clone(),
            Arc::new(FunctionInvoker::new(url)),
        );
        controller.install(pod_watch_trigger(BTreeMap::new()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        orch.emit_event(pod_event("web-1", BTreeMap::new()));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = captured.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind.as_deref(), Some("Pod"));
        assert_eq!(seen[0].event_type.as_deref(), Some("added"));
        let decoded: ObjectEvent = serde_json::from_slice(&seen[0].body).unwrap();
        assert_eq!(decoded.name, "web-1");
    }

    #[tokio::test]
    async fn test_selector_and_kind_filtering() {
        let (url, captured) = spawn_capture_server().await;
        let orch = Arc::new(MockOrchestrator::new());
        let controller = WatchController::new(
            Arc::new(MemoryStore::new()),
            orch.clone(),
            Arc::new(FunctionInvoker::new(url)),
        );
        let selector = BTreeMap::from([("app".to_string(), "web".to_string())]);
        controller.install(pod_watch_trigger(selector.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Wrong kind, wrong labels, then a match
        let mut wrong_kind = pod_event("cm-1", selector.clone());
        wrong_kind.kind = "ConfigMap".into();
        orch.emit_event(wrong_kind);
        orch.emit_event(pod_event(
            "db-1",
            BTreeMap::from([("app".to_string(), "db".to_string())]),
        ));
        orch.emit_event(pod_event("web-1", selector));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = captured.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let decoded: ObjectEvent = serde_json::from_slice(&seen[0].body).unwrap();
        assert_eq!(decoded.name, "web-1");
    }

    #[tokio::test]
    async fn test_watch_sync_installs_and_removes() {
        let (url, _captured) = spawn_capture_server().await;
        let store = Arc::new(MemoryStore::new());
        let controller = WatchController::new(
            store.clone(),
            Arc::new(MockOrchestrator::new()),
            Arc::new(FunctionInvoker::new(url)),
        );
        let _sync = start_watch_controller(controller.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        store
            .create(Object::WatchTrigger(pod_watch_trigger(BTreeMap::new())))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.watch_count(), 1);

        store
            .delete(Kind::WatchTrigger, "default", "podwatch")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.watch_count(), 0);
    }
}
