//! Cron-driven invocations.
//!
//! One task per time trigger sleeps until the next cron occurrence and
//! fires the referenced function with an empty body. Trigger updates
//! reinstall the job; deletes abort it.

use crate::error::Result;
use crate::store::{Kind, Object, ObjectStore, WatchEvent};
use crate::triggers::FunctionInvoker;
use crate::types::TimeTrigger;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Name of the firing trigger, stamped on every timed invocation
pub const HEADER_TIMER_NAME: &str = "X-Fission-Timer-Name";

pub struct TimerController {
    store: Arc<dyn ObjectStore>,
    invoker: Arc<FunctionInvoker>,
    jobs: Mutex<HashMap<(String, String), tokio::task::JoinHandle<()>>>,
}

impl TimerController {
    pub fn new(store: Arc<dyn ObjectStore>, invoker: Arc<FunctionInvoker>) -> Arc<Self> {
        Arc::new(Self {
            store,
            invoker,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// (Re)install the job for a trigger. An existing job for the same
    /// trigger is aborted first so schedule edits take effect immediately.
    pub fn install(&self, trigger: TimeTrigger) -> Result<()> {
        let cron = croner::Cron::new(&trigger.spec.cron)
            .with_seconds_optional()
            .parse()
            .map_err(|e| {
                crate::error::Error::Invalid(format!(
                    "trigger '{}': bad cron expression '{}': {}",
                    trigger.metadata.name, trigger.spec.cron, e
                ))
            })?;

        let key = (
            trigger.metadata.namespace.clone(),
            trigger.metadata.name.clone(),
        );
        let invoker = self.invoker.clone();
        let handle = tokio::spawn(async move {
            let namespace = trigger.metadata.namespace.clone();
            let name = trigger.metadata.name.clone();
            loop {
                let now = Utc::now();
                let Ok(next) = cron.find_next_occurrence(&now, false) else {
                    tracing::warn!(trigger = name, "Cron schedule has no next occurrence");
                    break;
                };
                let wait = (next - now)
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(wait).await;

                let result = invoker
                    .invoke(
                        &namespace,
                        &trigger.spec.function_reference,
                        Bytes::new(),
                        "application/json",
                        &[(HEADER_TIMER_NAME, name.clone())],
                    )
                    .await;
                match result {
                    Ok(outcome) if outcome.is_success() => {
                        tracing::debug!(trigger = name, status = outcome.status, "Timer fired");
                    }
                    Ok(outcome) => {
                        tracing::warn!(
                            trigger = name,
                            status = outcome.status,
                            "Timed invocation returned an error status"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(trigger = name, error = %e, "Timed invocation failed");
                    }
                }
            }
        });

        if let Some(previous) = self.jobs.lock().unwrap().insert(key, handle) {
            previous.abort();
        }
        Ok(())
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        if let Some(handle) = self
            .jobs
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
        {
            handle.abort();
        }
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

/// Sync jobs with the time-trigger stream
pub fn start_timer_controller(controller: Arc<TimerController>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = controller.store.watch(Kind::TimeTrigger);

        if let Ok(objects) = controller.store.list(Kind::TimeTrigger, None).await {
            for object in objects {
                if let Object::TimeTrigger(trigger) = object {
                    if let Err(e) = controller.install(trigger) {
                        tracing::warn!(error = %e, "Skipping unschedulable time trigger");
                    }
                }
            }
        }

        loop {
            match events.recv().await {
                Ok(WatchEvent::Added(Object::TimeTrigger(trigger)))
                | Ok(WatchEvent::Modified(Object::TimeTrigger(trigger))) => {
                    if let Err(e) = controller.install(trigger) {
                        tracing::warn!(error = %e, "Skipping unschedulable time trigger");
                    }
                }
                Ok(WatchEvent::Deleted(Object::TimeTrigger(trigger))) => {
                    controller.remove(&trigger.metadata.namespace, &trigger.metadata.name);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Time-trigger watch lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{FunctionReference, Metadata, TimeTriggerSpec};
    use std::time::Duration;

    struct Captured {
        path: String,
        timer_header: Option<String>,
    }

    async fn spawn_capture_server() -> (String, Arc<Mutex<Vec<Captured>>>) {
        use http_body_util::Full;
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
                            service_fn(move |req| {
                                let sink = sink.clone();
                                async move {
                                    sink.lock().unwrap().push(Captured {
                                        path: req.uri().path().to_string(),
                                        timer_header: req
                                            .headers()
                                            .get(HEADER_TIMER_NAME)
                                            .and_then(|v| v.to_str().ok())
                                            .map(str::to_string),
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

    fn every_second_trigger(name: &str) -> TimeTrigger {
        TimeTrigger {
            metadata: Metadata::new(name, "default"),
            spec: TimeTriggerSpec {
                cron: "* * * * * *".into(),
                function_reference: FunctionReference::name("tick"),
            },
        }
    }

    #[tokio::test]
    async fn test_installed_job_fires_with_trigger_header() {
        let (url, captured) = spawn_capture_server().await;
        let controller = TimerController::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FunctionInvoker::new(url)),
        );

        controller.install(every_second_trigger("everysec")).unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let seen = captured.lock().unwrap();
        assert!(seen.len() >= 2, "expected at least 2 firings, got {}", seen.len());
        assert_eq!(seen[0].path, "/invoke/default/tick");
        assert_eq!(seen[0].timer_header.as_deref(), Some("everysec"));
    }

    #[tokio::test]
    async fn test_remove_aborts_the_job() {
        let (url, captured) = spawn_capture_server().await;
        let controller = TimerController::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FunctionInvoker::new(url)),
        );

        controller.install(every_second_trigger("t")).unwrap();
        assert_eq!(controller.job_count(), 1);
        controller.remove("default", "t");
        assert_eq!(controller.job_count(), 0);

        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(captured.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_cron_is_rejected() {
        let controller = TimerController::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FunctionInvoker::new("http://127.0.0.1:1")),
        );
        let mut trigger = every_second_trigger("bad");
        trigger.spec.cron = "not a schedule".into();
        assert!(controller.install(trigger).is_err());
    }

    #[tokio::test]
    async fn test_watch_sync_installs_and_removes() {
        let (url, _captured) = spawn_capture_server().await;
        let store = Arc::new(MemoryStore::new());
        let controller = TimerController::new(store.clone(), Arc::new(FunctionInvoker::new(url)));
        let _sync = start_timer_controller(controller.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let created = store
            .create(Object::TimeTrigger(every_second_trigger("synced")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.job_count(), 1);

        store
            .delete(Kind::TimeTrigger, "default", "synced")
            .await
            .unwrap();
        let _ = created;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.job_count(), 0);
    }
}
