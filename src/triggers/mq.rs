//! Message-queue subscriptions.
//!
//! One subscriber task per trigger consumes its topic, invokes the
//! referenced function, retries failed deliveries up to `maxRetries`, then
//! forwards successes to the response topic and exhausted messages to the
//! error topic.

use crate::error::Result;
use crate::store::{Kind, Object, ObjectStore, WatchEvent};
use crate::triggers::FunctionInvoker;
use crate::types::MessageQueueTrigger;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub const HEADER_MQ_TOPIC: &str = "X-Fission-MQTrigger-Topic";
pub const HEADER_MQ_RESP_TOPIC: &str = "X-Fission-MQTrigger-RespTopic";
pub const HEADER_MQ_ERROR_TOPIC: &str = "X-Fission-MQTrigger-ErrorTopic";
pub const HEADER_MQ_RETRY_COUNT: &str = "X-Fission-MQTrigger-RetryCount";

/// Broker port. Topics are plain strings; delivery is at-most-once from the
/// subscriber's point of view (a slow consumer can lag).
#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Bytes>;

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()>;
}

/// In-process broker for tests and single-process mode
pub struct MemoryQueue {
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
        })
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Bytes> {
        self.sender(topic).subscribe()
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<()> {
        // No subscribers is fine; broadcast send only errs on zero receivers
        let _ = self.sender(topic).send(data);
        Ok(())
    }
}

pub struct MqController {
    store: Arc<dyn ObjectStore>,
    queue: Arc<dyn MessageQueue>,
    invoker: Arc<FunctionInvoker>,
    subscriptions: Mutex<HashMap<(String, String), tokio::task::JoinHandle<()>>>,
}

impl MqController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn MessageQueue>,
        invoker: Arc<FunctionInvoker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            invoker,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    /// (Re)subscribe for a trigger, replacing any existing subscription
    pub fn install(&self, trigger: MessageQueueTrigger) {
        let key = (
            trigger.metadata.namespace.clone(),
            trigger.metadata.name.clone(),
        );
        let mut rx = self.queue.subscribe(&trigger.spec.topic);
        let queue = self.queue.clone();
        let invoker = self.invoker.clone();

        let handle = tokio::spawn(async move {
            let name = trigger.metadata.name.clone();
            loop {
                let message = match rx.recv().await {
                    Ok(m) => m,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(trigger = name, missed, "Queue subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                deliver(&trigger, queue.as_ref(), &invoker, message).await;
            }
        });

        if let Some(previous) = self.subscriptions.lock().unwrap().insert(key, handle) {
            previous.abort();
        }
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        if let Some(handle) = self
            .subscriptions
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
        {
            handle.abort();
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }
}

/// One message end to end: invoke, retry up to `maxRetries`, then route the
/// result to the response or error topic.
async fn deliver(
    trigger: &MessageQueueTrigger,
    queue: &dyn MessageQueue,
    invoker: &FunctionInvoker,
    message: Bytes,
) {
    let spec = &trigger.spec;
    for attempt in 0..=spec.max_retries {
        let mut headers = vec![
            (HEADER_MQ_TOPIC, spec.topic.clone()),
            (HEADER_MQ_RETRY_COUNT, attempt.to_string()),
        ];
        if let Some(resp) = &spec.response_topic {
            headers.push((HEADER_MQ_RESP_TOPIC, resp.clone()));
        }
        if let Some(err) = &spec.error_topic {
            headers.push((HEADER_MQ_ERROR_TOPIC, err.clone()));
        }

        match invoker
            .invoke(
                &trigger.metadata.namespace,
                &spec.function_reference,
                message.clone(),
                &spec.content_type,
                &headers,
            )
            .await
        {
            Ok(outcome) if outcome.is_success() => {
                if let Some(resp) = &spec.response_topic {
                    if let Err(e) = queue.publish(resp, outcome.body).await {
                        tracing::warn!(
                            trigger = trigger.metadata.name,
                            topic = resp,
                            error = %e,
                            "Failed to publish function response"
                        );
                    }
                }
                return;
            }
            Ok(outcome) => {
                tracing::warn!(
                    trigger = trigger.metadata.name,
                    status = outcome.status,
                    attempt,
                    "Queued invocation returned an error status"
                );
            }
            Err(e) => {
                tracing::warn!(
                    trigger = trigger.metadata.name,
                    error = %e,
                    attempt,
                    "Queued invocation failed"
                );
            }
        }
    }

    // Retries exhausted; dead-letter the original message
    if let Some(err_topic) = &spec.error_topic {
        if let Err(e) = queue.publish(err_topic, message).await {
            tracing::warn!(
                trigger = trigger.metadata.name,
                topic = err_topic,
                error = %e,
                "Failed to publish to error topic"
            );
        }
    } else {
        tracing::error!(
            trigger = trigger.metadata.name,
            topic = spec.topic,
            "Dropping message after exhausting retries (no error topic)"
        );
    }
}

/// Sync subscriptions with the message-queue-trigger stream
pub fn start_mq_controller(controller: Arc<MqController>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = controller.store.watch(Kind::MessageQueueTrigger);

        if let Ok(objects) = controller
            .store
            .list(Kind::MessageQueueTrigger, None)
            .await
        {
            for object in objects {
                if let Object::MessageQueueTrigger(trigger) = object {
                    controller.install(trigger);
                }
            }
        }

        loop {
            match events.recv().await {
                Ok(WatchEvent::Added(Object::MessageQueueTrigger(trigger)))
                | Ok(WatchEvent::Modified(Object::MessageQueueTrigger(trigger))) => {
                    controller.install(trigger);
                }
                Ok(WatchEvent::Deleted(Object::MessageQueueTrigger(trigger))) => {
                    controller.remove(&trigger.metadata.namespace, &trigger.metadata.name);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Message-queue-trigger watch lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{FunctionReference, MessageQueueTriggerSpec, Metadata};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    async fn spawn_function_server(status: u16) -> (String, Arc<AtomicU32>) {
        use http_body_util::Full;
        use hyper::service::service_fn;
        use hyper_util::rt::TokioIo;

        let hits = Arc::new(AtomicU32::new(0));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let counter = counter.clone();
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(
                            TokioIo::new(stream),
                            service_fn(move |_req| {
                                counter.fetch_add(1, Ordering::SeqCst);
                                async move {
                                    Ok::<_, hyper::Error>(
                                        hyper::Response::builder()
                                            .status(status)
                                            .body(Full::new(Bytes::from("handled")))
                                            .unwrap(),
                                    )
                                }
                            }),
                        )
                        .await;
                });
            }
        });
        (format!("http://{}", addr), hits)
    }

    fn trigger(topic: &str, resp: Option<&str>, err: Option<&str>, retries: u32) -> MessageQueueTrigger {
        MessageQueueTrigger {
            metadata: Metadata::new("mqt", "default"),
            spec: MessageQueueTriggerSpec {
                queue_type: "memory".into(),
                topic: topic.into(),
                response_topic: resp.map(str::to_string),
                error_topic: err.map(str::to_string),
                max_retries: retries,
                content_type: "application/json".into(),
                function_reference: FunctionReference::name("consumer"),
            },
        }
    }

    #[tokio::test]
    async fn test_memory_queue_delivers_to_subscribers() {
        let queue = MemoryQueue::new();
        let mut rx = queue.subscribe("orders");
        queue
            .publish("orders", Bytes::from("o-1"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from("o-1"));
    }

    #[tokio::test]
    async fn test_success_forwards_response_topic() {
        let (url, hits) = spawn_function_server(200).await;
        let queue = MemoryQueue::new();
        let controller = MqController::new(
            Arc::new(MemoryStore::new()),
            queue.clone(),
            Arc::new(FunctionInvoker::new(url)),
        );

        let mut responses = queue.subscribe("orders-resp");
        controller.install(trigger("orders", Some("orders-resp"), None, 0));
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue
            .publish("orders", Bytes::from("{\"id\":1}"))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), responses.recv())
            .await
            .expect("no response forwarded")
            .unwrap();
        assert_eq!(reply, Bytes::from("handled"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_original_message() {
        let (url, hits) = spawn_function_server(500).await;
        let queue = MemoryQueue::new();
        let controller = MqController::new(
            Arc::new(MemoryStore::new()),
            queue.clone(),
            Arc::new(FunctionInvoker::new(url)),
        );

        let mut errors = queue.subscribe("orders-err");
        controller.install(trigger("orders", None, Some("orders-err"), 2));
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue
            .publish("orders", Bytes::from("poison"))
            .await
            .unwrap();

        let dead = tokio::time::timeout(Duration::from_secs(2), errors.recv())
            .await
            .expect("no dead letter")
            .unwrap();
        assert_eq!(dead, Bytes::from("poison"));
        // Initial attempt plus two retries
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_watch_sync_subscribes_and_unsubscribes() {
        let (url, hits) = spawn_function_server(200).await;
        let store = Arc::new(MemoryStore::new());
        let queue = MemoryQueue::new();
        let controller = MqController::new(
            store.clone(),
            queue.clone(),
            Arc::new(FunctionInvoker::new(url)),
        );
        let _sync = start_mq_controller(controller.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        store
            .create(Object::MessageQueueTrigger(trigger("jobs", None, None, 0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.subscription_count(), 1);

        queue.publish("jobs", Bytes::from("j-1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        store
            .delete(Kind::MessageQueueTrigger, "default", "mqt")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(controller.subscription_count(), 0);
    }
}
