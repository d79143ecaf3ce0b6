//! Trigger set — owns the live HTTP trigger list and republishes the mux
//!
//! Every mutation rebuilds the mux from the full trigger list and swaps it
//! in atomically. A reader that grabbed the previous mux keeps serving with
//! the complete pre-swap ruleset.

use crate::router::mux::Mux;
use crate::store::{Kind, Object, ObjectStore, WatchEvent};
use crate::types::HttpTrigger;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub struct TriggerSet {
    triggers: RwLock<HashMap<(String, String), HttpTrigger>>,
    mux: RwLock<Arc<Mux>>,
}

impl TriggerSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            triggers: RwLock::new(HashMap::new()),
            mux: RwLock::new(Arc::new(Mux::empty())),
        })
    }

    /// Current mux; callers hold the Arc for the whole request
    pub fn mux(&self) -> Arc<Mux> {
        self.mux.read().unwrap().clone()
    }

    pub fn upsert(&self, trigger: HttpTrigger) {
        let key = (
            trigger.metadata.namespace.clone(),
            trigger.metadata.name.clone(),
        );
        let mut triggers = self.triggers.write().unwrap();
        triggers.insert(key, trigger);
        self.republish(&triggers);
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        let mut triggers = self.triggers.write().unwrap();
        if triggers
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some()
        {
            self.republish(&triggers);
        }
    }

    /// Replace the whole set (watch resync)
    pub fn replace_all(&self, list: Vec<HttpTrigger>) {
        let mut triggers = self.triggers.write().unwrap();
        triggers.clear();
        for trigger in list {
            let key = (
                trigger.metadata.namespace.clone(),
                trigger.metadata.name.clone(),
            );
            triggers.insert(key, trigger);
        }
        self.republish(&triggers);
    }

    fn republish(&self, triggers: &HashMap<(String, String), HttpTrigger>) {
        let mux = Mux::build(triggers.values().cloned().collect());
        *self.mux.write().unwrap() = Arc::new(mux);
    }

    pub fn len(&self) -> usize {
        self.triggers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.read().unwrap().is_empty()
    }
}

/// Keep a trigger set in sync with the store's HTTP trigger watch stream.
/// A lagged watch falls back to a full relist.
pub fn start_sync(
    set: Arc<TriggerSet>,
    store: Arc<dyn ObjectStore>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = store.watch(Kind::HttpTrigger);

        if let Ok(objects) = store.list(Kind::HttpTrigger, None).await {
            set.replace_all(
                objects
                    .into_iter()
                    .filter_map(|o| match o {
                        Object::HttpTrigger(t) => Some(t),
                        _ => None,
                    })
                    .collect(),
            );
        }

        loop {
            match events.recv().await {
                Ok(WatchEvent::Added(Object::HttpTrigger(t)))
                | Ok(WatchEvent::Modified(Object::HttpTrigger(t))) => {
                    tracing::debug!(
                        trigger = t.metadata.name,
                        url = t.spec.relative_url,
                        "HTTP trigger installed"
                    );
                    set.upsert(t);
                }
                Ok(WatchEvent::Deleted(Object::HttpTrigger(t))) => {
                    tracing::debug!(trigger = t.metadata.name, "HTTP trigger removed");
                    set.remove(&t.metadata.namespace, &t.metadata.name);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Trigger watch lagged; relisting");
                    if let Ok(objects) = store.list(Kind::HttpTrigger, None).await {
                        set.replace_all(
                            objects
                                .into_iter()
                                .filter_map(|o| match o {
                                    Object::HttpTrigger(t) => Some(t),
                                    _ => None,
                                })
                                .collect(),
                        );
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
