//! Declarative object store port
//!
//! The store owns all user-visible entities; the core holds read-only copies
//! obtained via get/list/watch. Updates use optimistic concurrency on the
//! resource version; the losing caller re-reads and retries.
//!
//! `MemoryStore` is the in-process implementation used by tests and
//! single-node deployments.

use crate::error::{Error, Result};
use crate::types::{
    Environment, Function, HttpTrigger, Metadata, MessageQueueTrigger, Package, TimeTrigger,
    WatchTrigger,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;

/// Entity kinds stored in the declarative store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Kind {
    Function,
    Environment,
    Package,
    HttpTrigger,
    TimeTrigger,
    MessageQueueTrigger,
    WatchTrigger,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Function => "Function",
            Self::Environment => "Environment",
            Self::Package => "Package",
            Self::HttpTrigger => "HttpTrigger",
            Self::TimeTrigger => "TimeTrigger",
            Self::MessageQueueTrigger => "MessageQueueTrigger",
            Self::WatchTrigger => "WatchTrigger",
        };
        write!(f, "{}", s)
    }
}

/// A stored entity, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Object {
    Function(Function),
    Environment(Environment),
    Package(Package),
    HttpTrigger(HttpTrigger),
    TimeTrigger(TimeTrigger),
    MessageQueueTrigger(MessageQueueTrigger),
    WatchTrigger(WatchTrigger),
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Function(_) => Kind::Function,
            Self::Environment(_) => Kind::Environment,
            Self::Package(_) => Kind::Package,
            Self::HttpTrigger(_) => Kind::HttpTrigger,
            Self::TimeTrigger(_) => Kind::TimeTrigger,
            Self::MessageQueueTrigger(_) => Kind::MessageQueueTrigger,
            Self::WatchTrigger(_) => Kind::WatchTrigger,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Self::Function(o) => &o.metadata,
            Self::Environment(o) => &o.metadata,
            Self::Package(o) => &o.metadata,
            Self::HttpTrigger(o) => &o.metadata,
            Self::TimeTrigger(o) => &o.metadata,
            Self::MessageQueueTrigger(o) => &o.metadata,
            Self::WatchTrigger(o) => &o.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        match self {
            Self::Function(o) => &mut o.metadata,
            Self::Environment(o) => &mut o.metadata,
            Self::Package(o) => &mut o.metadata,
            Self::HttpTrigger(o) => &mut o.metadata,
            Self::TimeTrigger(o) => &mut o.metadata,
            Self::MessageQueueTrigger(o) => &mut o.metadata,
            Self::WatchTrigger(o) => &mut o.metadata,
        }
    }

    /// Run the entity's own spec validation
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Function(o) => o.validate(),
            Self::Environment(_) => Ok(()),
            Self::Package(o) => {
                if let Some(a) = &o.spec.source {
                    a.validate()?;
                }
                if let Some(a) = &o.spec.deployment {
                    a.validate()?;
                }
                Ok(())
            }
            Self::HttpTrigger(o) => o.validate(),
            Self::TimeTrigger(o) => o.validate(),
            Self::MessageQueueTrigger(o) => o.validate(),
            Self::WatchTrigger(o) => o.validate(),
        }
    }
}

/// Change event yielded by a watch
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
}

impl WatchEvent {
    pub fn object(&self) -> &Object {
        match self {
            Self::Added(o) | Self::Modified(o) | Self::Deleted(o) => o,
        }
    }
}

/// Typed CRUD + watch over the declarative store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create an entity; the store assigns uid and resource version.
    /// Returns the stored copy.
    async fn create(&self, obj: Object) -> Result<Object>;

    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> Result<Object>;

    /// Update with optimistic concurrency: the passed object's resource
    /// version must match the stored one, or `Error::Conflict` is returned.
    async fn update(&self, obj: Object) -> Result<Object>;

    async fn delete(&self, kind: Kind, namespace: &str, name: &str) -> Result<()>;

    /// List objects of one kind; `None` spans all namespaces
    async fn list(&self, kind: Kind, namespace: Option<&str>) -> Result<Vec<Object>>;

    /// Subscribe to change events for one kind, across all namespaces.
    /// Events are delivered in per-namespace watch order.
    fn watch(&self, kind: Kind) -> broadcast::Receiver<WatchEvent>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

const WATCH_CHANNEL_CAPACITY: usize = 256;

/// In-memory object store with broadcast-based watch
pub struct MemoryStore {
    objects: RwLock<HashMap<(Kind, String, String), Object>>,
    counter: AtomicU64,
    watchers: RwLock<HashMap<Kind, broadcast::Sender<WatchEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(1),
            watchers: RwLock::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    fn publish(&self, event: WatchEvent) {
        let kind = event.object().kind();
        let watchers = self.watchers.read().unwrap();
        if let Some(tx) = watchers.get(&kind) {
            // A send error just means no live receivers
            let _ = tx.send(event);
        }
    }

    fn key(obj: &Object) -> (Kind, String, String) {
        (
            obj.kind(),
            obj.metadata().namespace.clone(),
            obj.metadata().name.clone(),
        )
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create(&self, mut obj: Object) -> Result<Object> {
        obj.validate()?;
        let key = Self::key(&obj);
        let mut objects = self.objects.write().unwrap();
        if objects.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "{} '{}/{}' already exists",
                key.0, key.1, key.2
            )));
        }

        let id = self.next_id();
        let meta = obj.metadata_mut();
        meta.uid = format!("uid-{:08x}", id);
        meta.resource_version = id.to_string();

        objects.insert(key, obj.clone());
        drop(objects);

        self.publish(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn get(&self, kind: Kind, namespace: &str, name: &str) -> Result<Object> {
        let objects = self.objects.read().unwrap();
        objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{} '{}/{}'", kind, namespace, name)))
    }

    async fn update(&self, mut obj: Object) -> Result<Object> {
        obj.validate()?;
        let key = Self::key(&obj);
        let mut objects = self.objects.write().unwrap();
        let existing = objects.get(&key).ok_or_else(|| {
            Error::NotFound(format!("{} '{}/{}'", key.0, key.1, key.2))
        })?;

        if existing.metadata().resource_version != obj.metadata().resource_version {
            return Err(Error::Conflict(format!(
                "{} '{}/{}': resource version {} is stale (current {})",
                key.0,
                key.1,
                key.2,
                obj.metadata().resource_version,
                existing.metadata().resource_version
            )));
        }

        let id = self.next_id();
        let uid = existing.metadata().uid.clone();
        let meta = obj.metadata_mut();
        meta.uid = uid;
        meta.resource_version = id.to_string();

        objects.insert(key, obj.clone());
        drop(objects);

        self.publish(WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }

    async fn delete(&self, kind: Kind, namespace: &str, name: &str) -> Result<()> {
        let key = (kind, namespace.to_string(), name.to_string());
        let removed = self.objects.write().unwrap().remove(&key);
        match removed {
            Some(obj) => {
                self.publish(WatchEvent::Deleted(obj));
                Ok(())
            }
            None => Err(Error::NotFound(format!("{} '{}/{}'", kind, namespace, name))),
        }
    }

    async fn list(&self, kind: Kind, namespace: Option<&str>) -> Result<Vec<Object>> {
        let objects = self.objects.read().unwrap();
        let mut result: Vec<Object> = objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.map(|n| n == ns).unwrap_or(true))
            .map(|(_, obj)| obj.clone())
            .collect();
        result.sort_by(|a, b| a.metadata().name.cmp(&b.metadata().name));
        Ok(result)
    }

    fn watch(&self, kind: Kind) -> broadcast::Receiver<WatchEvent> {
        let mut watchers = self.watchers.write().unwrap();
        watchers
            .entry(kind)
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

// ---------------------------------------------------------------------------
// Typed accessors
// ---------------------------------------------------------------------------

/// Fetch a function by name
pub async fn get_function(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
) -> Result<Function> {
    match store.get(Kind::Function, namespace, name).await? {
        Object::Function(f) => Ok(f),
        other => Err(Error::Other(format!(
            "store returned {} for Function '{}/{}'",
            other.kind(),
            namespace,
            name
        ))),
    }
}

/// Fetch an environment by name
pub async fn get_environment(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
) -> Result<Environment> {
    match store.get(Kind::Environment, namespace, name).await? {
        Object::Environment(e) => Ok(e),
        other => Err(Error::Other(format!(
            "store returned {} for Environment '{}/{}'",
            other.kind(),
            namespace,
            name
        ))),
    }
}

/// Fetch a package by name
pub async fn get_package(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
) -> Result<Package> {
    match store.get(Kind::Package, namespace, name).await? {
        Object::Package(p) => Ok(p),
        other => Err(Error::Other(format!(
            "store returned {} for Package '{}/{}'",
            other.kind(),
            namespace,
            name
        ))),
    }
}
