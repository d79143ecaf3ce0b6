//! Executors — turn a function snapshot into a ready HTTP backend
//!
//! Two interchangeable strategies: `PoolExecutor` taps pre-warmed generic
//! pods and specialises one per function on demand; `NewDeployExecutor`
//! materialises a dedicated deployment + service + autoscaler. The router
//! only sees the `Executor` capability set.

mod newdeploy;
mod pool;

pub use newdeploy::NewDeployExecutor;
pub use pool::PoolExecutor;

use crate::cache::FnServiceEntry;
use crate::error::Result;
use crate::types::{Environment, ExecutorType, Fingerprint, Function};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Backend acquisition and release for one invoke strategy
#[async_trait]
pub trait Executor: Send + Sync {
    /// Produce a ready backend for the function snapshot. Blocks up to the
    /// function's specialization timeout.
    async fn acquire(&self, function: &Function) -> Result<FnServiceEntry>;

    /// Give back a backend the cache evicted
    async fn release(&self, fp: &Fingerprint, entry: &FnServiceEntry) -> Result<()>;

    /// Usage signal for executors that track backend liveness
    async fn tap(&self, _url: &str) {}

    /// Executor name (for logging)
    fn name(&self) -> &str;
}

/// Both strategies, dispatched by the function's invoke strategy
pub struct ExecutorSet {
    pool: Arc<dyn Executor>,
    newdeploy: Arc<dyn Executor>,
}

impl ExecutorSet {
    pub fn new(pool: Arc<dyn Executor>, newdeploy: Arc<dyn Executor>) -> Self {
        Self { pool, newdeploy }
    }

    pub fn for_function(&self, function: &Function) -> &Arc<dyn Executor> {
        match function.spec.invoke_strategy.executor_type {
            ExecutorType::PoolBased => &self.pool,
            ExecutorType::NewDeployment => &self.newdeploy,
        }
    }

    pub fn for_type(&self, executor_type: ExecutorType) -> &Arc<dyn Executor> {
        match executor_type {
            ExecutorType::PoolBased => &self.pool,
            ExecutorType::NewDeployment => &self.newdeploy,
        }
    }
}

/// Labels stamped on every pod/deployment so selectors can find workloads by
/// function name, uid, executor or environment
pub fn function_labels(function: &Function, environment: &Environment) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "functionName".to_string(),
        function.metadata.name.clone(),
    );
    labels.insert("functionUid".to_string(), function.metadata.uid.clone());
    labels.insert(
        "executorType".to_string(),
        function.spec.invoke_strategy.executor_type.to_string(),
    );
    labels.insert(
        "environmentName".to_string(),
        environment.metadata.name.clone(),
    );
    labels
}

/// Drain idle-eviction notifications from the map sweeper into the owning
/// executor's release port.
pub fn spawn_release_worker(
    mut evicted: mpsc::UnboundedReceiver<(Fingerprint, FnServiceEntry)>,
    executors: Arc<ExecutorSet>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((fp, entry)) = evicted.recv().await {
            let executor = executors.for_type(entry.executor_type);
            if let Err(e) = executor.release(&fp, &entry).await {
                tracing::warn!(
                    fingerprint = %fp,
                    url = entry.backend_url,
                    error = %e,
                    "Backend release failed"
                );
            }
        }
    })
}
