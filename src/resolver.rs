//! Function reference resolver
//!
//! Translates a trigger's `(namespace, FunctionReference)` into concrete
//! function snapshots plus canary weights. Results are cached with a short
//! TTL; watch events for functions invalidate affected entries so triggers
//! pick up re-pointed functions promptly.

use crate::error::{Error, Result};
use crate::store::{self, Kind, ObjectStore, WatchEvent};
use crate::types::{Fingerprint, Function, FunctionReference};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// A resolved canary target
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub function: Function,
    pub weight: u32,
}

impl ResolvedTarget {
    pub fn fingerprint(&self) -> Fingerprint {
        self.function.metadata.fingerprint()
    }
}

struct CacheEntry {
    targets: Vec<ResolvedTarget>,
    inserted_at: Instant,
}

/// Caching resolver over the declarative store
pub struct FunctionResolver {
    store: Arc<dyn ObjectStore>,
    cache: RwLock<HashMap<(String, String), CacheEntry>>,
    ttl: Duration,
    pick_counter: AtomicUsize,
}

impl FunctionResolver {
    pub fn new(store: Arc<dyn ObjectStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            ttl,
            pick_counter: AtomicUsize::new(0),
        }
    }

    /// Resolve a reference to its target functions and weights.
    ///
    /// By-name references resolve to a single target with weight 1; weighted
    /// references resolve each named function, sorted by name so equal
    /// weights break ties deterministically.
    pub async fn resolve(
        &self,
        namespace: &str,
        reference: &FunctionReference,
    ) -> Result<Vec<ResolvedTarget>> {
        reference.validate()?;

        let key = (namespace.to_string(), reference.canonical());
        {
            let cache = self.cache.read().unwrap();
            if let Some(entry) = cache.get(&key) {
                if entry.inserted_at.elapsed() < self.ttl {
                    return Ok(entry.targets.clone());
                }
            }
        }

        let targets = match reference {
            FunctionReference::Name(name) => {
                let function = store::get_function(self.store.as_ref(), namespace, name).await?;
                vec![ResolvedTarget {
                    function,
                    weight: 1,
                }]
            }
            FunctionReference::WeightedNames(weights) => {
                // BTreeMap iteration is name-ordered
                let mut targets = Vec::with_capacity(weights.len());
                for (name, weight) in weights {
                    let function =
                        store::get_function(self.store.as_ref(), namespace, name).await?;
                    targets.push(ResolvedTarget {
                        function,
                        weight: *weight,
                    });
                }
                targets
            }
        };

        self.cache.write().unwrap().insert(
            key,
            CacheEntry {
                targets: targets.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(targets)
    }

    /// Per-request weighted choice, proportional to weight. Zero-weight
    /// targets are never chosen.
    pub fn choose<'a>(&self, targets: &'a [ResolvedTarget]) -> Result<&'a ResolvedTarget> {
        match targets {
            [] => Err(Error::NotFound("reference resolved to no functions".into())),
            [single] => Ok(single),
            many => {
                let total: u32 = many.iter().map(|t| t.weight).sum();
                if total == 0 {
                    return Err(Error::Invalid(
                        "weighted reference has zero total weight".into(),
                    ));
                }
                let tick = self.pick_counter.fetch_add(1, Ordering::Relaxed) as u32;
                let target = tick % total;
                let mut cumulative = 0u32;
                for t in many {
                    cumulative += t.weight;
                    if target < cumulative {
                        return Ok(t);
                    }
                }
                Ok(many.last().unwrap_or(&many[0]))
            }
        }
    }

    /// Drop cached resolutions that reference `name` in `namespace`
    pub fn invalidate(&self, namespace: &str, name: &str) {
        let mut cache = self.cache.write().unwrap();
        cache.retain(|(ns, _), entry| {
            ns != namespace
                || !entry
                    .targets
                    .iter()
                    .any(|t| t.function.metadata.name == name)
        });
    }

    /// Drop every cached resolution in a namespace
    pub fn invalidate_namespace(&self, namespace: &str) {
        self.cache.write().unwrap().retain(|(ns, _), _| ns != namespace);
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().unwrap().len()
    }
}

/// Keep the resolver cache coherent with function watch events
pub fn start_invalidation_task(resolver: Arc<FunctionResolver>) -> tokio::task::JoinHandle<()> {
    let mut rx = resolver.store.watch(Kind::Function);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let meta = event.object().metadata();
                    resolver.invalidate(&meta.namespace, &meta.name);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Function watch lagged; flushing resolver cache");
                    resolver.cache.write().unwrap().clear();
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
