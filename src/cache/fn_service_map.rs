//! Function-service map — fingerprint → ready backend URL
//!
//! At most one entry per fingerprint. Entries are kept alive by `tap` on
//! every successful proxy attempt and evicted once idle longer than the
//! executor strategy's timeout; evictions are handed to the owner through a
//! channel so the executor's release port runs outside the map lock.

use crate::cache::UpdateLockGuard;
use crate::types::{ExecutorType, Fingerprint};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// A cached backend binding
#[derive(Debug, Clone)]
pub struct FnServiceEntry {
    pub backend_url: String,
    /// Strategy that produced this backend; routes eviction to the right
    /// release port
    pub executor_type: ExecutorType,
    /// Pod that owns this backend, for pool-based executors
    pub owning_pod: Option<String>,
    pub last_used: Instant,
}

impl FnServiceEntry {
    pub fn new(backend_url: impl Into<String>, owning_pod: Option<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            executor_type: ExecutorType::PoolBased,
            owning_pod,
            last_used: Instant::now(),
        }
    }

    pub fn with_executor(mut self, executor_type: ExecutorType) -> Self {
        self.executor_type = executor_type;
        self
    }
}

/// Thread-safe fingerprint → backend map
pub struct FnServiceMap {
    entries: RwLock<HashMap<Fingerprint, FnServiceEntry>>,
}

impl FnServiceMap {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached backend URL for a fingerprint, if any
    pub fn lookup(&self, fp: &Fingerprint) -> Option<FnServiceEntry> {
        self.entries.read().unwrap().get(fp).cloned()
    }

    /// Insert a binding. Requires the caller to hold the fingerprint's
    /// update lock; an existing entry with a different URL is logged and
    /// overwritten.
    pub fn assign(&self, fp: Fingerprint, entry: FnServiceEntry, lock: &UpdateLockGuard) {
        debug_assert_eq!(lock.key(), fp.to_string());
        let mut entries = self.entries.write().unwrap();
        if let Some(old) = entries.get(&fp) {
            if old.backend_url != entry.backend_url {
                tracing::info!(
                    fingerprint = %fp,
                    old = old.backend_url,
                    new = entry.backend_url,
                    "Overwriting cached backend"
                );
            }
        }
        entries.insert(fp, entry);
    }

    /// Remove a binding; idempotent. The removed entry is returned so the
    /// caller can hand the URL to the executor's release port.
    pub fn remove(&self, fp: &Fingerprint) -> Option<FnServiceEntry> {
        self.entries.write().unwrap().remove(fp)
    }

    /// Record a use of `url`, resetting its idle timer. Returns false when
    /// no entry for the URL exists (already evicted).
    pub fn tap(&self, url: &str) -> bool {
        let mut entries = self.entries.write().unwrap();
        let mut found = false;
        for entry in entries.values_mut() {
            if entry.backend_url == url {
                entry.last_used = Instant::now();
                found = true;
            }
        }
        found
    }

    /// Evict entries idle longer than `idle_timeout`, sending each to `evicted`.
    pub fn sweep_idle(
        &self,
        idle_timeout: Duration,
        evicted: &mpsc::UnboundedSender<(Fingerprint, FnServiceEntry)>,
    ) -> usize {
        let mut entries = self.entries.write().unwrap();
        let expired: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, e)| e.last_used.elapsed() > idle_timeout)
            .map(|(fp, _)| fp.clone())
            .collect();
        let count = expired.len();
        for fp in expired {
            if let Some(entry) = entries.remove(&fp) {
                tracing::debug!(fingerprint = %fp, url = entry.backend_url, "Idle-evicting backend");
                let _ = evicted.send((fp, entry));
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl Default for FnServiceMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the idle sweeper until the map is dropped by all other owners.
/// Evicted entries are delivered on the returned channel in eviction order.
pub fn start_idle_sweeper(
    map: Arc<FnServiceMap>,
    idle_timeout: Duration,
    interval: Duration,
) -> mpsc::UnboundedReceiver<(Fingerprint, FnServiceEntry)> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if Arc::strong_count(&map) == 1 {
                break;
            }
            map.sweep_idle(idle_timeout, &tx);
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{LockOutcome, UpdateLocks};

    fn fp(uid: &str, rv: &str) -> Fingerprint {
        Fingerprint {
            uid: uid.into(),
            resource_version: rv.into(),
        }
    }

    async fn acquire(locks: &UpdateLocks, key: &str) -> UpdateLockGuard {
        match locks.run_or_wait(key).await.unwrap() {
            LockOutcome::Acquired(g) => g,
            LockOutcome::Waited => panic!("expected to acquire"),
        }
    }

    #[tokio::test]
    async fn test_lookup_miss_then_hit() {
        let map = FnServiceMap::new();
        let locks = UpdateLocks::new(Duration::from_secs(5));
        let f = fp("u1", "1");

        assert!(map.lookup(&f).is_none());

        let guard = acquire(&locks, &f.to_string()).await;
        map.assign(f.clone(), FnServiceEntry::new("http://10.0.0.1:8888", None), &guard);
        guard.release();

        assert_eq!(map.lookup(&f).unwrap().backend_url, "http://10.0.0.1:8888");
    }

    #[tokio::test]
    async fn test_assign_overwrites_under_lock() {
        let map = FnServiceMap::new();
        let locks = UpdateLocks::new(Duration::from_secs(5));
        let f = fp("u1", "1");

        let guard = acquire(&locks, &f.to_string()).await;
        map.assign(f.clone(), FnServiceEntry::new("http://a", None), &guard);
        map.assign(f.clone(), FnServiceEntry::new("http://b", None), &guard);
        guard.release();

        // Last writer wins
        assert_eq!(map.lookup(&f).unwrap().backend_url, "http://b");
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let map = FnServiceMap::new();
        let locks = UpdateLocks::new(Duration::from_secs(5));
        let f = fp("u1", "1");

        let guard = acquire(&locks, &f.to_string()).await;
        map.assign(f.clone(), FnServiceEntry::new("http://a", Some("pod-1".into())), &guard);
        guard.release();

        let removed = map.remove(&f).unwrap();
        assert_eq!(removed.owning_pod.as_deref(), Some("pod-1"));
        assert!(map.remove(&f).is_none());
    }

    #[tokio::test]
    async fn test_tap_refreshes_idle_timer() {
        let map = FnServiceMap::new();
        let locks = UpdateLocks::new(Duration::from_secs(5));
        let f = fp("u1", "1");

        let guard = acquire(&locks, &f.to_string()).await;
        map.assign(f.clone(), FnServiceEntry::new("http://a", None), &guard);
        guard.release();

        let before = map.lookup(&f).unwrap().last_used;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(map.tap("http://a"));
        let after = map.lookup(&f).unwrap().last_used;
        assert!(after > before);

        assert!(!map.tap("http://unknown"));
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_idle_entries() {
        let map = FnServiceMap::new();
        let locks = UpdateLocks::new(Duration::from_secs(5));
        let stale = fp("u1", "1");
        let fresh = fp("u2", "1");

        let g1 = acquire(&locks, &stale.to_string()).await;
        map.assign(stale.clone(), FnServiceEntry::new("http://stale", None), &g1);
        g1.release();
        let g2 = acquire(&locks, &fresh.to_string()).await;
        map.assign(fresh.clone(), FnServiceEntry::new("http://fresh", None), &g2);
        g2.release();

        tokio::time::sleep(Duration::from_millis(30)).await;
        map.tap("http://fresh");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let evicted = map.sweep_idle(Duration::from_millis(20), &tx);
        assert_eq!(evicted, 1);

        let (evicted_fp, entry) = rx.try_recv().unwrap();
        assert_eq!(evicted_fp, stale);
        assert_eq!(entry.backend_url, "http://stale");
        assert!(map.lookup(&stale).is_none());
        assert!(map.lookup(&fresh).is_some());
    }

    #[tokio::test]
    async fn test_background_sweeper_delivers_evictions() {
        let map = Arc::new(FnServiceMap::new());
        let locks = UpdateLocks::new(Duration::from_secs(5));
        let f = fp("u1", "1");

        let guard = acquire(&locks, &f.to_string()).await;
        map.assign(f.clone(), FnServiceEntry::new("http://a", None), &guard);
        guard.release();

        let mut rx = start_idle_sweeper(
            map.clone(),
            Duration::from_millis(20),
            Duration::from_millis(10),
        );

        let (evicted_fp, _) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("sweeper should evict within the timeout")
            .unwrap();
        assert_eq!(evicted_fp, f);
        assert!(map.is_empty());
    }
}
