//! Single-flight update locks, one per fingerprint
//!
//! Under a cold-start burst for one function, only the first caller talks to
//! the executor; everyone else parks on the lock and re-reads the cache
//! after release. Lock state lives behind a request-serialising task, so no
//! mutex is held across await points. A periodic sweep expires locks whose
//! acquirer died, bounding the damage to `lock_timeout`.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

/// Outcome of `run_or_wait`
pub enum LockOutcome {
    /// This caller installed the lock and must acquire the backend, then
    /// release (or drop) the guard.
    Acquired(UpdateLockGuard),
    /// Another caller held the lock and has since released it; re-read the
    /// cache. A still-missing entry means the acquirer failed.
    Waited,
}

struct LockCell {
    created_at: Instant,
    released: watch::Sender<bool>,
}

impl LockCell {
    fn is_old(&self, expiry: Duration) -> bool {
        self.created_at.elapsed() > expiry
    }
}

enum LockRequest {
    Get {
        key: String,
        reply: oneshot::Sender<GetReply>,
    },
    Release {
        key: String,
    },
}

enum GetReply {
    Acquirer,
    Waiter(watch::Receiver<bool>),
}

/// Per-fingerprint single-flight lock table
pub struct UpdateLocks {
    tx: mpsc::UnboundedSender<LockRequest>,
    lock_timeout: Duration,
}

impl UpdateLocks {
    /// Create the lock table and start its service + expiry tasks.
    ///
    /// `lock_timeout` must be at least the executor's specialization timeout,
    /// otherwise a healthy acquirer can be expired mid-flight.
    pub fn new(lock_timeout: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let locks = Arc::new(Self { tx, lock_timeout });
        tokio::spawn(Self::service(rx, lock_timeout));
        locks
    }

    /// Either become the backend acquirer for `key` or wait for the current
    /// acquirer to finish.
    pub async fn run_or_wait(&self, key: &str) -> Result<LockOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(LockRequest::Get {
                key: key.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| Error::Other("update lock service stopped".into()))?;

        let reply = reply_rx
            .await
            .map_err(|_| Error::Other("update lock service dropped the request".into()))?;

        match reply {
            GetReply::Acquirer => Ok(LockOutcome::Acquired(UpdateLockGuard {
                key: key.to_string(),
                tx: self.tx.clone(),
                released: false,
            })),
            GetReply::Waiter(mut released) => {
                let wait = released.wait_for(|done| *done);
                match tokio::time::timeout(self.lock_timeout, wait).await {
                    Ok(Ok(_)) => Ok(LockOutcome::Waited),
                    Ok(Err(_)) => Ok(LockOutcome::Waited), // sender dropped on expiry
                    Err(_) => Err(Error::ColdStartTimeout(self.lock_timeout)),
                }
            }
        }
    }

    async fn service(mut rx: mpsc::UnboundedReceiver<LockRequest>, expiry: Duration) {
        let mut locks: HashMap<String, LockCell> = HashMap::new();
        let sweep_every = expiry.min(Duration::from_secs(5)).max(Duration::from_millis(50));
        let mut sweep = tokio::time::interval(sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                req = rx.recv() => {
                    let Some(req) = req else { break };
                    match req {
                        LockRequest::Get { key, reply } => {
                            match locks.get(&key) {
                                Some(cell) if !cell.is_old(expiry) => {
                                    let _ = reply.send(GetReply::Waiter(cell.released.subscribe()));
                                }
                                stale => {
                                    if stale.is_some() {
                                        // Dead acquirer; wake its waiters before replacing
                                        if let Some(old) = locks.remove(&key) {
                                            let _ = old.released.send(true);
                                        }
                                        tracing::warn!(key, "Expired a stale update lock");
                                    }
                                    let (released, _) = watch::channel(false);
                                    locks.insert(key, LockCell { created_at: Instant::now(), released });
                                    let _ = reply.send(GetReply::Acquirer);
                                }
                            }
                        }
                        LockRequest::Release { key } => {
                            if let Some(cell) = locks.remove(&key) {
                                let _ = cell.released.send(true);
                            }
                        }
                    }
                }
                _ = sweep.tick() => {
                    let expired: Vec<String> = locks
                        .iter()
                        .filter(|(_, cell)| cell.is_old(expiry))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in expired {
                        if let Some(cell) = locks.remove(&key) {
                            let _ = cell.released.send(true);
                            tracing::warn!(key, "Swept an expired update lock");
                        }
                    }
                }
            }
        }
    }
}

/// Held by the single acquirer; releasing (or dropping) wakes all waiters.
pub struct UpdateLockGuard {
    key: String,
    tx: mpsc::UnboundedSender<LockRequest>,
    released: bool,
}

impl UpdateLockGuard {
    /// Fingerprint key this guard covers
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release explicitly (drop does the same)
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.tx.send(LockRequest::Release {
                key: self.key.clone(),
            });
        }
    }
}

impl Drop for UpdateLockGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}
