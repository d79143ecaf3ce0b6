//! Shared cache primitives for the dispatch hot path
//!
//! `FnServiceMap` holds fingerprint → backend URL bindings with idle
//! eviction; `UpdateLocks` collapses concurrent misses on the same
//! fingerprint into a single backend acquisition.

mod fn_service_map;
mod update_locks;

pub use fn_service_map::{start_idle_sweeper, FnServiceEntry, FnServiceMap};
pub use update_locks::{LockOutcome, UpdateLockGuard, UpdateLocks};
