//! Router — trigger-matched dispatch of HTTP requests to functions
//!
//! The mux is an immutable compiled table; the trigger set rebuilds and
//! atomically republishes it on every watch event. The handler runs the
//! per-request pipeline: match, resolve, cached-backend lookup with
//! single-flight acquire, reverse proxy, one retry on backend failure.

mod handler;
mod mux;
mod trigger_set;

pub use handler::{serve, DispatchOutcome, RouterState, HEADER_ERROR_KIND};
pub use mux::{MatchedRoute, Mux};
pub use trigger_set::{start_sync, TriggerSet};
