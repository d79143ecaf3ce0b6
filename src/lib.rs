//! # Funcgate
//!
//! Cold-start-avoiding dispatch core for a function-as-a-service platform.
//!
//! ## Architecture
//!
//! ```text
//! Trigger → Router (mux → resolver → service map) → Executor → Backend Pod
//! ```
//!
//! ## Core pieces
//!
//! - **Router**: longest-prefix HTTP dispatch with weighted canary
//!   references, a fingerprint-keyed function-service map, and single-flight
//!   backend acquisition
//! - **Executors**: pool-based (pre-warmed generic pods specialised on
//!   demand) and new-deployment (dedicated deployment + service + autoscaler)
//! - **Builder**: source-to-artifact pipeline driven by package status
//! - **Triggers**: cron schedules, message-queue subscriptions, and
//!   orchestrator object watches feeding the router's internal invoke
//!   endpoint
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use funcgate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> funcgate::Result<()> {
//!     let config = Config::from_file("funcgate.hcl").await?;
//!     config.validate()?;
//!     // wire stores, executors and the router; see src/main.rs
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod observability;
pub mod orchestrator;
pub mod proxy;
pub mod resolver;
pub mod router;
pub mod storage;
pub mod store;
pub mod triggers;
pub mod types;

pub use error::{Error, Result};
