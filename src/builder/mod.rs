//! Source-to-artifact build pipeline: the in-pod build server and the
//! controller that drives pending packages through it.

pub mod manager;
pub mod server;

pub use manager::{start, BuildLeases, BuildManager};
pub use server::{serve, BuildRequest, BuildResponse, BuilderServer};
