//! Pebble-backed process supervisor for the Concourse worker operator.
//!
//! Talks to the workload container's Pebble daemon over its HTTP API. Any
//! failure to reach the daemon is reported as
//! [`SupervisorError::RuntimeUnavailable`](worker_reconciler::SupervisorError),
//! which the reconciler turns into a defer.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod client;
pub mod multipart;
pub mod supervisor;

pub use client::{PebbleClient, PebbleConfig, ServiceInfo};
pub use supervisor::PebbleSupervisor;
