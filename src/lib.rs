#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # Concourse worker operator
//!
//! Hook-driven controller for a Concourse worker unit. The reconciliation
//! logic lives in `worker-reconciler`; this crate supplies the platform side:
//! hook dispatch with deferred-event redelivery, persisted controller state,
//! the filesystem key store and the hook-tool relation/status adapters.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod hook_tools;
pub mod keystore;
pub mod state;

pub use config::OperatorConfig;
pub use dispatch::{DispatchError, DispatchReport, Dispatcher, HookContext};
pub use state::{ControllerState, EventQueue, JsonFileStateStore, StateStore};
