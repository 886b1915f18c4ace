//! Reconciliation loop for a Concourse worker unit.
//!
//! This crate decides, whenever unit configuration or coordinator relation
//! facts change, whether the worker service should be (re)configured,
//! (re)started or left alone, and what health the unit should report.
//!
//! # Key Concepts
//!
//! ## Desired vs. observed
//!
//! Every pass rebuilds the [`DesiredProcessConfig`] from the
//! persisted [`PeerFacts`](worker_core::PeerFacts) and compares it with the
//! supervisor's plan. The service is restarted only when the declaration
//! differs, and always as `stop` followed by `start`.
//!
//! ## Defer
//!
//! Handlers return [`HandlerOutcome::Defer`] while waiting on something that will
//! show up by itself (key generator, peer data, container runtime). The
//! surrounding platform redelivers the event; nothing here retries.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use worker_reconciler::{ReconcilerBuilder, WorkerEvent};
//! use worker_reconciler::memory::{
//!     InMemoryKeyStore, InMemoryRelation, InMemorySupervisor, RecordingStatus,
//! };
//!
//! let keys = Arc::new(InMemoryKeyStore::new());
//! let mut reconciler = ReconcilerBuilder::new()
//!     .with_key_store(keys.clone())
//!     .with_relations(Arc::new(InMemoryRelation::new(keys)))
//!     .with_supervisor(Arc::new(InMemorySupervisor::new()))
//!     .with_status(Arc::new(RecordingStatus::new()))
//!     .build()?;
//!
//! let outcome = reconciler.handle(&WorkerEvent::ConfigChanged).await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config_builder;
pub mod contracts;
pub mod error;
pub mod memory;
pub mod reconciler;
pub mod types;

// Re-export main types
pub use contracts::{ArtifactStore, KeyStore, ProcessSupervisor, RelationFacts, StatusSink};
pub use error::{Error, KeyStoreError, Result, SupervisorError, SupervisorResult};
pub use reconciler::{Reconciler, ReconcilerBuilder};
pub use types::{
    DesiredProcessConfig, FileSource, HandlerOutcome, Layer, MissingInput, ObservedProcessState,
    ReconcilePhase, RequiredFile, ServiceSpec, WorkerEvent,
};
