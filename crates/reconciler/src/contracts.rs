//! Interfaces the reconciler drives.
//!
//! The container runtime, the relation transport and key generation are all
//! external; the reconciler only ever sees them through these traits.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use worker_core::{Keypair, LocalAnnouncement, PeerFacts, Relation, UnitHealth};

use crate::error::{KeyStoreError, SupervisorResult};
use crate::types::{Layer, ServiceSpec};

/// Local persistent keypair.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Return the keypair, generating it first if none exists.
    ///
    /// Must be side-effect free once the keypair exists.
    ///
    /// # Errors
    ///
    /// [`KeyStoreError::Deferred`] when the runtime holding the key generator
    /// is unreachable, [`KeyStoreError::Failed`] when generation itself fails.
    async fn ensure_keypair(&self) -> Result<Keypair, KeyStoreError>;
}

/// View over relation data exchanged with the coordinator.
#[async_trait]
pub trait RelationFacts: Send + Sync {
    /// Public key produced by the key store, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the key exists but cannot be read.
    async fn read_local_public_key(&self) -> worker_core::Result<Option<Vec<u8>>>;

    /// Facts published by the coordinator application.
    ///
    /// Absent fields map to `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the relation transport fails.
    async fn read_peer_facts(&self, relation: &Relation) -> worker_core::Result<PeerFacts>;

    /// Whether `relation` is still established.
    ///
    /// # Errors
    ///
    /// Returns an error if the relation transport fails.
    async fn is_established(&self, relation: &Relation) -> worker_core::Result<bool>;

    /// Publish this unit's announcement into its side of the relation.
    ///
    /// # Errors
    ///
    /// Returns an error if the relation transport fails.
    async fn publish_local(
        &self,
        relation: &Relation,
        announcement: &LocalAnnouncement,
    ) -> worker_core::Result<()>;
}

/// Read-only access to files shipped in the workload image.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fetch a file from the workload container.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::RuntimeUnavailable`](crate::SupervisorError) when the
    /// runtime cannot be reached.
    async fn fetch_artifact(&self, path: &Path) -> SupervisorResult<Vec<u8>>;
}

/// Process supervisor inside the workload container.
///
/// Restart is always `stop` followed by `start`; there is no reload.
#[async_trait]
pub trait ProcessSupervisor: ArtifactStore {
    /// Write a file, creating parent directories.
    ///
    /// # Errors
    ///
    /// `RuntimeUnavailable` when the runtime cannot be reached.
    async fn materialize_file(&self, path: &Path, content: &[u8]) -> SupervisorResult<()>;

    /// Whether a file exists.
    ///
    /// # Errors
    ///
    /// `RuntimeUnavailable` when the runtime cannot be reached.
    async fn file_exists(&self, path: &Path) -> SupervisorResult<bool>;

    /// Services currently declared in the supervisor plan.
    ///
    /// # Errors
    ///
    /// `RuntimeUnavailable` when the runtime cannot be reached.
    async fn get_declared_services(&self) -> SupervisorResult<BTreeMap<String, ServiceSpec>>;

    /// Combine a layer into the plan under `label`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer is refused or the runtime is unreachable.
    async fn apply_layer(&self, label: &str, layer: &Layer) -> SupervisorResult<()>;

    /// # Errors
    ///
    /// `RuntimeUnavailable` when the runtime cannot be reached.
    async fn is_running(&self, service: &str) -> SupervisorResult<bool>;

    /// # Errors
    ///
    /// Returns an error if the service cannot be stopped.
    async fn stop(&self, service: &str) -> SupervisorResult<()>;

    /// # Errors
    ///
    /// Returns an error if the service cannot be started.
    async fn start(&self, service: &str) -> SupervisorResult<()>;
}

/// Where unit health is reported.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Replace the reported status.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot be told.
    async fn set_status(&self, health: &UnitHealth) -> worker_core::Result<()>;
}
