//! Error types for the reconciler crate.

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for supervisor calls.
pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

/// Failures reported by a [`ProcessSupervisor`](crate::ProcessSupervisor).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    /// The execution substrate cannot be reached. Callers defer.
    #[error("container runtime unavailable: {reason}")]
    RuntimeUnavailable { reason: String },
    /// The substrate answered but refused the request.
    #[error("supervisor rejected {operation}: {reason}")]
    Rejected { operation: String, reason: String },
}

impl SupervisorError {
    /// Create a runtime unavailable error.
    pub fn runtime_unavailable(reason: impl Into<String>) -> Self {
        Self::RuntimeUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a rejected error.
    pub fn rejected(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub const fn is_runtime_unavailable(&self) -> bool {
        matches!(self, Self::RuntimeUnavailable { .. })
    }
}

/// Failures reported by a [`KeyStore`](crate::KeyStore).
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Key material cannot be produced yet; retry on a later delivery.
    #[error("keypair deferred: {reason}")]
    Deferred { reason: String },
    /// Key generation or storage failed.
    #[error(transparent)]
    Failed(#[from] worker_core::Error),
}

impl KeyStoreError {
    /// Create a deferred error.
    pub fn deferred(reason: impl Into<String>) -> Self {
        Self::Deferred {
            reason: reason.into(),
        }
    }
}

impl From<SupervisorError> for KeyStoreError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::RuntimeUnavailable { reason } => Self::Deferred { reason },
            SupervisorError::Rejected { operation, reason } => Self::Failed(
                worker_core::Error::command_failed(operation, reason),
            ),
        }
    }
}

/// Reconciler error types.
///
/// Anything surfacing here aborts the current handler; the event is redelivered
/// by the platform on a later dispatch.
#[derive(Debug, Error)]
pub enum Error {
    /// A supervisor call failed for a reason other than unavailability.
    #[error("supervisor {operation} failed: {source}")]
    Supervisor {
        operation: String,
        #[source]
        source: SupervisorError,
    },
    /// Key generation failed.
    #[error("key store failed: {0}")]
    KeyStore(#[source] worker_core::Error),
    /// Reading or writing relation data failed.
    #[error("relation {relation} failed: {source}")]
    Relation {
        relation: String,
        #[source]
        source: worker_core::Error,
    },
    /// Reporting unit status failed.
    #[error("status update failed: {0}")]
    Status(#[source] worker_core::Error),
    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a supervisor error.
    pub fn supervisor(operation: impl Into<String>, source: SupervisorError) -> Self {
        Self::Supervisor {
            operation: operation.into(),
            source,
        }
    }

    /// Create a relation error.
    pub fn relation(relation: impl Into<String>, source: worker_core::Error) -> Self {
        Self::Relation {
            relation: relation.into(),
            source,
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}
