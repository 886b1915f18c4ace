//! Domain types for the worker operator.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::names::{TSA_HOST_KEY, TSA_HOST_KEY_PUB_KEY, WORKER_KEY_PUB_KEY};

/// Opaque handle to the private half of the worker keypair.
///
/// Only the location is carried around; the key material itself never leaves
/// local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKeyRef(PathBuf);

impl PrivateKeyRef {
    /// Create a handle pointing at a private key on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Location of the private key.
    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// The worker's keypair used to authenticate to the coordinator.
#[derive(Clone, PartialEq, Eq)]
pub struct Keypair {
    public_key: Vec<u8>,
    private_key_ref: PrivateKeyRef,
}

impl Keypair {
    /// Create a keypair from its public half and a handle to the private half.
    pub fn new(public_key: impl Into<Vec<u8>>, private_key_ref: PrivateKeyRef) -> Self {
        Self {
            public_key: public_key.into(),
            private_key_ref,
        }
    }

    /// Public key bytes, exactly as generated.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Handle to the private key.
    pub fn private_key_ref(&self) -> &PrivateKeyRef {
        &self.private_key_ref
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key_len", &self.public_key.len())
            .field("private_key_ref", &self.private_key_ref)
            .finish()
    }
}

/// Facts the coordinator peer has published on the relation.
///
/// Each field is filled in independently as the peer publishes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFacts {
    /// Coordinator host without port.
    #[serde(default)]
    pub coordinator_host: Option<String>,
    /// Coordinator SSH host public key, preserved verbatim.
    #[serde(default)]
    pub coordinator_host_key: Option<Vec<u8>>,
}

impl PeerFacts {
    /// Create empty facts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the coordinator host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.coordinator_host = Some(host.into());
        self
    }

    /// Set the coordinator host key.
    #[must_use]
    pub fn with_host_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.coordinator_host_key = Some(key.into());
        self
    }

    /// Extract the coordinator's facts from its application data.
    ///
    /// Absent or empty values map to `None`.
    pub fn from_app_data(data: &BTreeMap<String, String>) -> Self {
        let field = |key: &str| data.get(key).filter(|value| !value.is_empty());
        Self {
            coordinator_host: field(TSA_HOST_KEY).cloned(),
            coordinator_host_key: field(TSA_HOST_KEY_PUB_KEY).map(|key| key.as_bytes().to_vec()),
        }
    }

    /// Both facts have been published.
    pub const fn is_complete(&self) -> bool {
        self.coordinator_host.is_some() && self.coordinator_host_key.is_some()
    }
}

/// What this unit publishes to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAnnouncement {
    pub worker_public_key: Vec<u8>,
}

impl LocalAnnouncement {
    pub fn new(worker_public_key: impl Into<Vec<u8>>) -> Self {
        Self {
            worker_public_key: worker_public_key.into(),
        }
    }

    /// Unit databag entries carrying this announcement.
    pub fn to_unit_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            WORKER_KEY_PUB_KEY.to_string(),
            String::from_utf8_lossy(&self.worker_public_key).into_owned(),
        )])
    }
}

/// Health reported for this unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum UnitHealth {
    /// Worker configured and running.
    Active,
    /// Waiting on an external change; carries a human readable reason.
    Blocked(String),
}

impl UnitHealth {
    /// Create a blocked status.
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self::Blocked(reason.into())
    }

    /// Status name as understood by the orchestration platform.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Blocked(_) => "blocked",
        }
    }

    /// Message shown next to the status (empty when active).
    pub fn message(&self) -> &str {
        match self {
            Self::Active => "",
            Self::Blocked(reason) => reason,
        }
    }

    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for UnitHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Blocked(reason) => write!(f, "blocked: {reason}"),
        }
    }
}

/// A named relation instance between this unit and a remote application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    /// Endpoint name, e.g. `concourse-worker`.
    pub name: String,
    /// Relation id as handed out by the platform, e.g. `concourse-worker:3`.
    pub id: String,
    /// Application on the other side.
    pub remote_app: String,
}

impl Relation {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        remote_app: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            remote_app: remote_app.into(),
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.remote_app)
    }
}
