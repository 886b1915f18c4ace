//! Core types for the reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use worker_core::Relation;

/// A single service declaration in a supervisor layer.
///
/// Field names follow the supervisor's layer format so the struct
/// (de)serializes directly to and from plan documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(rename = "override", default, skip_serializing_if = "String::is_empty")]
    pub override_: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub startup: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

/// Declarative service specification applied to the supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
}

/// Where the content of a required file comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSource {
    /// Coordinator host key published by the peer.
    PeerHostKey,
    /// Private key held by the key store.
    LocalPrivateKey,
}

/// A file the worker process needs before it can start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredFile {
    pub path: PathBuf,
    pub source: FileSource,
}

/// An input the desired configuration could not be filled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingInput {
    CoordinatorHost,
    CoordinatorHostKey,
    Keypair,
}

impl fmt::Display for MissingInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CoordinatorHost => write!(f, "coordinator host"),
            Self::CoordinatorHostKey => write!(f, "coordinator host key"),
            Self::Keypair => write!(f, "worker keypair"),
        }
    }
}

/// Configuration the worker process should be running with.
///
/// Recomputed on every pass and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredProcessConfig {
    pub(crate) service_name: String,
    pub(crate) layer: Layer,
    pub(crate) required_files: Vec<RequiredFile>,
    pub(crate) missing: Vec<MissingInput>,
}

impl DesiredProcessConfig {
    /// Name of the managed service.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The layer to hand to the supervisor.
    pub const fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Service declarations, keyed by service name.
    pub const fn declared_services(&self) -> &BTreeMap<String, ServiceSpec> {
        &self.layer.services
    }

    /// Declaration of the managed service.
    pub fn service(&self) -> Option<&ServiceSpec> {
        self.layer.services.get(&self.service_name)
    }

    /// Command the service runs.
    pub fn command(&self) -> Option<&str> {
        self.service().map(|service| service.command.as_str())
    }

    /// Environment of the service.
    pub fn environment(&self) -> Option<&BTreeMap<String, String>> {
        self.service().map(|service| &service.environment)
    }

    pub fn required_files(&self) -> &[RequiredFile] {
        &self.required_files
    }

    /// Inputs that were not available when this config was built.
    pub fn missing_inputs(&self) -> &[MissingInput] {
        &self.missing
    }

    /// Every input was available.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// What the supervisor reports right now.
///
/// Read fresh on every pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedProcessState {
    pub declared_services: BTreeMap<String, ServiceSpec>,
    pub running: bool,
}

/// Platform events the reconciler reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkerEvent {
    /// Unit configuration changed (also used for install and runtime-ready).
    ConfigChanged,
    /// The coordinator relation's data changed.
    RelationChanged { relation: Relation },
}

impl WorkerEvent {
    /// Short name for logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConfigChanged => "config-changed",
            Self::RelationChanged { .. } => "relation-changed",
        }
    }
}

impl fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigChanged => write!(f, "config-changed"),
            Self::RelationChanged { relation } => write!(f, "relation-changed {relation}"),
        }
    }
}

/// Outcome of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The event was fully handled.
    Proceed,
    /// The event must be redelivered later.
    Defer { reason: String },
}

impl HandlerOutcome {
    /// Create a defer outcome.
    pub fn defer(reason: impl Into<String>) -> Self {
        Self::Defer {
            reason: reason.into(),
        }
    }

    pub const fn is_deferred(&self) -> bool {
        matches!(self, Self::Defer { .. })
    }
}

/// Where the reconciler stopped on its last handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcilePhase {
    #[default]
    AwaitingKey,
    AwaitingPeerHost,
    AwaitingPeerHostKey,
    AwaitingRuntime,
    Reconciling,
    Active,
    Blocked,
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingKey => "awaiting-key",
            Self::AwaitingPeerHost => "awaiting-peer-host",
            Self::AwaitingPeerHostKey => "awaiting-peer-host-key",
            Self::AwaitingRuntime => "awaiting-runtime",
            Self::Reconciling => "reconciling",
            Self::Active => "active",
            Self::Blocked => "blocked",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_spec_layer_yaml_uses_override_key() {
        let spec = ServiceSpec {
            override_: "replace".to_string(),
            command: "/bin/true".to_string(),
            ..ServiceSpec::default()
        };
        let rendered = serde_yaml::to_string(&spec).unwrap_or_default();
        assert!(rendered.contains("override: replace"));
        assert!(!rendered.contains("summary"));
    }

    #[test]
    fn test_plan_services_parse_ignores_unknown_fields() {
        let plan = "services:\n  concourse-worker:\n    override: replace\n    command: run\n    backoff-delay: 1s\n";
        let layer: std::result::Result<Layer, _> = serde_yaml::from_str(plan);
        let layer = layer.ok();
        let command = layer
            .as_ref()
            .and_then(|l| l.services.get("concourse-worker"))
            .map(|s| s.command.clone());
        assert_eq!(command.as_deref(), Some("run"));
    }

    #[test]
    fn test_handler_outcome_defer() {
        assert!(HandlerOutcome::defer("runtime").is_deferred());
        assert!(!HandlerOutcome::Proceed.is_deferred());
    }

    #[test]
    fn test_event_name() {
        let event = WorkerEvent::RelationChanged {
            relation: Relation::new("concourse-worker", "concourse-worker:1", "web"),
        };
        assert_eq!(event.name(), "relation-changed");
        assert!(event.to_string().contains("concourse-worker:1"));
    }
}
