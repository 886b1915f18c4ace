//! Controller state that outlives a single hook invocation.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;
use worker_core::{Error, PeerFacts, Result};
use worker_reconciler::WorkerEvent;

/// Events waiting for redelivery, oldest first.
///
/// Holds each distinct event at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventQueue {
    events: Vec<WorkerEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `event` unless an identical event is already waiting.
    ///
    /// Returns whether the queue grew.
    pub fn push(&mut self, event: WorkerEvent) -> bool {
        if self.events.contains(&event) {
            return false;
        }
        self.events.push(event);
        true
    }

    /// Drop `event` if it is queued. Returns whether it was.
    pub fn remove(&mut self, event: &WorkerEvent) -> bool {
        let before = self.events.len();
        self.events.retain(|queued| queued != event);
        self.events.len() != before
    }

    /// Remove and return every queued event in delivery order.
    pub fn drain(&mut self) -> Vec<WorkerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Extend<WorkerEvent> for EventQueue {
    fn extend<I: IntoIterator<Item = WorkerEvent>>(&mut self, iter: I) {
        for event in iter {
            self.push(event);
        }
    }
}

/// Everything the operator remembers between invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerState {
    /// Coordinator facts gathered from relation data.
    pub peer_facts: PeerFacts,
    /// Events handed back for redelivery.
    pub deferred: EventQueue,
    /// When the last dispatch finished.
    pub last_dispatch: Option<DateTime<Utc>>,
}

/// Load/save seam for [`ControllerState`].
pub trait StateStore: Send + Sync {
    /// Load the persisted state. A store that was never written yields
    /// the default state.
    ///
    /// # Errors
    ///
    /// Returns an error if existing state cannot be read or parsed.
    fn load(&self) -> Result<ControllerState>;

    /// Persist `state`, replacing what was stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    fn save(&self, state: &ControllerState) -> Result<()>;
}

/// JSON file store, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

impl StateStore for JsonFileStateStore {
    fn load(&self) -> Result<ControllerState> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted state");
                return Ok(ControllerState::default());
            }
            Err(e) => return Err(Error::file_read_failed(&self.path, e.to_string())),
        };
        serde_json::from_slice(&raw).map_err(|e| {
            Error::json_parse_failed(format!("{}: {e}", self.path.display()))
        })
    }

    fn save(&self, state: &ControllerState) -> Result<()> {
        let dir = self.parent_dir();
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::directory_creation_failed(dir, e.to_string()))?;

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::json_parse_failed(e.to_string()))?;

        let write_failed = |e: std::io::Error| Error::file_write_failed(&self.path, e.to_string());
        let mut tmp = NamedTempFile::new_in(dir).map_err(write_failed)?;
        tmp.write_all(&json).map_err(write_failed)?;
        tmp.as_file().sync_all().map_err(write_failed)?;
        tmp.persist(&self.path).map_err(|e| write_failed(e.error))?;

        debug!(path = %self.path.display(), deferred = state.deferred.len(), "Saved state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker_core::Relation;

    fn relation_changed(id: &str) -> WorkerEvent {
        WorkerEvent::RelationChanged {
            relation: Relation::new("concourse-worker", id, "concourse-web"),
        }
    }

    #[test]
    fn test_queue_deduplicates_identical_events() {
        let mut queue = EventQueue::new();
        assert!(queue.push(WorkerEvent::ConfigChanged));
        assert!(!queue.push(WorkerEvent::ConfigChanged));
        assert!(queue.push(relation_changed("concourse-worker:1")));
        assert!(queue.push(relation_changed("concourse-worker:2")));
        assert!(!queue.push(relation_changed("concourse-worker:1")));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_drain_keeps_order_and_empties() {
        let mut queue = EventQueue::new();
        queue.extend([relation_changed("concourse-worker:1"), WorkerEvent::ConfigChanged]);
        let drained = queue.drain();
        assert_eq!(
            drained,
            vec![relation_changed("concourse-worker:1"), WorkerEvent::ConfigChanged]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_state_json_shape() {
        let mut state = ControllerState {
            peer_facts: PeerFacts::new().with_host("tsa"),
            ..ControllerState::default()
        };
        state.deferred.push(WorkerEvent::ConfigChanged);
        let json = serde_json::to_value(&state).unwrap_or_default();
        assert_eq!(
            json.pointer("/peer_facts/coordinator_host"),
            Some(&serde_json::json!("tsa"))
        );
        assert_eq!(
            json.pointer("/deferred/0/kind"),
            Some(&serde_json::json!("config-changed"))
        );
    }

    #[test]
    fn test_empty_document_loads_defaults() {
        let state: Option<ControllerState> = serde_json::from_str("{}").ok();
        assert_eq!(state, Some(ControllerState::default()));
    }
}
