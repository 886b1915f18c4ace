//! In-memory collaborators.
//!
//! Used by the test suites. Every collaborator records what was asked of it
//! so call sequences can be asserted on.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use worker_core::names::{
    TSA_HOST_KEY, TSA_HOST_KEY_PUB_KEY, WORKER_KEY_PUB_KEY, WORKER_PRIVATE_KEY_PATH,
};
use worker_core::{Keypair, LocalAnnouncement, PeerFacts, PrivateKeyRef, Relation, UnitHealth};

use crate::contracts::{ArtifactStore, KeyStore, ProcessSupervisor, RelationFacts, StatusSink};
use crate::error::{KeyStoreError, SupervisorError, SupervisorResult};
use crate::types::{Layer, ServiceSpec};

/// A call made against [`InMemorySupervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCall {
    Materialize(PathBuf),
    ApplyLayer(String),
    Stop(String),
    Start(String),
}

#[derive(Debug, Default)]
struct SupervisorState {
    available: bool,
    fail_start: bool,
    files: BTreeMap<PathBuf, Vec<u8>>,
    artifacts: BTreeMap<PathBuf, Vec<u8>>,
    services: BTreeMap<String, ServiceSpec>,
    running: BTreeSet<String>,
    calls: Vec<SupervisorCall>,
}

/// Process supervisor holding its plan, files and running set in memory.
#[derive(Debug)]
pub struct InMemorySupervisor {
    state: Mutex<SupervisorState>,
}

impl InMemorySupervisor {
    /// Create a reachable supervisor with an empty plan.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SupervisorState {
                available: true,
                ..SupervisorState::default()
            }),
        }
    }

    /// Make the runtime (un)reachable.
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
    }

    /// Make `start` fail with a rejection.
    pub async fn fail_start(&self, fail: bool) {
        self.state.lock().await.fail_start = fail;
    }

    /// Place a file without recording a call.
    pub async fn put_file(&self, path: impl Into<PathBuf>, content: Vec<u8>) {
        self.state.lock().await.files.insert(path.into(), content);
    }

    /// Ship an artifact in the workload image.
    pub async fn put_artifact(&self, path: impl Into<PathBuf>, content: Vec<u8>) {
        self.state.lock().await.artifacts.insert(path.into(), content);
    }

    /// Declare a service and mark it running, as if left over from a
    /// previous configuration.
    pub async fn seed_running(&self, name: &str, spec: ServiceSpec) {
        let mut state = self.state.lock().await;
        state.services.insert(name.to_string(), spec);
        state.running.insert(name.to_string());
    }

    pub async fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.state.lock().await.files.get(path.as_ref()).cloned()
    }

    pub async fn services(&self) -> BTreeMap<String, ServiceSpec> {
        self.state.lock().await.services.clone()
    }

    pub async fn running(&self, service: &str) -> bool {
        self.state.lock().await.running.contains(service)
    }

    /// Calls recorded so far.
    pub async fn calls(&self) -> Vec<SupervisorCall> {
        self.state.lock().await.calls.clone()
    }

    /// Forget recorded calls.
    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }
}

impl Default for InMemorySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_available(state: &SupervisorState) -> SupervisorResult<()> {
    if state.available {
        Ok(())
    } else {
        Err(SupervisorError::runtime_unavailable("in-memory runtime offline"))
    }
}

#[async_trait]
impl ArtifactStore for InMemorySupervisor {
    async fn fetch_artifact(&self, path: &Path) -> SupervisorResult<Vec<u8>> {
        let state = self.state.lock().await;
        ensure_available(&state)?;
        state
            .artifacts
            .get(path)
            .cloned()
            .ok_or_else(|| SupervisorError::rejected("pull", format!("{} not found", path.display())))
    }
}

#[async_trait]
impl ProcessSupervisor for InMemorySupervisor {
    async fn materialize_file(&self, path: &Path, content: &[u8]) -> SupervisorResult<()> {
        let mut state = self.state.lock().await;
        ensure_available(&state)?;
        state.files.insert(path.to_path_buf(), content.to_vec());
        state.calls.push(SupervisorCall::Materialize(path.to_path_buf()));
        Ok(())
    }

    async fn file_exists(&self, path: &Path) -> SupervisorResult<bool> {
        let state = self.state.lock().await;
        ensure_available(&state)?;
        Ok(state.files.contains_key(path))
    }

    async fn get_declared_services(&self) -> SupervisorResult<BTreeMap<String, ServiceSpec>> {
        let state = self.state.lock().await;
        ensure_available(&state)?;
        Ok(state.services.clone())
    }

    async fn apply_layer(&self, label: &str, layer: &Layer) -> SupervisorResult<()> {
        let mut state = self.state.lock().await;
        ensure_available(&state)?;
        state
            .services
            .extend(layer.services.iter().map(|(name, spec)| (name.clone(), spec.clone())));
        state.calls.push(SupervisorCall::ApplyLayer(label.to_string()));
        Ok(())
    }

    async fn is_running(&self, service: &str) -> SupervisorResult<bool> {
        let state = self.state.lock().await;
        ensure_available(&state)?;
        Ok(state.running.contains(service))
    }

    async fn stop(&self, service: &str) -> SupervisorResult<()> {
        let mut state = self.state.lock().await;
        ensure_available(&state)?;
        state.running.remove(service);
        state.calls.push(SupervisorCall::Stop(service.to_string()));
        Ok(())
    }

    async fn start(&self, service: &str) -> SupervisorResult<()> {
        let mut state = self.state.lock().await;
        ensure_available(&state)?;
        state.calls.push(SupervisorCall::Start(service.to_string()));
        if state.fail_start {
            return Err(SupervisorError::rejected("start", "service exited immediately"));
        }
        if !state.services.contains_key(service) {
            return Err(SupervisorError::rejected(
                "start",
                format!("service {service} not in plan"),
            ));
        }
        state.running.insert(service.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct KeyStoreState {
    unavailable: bool,
    keypair: Option<Keypair>,
    generated: usize,
}

/// Key store that "generates" a fixed keypair.
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    state: Mutex<KeyStoreState>,
}

impl InMemoryKeyStore {
    /// Create a key store with no keypair yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a key store holding an existing keypair.
    pub fn with_keypair(public_key: impl Into<Vec<u8>>) -> Self {
        Self {
            state: Mutex::new(KeyStoreState {
                keypair: Some(Keypair::new(
                    public_key,
                    PrivateKeyRef::new(WORKER_PRIVATE_KEY_PATH),
                )),
                ..KeyStoreState::default()
            }),
        }
    }

    /// Make the key generator (un)reachable.
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.unavailable = !available;
    }

    /// Number of times a keypair was generated.
    pub async fn generated_count(&self) -> usize {
        self.state.lock().await.generated
    }

    /// Current keypair, if generated.
    pub async fn keypair(&self) -> Option<Keypair> {
        self.state.lock().await.keypair.clone()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn ensure_keypair(&self) -> Result<Keypair, KeyStoreError> {
        let mut state = self.state.lock().await;
        if let Some(keypair) = &state.keypair {
            return Ok(keypair.clone());
        }
        if state.unavailable {
            return Err(KeyStoreError::deferred("in-memory runtime offline"));
        }
        let keypair = Keypair::new(
            b"ssh-rsa AAAAB3NzaC1yc2EAAAADAQABworker worker@concourse\n".to_vec(),
            PrivateKeyRef::new(WORKER_PRIVATE_KEY_PATH),
        );
        state.keypair = Some(keypair.clone());
        state.generated = state.generated.saturating_add(1);
        Ok(keypair)
    }
}

#[derive(Debug, Default)]
struct RelationState {
    peer_app_data: BTreeMap<String, String>,
    unit_data: BTreeMap<String, String>,
    writes: usize,
    departed: BTreeSet<String>,
    fail_reads: bool,
}

/// Relation whose peer data is set directly and whose local public key is
/// whatever the paired key store holds.
#[derive(Debug)]
pub struct InMemoryRelation {
    keys: Arc<InMemoryKeyStore>,
    state: Mutex<RelationState>,
}

impl InMemoryRelation {
    pub fn new(keys: Arc<InMemoryKeyStore>) -> Self {
        Self {
            keys,
            state: Mutex::new(RelationState::default()),
        }
    }

    /// Publish `TSA_HOST` as the coordinator.
    pub async fn set_peer_host(&self, host: &str) {
        self.set_peer_value(TSA_HOST_KEY, host).await;
    }

    /// Publish `CONCOURSE_TSA_HOST_KEY_PUB` as the coordinator.
    pub async fn set_peer_host_key(&self, key: &str) {
        self.set_peer_value(TSA_HOST_KEY_PUB_KEY, key).await;
    }

    /// Publish an arbitrary coordinator application value.
    pub async fn set_peer_value(&self, key: &str, value: &str) {
        self.state
            .lock()
            .await
            .peer_app_data
            .insert(key.to_string(), value.to_string());
    }

    /// This unit's side of the relation, as the peer sees it.
    pub async fn unit_data(&self) -> BTreeMap<String, String> {
        self.state.lock().await.unit_data.clone()
    }

    /// The published `WORKER_KEY_PUB`, if any.
    pub async fn published_key(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .unit_data
            .get(WORKER_KEY_PUB_KEY)
            .cloned()
    }

    /// Number of `publish_local` calls.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    /// Remove the relation `id`; reads of its data fail from now on.
    pub async fn depart(&self, id: &str) {
        self.state.lock().await.departed.insert(id.to_string());
    }

    /// Make every peer data read fail.
    pub async fn fail_reads(&self, fail: bool) {
        self.state.lock().await.fail_reads = fail;
    }
}

#[async_trait]
impl RelationFacts for InMemoryRelation {
    async fn read_local_public_key(&self) -> worker_core::Result<Option<Vec<u8>>> {
        Ok(self
            .keys
            .keypair()
            .await
            .map(|keypair| keypair.public_key().to_vec()))
    }

    async fn read_peer_facts(&self, relation: &Relation) -> worker_core::Result<PeerFacts> {
        let state = self.state.lock().await;
        if state.fail_reads || state.departed.contains(&relation.id) {
            return Err(worker_core::Error::command_failed(
                format!("relation-get -r {}", relation.id),
                "relation not found",
            ));
        }
        Ok(PeerFacts::from_app_data(&state.peer_app_data))
    }

    async fn is_established(&self, relation: &Relation) -> worker_core::Result<bool> {
        Ok(!self.state.lock().await.departed.contains(&relation.id))
    }

    async fn publish_local(
        &self,
        _relation: &Relation,
        announcement: &LocalAnnouncement,
    ) -> worker_core::Result<()> {
        let mut state = self.state.lock().await;
        state.unit_data.extend(announcement.to_unit_data());
        state.writes = state.writes.saturating_add(1);
        Ok(())
    }
}

/// Status sink that keeps every reported status.
#[derive(Debug, Default)]
pub struct RecordingStatus {
    history: Mutex<Vec<UnitHealth>>,
}

impl RecordingStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn history(&self) -> Vec<UnitHealth> {
        self.history.lock().await.clone()
    }

    pub async fn last(&self) -> Option<UnitHealth> {
        self.history.lock().await.last().cloned()
    }
}

#[async_trait]
impl StatusSink for RecordingStatus {
    async fn set_status(&self, health: &UnitHealth) -> worker_core::Result<()> {
        self.history.lock().await.push(health.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_store_generates_once() {
        let keys = InMemoryKeyStore::new();
        let first = keys.ensure_keypair().await.ok();
        let second = keys.ensure_keypair().await.ok();
        assert_eq!(first, second);
        assert_eq!(keys.generated_count().await, 1);
    }

    #[tokio::test]
    async fn test_existing_keypair_is_returned_while_offline() {
        let keys = InMemoryKeyStore::with_keypair(b"ssh-rsa existing".to_vec());
        keys.set_available(false).await;
        let keypair = keys.ensure_keypair().await.ok();
        assert_eq!(
            keypair.as_ref().map(Keypair::public_key),
            Some(&b"ssh-rsa existing"[..])
        );
        assert_eq!(keys.generated_count().await, 0);
    }

    #[tokio::test]
    async fn test_supervisor_start_requires_declared_service() {
        let supervisor = InMemorySupervisor::new();
        assert!(supervisor.start("concourse-worker").await.is_err());
        assert!(!supervisor.running("concourse-worker").await);
    }

    #[tokio::test]
    async fn test_supervisor_offline() {
        let supervisor = InMemorySupervisor::new();
        supervisor.set_available(false).await;
        let result = supervisor.get_declared_services().await;
        assert!(matches!(result, Err(SupervisorError::RuntimeUnavailable { .. })));
    }
}
