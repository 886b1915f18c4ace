//! Reconciler implementation.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};
use worker_core::names::{
    BLOCKED_NO_COORDINATOR, BLOCKED_NO_HOST_KEY, SERVICE_NAME, TSA_HOST_KEY_PATH,
};
use worker_core::{LocalAnnouncement, PeerFacts, Relation, UnitHealth};

use crate::config_builder;
use crate::contracts::{KeyStore, ProcessSupervisor, RelationFacts, StatusSink};
use crate::error::{Error, KeyStoreError, Result, SupervisorError};
use crate::types::{HandlerOutcome, ObservedProcessState, ReconcilePhase, WorkerEvent};

/// Reconciler for the managed Concourse worker.
///
/// Handlers take `&mut self`: one event is handled to completion (or to a
/// defer point) before the next one starts.
pub struct Reconciler {
    keys: Arc<dyn KeyStore>,
    relations: Arc<dyn RelationFacts>,
    supervisor: Arc<dyn ProcessSupervisor>,
    status: Arc<dyn StatusSink>,
    /// Persisted coordinator facts.
    peer_facts: PeerFacts,
    phase: ReconcilePhase,
    health: Option<UnitHealth>,
}

impl Reconciler {
    /// Create a new reconciler starting from previously persisted facts.
    pub fn new(
        keys: Arc<dyn KeyStore>,
        relations: Arc<dyn RelationFacts>,
        supervisor: Arc<dyn ProcessSupervisor>,
        status: Arc<dyn StatusSink>,
        peer_facts: PeerFacts,
    ) -> Self {
        Self {
            keys,
            relations,
            supervisor,
            status,
            peer_facts,
            phase: ReconcilePhase::default(),
            health: None,
        }
    }

    /// Route an event to its handler.
    ///
    /// # Errors
    ///
    /// Propagates handler failures.
    pub async fn handle(&mut self, event: &WorkerEvent) -> Result<HandlerOutcome> {
        debug!(event = %event, "Handling event");
        let outcome = match event {
            WorkerEvent::ConfigChanged => self.on_config_changed().await?,
            WorkerEvent::RelationChanged { relation } => {
                self.on_peer_relation_changed(relation).await?
            }
        };
        if let HandlerOutcome::Defer { reason } = &outcome {
            info!(event = %event, phase = %self.phase, reason = %reason, "Deferring event");
        }
        Ok(outcome)
    }

    /// Whether `event` refers to a relation that no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the relation cannot be looked up.
    pub async fn is_departed(&self, event: &WorkerEvent) -> Result<bool> {
        match event {
            WorkerEvent::ConfigChanged => Ok(false),
            WorkerEvent::RelationChanged { relation } => self
                .relations
                .is_established(relation)
                .await
                .map(|established| !established)
                .map_err(|e| Error::relation(relation.id.clone(), e)),
        }
    }

    /// Take in the coordinator's facts and announce our public key.
    ///
    /// # Errors
    ///
    /// Returns an error if relation data cannot be read or written, or the
    /// host key write is refused.
    pub async fn on_peer_relation_changed(&mut self, relation: &Relation) -> Result<HandlerOutcome> {
        let relation_error = |e: worker_core::Error| Error::relation(relation.id.clone(), e);

        let Some(public_key) = self
            .relations
            .read_local_public_key()
            .await
            .map_err(relation_error)?
        else {
            self.phase = ReconcilePhase::AwaitingKey;
            return Ok(HandlerOutcome::defer(
                "worker public key has not been generated yet",
            ));
        };

        let facts = self
            .relations
            .read_peer_facts(relation)
            .await
            .map_err(relation_error)?;
        let (Some(host), Some(host_key)) = (facts.coordinator_host, facts.coordinator_host_key)
        else {
            self.phase = if self.peer_facts.coordinator_host.is_some() {
                ReconcilePhase::AwaitingPeerHostKey
            } else {
                ReconcilePhase::AwaitingPeerHost
            };
            return Ok(HandlerOutcome::defer(
                "coordinator has not published TSA_HOST and CONCOURSE_TSA_HOST_KEY_PUB yet",
            ));
        };

        match self
            .supervisor
            .materialize_file(Path::new(TSA_HOST_KEY_PATH), &host_key)
            .await
        {
            Ok(()) => {}
            Err(SupervisorError::RuntimeUnavailable { reason }) => {
                self.phase = ReconcilePhase::AwaitingRuntime;
                return Ok(HandlerOutcome::defer(format!(
                    "unable to push coordinator host key: {reason}"
                )));
            }
            Err(e) => return Err(Error::supervisor("push coordinator host key", e)),
        }

        info!(relation = %relation, host = %host, "Stored coordinator facts");
        self.peer_facts = PeerFacts {
            coordinator_host: Some(host),
            coordinator_host_key: Some(host_key),
        };

        info!(relation = %relation, "Publishing WORKER_KEY_PUB");
        self.relations
            .publish_local(relation, &LocalAnnouncement::new(public_key))
            .await
            .map_err(relation_error)?;

        self.phase = ReconcilePhase::Reconciling;
        Ok(HandlerOutcome::Proceed)
    }

    /// Converge the worker service on the desired configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation fails, the supervisor refuses a
    /// request, a stop/start fails, or status cannot be reported.
    pub async fn on_config_changed(&mut self) -> Result<HandlerOutcome> {
        // Key generation precedes the coordinator check.
        let keypair_present = match self.keys.ensure_keypair().await {
            Ok(keypair) => {
                debug!(keypair = ?keypair, "Worker keypair present");
                true
            }
            Err(KeyStoreError::Deferred { reason }) => {
                self.phase = ReconcilePhase::AwaitingKey;
                return Ok(HandlerOutcome::defer(reason));
            }
            Err(KeyStoreError::Failed(e)) => return Err(Error::KeyStore(e)),
        };

        if self.peer_facts.coordinator_host.is_none() {
            self.phase = ReconcilePhase::Blocked;
            self.report(UnitHealth::blocked(BLOCKED_NO_COORDINATOR)).await?;
            return Ok(HandlerOutcome::Proceed);
        }

        match self.supervisor.file_exists(Path::new(TSA_HOST_KEY_PATH)).await {
            Ok(true) => {}
            Ok(false) => {
                self.phase = ReconcilePhase::AwaitingPeerHostKey;
                self.report(UnitHealth::blocked(BLOCKED_NO_HOST_KEY)).await?;
                return Ok(HandlerOutcome::defer("coordinator host key not written yet"));
            }
            Err(SupervisorError::RuntimeUnavailable { reason }) => {
                return Ok(self.runtime_unavailable(&reason));
            }
            Err(e) => return Err(Error::supervisor("check coordinator host key", e)),
        }

        let desired = config_builder::build(&self.peer_facts, keypair_present);
        if let Some(missing) = desired.missing_inputs().first() {
            self.phase = ReconcilePhase::AwaitingPeerHostKey;
            return Ok(HandlerOutcome::defer(format!("missing {missing}")));
        }

        let observed = match self.observe(desired.service_name()).await {
            Ok(observed) => observed,
            Err(SupervisorError::RuntimeUnavailable { reason }) => {
                return Ok(self.runtime_unavailable(&reason));
            }
            Err(e) => return Err(Error::supervisor("read plan", e)),
        };

        self.phase = ReconcilePhase::Reconciling;
        let service = desired.service_name();
        if observed.declared_services.get(service) == desired.service() {
            debug!(service, "Service declaration unchanged");
        } else {
            match self.supervisor.apply_layer(SERVICE_NAME, desired.layer()).await {
                Ok(()) => info!(service, "Added updated layer"),
                Err(SupervisorError::RuntimeUnavailable { reason }) => {
                    return Ok(self.runtime_unavailable(&reason));
                }
                Err(e) => return Err(Error::supervisor("add layer", e)),
            }
            self.restart(service, observed.running).await?;
        }

        self.report(UnitHealth::Active).await?;
        Ok(HandlerOutcome::Proceed)
    }

    /// Stop (when running) then start the managed service.
    async fn restart(&self, service: &str, running: bool) -> Result<()> {
        if running {
            self.supervisor
                .stop(service)
                .await
                .map_err(|e| Error::supervisor("stop", e))
                .inspect_err(|e| warn!(service, error = %e, "Stop failed"))?;
        }
        self.supervisor
            .start(service)
            .await
            .map_err(|e| Error::supervisor("start", e))
            .inspect_err(|e| warn!(service, error = %e, "Start failed"))?;
        info!(service, was_running = running, "Restarted service");
        Ok(())
    }

    async fn observe(
        &self,
        service: &str,
    ) -> std::result::Result<ObservedProcessState, SupervisorError> {
        let declared_services = self.supervisor.get_declared_services().await?;
        let running = self.supervisor.is_running(service).await?;
        Ok(ObservedProcessState {
            declared_services,
            running,
        })
    }

    fn runtime_unavailable(&mut self, reason: &str) -> HandlerOutcome {
        self.phase = ReconcilePhase::AwaitingRuntime;
        HandlerOutcome::defer(format!("unable to reach the container runtime: {reason}"))
    }

    async fn report(&mut self, health: UnitHealth) -> Result<()> {
        self.status.set_status(&health).await.map_err(Error::Status)?;
        if health.is_active() {
            self.phase = ReconcilePhase::Active;
        }
        debug!(health = %health, "Reported unit status");
        self.health = Some(health);
        Ok(())
    }

    /// Coordinator facts to persist.
    pub const fn peer_facts(&self) -> &PeerFacts {
        &self.peer_facts
    }

    /// Phase the last handler stopped in.
    pub const fn phase(&self) -> ReconcilePhase {
        self.phase
    }

    /// Health reported by the last handler that reported one.
    pub const fn health(&self) -> Option<&UnitHealth> {
        self.health.as_ref()
    }
}

/// Builder for Reconciler.
#[derive(Default)]
pub struct ReconcilerBuilder {
    keys: Option<Arc<dyn KeyStore>>,
    relations: Option<Arc<dyn RelationFacts>>,
    supervisor: Option<Arc<dyn ProcessSupervisor>>,
    status: Option<Arc<dyn StatusSink>>,
    peer_facts: PeerFacts,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the key store.
    #[must_use]
    pub fn with_key_store(mut self, keys: Arc<dyn KeyStore>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Set the relation data source.
    #[must_use]
    pub fn with_relations(mut self, relations: Arc<dyn RelationFacts>) -> Self {
        self.relations = Some(relations);
        self
    }

    /// Set the process supervisor.
    #[must_use]
    pub fn with_supervisor(mut self, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Set the status sink.
    #[must_use]
    pub fn with_status(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = Some(status);
        self
    }

    /// Resume from persisted coordinator facts.
    #[must_use]
    pub fn with_peer_facts(mut self, peer_facts: PeerFacts) -> Self {
        self.peer_facts = peer_facts;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns an error if a collaborator is missing.
    pub fn build(self) -> Result<Reconciler> {
        let keys = self
            .keys
            .ok_or_else(|| Error::invalid_config("key store is required"))?;
        let relations = self
            .relations
            .ok_or_else(|| Error::invalid_config("relation source is required"))?;
        let supervisor = self
            .supervisor
            .ok_or_else(|| Error::invalid_config("process supervisor is required"))?;
        let status = self
            .status
            .ok_or_else(|| Error::invalid_config("status sink is required"))?;

        Ok(Reconciler::new(
            keys,
            relations,
            supervisor,
            status,
            self.peer_facts,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        InMemoryKeyStore, InMemoryRelation, InMemorySupervisor, RecordingStatus, SupervisorCall,
    };

    struct Fixture {
        keys: Arc<InMemoryKeyStore>,
        relation: Arc<InMemoryRelation>,
        supervisor: Arc<InMemorySupervisor>,
        status: Arc<RecordingStatus>,
    }

    impl Fixture {
        fn new() -> Self {
            let keys = Arc::new(InMemoryKeyStore::new());
            Self {
                relation: Arc::new(InMemoryRelation::new(keys.clone())),
                keys,
                supervisor: Arc::new(InMemorySupervisor::new()),
                status: Arc::new(RecordingStatus::new()),
            }
        }

        fn reconciler(&self, peer_facts: PeerFacts) -> Reconciler {
            Reconciler::new(
                self.keys.clone(),
                self.relation.clone(),
                self.supervisor.clone(),
                self.status.clone(),
                peer_facts,
            )
        }
    }

    fn relation() -> Relation {
        Relation::new("concourse-worker", "concourse-worker:0", "concourse-web")
    }

    #[tokio::test]
    async fn test_config_changed_defers_until_runtime_holds_binary() {
        let fx = Fixture::new();
        fx.keys.set_available(false).await;
        let mut reconciler = fx.reconciler(PeerFacts::new());

        let outcome = reconciler.on_config_changed().await;
        assert!(outcome.map(|o| o.is_deferred()).unwrap_or(false));
        assert_eq!(reconciler.phase(), ReconcilePhase::AwaitingKey);
        assert!(fx.status.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_config_changed_generates_key_while_blocked() {
        let fx = Fixture::new();
        let mut reconciler = fx.reconciler(PeerFacts::new());

        let outcome = reconciler.on_config_changed().await;
        assert_eq!(outcome.ok(), Some(HandlerOutcome::Proceed));
        assert_eq!(fx.keys.generated_count().await, 1);
        assert_eq!(
            fx.status.last().await,
            Some(UnitHealth::blocked("Relation required with coordinator"))
        );
        assert_eq!(reconciler.phase(), ReconcilePhase::Blocked);
    }

    #[tokio::test]
    async fn test_config_changed_blocks_and_defers_without_host_key_file() {
        let fx = Fixture::new();
        let mut reconciler = fx.reconciler(PeerFacts::new().with_host("tsa"));

        let outcome = reconciler.on_config_changed().await;
        assert!(outcome.map(|o| o.is_deferred()).unwrap_or(false));
        assert_eq!(
            fx.status.last().await,
            Some(UnitHealth::blocked("Waiting for CONCOURSE_TSA_PUBLIC_KEY"))
        );
        // This path only checks for the file, never writes it.
        assert!(fx.supervisor.file(TSA_HOST_KEY_PATH).await.is_none());
        assert!(fx.supervisor.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_config_changed_defers_when_plan_unreachable() {
        let fx = Fixture::new();
        fx.supervisor
            .put_file(TSA_HOST_KEY_PATH, b"ssh-rsa tsa".to_vec())
            .await;
        fx.supervisor.set_available(false).await;
        let facts = PeerFacts::new().with_host("tsa").with_host_key(b"ssh-rsa tsa".to_vec());
        let mut reconciler = fx.reconciler(facts);

        let outcome = reconciler.on_config_changed().await;
        assert!(outcome.map(|o| o.is_deferred()).unwrap_or(false));
        assert_eq!(reconciler.phase(), ReconcilePhase::AwaitingRuntime);
    }

    #[tokio::test]
    async fn test_start_failure_propagates() {
        let fx = Fixture::new();
        fx.supervisor
            .put_file(TSA_HOST_KEY_PATH, b"ssh-rsa tsa".to_vec())
            .await;
        fx.supervisor.fail_start(true).await;
        let facts = PeerFacts::new().with_host("tsa").with_host_key(b"ssh-rsa tsa".to_vec());
        let mut reconciler = fx.reconciler(facts);

        let outcome = reconciler.on_config_changed().await;
        assert!(matches!(outcome, Err(Error::Supervisor { .. })));
        assert_ne!(fx.status.last().await, Some(UnitHealth::Active));
    }

    #[tokio::test]
    async fn test_relation_changed_stores_facts_and_publishes() {
        let fx = Fixture::new();
        let _ = fx.keys.ensure_keypair().await;
        fx.relation.set_peer_host("tsa.example.internal").await;
        fx.relation.set_peer_host_key("ssh-rsa tsa").await;
        let mut reconciler = fx.reconciler(PeerFacts::new());

        let outcome = reconciler.on_peer_relation_changed(&relation()).await;
        assert_eq!(outcome.ok(), Some(HandlerOutcome::Proceed));
        assert_eq!(
            reconciler.peer_facts().coordinator_host.as_deref(),
            Some("tsa.example.internal")
        );
        assert_eq!(
            fx.supervisor.file(TSA_HOST_KEY_PATH).await,
            Some(b"ssh-rsa tsa".to_vec())
        );
        assert!(fx.relation.published_key().await.is_some());
    }

    #[tokio::test]
    async fn test_relation_changed_defers_on_partial_peer_data() {
        let fx = Fixture::new();
        let _ = fx.keys.ensure_keypair().await;
        fx.relation.set_peer_host("tsa.example.internal").await;
        let mut reconciler = fx.reconciler(PeerFacts::new());

        let outcome = reconciler.on_peer_relation_changed(&relation()).await;
        assert!(outcome.map(|o| o.is_deferred()).unwrap_or(false));
        assert_eq!(reconciler.peer_facts(), &PeerFacts::new());
        assert_eq!(fx.relation.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_relation_changed_defers_on_host_key_without_host() {
        let fx = Fixture::new();
        let _ = fx.keys.ensure_keypair().await;
        fx.relation.set_peer_host_key("ssh-rsa tsa").await;
        let mut reconciler = fx.reconciler(PeerFacts::new());

        let outcome = reconciler.on_peer_relation_changed(&relation()).await;
        assert!(outcome.map(|o| o.is_deferred()).unwrap_or(false));
        assert_eq!(reconciler.phase(), ReconcilePhase::AwaitingPeerHost);
        assert_eq!(reconciler.peer_facts(), &PeerFacts::new());
        assert!(fx.supervisor.calls().await.is_empty());
        assert!(fx.supervisor.file(TSA_HOST_KEY_PATH).await.is_none());
        assert_eq!(fx.relation.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_departed_relation_detected() {
        let fx = Fixture::new();
        let reconciler = fx.reconciler(PeerFacts::new());
        let event = WorkerEvent::RelationChanged { relation: relation() };

        assert!(matches!(reconciler.is_departed(&event).await, Ok(false)));
        fx.relation.depart("concourse-worker:0").await;
        assert!(matches!(reconciler.is_departed(&event).await, Ok(true)));
        assert!(matches!(
            reconciler.is_departed(&WorkerEvent::ConfigChanged).await,
            Ok(false)
        ));
    }

    #[tokio::test]
    async fn test_relation_changed_defers_when_push_unreachable() {
        let fx = Fixture::new();
        let _ = fx.keys.ensure_keypair().await;
        fx.relation.set_peer_host("tsa.example.internal").await;
        fx.relation.set_peer_host_key("ssh-rsa tsa").await;
        fx.supervisor.set_available(false).await;
        let mut reconciler = fx.reconciler(PeerFacts::new());

        let outcome = reconciler.on_peer_relation_changed(&relation()).await;
        assert!(outcome.map(|o| o.is_deferred()).unwrap_or(false));
        assert_eq!(reconciler.phase(), ReconcilePhase::AwaitingRuntime);
        assert!(reconciler.peer_facts().coordinator_host.is_none());
        assert_eq!(fx.relation.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_handle_routes_events() {
        let fx = Fixture::new();
        let mut reconciler = fx.reconciler(PeerFacts::new());

        let outcome = reconciler
            .handle(&WorkerEvent::RelationChanged { relation: relation() })
            .await;
        assert!(outcome.map(|o| o.is_deferred()).unwrap_or(false));

        let outcome = reconciler.handle(&WorkerEvent::ConfigChanged).await;
        assert_eq!(outcome.ok(), Some(HandlerOutcome::Proceed));
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let result = ReconcilerBuilder::new().build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_builder() {
        let fx = Fixture::new();
        let result = ReconcilerBuilder::new()
            .with_key_store(fx.keys.clone())
            .with_relations(fx.relation.clone())
            .with_supervisor(fx.supervisor.clone())
            .with_status(fx.status.clone())
            .with_peer_facts(PeerFacts::new().with_host("tsa"))
            .build();

        let reconciler = result.ok();
        assert_eq!(
            reconciler
                .as_ref()
                .and_then(|r| r.peer_facts().coordinator_host.clone())
                .as_deref(),
            Some("tsa")
        );
        assert!(
            fx.supervisor
                .calls()
                .await
                .iter()
                .all(|c| !matches!(c, SupervisorCall::Start(_)))
        );
    }
}
