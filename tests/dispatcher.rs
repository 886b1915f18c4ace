//! Dispatcher behaviour across hook invocations.
//!
//! These tests verify that:
//! - Deferred events are redelivered before the current event
//! - Peer facts survive between invocations through the state file
//! - Fatal handler errors still leave consistent state behind

#![forbid(clippy::unwrap_used)]
#![forbid(clippy::expect_used)]
#![forbid(clippy::panic)]

use std::error::Error;
use std::sync::Arc;

use concourse_worker_operator::{
    ControllerState, DispatchError, Dispatcher, JsonFileStateStore, StateStore,
};
use tempfile::TempDir;
use worker_core::names::{BLOCKED_NO_COORDINATOR, TSA_HOST_KEY_PATH};
use worker_core::{PeerFacts, Relation, UnitHealth};
use worker_reconciler::memory::{
    InMemoryKeyStore, InMemoryRelation, InMemorySupervisor, RecordingStatus, SupervisorCall,
};
use worker_reconciler::{HandlerOutcome, ReconcilePhase, ReconcilerBuilder, WorkerEvent};

type TestResult = Result<(), Box<dyn Error>>;

struct Unit {
    _dir: TempDir,
    store: Arc<JsonFileStateStore>,
    keys: Arc<InMemoryKeyStore>,
    relation: Arc<InMemoryRelation>,
    supervisor: Arc<InMemorySupervisor>,
    status: Arc<RecordingStatus>,
}

impl Unit {
    fn new(keys: InMemoryKeyStore) -> Result<Self, Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonFileStateStore::new(dir.path().join("state.json")));
        let keys = Arc::new(keys);
        Ok(Self {
            _dir: dir,
            store,
            relation: Arc::new(InMemoryRelation::new(keys.clone())),
            keys,
            supervisor: Arc::new(InMemorySupervisor::new()),
            status: Arc::new(RecordingStatus::new()),
        })
    }

    /// A fresh dispatcher, as a new hook invocation would build it.
    fn invocation(&self) -> Result<Dispatcher, DispatchError> {
        let builder = ReconcilerBuilder::new()
            .with_key_store(self.keys.clone())
            .with_relations(self.relation.clone())
            .with_supervisor(self.supervisor.clone())
            .with_status(self.status.clone());
        Dispatcher::new(builder, self.store.clone())
    }
}

fn coordinator() -> WorkerEvent {
    WorkerEvent::RelationChanged {
        relation: Relation::new("concourse-worker", "concourse-worker:1", "concourse-web"),
    }
}

async fn publish_coordinator(unit: &Unit) {
    unit.relation.set_peer_host("tsa.example.internal").await;
    unit.relation.set_peer_host_key("ssh-rsa AAAA tsa\n").await;
}

#[tokio::test]
async fn test_fresh_unit_blocks_and_persists() -> TestResult {
    let unit = Unit::new(InMemoryKeyStore::new())?;

    let report = unit
        .invocation()?
        .dispatch(Some(WorkerEvent::ConfigChanged))
        .await?;

    assert_eq!(report.phase, ReconcilePhase::Blocked);
    assert_eq!(
        report.health,
        Some(UnitHealth::blocked(BLOCKED_NO_COORDINATOR))
    );
    assert_eq!(report.deferred, 0);

    let state = unit.store.load()?;
    assert!(state.deferred.is_empty());
    assert!(state.last_dispatch.is_some());
    Ok(())
}

#[tokio::test]
async fn test_relation_change_configures_worker_in_same_invocation() -> TestResult {
    let unit = Unit::new(InMemoryKeyStore::with_keypair("ssh-ed25519 AAAA worker"))?;
    publish_coordinator(&unit).await;

    let report = unit.invocation()?.dispatch(Some(coordinator())).await?;

    let handled: Vec<_> = report.deliveries.iter().map(|d| d.event.clone()).collect();
    assert_eq!(handled, vec![coordinator(), WorkerEvent::ConfigChanged]);
    assert_eq!(report.health, Some(UnitHealth::Active));
    assert!(unit.supervisor.running("concourse-worker").await);
    assert_eq!(
        unit.relation.published_key().await.as_deref(),
        Some("ssh-ed25519 AAAA worker")
    );
    Ok(())
}

#[tokio::test]
async fn test_peer_facts_survive_invocations() -> TestResult {
    let unit = Unit::new(InMemoryKeyStore::with_keypair("ssh-ed25519 AAAA worker"))?;
    publish_coordinator(&unit).await;
    unit.invocation()?.dispatch(Some(coordinator())).await?;

    let persisted = unit.store.load()?;
    assert_eq!(
        persisted.peer_facts.coordinator_host.as_deref(),
        Some("tsa.example.internal")
    );

    unit.supervisor.clear_calls().await;
    let report = unit
        .invocation()?
        .dispatch(Some(WorkerEvent::ConfigChanged))
        .await?;

    assert_eq!(report.health, Some(UnitHealth::Active));
    assert!(unit.supervisor.calls().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_relation_before_key_is_redelivered_after_key_exists() -> TestResult {
    let unit = Unit::new(InMemoryKeyStore::new())?;
    publish_coordinator(&unit).await;

    let first = unit.invocation()?.dispatch(Some(coordinator())).await?;
    assert_eq!(first.deferred, 1);
    assert_eq!(unit.relation.write_count().await, 0);

    // config-changed generates the key after the queued relation event ran.
    let second = unit
        .invocation()?
        .dispatch(Some(WorkerEvent::ConfigChanged))
        .await?;
    let outcomes: Vec<_> = second.deliveries.iter().map(|d| d.outcome.is_deferred()).collect();
    assert_eq!(outcomes, vec![true, false]);
    assert_eq!(second.phase, ReconcilePhase::Blocked);
    assert_eq!(unit.keys.generated_count().await, 1);

    // Next hook of any kind: the relation event proceeds and configures.
    let third = unit.invocation()?.dispatch(None).await?;
    assert_eq!(third.deferred, 0);
    assert_eq!(third.health, Some(UnitHealth::Active));
    assert!(unit.relation.published_key().await.is_some());
    Ok(())
}

#[tokio::test]
async fn test_repeated_defers_do_not_grow_queue() -> TestResult {
    let unit = Unit::new(InMemoryKeyStore::with_keypair("ssh-ed25519 AAAA worker"))?;
    publish_coordinator(&unit).await;
    unit.invocation()?.dispatch(Some(coordinator())).await?;

    unit.supervisor.set_available(false).await;
    for _ in 0..3 {
        let report = unit
            .invocation()?
            .dispatch(Some(WorkerEvent::ConfigChanged))
            .await?;
        assert_eq!(report.deferred, 1);
    }
    assert_eq!(unit.store.load()?.deferred.len(), 1);

    unit.supervisor.set_available(true).await;
    let report = unit.invocation()?.dispatch(None).await?;
    assert_eq!(report.deferred, 0);
    assert_eq!(
        report.deliveries.first().map(|d| d.outcome.clone()),
        Some(HandlerOutcome::Proceed)
    );
    Ok(())
}

#[tokio::test]
async fn test_failed_redelivery_stays_queued_in_order() -> TestResult {
    let unit = Unit::new(InMemoryKeyStore::with_keypair("ssh-ed25519 AAAA worker"))?;
    unit.supervisor
        .put_file(TSA_HOST_KEY_PATH, b"ssh-rsa AAAA tsa\n".to_vec())
        .await;
    unit.supervisor.fail_start(true).await;

    let mut seeded = ControllerState {
        peer_facts: PeerFacts::new()
            .with_host("tsa.example.internal")
            .with_host_key(b"ssh-rsa AAAA tsa\n".to_vec()),
        ..ControllerState::default()
    };
    seeded.deferred.push(WorkerEvent::ConfigChanged);
    seeded.deferred.push(coordinator());
    unit.store.save(&seeded)?;

    let result = unit.invocation()?.dispatch(None).await;
    assert!(matches!(result, Err(DispatchError::Handler { .. })));

    let state = unit.store.load()?;
    let queued: Vec<_> = state.deferred.iter().cloned().collect();
    assert_eq!(queued, vec![WorkerEvent::ConfigChanged, coordinator()]);
    assert_eq!(state.peer_facts, seeded.peer_facts);
    assert_eq!(
        unit.supervisor.calls().await.last(),
        Some(&SupervisorCall::Start("concourse-worker".to_string()))
    );
    Ok(())
}

#[tokio::test]
async fn test_failing_relation_does_not_block_config_changed() -> TestResult {
    let unit = Unit::new(InMemoryKeyStore::with_keypair("ssh-ed25519 AAAA worker"))?;
    unit.relation.fail_reads(true).await;
    let mut seeded = ControllerState::default();
    seeded.deferred.push(coordinator());
    unit.store.save(&seeded)?;

    for round in 1..=3 {
        let result = unit
            .invocation()?
            .dispatch(Some(WorkerEvent::ConfigChanged))
            .await;
        assert!(matches!(result, Err(DispatchError::Handler { .. })));
        assert_eq!(unit.status.history().await.len(), round);
        assert_eq!(unit.store.load()?.deferred.len(), 1);
    }
    assert_eq!(
        unit.status.last().await,
        Some(UnitHealth::blocked(BLOCKED_NO_COORDINATOR))
    );

    // Once reads work again the queued event proceeds.
    unit.relation.fail_reads(false).await;
    publish_coordinator(&unit).await;
    let report = unit.invocation()?.dispatch(None).await?;
    assert_eq!(report.deferred, 0);
    assert_eq!(report.health, Some(UnitHealth::Active));
    Ok(())
}

#[tokio::test]
async fn test_event_of_departed_relation_is_dropped() -> TestResult {
    let unit = Unit::new(InMemoryKeyStore::with_keypair("ssh-ed25519 AAAA worker"))?;
    unit.relation.depart("concourse-worker:1").await;
    let mut seeded = ControllerState::default();
    seeded.deferred.push(coordinator());
    unit.store.save(&seeded)?;

    let report = unit
        .invocation()?
        .dispatch(Some(WorkerEvent::ConfigChanged))
        .await?;

    let handled: Vec<_> = report.deliveries.iter().map(|d| d.event.clone()).collect();
    assert_eq!(handled, vec![WorkerEvent::ConfigChanged]);
    assert_eq!(report.deferred, 0);
    assert!(unit.store.load()?.deferred.is_empty());
    assert_eq!(
        report.health,
        Some(UnitHealth::blocked(BLOCKED_NO_COORDINATOR))
    );
    Ok(())
}

#[tokio::test]
async fn test_unhandled_hook_only_redelivers() -> TestResult {
    let unit = Unit::new(InMemoryKeyStore::new())?;
    let report = unit.invocation()?.dispatch(None).await?;
    assert!(report.deliveries.is_empty());
    assert_eq!(report.health, None);
    assert!(unit.status.history().await.is_empty());
    Ok(())
}
