//! Hook dispatch with deferred-event redelivery.
//!
//! Each invocation loads the controller state, redelivers every deferred event
//! in order, then delivers the event of the current hook. Redelivered events
//! that defer again or fail stay queued; the state is saved before returning,
//! including when a handler fails.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use worker_core::{Relation, UnitHealth};
use worker_reconciler::{HandlerOutcome, ReconcilePhase, Reconciler, ReconcilerBuilder, WorkerEvent};

use crate::state::{ControllerState, EventQueue, StateStore};

/// Hooks that trigger a configuration pass.
const CONFIG_HOOKS: &[&str] = &["config-changed", "install", "upgrade-charm"];

/// Errors raised while dispatching.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to load or save controller state: {0}")]
    State(#[from] worker_core::Error),

    #[error("failed to assemble reconciler: {0}")]
    Setup(#[source] worker_reconciler::Error),

    #[error("handling {event} failed: {source}")]
    Handler {
        event: String,
        #[source]
        source: worker_reconciler::Error,
    },

    #[error("hook {hook} requires {variable}")]
    MissingHookContext { hook: String, variable: &'static str },
}

/// Hook invocation context, as exported by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookContext {
    /// `JUJU_DISPATCH_PATH`, e.g. `hooks/config-changed`.
    pub dispatch_path: Option<String>,
    /// `JUJU_RELATION_ID`, e.g. `concourse-worker:3`.
    pub relation_id: Option<String>,
    /// `JUJU_REMOTE_APP`.
    pub remote_app: Option<String>,
}

impl HookContext {
    /// Read the context from the process environment.
    pub fn from_env() -> Self {
        Self {
            dispatch_path: non_empty_var("JUJU_DISPATCH_PATH"),
            relation_id: non_empty_var("JUJU_RELATION_ID"),
            remote_app: non_empty_var("JUJU_REMOTE_APP"),
        }
    }

    /// Hook name: the last component of the dispatch path.
    pub fn hook_name(&self) -> Option<&str> {
        self.dispatch_path
            .as_deref()
            .and_then(|path| path.rsplit('/').next())
            .filter(|name| !name.is_empty())
    }

    /// Event delivered by this hook, if any.
    ///
    /// # Errors
    ///
    /// `MissingHookContext` if a relation hook lacks its relation id or remote
    /// application.
    pub fn event(&self, relation_name: &str) -> Result<Option<WorkerEvent>, DispatchError> {
        let Some(hook) = self.hook_name() else {
            return Ok(None);
        };

        if CONFIG_HOOKS.contains(&hook) || hook.ends_with("-pebble-ready") {
            return Ok(Some(WorkerEvent::ConfigChanged));
        }

        if hook == format!("{relation_name}-relation-changed") {
            let missing = |variable: &'static str| DispatchError::MissingHookContext {
                hook: hook.to_string(),
                variable,
            };
            let id = self.relation_id.clone().ok_or_else(|| missing("JUJU_RELATION_ID"))?;
            let app = self.remote_app.clone().ok_or_else(|| missing("JUJU_REMOTE_APP"))?;
            return Ok(Some(WorkerEvent::RelationChanged {
                relation: Relation::new(relation_name, id, app),
            }));
        }

        Ok(None)
    }
}

/// Whether a configuration pass is owed after `event` finished with `outcome`.
fn still_stale(stale: bool, event: &WorkerEvent, outcome: &HandlerOutcome) -> bool {
    match event {
        WorkerEvent::ConfigChanged => false,
        WorkerEvent::RelationChanged { .. } => stale || *outcome == HandlerOutcome::Proceed,
    }
}

/// Keep the first failure; later ones are only logged.
fn record(failure: &mut Option<DispatchError>, error: DispatchError) {
    warn!(error = %error, "Handler failed");
    if failure.is_none() {
        *failure = Some(error);
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// One handler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub event: WorkerEvent,
    pub outcome: HandlerOutcome,
}

/// Summary of a dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handler runs in execution order.
    pub deliveries: Vec<Delivery>,
    /// Phase the reconciler stopped in.
    pub phase: ReconcilePhase,
    /// Last health reported, if any handler reported one.
    pub health: Option<UnitHealth>,
    /// Events left for the next invocation.
    pub deferred: usize,
}

/// Delivers events to a [`Reconciler`] and keeps the deferred queue.
pub struct Dispatcher {
    reconciler: Reconciler,
    store: Arc<dyn StateStore>,
    deferred: EventQueue,
}

impl Dispatcher {
    /// Load state from `store` and finish assembling the reconciler with the
    /// persisted peer facts.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or a collaborator is
    /// missing from `builder`.
    pub fn new(
        builder: ReconcilerBuilder,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, DispatchError> {
        let state = store.load()?;
        let reconciler = builder
            .with_peer_facts(state.peer_facts)
            .build()
            .map_err(DispatchError::Setup)?;
        Ok(Self {
            reconciler,
            store,
            deferred: state.deferred,
        })
    }

    pub const fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub const fn deferred(&self) -> &EventQueue {
        &self.deferred
    }

    /// Redeliver deferred events, then deliver `event`.
    ///
    /// A relation change that proceeds is followed by a configuration pass, so
    /// newly learned facts take effect in the same invocation. A handler
    /// failure stops only its own event: the remaining events still run.
    ///
    /// # Errors
    ///
    /// Returns the first handler failure, after saving state. A deferred event
    /// whose redelivery fails stays queued in its place, unless its relation
    /// has departed, in which case it is dropped.
    pub async fn dispatch(
        &mut self,
        event: Option<WorkerEvent>,
    ) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::default();
        let mut pending: VecDeque<WorkerEvent> = self.deferred.drain().into();
        let mut config_stale = false;
        let mut failure = None;

        if !pending.is_empty() {
            info!(count = pending.len(), "Redelivering deferred events");
        }
        while let Some(deferred) = pending.pop_front() {
            match self.deliver(&deferred, &mut report).await {
                Ok(outcome) => config_stale = still_stale(config_stale, &deferred, &outcome),
                Err(e) => {
                    if self.departed(&deferred).await {
                        info!(event = %deferred, error = %e, "Dropping event of departed relation");
                    } else {
                        self.deferred.push(deferred);
                        record(&mut failure, e);
                    }
                }
            }
        }

        if let Some(event) = event {
            match self.deliver(&event, &mut report).await {
                Ok(outcome) => config_stale = still_stale(config_stale, &event, &outcome),
                Err(e) => record(&mut failure, e),
            }
        }

        if config_stale {
            debug!("Relation facts changed, running configuration pass");
            if let Err(e) = self.deliver(&WorkerEvent::ConfigChanged, &mut report).await {
                record(&mut failure, e);
            }
        }

        self.save()?;
        if let Some(error) = failure {
            return Err(error);
        }
        report.phase = self.reconciler.phase();
        report.health = self.reconciler.health().cloned();
        report.deferred = self.deferred.len();
        Ok(report)
    }

    async fn departed(&self, event: &WorkerEvent) -> bool {
        self.reconciler
            .is_departed(event)
            .await
            .inspect_err(|e| warn!(event = %event, error = %e, "Relation lookup failed"))
            .unwrap_or(false)
    }

    async fn deliver(
        &mut self,
        event: &WorkerEvent,
        report: &mut DispatchReport,
    ) -> Result<HandlerOutcome, DispatchError> {
        let outcome = self
            .reconciler
            .handle(event)
            .await
            .map_err(|source| DispatchError::Handler {
                event: event.to_string(),
                source,
            })?;

        if outcome.is_deferred() {
            self.deferred.push(event.clone());
        } else {
            self.deferred.remove(event);
        }
        report.deliveries.push(Delivery {
            event: event.clone(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    /// State as it would be persisted now.
    pub fn state(&self) -> ControllerState {
        ControllerState {
            peer_facts: self.reconciler.peer_facts().clone(),
            deferred: self.deferred.clone(),
            last_dispatch: Some(Utc::now()),
        }
    }

    fn save(&self) -> Result<(), DispatchError> {
        self.store.save(&self.state())?;
        Ok(())
    }
}
