//! # Concourse worker operator
//!
//! Entry point invoked once per hook.
//!
//! ## Invocation sequence
//!
//! 1. **Config** - Load `OperatorConfig` (defaults when no file exists)
//! 2. **Collaborators** - Pebble supervisor, key store, hook-tool adapters
//! 3. **Dispatcher** - Load persisted state and assemble the reconciler
//! 4. **Dispatch** - Redeliver deferred events, then the current one
//!
//! Handler failures exit non-zero so the platform retries the hook.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use concourse_worker_operator::cli::{Cli, Commands};
use concourse_worker_operator::hook_tools::{HookToolRelation, HookToolStatus, HookTools};
use concourse_worker_operator::keystore::FsKeyStore;
use concourse_worker_operator::{
    Dispatcher, HookContext, JsonFileStateStore, OperatorConfig, StateStore,
};
use worker_core::Relation;
use worker_pebble::{PebbleClient, PebbleConfig, PebbleSupervisor};
use worker_reconciler::{ReconcilerBuilder, WorkerEvent};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = OperatorConfig::load(cli.config.as_deref())
        .context("Failed to load operator configuration")?;
    debug!(?config, "Configuration loaded");

    let store = Arc::new(JsonFileStateStore::new(&config.state_file));

    let event = match cli.command {
        Commands::Status => return print_status(store.as_ref()),
        Commands::Dispatch => {
            let context = HookContext::from_env();
            info!(hook = context.hook_name().unwrap_or("<none>"), "Dispatching hook");
            context.event(&config.relation_name)?
        }
        Commands::ConfigChanged => Some(WorkerEvent::ConfigChanged),
        Commands::RelationChanged {
            relation_id,
            remote_app,
        } => Some(WorkerEvent::RelationChanged {
            relation: Relation::new(&config.relation_name, relation_id, remote_app),
        }),
    };

    let builder = init_reconciler(&config)?;
    let mut dispatcher =
        Dispatcher::new(builder, store).context("Failed to initialize dispatcher")?;
    let report = dispatcher.dispatch(event).await?;

    info!(
        handled = report.deliveries.len(),
        deferred = report.deferred,
        phase = %report.phase,
        "Dispatch finished"
    );
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
///
/// Logs go to stderr, which the platform captures in the unit log.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Wire the production collaborators.
fn init_reconciler(config: &OperatorConfig) -> Result<ReconcilerBuilder> {
    let pebble = PebbleConfig::new(config.pebble_base_url()?)
        .with_request_timeout(config.request_timeout());
    let supervisor = Arc::new(PebbleSupervisor::new(
        PebbleClient::new(pebble).context("Failed to create Pebble client")?,
    ));

    let tools = HookTools::new(config.hook_tools_dir.clone());
    let keys = Arc::new(FsKeyStore::new(
        &config.keys_dir,
        &config.artifact_path,
        supervisor.clone(),
    ));

    Ok(ReconcilerBuilder::new()
        .with_key_store(keys)
        .with_relations(Arc::new(HookToolRelation::new(
            tools.clone(),
            config.public_key_path(),
        )))
        .with_supervisor(supervisor)
        .with_status(Arc::new(HookToolStatus::new(tools))))
}

fn print_status(store: &dyn StateStore) -> Result<()> {
    let state = store.load().context("Failed to load controller state")?;
    let json = serde_json::to_string_pretty(&state)?;
    println!("{json}");
    Ok(())
}
