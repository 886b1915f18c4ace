//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::CONFIG_ENV;

/// Concourse worker operator
#[derive(Parser, Debug)]
#[command(name = "concourse-worker-operator")]
#[command(version)]
#[command(about = "Keeps a Concourse worker unit registered with its coordinator")]
#[command(
    long_about = "Generates the worker keypair, exchanges keys with the Concourse web/TSA coordinator over a relation, and (re)starts the worker service only when its declaration changes."
)]
pub struct Cli {
    /// Operator config file (TOML)
    #[arg(short, long, global = true, env = CONFIG_ENV)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Handle the hook named by JUJU_DISPATCH_PATH
    Dispatch,

    /// Run a configuration pass
    ConfigChanged,

    /// Handle a change of coordinator relation data
    RelationChanged {
        /// Relation id, e.g. concourse-worker:3
        #[arg(long, env = "JUJU_RELATION_ID")]
        relation_id: String,

        /// Coordinator application name
        #[arg(long, env = "JUJU_REMOTE_APP")]
        remote_app: String,
    },

    /// Print persisted controller state as JSON
    Status,
}
