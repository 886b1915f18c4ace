//! Mapping from known facts to the worker's desired configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use worker_core::PeerFacts;
use worker_core::names::{
    SERVICE_COMMAND, SERVICE_NAME, SERVICE_SUMMARY, TSA_BOOTSTRAP_PORT, TSA_HOST_KEY_PATH,
    WORK_DIR, WORKER_PRIVATE_KEY_PATH, env,
};

use crate::types::{
    DesiredProcessConfig, FileSource, Layer, MissingInput, RequiredFile, ServiceSpec,
};

/// Connection target for the coordinator's worker registration endpoint.
pub fn tsa_target(host: &str) -> String {
    format!("{host}:{TSA_BOOTSTRAP_PORT}")
}

/// Build the desired worker configuration.
///
/// Always returns a config; missing inputs are recorded on it rather than
/// refused here.
pub fn build(peer_facts: &PeerFacts, keypair_present: bool) -> DesiredProcessConfig {
    let mut missing = Vec::new();
    if peer_facts.coordinator_host.is_none() {
        missing.push(MissingInput::CoordinatorHost);
    }
    if peer_facts.coordinator_host_key.is_none() {
        missing.push(MissingInput::CoordinatorHostKey);
    }
    if !keypair_present {
        missing.push(MissingInput::Keypair);
    }

    let host = peer_facts.coordinator_host.as_deref().unwrap_or_default();
    let environment = BTreeMap::from([
        (env::WORK_DIR.to_string(), WORK_DIR.to_string()),
        (env::TSA_HOST.to_string(), tsa_target(host)),
        (env::TSA_PUBLIC_KEY.to_string(), TSA_HOST_KEY_PATH.to_string()),
        (
            env::TSA_WORKER_PRIVATE_KEY.to_string(),
            WORKER_PRIVATE_KEY_PATH.to_string(),
        ),
    ]);

    let service = ServiceSpec {
        override_: "replace".to_string(),
        summary: SERVICE_SUMMARY.to_string(),
        command: SERVICE_COMMAND.to_string(),
        startup: "enabled".to_string(),
        environment,
    };

    DesiredProcessConfig {
        service_name: SERVICE_NAME.to_string(),
        layer: Layer {
            summary: Some(format!("{SERVICE_NAME} layer")),
            services: BTreeMap::from([(SERVICE_NAME.to_string(), service)]),
        },
        required_files: vec![
            RequiredFile {
                path: PathBuf::from(TSA_HOST_KEY_PATH),
                source: FileSource::PeerHostKey,
            },
            RequiredFile {
                path: PathBuf::from(WORKER_PRIVATE_KEY_PATH),
                source: FileSource::LocalPrivateKey,
            },
        ],
        missing,
    }
}
