//! Well-known names shared between the worker image, the coordinator and the
//! operator. These are part of the external contract and must not change.

/// Relation joining this unit to the Concourse web/TSA coordinator.
pub const RELATION_NAME: &str = "concourse-worker";

/// Peer application data key carrying the coordinator host (no port).
pub const TSA_HOST_KEY: &str = "TSA_HOST";

/// Peer application data key carrying the coordinator's SSH host public key.
pub const TSA_HOST_KEY_PUB_KEY: &str = "CONCOURSE_TSA_HOST_KEY_PUB";

/// Local unit data key carrying this worker's public key.
pub const WORKER_KEY_PUB_KEY: &str = "WORKER_KEY_PUB";

/// Port the coordinator accepts worker registrations on.
pub const TSA_BOOTSTRAP_PORT: u16 = 2222;

/// Pebble service name (and layer label) of the managed worker process.
pub const SERVICE_NAME: &str = "concourse-worker";

/// Command the worker service runs.
pub const SERVICE_COMMAND: &str = "/usr/local/bin/entrypoint.sh worker";

/// Human readable service summary.
pub const SERVICE_SUMMARY: &str = "concourse worker node";

/// Worker scratch directory inside the workload container.
pub const WORK_DIR: &str = "/opt/concourse/worker";

/// Mount point of the per-worker key volume, in both containers.
pub const KEYS_DIR: &str = "/concourse-keys";

/// File name of the worker private key within [`KEYS_DIR`].
pub const WORKER_KEY_FILE: &str = "worker_key";

/// File name of the public key `generate-key` writes next to the private key.
pub const WORKER_PUBLIC_KEY_FILE: &str = "worker_key.pub";

/// Worker private key, as the workload container sees it.
pub const WORKER_PRIVATE_KEY_PATH: &str = "/concourse-keys/worker_key";

/// Coordinator host key supplied by the peer.
pub const TSA_HOST_KEY_PATH: &str = "/concourse-keys/tsa_host_key.pub";

/// Location of the `concourse` binary inside the workload container.
pub const CONCOURSE_BINARY_PATH: &str = "/usr/local/concourse/bin/concourse";

/// Key algorithm requested from `concourse generate-key`.
pub const KEY_ALGORITHM: &str = "ssh";

/// Status reason while no coordinator relation has delivered a host.
pub const BLOCKED_NO_COORDINATOR: &str = "Relation required with coordinator";

/// Status reason while the coordinator host key has not been written yet.
pub const BLOCKED_NO_HOST_KEY: &str = "Waiting for CONCOURSE_TSA_PUBLIC_KEY";

/// Worker environment variable names.
pub mod env {
    pub const WORK_DIR: &str = "CONCOURSE_WORK_DIR";
    pub const TSA_HOST: &str = "CONCOURSE_TSA_HOST";
    pub const TSA_PUBLIC_KEY: &str = "CONCOURSE_TSA_PUBLIC_KEY";
    pub const TSA_WORKER_PRIVATE_KEY: &str = "CONCOURSE_TSA_WORKER_PRIVATE_KEY";
}
