//! [`ProcessSupervisor`] backed by a Pebble daemon.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::info;
use worker_reconciler::{
    ArtifactStore, Layer, ProcessSupervisor, ServiceSpec, SupervisorError, SupervisorResult,
};

use crate::client::PebbleClient;

/// Mode for files pushed into the workload container.
const PUSH_PERMISSIONS: &str = "644";

/// Process supervisor talking to the workload container's Pebble.
#[derive(Debug, Clone)]
pub struct PebbleSupervisor {
    client: PebbleClient,
}

impl PebbleSupervisor {
    pub const fn new(client: PebbleClient) -> Self {
        Self { client }
    }

    pub const fn client(&self) -> &PebbleClient {
        &self.client
    }
}

fn path_str<'a>(operation: &str, path: &'a Path) -> SupervisorResult<&'a str> {
    path.to_str()
        .ok_or_else(|| SupervisorError::rejected(operation, format!("non UTF-8 path {}", path.display())))
}

#[async_trait]
impl ArtifactStore for PebbleSupervisor {
    async fn fetch_artifact(&self, path: &Path) -> SupervisorResult<Vec<u8>> {
        let bytes = self.client.pull(path_str("pull", path)?).await?;
        info!(path = %path.display(), size = bytes.len(), "Pulled artifact");
        Ok(bytes)
    }
}

#[async_trait]
impl ProcessSupervisor for PebbleSupervisor {
    async fn materialize_file(&self, path: &Path, content: &[u8]) -> SupervisorResult<()> {
        self.client
            .push(path_str("push", path)?, content, true, PUSH_PERMISSIONS)
            .await
    }

    async fn file_exists(&self, path: &Path) -> SupervisorResult<bool> {
        self.client.exists(path_str("list", path)?).await
    }

    async fn get_declared_services(&self) -> SupervisorResult<BTreeMap<String, ServiceSpec>> {
        let yaml = self.client.plan_yaml().await?;
        let plan: Option<Layer> = serde_yaml::from_str(&yaml)
            .map_err(|e| SupervisorError::rejected("get plan", format!("invalid plan: {e}")))?;
        Ok(plan.map(|plan| plan.services).unwrap_or_default())
    }

    async fn apply_layer(&self, label: &str, layer: &Layer) -> SupervisorResult<()> {
        let yaml = serde_yaml::to_string(layer)
            .map_err(|e| SupervisorError::rejected("add layer", e.to_string()))?;
        self.client.add_layer(label, &yaml).await
    }

    async fn is_running(&self, service: &str) -> SupervisorResult<bool> {
        let services = self.client.services(&[service]).await?;
        Ok(services
            .iter()
            .any(|info| info.name == service && info.is_active()))
    }

    async fn stop(&self, service: &str) -> SupervisorResult<()> {
        self.client.service_action("stop", &[service]).await
    }

    async fn start(&self, service: &str) -> SupervisorResult<()> {
        self.client.service_action("start", &[service]).await
    }
}
