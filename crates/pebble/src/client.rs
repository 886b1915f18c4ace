//! Thin client for the Pebble HTTP API.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;
use worker_reconciler::{SupervisorError, SupervisorResult};

use crate::multipart;

/// Connection settings for a Pebble daemon.
#[derive(Debug, Clone)]
pub struct PebbleConfig {
    /// API root, e.g. `http://localhost:4000/`.
    pub base_url: Url,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// How long to wait for service changes to finish.
    pub change_timeout: Duration,
}

impl PebbleConfig {
    /// Create a config for the given API root.
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            request_timeout: Duration::from_secs(30),
            change_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_change_timeout(mut self, timeout: Duration) -> Self {
        self.change_timeout = timeout;
        self
    }
}

/// Pebble response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "status-code", default)]
    status_code: u16,
    #[serde(default)]
    status: String,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    change: Option<String>,
}

impl Envelope {
    fn is_error(&self) -> bool {
        self.kind == "error"
    }

    fn error_kind(&self) -> Option<&str> {
        self.result.get("kind").and_then(Value::as_str)
    }

    fn error(&self, operation: &str) -> SupervisorError {
        let message = self
            .result
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(&self.status);
        SupervisorError::rejected(operation, format!("{} {message}", self.status_code))
    }

    fn into_result<T: DeserializeOwned>(self, operation: &str) -> SupervisorResult<T> {
        if self.is_error() {
            return Err(self.error(operation));
        }
        serde_json::from_value(self.result)
            .map_err(|e| SupervisorError::rejected(operation, format!("unexpected result: {e}")))
    }
}

/// Entry of `GET /v1/services`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(default)]
    pub startup: String,
    #[serde(default)]
    pub current: String,
}

impl ServiceInfo {
    pub fn is_active(&self) -> bool {
        self.current == "active"
    }
}

#[derive(Debug, Deserialize)]
struct Change {
    #[serde(default)]
    status: String,
    #[serde(default)]
    err: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileResult {
    #[serde(default)]
    path: String,
    #[serde(default)]
    error: Option<Value>,
}

/// Map a transport failure. Anything that never reached the daemon means the
/// runtime is unavailable.
fn transport_error(operation: &str, e: &reqwest::Error) -> SupervisorError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        SupervisorError::runtime_unavailable(format!("{operation}: {e}"))
    } else {
        SupervisorError::rejected(operation, e.to_string())
    }
}

/// Client for one Pebble daemon.
#[derive(Debug, Clone)]
pub struct PebbleClient {
    http: Client,
    config: PebbleConfig,
}

impl PebbleClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: PebbleConfig) -> SupervisorResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SupervisorError::rejected("build client", e.to_string()))?;
        Ok(Self { http, config })
    }

    pub const fn config(&self) -> &PebbleConfig {
        &self.config
    }

    fn url(&self, path: &str) -> SupervisorResult<Url> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| SupervisorError::rejected(path, e.to_string()))
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> SupervisorResult<Envelope> {
        debug!(operation, "Pebble request");
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(operation, &e))?;
        response
            .json::<Envelope>()
            .await
            .map_err(|e| transport_error(operation, &e))
    }

    /// Current plan, as YAML.
    ///
    /// # Errors
    ///
    /// `RuntimeUnavailable` if the daemon is unreachable.
    pub async fn plan_yaml(&self) -> SupervisorResult<String> {
        let url = self.url("v1/plan")?;
        self.send("get plan", self.http.get(url).query(&[("format", "yaml")]))
            .await?
            .into_result("get plan")
    }

    /// Add a YAML layer, combining with an existing layer of the same label.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer is refused.
    pub async fn add_layer(&self, label: &str, layer_yaml: &str) -> SupervisorResult<()> {
        let url = self.url("v1/layers")?;
        let body = json!({
            "action": "add",
            "combine": true,
            "label": label,
            "format": "yaml",
            "layer": layer_yaml,
        });
        let _: Value = self
            .send("add layer", self.http.post(url).json(&body))
            .await?
            .into_result("add layer")?;
        Ok(())
    }

    /// Status of the named services.
    ///
    /// # Errors
    ///
    /// `RuntimeUnavailable` if the daemon is unreachable.
    pub async fn services(&self, names: &[&str]) -> SupervisorResult<Vec<ServiceInfo>> {
        let url = self.url("v1/services")?;
        let names = names.join(",");
        self.send(
            "get services",
            self.http.get(url).query(&[("names", names.as_str())]),
        )
        .await?
        .into_result("get services")
    }

    /// Run a service action (`start`, `stop`, ...) and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the action is refused or its change fails.
    pub async fn service_action(&self, action: &str, names: &[&str]) -> SupervisorResult<()> {
        let url = self.url("v1/services")?;
        let body = json!({ "action": action, "services": names });
        let envelope = self.send(action, self.http.post(url).json(&body)).await?;
        if envelope.is_error() {
            return Err(envelope.error(action));
        }
        match envelope.change {
            Some(change) => self.wait_change(action, &change).await,
            None => Ok(()),
        }
    }

    async fn wait_change(&self, operation: &str, change: &str) -> SupervisorResult<()> {
        let url = self.url(&format!("v1/changes/{change}/wait"))?;
        let timeout = format!("{}s", self.config.change_timeout.as_secs());
        let change: Change = self
            .send(operation, self.http.get(url).query(&[("timeout", timeout.as_str())]))
            .await?
            .into_result(operation)?;
        match change.err {
            Some(err) => Err(SupervisorError::rejected(operation, err)),
            None => {
                debug!(operation, status = %change.status, "Change finished");
                Ok(())
            }
        }
    }

    /// Write a file into the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is refused.
    pub async fn push(
        &self,
        path: &str,
        content: &[u8],
        make_dirs: bool,
        permissions: &str,
    ) -> SupervisorResult<()> {
        let url = self.url("v1/files")?;
        let request = json!({
            "action": "write",
            "files": [{
                "path": path,
                "make-dirs": make_dirs,
                "permissions": permissions,
            }],
        });
        let part_error = |e: reqwest::Error| SupervisorError::rejected("push", e.to_string());
        let form = Form::new()
            .part(
                "request",
                Part::text(request.to_string())
                    .mime_str("application/json")
                    .map_err(part_error)?,
            )
            .part(
                "files",
                Part::bytes(content.to_vec())
                    .file_name(path.to_string())
                    .mime_str("application/octet-stream")
                    .map_err(part_error)?,
            );

        let results: Vec<FileResult> = self
            .send("push", self.http.post(url).multipart(form))
            .await?
            .into_result("push")?;
        match results.into_iter().find_map(|r| r.error.map(|e| (r.path, e))) {
            Some((path, error)) => Err(SupervisorError::rejected(
                "push",
                format!("{path}: {error}"),
            )),
            None => Ok(()),
        }
    }

    /// Whether `path` exists.
    ///
    /// # Errors
    ///
    /// `RuntimeUnavailable` if the daemon is unreachable.
    pub async fn exists(&self, path: &str) -> SupervisorResult<bool> {
        let url = self.url("v1/files")?;
        let envelope = self
            .send(
                "list",
                self.http
                    .get(url)
                    .query(&[("action", "list"), ("path", path), ("itself", "true")]),
            )
            .await?;
        if envelope.is_error() && envelope.error_kind() == Some("not-found") {
            return Ok(false);
        }
        let entries: Vec<Value> = envelope.into_result("list")?;
        Ok(!entries.is_empty())
    }

    /// Read a file out of the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub async fn pull(&self, path: &str) -> SupervisorResult<Vec<u8>> {
        let url = self.url("v1/files")?;
        let response = self
            .http
            .get(url)
            .query(&[("action", "read"), ("path", path)])
            .send()
            .await
            .map_err(|e| transport_error("pull", &e))?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let Some(boundary) = multipart::boundary(&content_type).map(str::to_string) else {
            // Errors come back as a plain JSON envelope.
            let envelope: Envelope = response
                .json()
                .await
                .map_err(|e| transport_error("pull", &e))?;
            return Err(envelope.error("pull"));
        };

        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error("pull", &e))?;
        multipart::named_part(&body, &boundary, "files")
            .map(<[u8]>::to_vec)
            .ok_or_else(|| SupervisorError::rejected("pull", format!("{path} missing from response")))
    }
}
