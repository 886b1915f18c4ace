//! Operator configuration.
//!
//! Loaded from an optional TOML file. Every field has a default matching the
//! Concourse worker image, so a unit normally runs without any file at all.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use worker_core::names::{CONCOURSE_BINARY_PATH, KEYS_DIR, RELATION_NAME, WORKER_PUBLIC_KEY_FILE};
use worker_core::{Error, Result};

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "CONCOURSE_WORKER_OPERATOR_CONFIG";

/// Runtime configuration of the operator binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OperatorConfig {
    /// Where controller state (peer facts, deferred events) is persisted.
    pub state_file: PathBuf,
    /// Where this process sees the key volume.
    ///
    /// The worker layer always refers to the volume at [`KEYS_DIR`], where the
    /// workload container mounts it. Only point this elsewhere when the same
    /// volume is mounted at a different path here.
    pub keys_dir: PathBuf,
    /// Pebble API root of the workload container.
    pub pebble_url: String,
    /// Directory containing the hook tools; `None` resolves them via `PATH`.
    pub hook_tools_dir: Option<PathBuf>,
    /// Path of the `concourse` binary inside the workload container.
    pub artifact_path: PathBuf,
    /// Endpoint name of the coordinator relation.
    pub relation_name: String,
    /// Per-request timeout towards Pebble, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(".concourse-worker-state.json"),
            keys_dir: PathBuf::from(KEYS_DIR),
            pebble_url: "http://localhost:4000/".to_string(),
            hook_tools_dir: None,
            artifact_path: PathBuf::from(CONCOURSE_BINARY_PATH),
            relation_name: RELATION_NAME.to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from `path`, falling back to defaults when no path is
    /// given or the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Self::default().validated();
        };

        match std::fs::read_to_string(path) {
            Ok(raw) => {
                debug!(path = %path.display(), "Loaded operator config");
                Self::from_toml_str(&raw)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No operator config, using defaults");
                Self::default().validated()
            }
            Err(e) => Err(Error::file_read_failed(path, e.to_string())),
        }
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML or fails validation.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str::<Self>(raw)
            .map_err(|e| Error::toml_parse_failed(e.to_string()))?
            .validated()
    }

    fn validated(self) -> Result<Self> {
        if self.state_file.as_os_str().is_empty() {
            return Err(Error::invalid_config("state_file must not be empty"));
        }
        if self.keys_dir.as_os_str().is_empty() {
            return Err(Error::invalid_config("keys_dir must not be empty"));
        }
        if self.artifact_path.as_os_str().is_empty() {
            return Err(Error::invalid_config("artifact_path must not be empty"));
        }
        if self.relation_name.trim().is_empty() {
            return Err(Error::invalid_config("relation_name must not be empty"));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::invalid_config("request_timeout_secs must be positive"));
        }
        self.pebble_base_url()?;
        Ok(self)
    }

    /// Parsed Pebble API root.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `pebble_url` is not an absolute http(s) URL.
    pub fn pebble_base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.pebble_url)
            .map_err(|e| Error::invalid_config(format!("pebble_url {:?}: {e}", self.pebble_url)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::invalid_config(format!(
                "pebble_url scheme {other:?} is not supported"
            ))),
        }
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Worker public key on local storage.
    pub fn public_key_path(&self) -> PathBuf {
        self.keys_dir.join(WORKER_PUBLIC_KEY_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_worker_image() {
        let config = OperatorConfig::default();
        assert_eq!(config.keys_dir, PathBuf::from("/concourse-keys"));
        assert_eq!(
            config.public_key_path(),
            PathBuf::from("/concourse-keys/worker_key.pub")
        );
        assert_eq!(config.relation_name, "concourse-worker");
        assert!(config.validated().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = OperatorConfig::from_toml_str(
            "pebble_url = \"http://10.0.0.5:4000\"\nkeys_dir = \"/tmp/keys\"\n",
        );
        assert!(config.is_ok());
        let config = config.unwrap_or_default();
        assert_eq!(config.keys_dir, PathBuf::from("/tmp/keys"));
        assert_eq!(config.relation_name, "concourse-worker");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = OperatorConfig::from_toml_str("pebble = \"x\"\n");
        assert!(matches!(result, Err(Error::TomlParseFailed { .. })));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for raw in [
            "relation_name = \"  \"\n",
            "pebble_url = \"not a url\"\n",
            "pebble_url = \"unix:///charm/containers/worker/pebble.socket\"\n",
            "request_timeout_secs = 0\n",
            "state_file = \"\"\n",
        ] {
            let result = OperatorConfig::from_toml_str(raw);
            assert!(
                matches!(result, Err(Error::InvalidConfig { .. })),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().ok();
        let path = dir.as_ref().map(|d| d.path().join("absent.toml"));
        let config = OperatorConfig::load(path.as_deref());
        assert_eq!(config.ok(), Some(OperatorConfig::default()));
    }

    #[test]
    fn test_no_path_yields_defaults() {
        assert_eq!(OperatorConfig::load(None).ok(), Some(OperatorConfig::default()));
    }
}
