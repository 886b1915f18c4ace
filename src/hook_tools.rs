//! Relation and status adapters over the platform's hook tools.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use worker_core::{Error, LocalAnnouncement, PeerFacts, Relation, Result, UnitHealth};
use worker_reconciler::{RelationFacts, StatusSink};

/// Locates and runs hook tools (`relation-get`, `status-set`, ...).
#[derive(Debug, Clone, Default)]
pub struct HookTools {
    dir: Option<PathBuf>,
}

impl HookTools {
    /// Tools resolved from `dir`, or from `PATH` when `None`.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    fn program(&self, tool: &str) -> PathBuf {
        self.dir
            .as_ref()
            .map_or_else(|| PathBuf::from(tool), |dir| dir.join(tool))
    }

    /// Run `tool` with `args`, feeding `stdin` if given, and return stdout.
    ///
    /// # Errors
    ///
    /// `CommandFailed` if the tool cannot be spawned or exits non-zero.
    pub async fn run(&self, tool: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let command = format!("{tool} {}", args.join(" "));
        debug!(command = %command, "Running hook tool");

        let mut child = Command::new(self.program(tool))
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::command_failed(&command, e.to_string()))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)
                .await
                .map_err(|e| Error::command_failed(&command, e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::command_failed(&command, e.to_string()))?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(Error::command_failed(
                &command,
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }
}

/// [`RelationFacts`] through `relation-get`, `relation-set` and `relation-ids`.
#[derive(Debug, Clone)]
pub struct HookToolRelation {
    tools: HookTools,
    public_key_path: PathBuf,
}

impl HookToolRelation {
    pub fn new(tools: HookTools, public_key_path: impl Into<PathBuf>) -> Self {
        Self {
            tools,
            public_key_path: public_key_path.into(),
        }
    }
}

#[async_trait]
impl RelationFacts for HookToolRelation {
    async fn read_local_public_key(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.public_key_path).await {
            Ok(key) => Ok(Some(key)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::file_read_failed(&self.public_key_path, e.to_string())),
        }
    }

    async fn read_peer_facts(&self, relation: &Relation) -> Result<PeerFacts> {
        let stdout = self
            .tools
            .run(
                "relation-get",
                &[
                    "--format=json",
                    "--app",
                    "-r",
                    &relation.id,
                    "-",
                    &relation.remote_app,
                ],
                None,
            )
            .await?;
        let data: Option<BTreeMap<String, String>> = serde_json::from_slice(&stdout)
            .map_err(|e| Error::json_parse_failed(format!("relation-get {relation}: {e}")))?;
        Ok(PeerFacts::from_app_data(&data.unwrap_or_default()))
    }

    async fn is_established(&self, relation: &Relation) -> Result<bool> {
        let stdout = self
            .tools
            .run("relation-ids", &["--format=json", &relation.name], None)
            .await?;
        let ids: Option<Vec<String>> = serde_json::from_slice(&stdout)
            .map_err(|e| Error::json_parse_failed(format!("relation-ids {}: {e}", relation.name)))?;
        Ok(ids.unwrap_or_default().contains(&relation.id))
    }

    async fn publish_local(
        &self,
        relation: &Relation,
        announcement: &LocalAnnouncement,
    ) -> Result<()> {
        // YAML on stdin keeps multi-line keys intact.
        let yaml = serde_yaml::to_string(&announcement.to_unit_data())
            .map_err(|e| Error::yaml_parse_failed(e.to_string()))?;
        self.tools
            .run(
                "relation-set",
                &["-r", &relation.id, "--file", "-"],
                Some(yaml.as_bytes()),
            )
            .await?;
        Ok(())
    }
}

/// [`StatusSink`] through `status-set`.
#[derive(Debug, Clone)]
pub struct HookToolStatus {
    tools: HookTools,
}

impl HookToolStatus {
    pub const fn new(tools: HookTools) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl StatusSink for HookToolStatus {
    async fn set_status(&self, health: &UnitHealth) -> Result<()> {
        self.tools
            .run("status-set", &[health.name(), health.message()], None)
            .await?;
        Ok(())
    }
}
