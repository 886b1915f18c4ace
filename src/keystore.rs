//! Worker keypair on local storage, generated with the `concourse` binary
//! shipped in the workload image.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};
use worker_core::names::{KEY_ALGORITHM, WORKER_KEY_FILE, WORKER_PUBLIC_KEY_FILE};
use worker_core::{Error, Keypair, PrivateKeyRef};
use worker_reconciler::{ArtifactStore, KeyStore, KeyStoreError};

/// Mode of the copied binary before it is run.
const EXECUTABLE_MODE: u32 = 0o777;

/// [`KeyStore`] over a local key directory.
pub struct FsKeyStore {
    keys_dir: PathBuf,
    artifact_path: PathBuf,
    artifacts: Arc<dyn ArtifactStore>,
}

impl FsKeyStore {
    pub fn new(
        keys_dir: impl Into<PathBuf>,
        artifact_path: impl Into<PathBuf>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            keys_dir: keys_dir.into(),
            artifact_path: artifact_path.into(),
            artifacts,
        }
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.keys_dir.join(WORKER_KEY_FILE)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.keys_dir.join(WORKER_PUBLIC_KEY_FILE)
    }

    /// Existing keypair, if both halves are on disk.
    async fn existing(&self) -> Result<Option<Keypair>, Error> {
        let private = self.private_key_path();
        if !exists(&private).await? {
            return Ok(None);
        }
        let public_path = self.public_key_path();
        match tokio::fs::read(&public_path).await {
            Ok(public_key) => Ok(Some(Keypair::new(public_key, PrivateKeyRef::new(private)))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::file_read_failed(public_path, e.to_string())),
        }
    }

    async fn generate(&self) -> Result<Keypair, KeyStoreError> {
        let binary = self.artifacts.fetch_artifact(&self.artifact_path).await?;

        tokio::fs::create_dir_all(&self.keys_dir)
            .await
            .map_err(|e| Error::directory_creation_failed(&self.keys_dir, e.to_string()))?;

        let executable = write_executable(&binary)?;
        let private = self.private_key_path();
        let command = format!(
            "{} generate-key -t {KEY_ALGORITHM} -f {}",
            self.artifact_path.display(),
            private.display()
        );
        debug!(command = %command, "Generating worker keypair");

        let output = Command::new(&*executable)
            .args(["generate-key", "-t", KEY_ALGORITHM, "-f"])
            .arg(&private)
            .output()
            .await
            .map_err(|e| Error::command_failed(&command, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::command_failed(
                &command,
                format!("{}: {}", output.status, stderr.trim()),
            )
            .into());
        }

        let keypair = self.existing().await?.ok_or_else(|| {
            Error::command_failed(&command, "key files missing after generation")
        })?;
        info!(path = %private.display(), "Generated worker keypair");
        Ok(keypair)
    }
}

async fn exists(path: &Path) -> Result<bool, Error> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| Error::file_read_failed(path, e.to_string()))
}

/// Copy `binary` into a closed temporary file with execute permissions.
fn write_executable(binary: &[u8]) -> Result<tempfile::TempPath, Error> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix("concourse-")
        .tempfile()
        .map_err(|e| Error::file_write_failed(std::env::temp_dir(), e.to_string()))?;
    let path = file.path().to_path_buf();
    file.write_all(binary)
        .and_then(|()| file.as_file().sync_all())
        .map_err(|e| Error::file_write_failed(&path, e.to_string()))?;

    // The write handle must be closed before exec (ETXTBSY).
    let executable = file.into_temp_path();
    std::fs::set_permissions(&executable, std::fs::Permissions::from_mode(EXECUTABLE_MODE))
        .map_err(|e| Error::file_write_failed(&path, e.to_string()))?;
    Ok(executable)
}

#[async_trait]
impl KeyStore for FsKeyStore {
    async fn ensure_keypair(&self) -> Result<Keypair, KeyStoreError> {
        if let Some(keypair) = self.existing().await? {
            return Ok(keypair);
        }
        self.generate().await
    }
}
