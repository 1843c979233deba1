//! The file-backed checkpoint store.
//!
//! One file per checkpoint in an owner-only directory. The directory is
//! created lazily on first use with mode 0700; looser permissions on an
//! existing directory are tightened.

use std::path::{Path, PathBuf};

use tokio::{fs, sync::OnceCell};

use crate::{utils::expand_tilde, FreighterError, FreighterResult};

use super::{CheckpointStore, TreeCheckpoint};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The extension of checkpoint files.
const CHECKPOINT_EXTENSION: &str = "json";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A checkpoint store backed by a directory of JSON files.
#[derive(Debug)]
pub struct FileCheckpointStore {
    configured_path: PathBuf,
    dir: OnceCell<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FileCheckpointStore {
    /// Creates a store over the given directory. Nothing touches the disk
    /// until the first operation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            configured_path: path.into(),
            dir: OnceCell::new(),
        }
    }

    /// Resolves and prepares the directory on first use.
    async fn dir(&self) -> FreighterResult<&Path> {
        let dir = self
            .dir
            .get_or_try_init(|| async {
                let dir = expand_tilde(&self.configured_path);
                prepare_directory(&dir).await?;
                Ok::<_, FreighterError>(dir)
            })
            .await?;
        Ok(dir)
    }

    async fn checkpoint_path(&self, id: &str) -> FreighterResult<PathBuf> {
        validate_checkpoint_id(id)?;
        Ok(self
            .dir()
            .await?
            .join(format!("{}.{}", id, CHECKPOINT_EXTENSION)))
    }
}

/// Creates the directory with mode 0700, or tightens an existing one that
/// has any group/other permission bits set.
async fn prepare_directory(dir: &Path) -> FreighterResult<()> {
    if !fs::try_exists(dir).await? {
        fs::create_dir_all(dir).await?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(dir).await?;
        let mode = metadata.permissions().mode() & 0o777;
        if mode != 0o700 {
            if mode & 0o077 != 0 {
                tracing::warn!(
                    "checkpoint directory {} had mode {:o}, tightening to 0700",
                    dir.display(),
                    mode
                );
            }
            fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
        }
    }

    Ok(())
}

/// Rejects ids that could escape the store directory.
fn validate_checkpoint_id(id: &str) -> FreighterResult<()> {
    if id.is_empty() {
        return Err(FreighterError::InvalidInput("checkpoint id is empty".into()));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(FreighterError::InvalidInput(format!(
            "checkpoint id {} contains path separators",
            id
        )));
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn list(&self) -> FreighterResult<Vec<String>> {
        let dir = self.dir().await?;
        let mut entries = fs::read_dir(dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(CHECKPOINT_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn load(&self, id: &str) -> FreighterResult<TreeCheckpoint> {
        let path = self.checkpoint_path(id).await?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FreighterError::NotFound(format!("checkpoint {}", id)));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            FreighterError::CorruptCheckpoint(format!("checkpoint {} exists but is invalid: {}", id, e))
        })
    }

    async fn save(&self, checkpoint: &TreeCheckpoint) -> FreighterResult<()> {
        let path = self.checkpoint_path(checkpoint.get_id()).await?;
        let bytes = serde_json::to_vec(checkpoint)?;

        let tmp_path = path.with_extension(format!("tmp-{:016x}", rand::random::<u64>()));
        fs::write(&tmp_path, &bytes).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> FreighterResult<()> {
        let path = self.checkpoint_path(id).await?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(FreighterError::NotFound(format!("checkpoint {}", id)))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, id: &str) -> FreighterResult<bool> {
        let path = self.checkpoint_path(id).await?;
        Ok(fs::try_exists(&path).await?)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
