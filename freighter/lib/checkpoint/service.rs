//! The checkpoint service: store operations plus pretty-text export and
//! import for moving checkpoints between machines.

use std::{path::Path, sync::Arc};

use getset::Getters;
use tokio::fs;

use crate::{FreighterError, FreighterResult};

use super::{CheckpointStatus, CheckpointStore, TreeCheckpoint};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Store operations exposed to callers, plus import/export.
pub struct CheckpointService {
    store: Arc<dyn CheckpointStore>,
}

/// A one-line description of a stored checkpoint.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct CheckpointSummary {
    /// The checkpoint id.
    id: String,

    /// The aggregate status.
    status: CheckpointStatus,

    /// Completion percentage.
    progress: f64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CheckpointService {
    /// Creates a service over a store.
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Lists summaries of every stored checkpoint.
    pub async fn list_checkpoints(&self) -> FreighterResult<Vec<CheckpointSummary>> {
        let mut summaries = Vec::new();
        for id in self.store.list().await? {
            let checkpoint = self.store.load(&id).await?;
            summaries.push(CheckpointSummary {
                id,
                status: *checkpoint.get_status(),
                progress: *checkpoint.get_progress(),
            });
        }
        Ok(summaries)
    }

    /// Lists summaries of checkpoints a replication could resume from.
    pub async fn resumable_checkpoints(&self) -> FreighterResult<Vec<CheckpointSummary>> {
        let mut summaries = self.list_checkpoints().await?;
        summaries.retain(|summary| {
            matches!(
                summary.status,
                CheckpointStatus::InProgress | CheckpointStatus::Failed
            )
        });
        Ok(summaries)
    }

    /// Loads a checkpoint by id.
    pub async fn get(&self, id: &str) -> FreighterResult<TreeCheckpoint> {
        self.store.load(id).await
    }

    /// Saves a checkpoint.
    pub async fn save(&self, checkpoint: &TreeCheckpoint) -> FreighterResult<()> {
        self.store.save(checkpoint).await
    }

    /// Deletes a checkpoint by id.
    pub async fn delete(&self, id: &str) -> FreighterResult<()> {
        self.store.delete(id).await
    }

    /// Returns true if the checkpoint exists.
    pub async fn exists(&self, id: &str) -> FreighterResult<bool> {
        self.store.exists(id).await
    }

    /// Writes a checkpoint as pretty-printed text to `path`.
    pub async fn export(&self, id: &str, path: impl AsRef<Path>) -> FreighterResult<()> {
        let checkpoint = self.store.load(id).await?;
        let pretty = serde_json::to_vec_pretty(&checkpoint)?;
        fs::write(path.as_ref(), pretty).await?;
        Ok(())
    }

    /// Reads a pretty-printed checkpoint from `path` and saves it under the
    /// id it contains. Returns that id.
    pub async fn import(&self, path: impl AsRef<Path>) -> FreighterResult<String> {
        let bytes = fs::read(path.as_ref()).await?;
        let checkpoint: TreeCheckpoint = serde_json::from_slice(&bytes).map_err(|e| {
            FreighterError::CorruptCheckpoint(format!(
                "import of {} failed: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        self.store.save(&checkpoint).await?;
        Ok(checkpoint.get_id().clone())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::checkpoint::{FileCheckpointStore, RepoCheckpoint};

    fn sample(id: &str) -> TreeCheckpoint {
        let mut repositories = BTreeMap::new();
        repositories.insert("app".to_string(), RepoCheckpoint::pending("app", "mirror/app"));
        TreeCheckpoint::new(
            id,
            "src.example.com",
            "team",
            "dst.example.com",
            "mirror/team",
            repositories,
        )
    }

    #[test_log::test(tokio::test)]
    async fn test_export_import_roundtrip() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let service = CheckpointService::new(Arc::new(FileCheckpointStore::new(
            temp.path().join("checkpoints"),
        )));

        let checkpoint = sample("cp-export");
        service.save(&checkpoint).await?;

        let export_path = temp.path().join("cp.pretty.json");
        service.export("cp-export", &export_path).await?;

        service.delete("cp-export").await?;
        assert!(!service.exists("cp-export").await?);

        let id = service.import(&export_path).await?;
        assert_eq!(id, "cp-export");

        // The re-imported checkpoint encodes byte-equal to the original.
        let reloaded = service.get("cp-export").await?;
        assert_eq!(
            serde_json::to_vec(&reloaded)?,
            serde_json::to_vec(&checkpoint)?
        );
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_resumable_filters_statuses() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let service = CheckpointService::new(Arc::new(FileCheckpointStore::new(
            temp.path().join("checkpoints"),
        )));

        let mut done = sample("done");
        done.record_repo("app", CheckpointStatus::Completed);
        done.finish();
        service.save(&done).await?;

        let mut failed = sample("failed");
        failed.record_repo("app", CheckpointStatus::Failed);
        failed.finish();
        service.save(&failed).await?;

        service.save(&sample("running")).await?;

        let resumable: Vec<String> = service
            .resumable_checkpoints()
            .await?
            .into_iter()
            .map(|s| s.get_id().clone())
            .collect();
        assert_eq!(resumable, vec!["failed".to_string(), "running".to_string()]);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_import_rejects_garbage() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let service = CheckpointService::new(Arc::new(FileCheckpointStore::new(
            temp.path().join("checkpoints"),
        )));

        let bad = temp.path().join("bad.json");
        fs::write(&bad, b"{not a checkpoint").await?;
        assert!(matches!(
            service.import(&bad).await,
            Err(FreighterError::CorruptCheckpoint(_))
        ));
        Ok(())
    }
}
