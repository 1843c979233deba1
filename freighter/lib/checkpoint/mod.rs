//! Durable checkpoints for resumable tree replication.

mod service;
mod store;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use getset::{Getters, MutGetters, Setters};
use serde::{Deserialize, Serialize};

use crate::FreighterResult;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use service::*;
pub use store::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The status of a tree replication or one of its repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Not started yet.
    #[default]
    Pending,

    /// Currently being replicated.
    InProgress,

    /// Finished without errors.
    Completed,

    /// Finished with errors.
    Failed,
}

/// Per-repository progress within a tree replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub with_prefix")]
pub struct RepoCheckpoint {
    /// The repository's replication status.
    status: CheckpointStatus,

    /// The source repository name.
    source_repo: String,

    /// The destination repository name.
    dest_repo: String,

    /// When this entry last changed.
    last_updated: DateTime<Utc>,
}

/// The persistent record of an in-progress tree replication.
#[derive(
    Debug, Clone, PartialEq, Serialize, Deserialize, Getters, MutGetters, Setters,
)]
#[getset(get = "pub with_prefix", get_mut = "pub with_prefix", set = "pub with_prefix")]
pub struct TreeCheckpoint {
    /// The checkpoint id; doubles as the file identity in the store.
    id: String,

    /// When the replication started.
    start_time: DateTime<Utc>,

    /// When the checkpoint last changed.
    last_updated: DateTime<Utc>,

    /// The source registry hostname.
    source_registry: String,

    /// The source repository prefix.
    source_prefix: String,

    /// The destination registry hostname.
    dest_registry: String,

    /// The destination repository prefix.
    dest_prefix: String,

    /// The aggregate replication status.
    status: CheckpointStatus,

    /// Per-repository status, keyed by source repository name.
    repositories: BTreeMap<String, RepoCheckpoint>,

    /// Repositories that completed, in completion order.
    completed_repositories: Vec<String>,

    /// Completion percentage, 0 to 100.
    progress: f64,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A durable mapping from checkpoint id to checkpoint record.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Lists the ids of stored checkpoints.
    async fn list(&self) -> FreighterResult<Vec<String>>;

    /// Loads a checkpoint by id.
    async fn load(&self, id: &str) -> FreighterResult<TreeCheckpoint>;

    /// Saves a checkpoint, replacing any previous record under its id.
    async fn save(&self, checkpoint: &TreeCheckpoint) -> FreighterResult<()>;

    /// Deletes a checkpoint by id.
    async fn delete(&self, id: &str) -> FreighterResult<()>;

    /// Returns true if a checkpoint with the id exists.
    async fn exists(&self, id: &str) -> FreighterResult<bool>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RepoCheckpoint {
    /// Creates a pending entry for a source/destination repository pair.
    pub fn pending(source_repo: impl Into<String>, dest_repo: impl Into<String>) -> Self {
        Self {
            status: CheckpointStatus::Pending,
            source_repo: source_repo.into(),
            dest_repo: dest_repo.into(),
            last_updated: Utc::now(),
        }
    }
}

impl TreeCheckpoint {
    /// Creates a fresh checkpoint for a tree replication over the given
    /// repositories. Every repository entry starts pending and the
    /// aggregate status is in-progress.
    pub fn new(
        id: impl Into<String>,
        source_registry: impl Into<String>,
        source_prefix: impl Into<String>,
        dest_registry: impl Into<String>,
        dest_prefix: impl Into<String>,
        repositories: BTreeMap<String, RepoCheckpoint>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            start_time: now,
            last_updated: now,
            source_registry: source_registry.into(),
            source_prefix: source_prefix.into(),
            dest_registry: dest_registry.into(),
            dest_prefix: dest_prefix.into(),
            status: CheckpointStatus::InProgress,
            repositories,
            completed_repositories: Vec::new(),
            progress: 0.0,
        }
    }

    /// Records one repository's outcome and refreshes the aggregate
    /// progress. Completed repositories are appended to the ordered
    /// completion list.
    pub fn record_repo(&mut self, repo: &str, status: CheckpointStatus) {
        let now = Utc::now();
        if let Some(entry) = self.repositories.get_mut(repo) {
            entry.status = status;
            entry.last_updated = now;
        }
        if status == CheckpointStatus::Completed
            && !self.completed_repositories.iter().any(|r| r == repo)
        {
            self.completed_repositories.push(repo.to_string());
        }

        let total = self.repositories.len();
        if total > 0 {
            self.progress = self.completed_repositories.len() as f64 / total as f64 * 100.0;
        }
        self.last_updated = now;
    }

    /// Marks the whole replication finished: completed iff no repository
    /// failed.
    pub fn finish(&mut self) {
        let failed = self
            .repositories
            .values()
            .any(|entry| entry.status == CheckpointStatus::Failed);
        self.status = if failed {
            CheckpointStatus::Failed
        } else {
            CheckpointStatus::Completed
        };
        self.last_updated = Utc::now();
    }

    /// Computes the repositories a resumed run still has to process.
    ///
    /// A repository is excluded when it completed and `skip_completed` is
    /// set, or when it failed and `retry_failed` is not set.
    pub fn get_remaining(&self, skip_completed: bool, retry_failed: bool) -> Vec<String> {
        self.repositories
            .iter()
            .filter(|(_, entry)| match entry.status {
                CheckpointStatus::Completed => !skip_completed,
                CheckpointStatus::Failed => retry_failed,
                CheckpointStatus::Pending | CheckpointStatus::InProgress => true,
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint_with_statuses() -> TreeCheckpoint {
        let mut repositories = BTreeMap::new();
        for (name, status) in [
            ("repo1", CheckpointStatus::Completed),
            ("repo2", CheckpointStatus::Completed),
            ("repo3", CheckpointStatus::Failed),
            ("repo4", CheckpointStatus::Pending),
        ] {
            let mut entry = RepoCheckpoint::pending(name, name);
            entry.set_status(status);
            repositories.insert(name.to_string(), entry);
        }
        TreeCheckpoint::new(
            "cp-1",
            "src.example.com",
            "team",
            "dst.example.com",
            "mirror/team",
            repositories,
        )
    }

    #[test]
    fn test_get_remaining_truth_table() {
        let checkpoint = checkpoint_with_statuses();

        assert_eq!(checkpoint.get_remaining(true, true), vec!["repo3", "repo4"]);
        assert_eq!(checkpoint.get_remaining(true, false), vec!["repo4"]);
        assert_eq!(
            checkpoint.get_remaining(false, true),
            vec!["repo1", "repo2", "repo3", "repo4"]
        );
    }

    #[test]
    fn test_record_repo_updates_progress_and_completion_order() {
        let mut repositories = BTreeMap::new();
        repositories.insert("a".to_string(), RepoCheckpoint::pending("a", "a"));
        repositories.insert("b".to_string(), RepoCheckpoint::pending("b", "b"));
        let mut checkpoint =
            TreeCheckpoint::new("cp", "s", "p", "d", "p", repositories);

        checkpoint.record_repo("b", CheckpointStatus::Completed);
        assert_eq!(checkpoint.get_progress(), &50.0);
        assert_eq!(checkpoint.get_completed_repositories(), &vec!["b".to_string()]);

        checkpoint.record_repo("a", CheckpointStatus::Failed);
        checkpoint.finish();
        assert_eq!(*checkpoint.get_status(), CheckpointStatus::Failed);

        checkpoint.record_repo("a", CheckpointStatus::Completed);
        checkpoint.finish();
        assert_eq!(*checkpoint.get_status(), CheckpointStatus::Completed);
        assert_eq!(checkpoint.get_progress(), &100.0);
    }

    #[test]
    fn test_checkpoint_encode_decode_roundtrip() {
        let checkpoint = checkpoint_with_statuses();
        let encoded = serde_json::to_vec(&checkpoint).unwrap();
        let decoded: TreeCheckpoint = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, checkpoint);
        assert_eq!(serde_json::to_vec(&decoded).unwrap(), encoded);
    }
}
