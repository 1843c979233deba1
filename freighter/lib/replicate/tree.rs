//! The tree replicator: replicates every repository under a source prefix
//! to a destination prefix, with per-repository checkpointing and resume.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use getset::Getters;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    checkpoint::{
        CheckpointStatus, CheckpointStore, FileCheckpointStore, RepoCheckpoint, TreeCheckpoint,
    },
    config::{CHECKPOINTS_SUBDIR, FREIGHTER_HOME_DIR},
    copy::{
        copy_repository, resolve_worker_count, ConcurrencyGroup, CopyOptions, RepoCopyOptions,
    },
    encrypt::EnvelopeManager,
    registry::RegistryClient,
    FreighterError, FreighterResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options for one tree replication. This typed struct is the whole
/// contract between the service layer and the replicator.
#[derive(Debug, Clone, TypedBuilder)]
pub struct TreeReplicatorOptions {
    /// Concurrent repository workers. Zero auto-detects from the CPU count.
    #[builder(default)]
    pub worker_count: usize,

    /// Repositories excluded by exact source name.
    #[builder(default)]
    pub exclude_repositories: Vec<String>,

    /// Tags excluded in every repository.
    #[builder(default)]
    pub exclude_tags: Vec<String>,

    /// When non-empty, only these tags are considered.
    #[builder(default)]
    pub include_tags: Vec<String>,

    /// Compute the plan but write nothing.
    #[builder(default)]
    pub dry_run: bool,

    /// Copy even when destinations already hold the digests.
    #[builder(default)]
    pub force_overwrite: bool,

    /// Whether progress is checkpointed.
    #[builder(default)]
    pub enable_checkpointing: bool,

    /// Where checkpoints are stored. Defaults to
    /// `~/.freighter/checkpoints`.
    #[builder(default)]
    pub checkpoint_directory: Option<PathBuf>,

    /// Resume from this checkpoint instead of starting fresh.
    #[builder(default)]
    pub resume_id: Option<String>,

    /// On resume, leave completed repositories alone.
    #[builder(default = true)]
    pub skip_completed: bool,

    /// On resume, retry failed repositories.
    #[builder(default = true)]
    pub retry_failed: bool,

    /// Per-image copy options.
    #[builder(default)]
    pub copy: CopyOptions,
}

/// The aggregate outcome of a tree replication. Counters reflect only the
/// run that produced them; a resumed run does not re-count earlier runs.
#[derive(Debug, Clone, Default, Getters)]
#[getset(get = "pub with_prefix")]
pub struct TreeReplicationResult {
    /// Repositories this run set out to replicate.
    repositories_total: u64,

    /// Repositories that finished without errors.
    repositories_completed: u64,

    /// Repositories that finished with errors.
    repositories_failed: u64,

    /// Tags copied across all repositories.
    tags_copied: u64,

    /// Tags skipped across all repositories.
    tags_skipped: u64,

    /// Bytes moved across all repositories.
    bytes_transferred: i64,

    /// The checkpoint this run recorded into, if checkpointing was on.
    checkpoint_id: Option<String>,

    /// One message per failed repository.
    errors: Vec<String>,
}

/// Replicates a repository tree between two registries.
pub struct TreeReplicator {
    source: Arc<dyn RegistryClient>,
    dest: Arc<dyn RegistryClient>,
    encryption: Option<Arc<EnvelopeManager>>,
}

#[derive(Debug, Default)]
struct TreeCounters {
    repositories_completed: AtomicU64,
    repositories_failed: AtomicU64,
    tags_copied: AtomicU64,
    tags_skipped: AtomicU64,
    bytes_transferred: AtomicI64,
    errors: Mutex<Vec<String>>,
}

/// A checkpoint plus the store it persists through, shared by repo workers.
struct SharedCheckpoint {
    store: Arc<dyn CheckpointStore>,
    checkpoint: Mutex<TreeCheckpoint>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Default for TreeReplicatorOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SharedCheckpoint {
    async fn record(&self, repo: &str, status: CheckpointStatus) -> FreighterResult<()> {
        let snapshot = {
            let mut checkpoint = self
                .checkpoint
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            checkpoint.record_repo(repo, status);
            checkpoint.clone()
        };
        self.store.save(&snapshot).await
    }

    async fn finish(&self) -> FreighterResult<String> {
        let snapshot = {
            let mut checkpoint = self
                .checkpoint
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            checkpoint.finish();
            checkpoint.clone()
        };
        self.store.save(&snapshot).await?;
        Ok(snapshot.get_id().clone())
    }
}

impl TreeReplicator {
    /// Creates a replicator between two registry clients.
    pub fn new(source: Arc<dyn RegistryClient>, dest: Arc<dyn RegistryClient>) -> Self {
        Self {
            source,
            dest,
            encryption: None,
        }
    }

    /// Enables payload encryption for replicated blobs.
    pub fn with_encryption(mut self, encryption: Arc<EnvelopeManager>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    /// Opens the checkpoint store configured in the options.
    fn checkpoint_store(options: &TreeReplicatorOptions) -> Arc<dyn CheckpointStore> {
        let dir = options.checkpoint_directory.clone().unwrap_or_else(|| {
            PathBuf::from("~").join(FREIGHTER_HOME_DIR).join(CHECKPOINTS_SUBDIR)
        });
        Arc::new(FileCheckpointStore::new(dir))
    }

    /// Loads the checkpoint named by `resume_id` and computes the
    /// repositories a resumed run still has to process.
    pub async fn setup_resume(
        &self,
        options: &TreeReplicatorOptions,
    ) -> FreighterResult<(TreeCheckpoint, Vec<String>)> {
        let resume_id = options.resume_id.as_deref().ok_or_else(|| {
            FreighterError::InvalidInput("resume requested without a resume id".into())
        })?;
        let store = Self::checkpoint_store(options);
        let mut checkpoint = store.load(resume_id).await?;
        let remaining =
            checkpoint.get_remaining(options.skip_completed, options.retry_failed);
        checkpoint.set_status(CheckpointStatus::InProgress);
        tracing::info!(
            "resuming checkpoint {}: {} of {} repositories remain",
            resume_id,
            remaining.len(),
            checkpoint.get_repositories().len()
        );
        Ok((checkpoint, remaining))
    }

    /// Replicates every repository under `source_prefix` into
    /// `dest_prefix`. One repository's failure never cancels its peers;
    /// failures surface in the result and the checkpoint.
    pub async fn replicate(
        &self,
        source_prefix: &str,
        dest_prefix: &str,
        options: &TreeReplicatorOptions,
        cancel: &CancellationToken,
    ) -> FreighterResult<TreeReplicationResult> {
        let (repos, shared) = self
            .plan(source_prefix, dest_prefix, options)
            .await?;
        let repositories_total = repos.len() as u64;

        let workers = resolve_worker_count(options.worker_count, true);
        tracing::info!(
            "replicating {} repositories from {}/{} to {}/{} with {} workers",
            repos.len(),
            self.source.get_registry_name(),
            source_prefix,
            self.dest.get_registry_name(),
            dest_prefix,
            workers
        );

        let counters = Arc::new(TreeCounters::default());
        let mut group = ConcurrencyGroup::new(workers, cancel.clone());

        for repo in repos {
            let replicator_source = self.source.clone();
            let replicator_dest = self.dest.clone();
            let encryption = self.encryption.clone();
            let options = options.clone();
            let counters = counters.clone();
            let shared = shared.clone();
            let cancel = cancel.clone();
            let dest_name = map_repository(source_prefix, dest_prefix, &repo);

            group.spawn(async move {
                if let Some(shared) = &shared {
                    shared.record(&repo, CheckpointStatus::InProgress).await?;
                }

                let outcome = replicate_one_repository(
                    replicator_source,
                    replicator_dest,
                    &repo,
                    &dest_name,
                    &options,
                    encryption,
                    &counters,
                    &cancel,
                )
                .await;

                let status = match &outcome {
                    Ok(true) => CheckpointStatus::Completed,
                    _ => CheckpointStatus::Failed,
                };
                if let Some(shared) = &shared {
                    shared.record(&repo, status).await?;
                }

                match outcome {
                    Ok(true) => {
                        counters
                            .repositories_completed
                            .fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(false) => {
                        counters.repositories_failed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => {
                        if err.is_cancelled() {
                            return Err(err);
                        }
                        counters.repositories_failed.fetch_add(1, Ordering::SeqCst);
                        let message = format!("repository {}: {}", repo, err);
                        tracing::warn!("{}", message);
                        counters
                            .errors
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .push(message);
                    }
                }
                Ok(())
            });
        }

        let outcome = group.wait().await;
        if outcome.cancelled {
            return Err(FreighterError::Cancelled);
        }

        let checkpoint_id = match &shared {
            Some(shared) => Some(shared.finish().await?),
            None => None,
        };

        let errors = counters
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        Ok(TreeReplicationResult {
            repositories_total,
            repositories_completed: counters.repositories_completed.load(Ordering::SeqCst),
            repositories_failed: counters.repositories_failed.load(Ordering::SeqCst),
            tags_copied: counters.tags_copied.load(Ordering::SeqCst),
            tags_skipped: counters.tags_skipped.load(Ordering::SeqCst),
            bytes_transferred: counters.bytes_transferred.load(Ordering::SeqCst),
            checkpoint_id,
            errors,
        })
    }

    /// Resolves the repository list and checkpoint for a run: either a
    /// fresh listing (optionally with a fresh checkpoint) or the remaining
    /// set of a resumed checkpoint.
    async fn plan(
        &self,
        source_prefix: &str,
        dest_prefix: &str,
        options: &TreeReplicatorOptions,
    ) -> FreighterResult<(Vec<String>, Option<Arc<SharedCheckpoint>>)> {
        if options.resume_id.is_some() {
            let store = Self::checkpoint_store(options);
            let (checkpoint, remaining) = self.setup_resume(options).await?;
            let shared = Arc::new(SharedCheckpoint {
                store,
                checkpoint: Mutex::new(checkpoint),
            });
            return Ok((remaining, Some(shared)));
        }

        let mut repos = self.source.list_repositories(source_prefix).await?;
        repos.retain(|repo| !options.exclude_repositories.contains(repo));

        if !options.enable_checkpointing {
            return Ok((repos, None));
        }

        let id = format!(
            "tree-{}-{:08x}",
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            rand::random::<u32>()
        );
        let mut entries = BTreeMap::new();
        for repo in &repos {
            entries.insert(
                repo.clone(),
                RepoCheckpoint::pending(repo, map_repository(source_prefix, dest_prefix, repo)),
            );
        }
        let checkpoint = TreeCheckpoint::new(
            id,
            self.source.get_registry_name(),
            source_prefix,
            self.dest.get_registry_name(),
            dest_prefix,
            entries,
        );

        let store = Self::checkpoint_store(options);
        store.save(&checkpoint).await?;
        let shared = Arc::new(SharedCheckpoint {
            store,
            checkpoint: Mutex::new(checkpoint),
        });
        Ok((repos, Some(shared)))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Maps a source repository name under `source_prefix` to its destination
/// name under `dest_prefix`.
pub fn map_repository(source_prefix: &str, dest_prefix: &str, repo: &str) -> String {
    let suffix = repo
        .strip_prefix(source_prefix)
        .map(|s| s.trim_start_matches('/'))
        .unwrap_or(repo);
    if dest_prefix.is_empty() {
        return suffix.to_string();
    }
    if suffix.is_empty() {
        return dest_prefix.to_string();
    }
    format!("{}/{}", dest_prefix, suffix)
}

/// Replicates one repository. Returns `Ok(true)` when every tag copied or
/// skipped cleanly.
#[allow(clippy::too_many_arguments)]
async fn replicate_one_repository(
    source: Arc<dyn RegistryClient>,
    dest: Arc<dyn RegistryClient>,
    source_name: &str,
    dest_name: &str,
    options: &TreeReplicatorOptions,
    encryption: Option<Arc<EnvelopeManager>>,
    counters: &TreeCounters,
    cancel: &CancellationToken,
) -> FreighterResult<bool> {
    let source_repo = source.get_repository(source_name).await?;
    let dest_repo = match dest
        .create_repository(dest_name, &std::collections::HashMap::new())
        .await
    {
        Ok(repo) => repo,
        Err(FreighterError::NotImplemented(_)) => dest.get_repository(dest_name).await?,
        Err(err) => return Err(err),
    };

    let all_tags = source_repo.list_tags().await?;
    let mut tags: Vec<String> = if options.include_tags.is_empty() {
        all_tags
    } else {
        all_tags
            .into_iter()
            .filter(|tag| options.include_tags.contains(tag))
            .collect()
    };
    tags.retain(|tag| !options.exclude_tags.contains(tag));

    let repo_options = RepoCopyOptions::builder()
        .tags(tags)
        .force_overwrite(options.force_overwrite)
        .dry_run(options.dry_run)
        .copy(options.copy.clone())
        .build();

    let summary =
        copy_repository(source_repo, dest_repo, &repo_options, encryption, cancel).await?;

    counters
        .tags_copied
        .fetch_add(*summary.get_tags_copied(), Ordering::SeqCst);
    counters
        .tags_skipped
        .fetch_add(*summary.get_tags_skipped(), Ordering::SeqCst);
    counters
        .bytes_transferred
        .fetch_add(*summary.get_bytes_transferred(), Ordering::SeqCst);

    if !summary.success() {
        counters
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(
                summary
                    .get_errors()
                    .iter()
                    .map(|e| format!("repository {}: {}", source_name, e)),
            );
    }
    Ok(summary.success())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::MemoryRegistry;

    fn seeded_source() -> Arc<MemoryRegistry> {
        let registry = Arc::new(MemoryRegistry::new("src.example.com"));
        registry.repo("team/app1").seed_image("v1", &[b"a1"]);
        registry.repo("team/app1").seed_image("v2", &[b"a2"]);
        registry.repo("team/app2").seed_image("v1", &[b"b1"]);
        registry.repo("team/app3").seed_image("v1", &[b"c1"]);
        registry.repo("other/tool").seed_image("v1", &[b"d1"]);
        registry
    }

    #[test]
    fn test_map_repository() {
        assert_eq!(map_repository("team", "mirror/team", "team/app"), "mirror/team/app");
        assert_eq!(map_repository("", "mirror", "team/app"), "mirror/team/app");
        assert_eq!(map_repository("team", "", "team/app"), "app");
        assert_eq!(map_repository("team", "mirror", "team"), "mirror");
    }

    #[test_log::test(tokio::test)]
    async fn test_tree_replication_copies_prefix() -> anyhow::Result<()> {
        let source = seeded_source();
        let dest = Arc::new(MemoryRegistry::new("dst.example.com"));

        let replicator = TreeReplicator::new(source, dest.clone());
        let result = replicator
            .replicate(
                "team",
                "mirror/team",
                &TreeReplicatorOptions::default(),
                &CancellationToken::new(),
            )
            .await?;

        assert_eq!(*result.get_repositories_total(), 3);
        assert_eq!(*result.get_repositories_completed(), 3);
        assert_eq!(*result.get_repositories_failed(), 0);
        assert_eq!(*result.get_tags_copied(), 4);
        assert!(dest.repo("mirror/team/app1").manifest_digest("v2").is_some());
        assert!(dest.repo("mirror/team/app3").manifest_digest("v1").is_some());
        // Repositories outside the prefix stay untouched.
        assert_eq!(dest.list_repositories("mirror/other").await?.len(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tree_replication_applies_filters() -> anyhow::Result<()> {
        let source = seeded_source();
        let dest = Arc::new(MemoryRegistry::new("dst.example.com"));

        let options = TreeReplicatorOptions::builder()
            .exclude_repositories(vec!["team/app2".to_string()])
            .include_tags(vec!["v1".to_string()])
            .build();
        let replicator = TreeReplicator::new(source, dest.clone());
        let result = replicator
            .replicate("team", "mirror/team", &options, &CancellationToken::new())
            .await?;

        assert_eq!(*result.get_repositories_total(), 2);
        assert_eq!(*result.get_tags_copied(), 2);
        assert!(dest.repo("mirror/team/app1").manifest_digest("v1").is_some());
        assert!(dest.repo("mirror/team/app1").manifest_digest("v2").is_none());
        assert_eq!(dest.list_repositories("mirror/team/app2").await?.len(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tree_replication_checkpoints_and_resumes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let checkpoint_dir = temp.path().join("checkpoints");

        let source = seeded_source();
        let dest = Arc::new(MemoryRegistry::new("dst.example.com"));

        let options = TreeReplicatorOptions::builder()
            .enable_checkpointing(true)
            .checkpoint_directory(Some(checkpoint_dir.clone()))
            .build();
        let replicator = TreeReplicator::new(source.clone(), dest.clone());
        let result = replicator
            .replicate("team", "mirror/team", &options, &CancellationToken::new())
            .await?;

        let checkpoint_id = result.get_checkpoint_id().clone().unwrap();
        let store = FileCheckpointStore::new(&checkpoint_dir);
        let checkpoint = store.load(&checkpoint_id).await?;
        assert_eq!(*checkpoint.get_status(), CheckpointStatus::Completed);
        assert_eq!(checkpoint.get_completed_repositories().len(), 3);
        assert_eq!(*checkpoint.get_progress(), 100.0);

        // Resuming a completed checkpoint with skip_completed finds nothing
        // left to do.
        let resume_options = TreeReplicatorOptions::builder()
            .checkpoint_directory(Some(checkpoint_dir.clone()))
            .resume_id(Some(checkpoint_id.clone()))
            .build();
        let (_, remaining) = replicator.setup_resume(&resume_options).await?;
        assert!(remaining.is_empty());

        let resumed = replicator
            .replicate("team", "mirror/team", &resume_options, &CancellationToken::new())
            .await?;
        assert_eq!(*resumed.get_repositories_total(), 0);
        assert_eq!(*resumed.get_tags_copied(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tree_resume_retries_failed_repositories() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let checkpoint_dir = temp.path().join("checkpoints");
        let store = FileCheckpointStore::new(&checkpoint_dir);

        // A checkpoint left behind by a partially failed run.
        let mut entries = BTreeMap::new();
        for (name, status) in [
            ("team/app1", CheckpointStatus::Completed),
            ("team/app2", CheckpointStatus::Failed),
            ("team/app3", CheckpointStatus::Pending),
        ] {
            let mut entry = RepoCheckpoint::pending(name, map_repository("team", "mirror/team", name));
            entry.set_status(status);
            entries.insert(name.to_string(), entry);
        }
        let checkpoint = TreeCheckpoint::new(
            "cp-resume",
            "src.example.com",
            "team",
            "dst.example.com",
            "mirror/team",
            entries,
        );
        store.save(&checkpoint).await?;

        let source = seeded_source();
        let dest = Arc::new(MemoryRegistry::new("dst.example.com"));
        let replicator = TreeReplicator::new(source, dest.clone());

        let options = TreeReplicatorOptions::builder()
            .checkpoint_directory(Some(checkpoint_dir.clone()))
            .resume_id(Some("cp-resume".to_string()))
            .build();
        let result = replicator
            .replicate("team", "mirror/team", &options, &CancellationToken::new())
            .await?;

        // Only the failed and pending repositories run; counters reflect
        // just this resumed run.
        assert_eq!(*result.get_repositories_total(), 2);
        assert_eq!(*result.get_repositories_completed(), 2);
        assert!(dest.repo("mirror/team/app2").manifest_digest("v1").is_some());
        assert!(dest.repo("mirror/team/app3").manifest_digest("v1").is_some());
        assert_eq!(dest.list_repositories("mirror/team/app1").await?.len(), 0);

        let updated = store.load("cp-resume").await?;
        assert_eq!(*updated.get_status(), CheckpointStatus::Completed);
        Ok(())
    }
}
