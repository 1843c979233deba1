//! The single-repository copier: per-tag digest compare and copy with a
//! worker-pooled fan-out.

use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use getset::Getters;
use oci_spec::image::Digest;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    config::{detect_worker_count, MAX_REPLICATION_WORKERS},
    encrypt::EnvelopeManager,
    reference::validate_tag,
    registry::Repository,
    transport::{BlobInfo, BlobStream, ImageDestination, ImageSource, Manifest},
    FreighterError, FreighterResult, Reference,
};

use super::{copy_between, ConcurrencyGroup, CopyOptions};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many candidate tags a missing-manifest diagnostic lists.
const DIAGNOSTIC_TAG_LIMIT: usize = 10;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options for copying one repository.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct RepoCopyOptions {
    /// The tags to copy; empty means every tag in the source.
    pub tags: Vec<String>,

    /// Copy even when the destination already has the digest.
    pub force_overwrite: bool,

    /// Compute the plan but write nothing.
    pub dry_run: bool,

    /// Concurrent tag workers. Zero auto-detects from the CPU count when
    /// auto-detection is enabled.
    pub worker_count: usize,

    /// Whether a zero worker count resolves to the CPU count.
    #[builder(default = true)]
    pub auto_detect_workers: bool,

    /// Per-image copy options (blob parallelism, retries, progress).
    pub copy: CopyOptions,
}

/// The aggregate outcome of one repository copy.
#[derive(Debug, Clone, Default, Getters)]
#[getset(get = "pub with_prefix")]
pub struct RepoCopySummary {
    /// Tags whose images were copied.
    tags_copied: u64,

    /// Tags skipped because the destination already had the digest.
    tags_skipped: u64,

    /// Tags whose copy failed.
    error_count: u64,

    /// Total bytes moved.
    bytes_transferred: i64,

    /// One message per failed tag.
    errors: Vec<String>,
}

/// Additive counters shared by tag workers.
#[derive(Debug, Default)]
struct RepoCounters {
    tags_copied: AtomicU64,
    tags_skipped: AtomicU64,
    error_count: AtomicU64,
    bytes_transferred: AtomicI64,
    errors: Mutex<Vec<String>>,
}

/// An [`ImageSource`] over a registry repository and tag.
pub struct RepositoryImageSource {
    repo: Arc<dyn Repository>,
    tag: String,
    reference: Reference,
}

/// An [`ImageDestination`] over a registry repository and tag.
pub struct RepositoryImageDestination {
    repo: Arc<dyn Repository>,
    tag: String,
    reference: Reference,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Default for RepoCopyOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RepoCopySummary {
    /// True when every tag copied or skipped cleanly.
    pub fn success(&self) -> bool {
        self.error_count == 0
    }
}

impl RepoCounters {
    fn snapshot(&self) -> RepoCopySummary {
        RepoCopySummary {
            tags_copied: self.tags_copied.load(Ordering::SeqCst),
            tags_skipped: self.tags_skipped.load(Ordering::SeqCst),
            error_count: self.error_count.load(Ordering::SeqCst),
            bytes_transferred: self.bytes_transferred.load(Ordering::SeqCst),
            errors: self
                .errors
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }

    fn record_error(&self, message: String) {
        tracing::warn!("{}", message);
        self.error_count.fetch_add(1, Ordering::SeqCst);
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
    }
}

impl RepositoryImageSource {
    /// Creates a source reading the given tag of a repository.
    pub fn new(repo: Arc<dyn Repository>, tag: impl Into<String>) -> FreighterResult<Self> {
        let tag = tag.into();
        let reference = repo.get_image_reference(&tag)?;
        Ok(Self {
            repo,
            tag,
            reference,
        })
    }
}

impl RepositoryImageDestination {
    /// Creates a destination writing the given tag of a repository.
    pub fn new(repo: Arc<dyn Repository>, tag: impl Into<String>) -> FreighterResult<Self> {
        let tag = tag.into();
        let reference = repo.get_image_reference(&tag)?;
        Ok(Self {
            repo,
            tag,
            reference,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Copies some or all tags of a source repository to a destination
/// repository. One tag's failure never cancels its peers; the summary's
/// `error_count` reflects the failures.
pub async fn copy_repository(
    source: Arc<dyn Repository>,
    dest: Arc<dyn Repository>,
    options: &RepoCopyOptions,
    encryption: Option<Arc<EnvelopeManager>>,
    cancel: &CancellationToken,
) -> FreighterResult<RepoCopySummary> {
    let tags = if options.tags.is_empty() {
        source.list_tags().await?
    } else {
        options.tags.clone()
    };

    let workers = resolve_worker_count(options.worker_count, options.auto_detect_workers);
    tracing::info!(
        "copying {} tags of {}/{} with {} workers",
        tags.len(),
        source.get_registry_name(),
        source.get_name(),
        workers
    );

    let counters = Arc::new(RepoCounters::default());
    let mut group = ConcurrencyGroup::new(workers, cancel.clone());

    for tag in tags {
        let source = source.clone();
        let dest = dest.clone();
        let options = options.clone();
        let encryption = encryption.clone();
        let counters = counters.clone();
        let cancel = cancel.clone();
        group.spawn(async move {
            if let Err(err) =
                copy_tag(source, dest, &tag, &options, encryption, &counters, &cancel).await
            {
                if err.is_cancelled() {
                    return Err(err);
                }
                counters.record_error(format!("tag {}: {}", tag, err));
            }
            Ok(())
        });
    }

    let outcome = group.wait().await;
    if outcome.cancelled {
        return Err(FreighterError::Cancelled);
    }

    Ok(counters.snapshot())
}

/// Copies a single tag, honoring the skip policy.
async fn copy_tag(
    source: Arc<dyn Repository>,
    dest: Arc<dyn Repository>,
    tag: &str,
    options: &RepoCopyOptions,
    encryption: Option<Arc<EnvelopeManager>>,
    counters: &RepoCounters,
    cancel: &CancellationToken,
) -> FreighterResult<()> {
    validate_tag(tag)?;

    if !options.force_overwrite {
        match should_skip_tag(&source, &dest, tag).await {
            Ok(true) => {
                tracing::debug!("tag {} unchanged at destination, skipping", tag);
                counters.tags_skipped.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            Ok(false) => {}
            Err(err) => return Err(annotate_missing_manifest(err, &source, tag).await),
        }
    }

    let image_source: Arc<dyn ImageSource> =
        Arc::new(RepositoryImageSource::new(source.clone(), tag)?);
    let image_dest: Arc<dyn ImageDestination> =
        Arc::new(RepositoryImageDestination::new(dest, tag)?);

    let mut copy_options = options.copy.clone();
    copy_options.force_overwrite = options.force_overwrite;
    copy_options.dry_run = options.dry_run;

    let result = match copy_between(image_source, image_dest, &copy_options, encryption, cancel)
        .await
    {
        Ok(result) => result,
        Err(err) => return Err(annotate_missing_manifest(err, &source, tag).await),
    };

    counters.tags_copied.fetch_add(1, Ordering::SeqCst);
    counters
        .bytes_transferred
        .fetch_add(*result.get_bytes_transferred(), Ordering::SeqCst);
    Ok(())
}

/// The digest-skip policy.
///
/// The tag is skipped iff both manifests exist and their digests match. A
/// missing destination manifest means "copy"; a source manifest fetch error
/// is a hard error for the tag.
pub async fn should_skip_tag(
    source: &Arc<dyn Repository>,
    dest: &Arc<dyn Repository>,
    tag: &str,
) -> FreighterResult<bool> {
    let source_manifest = source.get_manifest(tag).await?;

    match dest.get_manifest(tag).await {
        Ok(dest_manifest) => Ok(source_manifest.get_digest() == dest_manifest.get_digest()),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => {
            // A defective destination check never blocks the copy.
            tracing::warn!(
                "destination manifest check for tag {} failed, copying anyway: {}",
                tag,
                err
            );
            Ok(false)
        }
    }
}

/// Resolves the worker count: the caller's value, the CPU count when zero
/// and auto-detection is on, capped at 100 with a warning past 2x the CPUs.
pub fn resolve_worker_count(requested: usize, auto_detect: bool) -> usize {
    let cpus = detect_worker_count();
    let mut count = match requested {
        0 if auto_detect => cpus,
        0 => 1,
        n => n,
    };
    if count > MAX_REPLICATION_WORKERS {
        tracing::warn!(
            "worker count {} exceeds the absolute cap, using {}",
            count,
            MAX_REPLICATION_WORKERS
        );
        count = MAX_REPLICATION_WORKERS;
    }
    if count > cpus * 2 {
        tracing::warn!(
            "worker count {} exceeds twice the CPU count ({})",
            count,
            cpus
        );
    }
    count
}

/// Extends a missing-manifest error with up to ten tags the source does
/// have. The listing is best-effort diagnostics; a failed listing falls
/// back to the original error.
async fn annotate_missing_manifest(
    err: FreighterError,
    source: &Arc<dyn Repository>,
    tag: &str,
) -> FreighterError {
    if !err.is_not_found() {
        return err;
    }
    match source.list_tags().await {
        Ok(tags) => {
            let sample: Vec<&str> = tags
                .iter()
                .take(DIAGNOSTIC_TAG_LIMIT)
                .map(String::as_str)
                .collect();
            FreighterError::ManifestNotFound(format!(
                "tag {} not found in {}/{}; available tags include {:?}",
                tag,
                source.get_registry_name(),
                source.get_name(),
                sample
            ))
        }
        Err(_) => err,
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ImageSource for RepositoryImageSource {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    async fn get_manifest(&self, instance_digest: Option<&Digest>) -> FreighterResult<Manifest> {
        match instance_digest {
            Some(digest) => self.repo.get_manifest(&digest.to_string()).await,
            None => self.repo.get_manifest(&self.tag).await,
        }
    }

    async fn get_blob(&self, info: &BlobInfo) -> FreighterResult<(BlobStream, i64)> {
        self.repo.get_blob(info.get_digest()).await
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }
}

#[async_trait]
impl ImageDestination for RepositoryImageDestination {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    async fn put_blob(
        &self,
        stream: BlobStream,
        info: &BlobInfo,
        _is_config: bool,
    ) -> FreighterResult<BlobInfo> {
        self.repo
            .put_blob(info.get_digest(), *info.get_size(), stream)
            .await
    }

    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        _can_substitute: bool,
    ) -> FreighterResult<Option<BlobInfo>> {
        if self.repo.blob_exists(info.get_digest()).await? {
            return Ok(Some(info.clone()));
        }
        Ok(None)
    }

    async fn put_manifest(
        &self,
        bytes: &[u8],
        instance_digest: Option<&Digest>,
    ) -> FreighterResult<()> {
        let media_type = serde_json::from_slice::<serde_json::Value>(bytes)
            .ok()
            .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_else(|| crate::transport::DOCKER_MANIFEST_MIME_TYPE.to_string());
        let manifest = Manifest::new(bytes.to_vec(), media_type);

        let reference = match instance_digest {
            Some(digest) => digest.to_string(),
            None => self.tag.clone(),
        };
        self.repo.put_manifest(&reference, &manifest).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::MemoryRegistry;

    #[test_log::test(tokio::test)]
    async fn test_skip_unchanged_tag() -> anyhow::Result<()> {
        let source_registry = MemoryRegistry::new("src.example.com");
        let dest_registry = MemoryRegistry::new("dst.example.com");
        let source = source_registry.repo("src/app");
        let dest = dest_registry.repo("dst/app");

        let src_digest = source.seed_image("v1", &[b"layer-one"]);
        let dst_digest = dest.seed_image("v1", &[b"layer-one"]);
        assert_eq!(src_digest, dst_digest);

        let summary = copy_repository(
            source,
            dest,
            &RepoCopyOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(*summary.get_tags_copied(), 0);
        assert_eq!(*summary.get_tags_skipped(), 1);
        assert_eq!(*summary.get_error_count(), 0);
        assert!(summary.success());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_copy_new_tag_and_skip_existing() -> anyhow::Result<()> {
        let source_registry = MemoryRegistry::new("src.example.com");
        let dest_registry = MemoryRegistry::new("dst.example.com");
        let source = source_registry.repo("src/app");
        let dest = dest_registry.repo("dst/app");

        source.seed_image("v1", &[b"layer-one"]);
        let v2_digest = source.seed_image("v2", &[b"layer-two"]);
        dest.seed_image("v1", &[b"layer-one"]);

        let summary = copy_repository(
            source,
            dest.clone(),
            &RepoCopyOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(*summary.get_tags_copied(), 1);
        assert_eq!(*summary.get_tags_skipped(), 1);
        assert_eq!(*summary.get_error_count(), 0);
        assert_eq!(dest.manifest_digest("v2"), Some(v2_digest));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_force_overwrite_copies_unchanged_tags() -> anyhow::Result<()> {
        let source_registry = MemoryRegistry::new("src.example.com");
        let dest_registry = MemoryRegistry::new("dst.example.com");
        let source = source_registry.repo("src/app");
        let dest = dest_registry.repo("dst/app");

        source.seed_image("v1", &[b"layer-one"]);
        dest.seed_image("v1", &[b"layer-one"]);

        let options = RepoCopyOptions::builder().force_overwrite(true).build();
        let summary = copy_repository(
            source,
            dest,
            &options,
            None,
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(*summary.get_tags_copied(), 1);
        assert_eq!(*summary.get_tags_skipped(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_tag_whitelist_limits_copy() -> anyhow::Result<()> {
        let source_registry = MemoryRegistry::new("src.example.com");
        let dest_registry = MemoryRegistry::new("dst.example.com");
        let source = source_registry.repo("src/app");
        let dest = dest_registry.repo("dst/app");

        source.seed_image("v1", &[b"one"]);
        source.seed_image("v2", &[b"two"]);
        source.seed_image("v3", &[b"three"]);

        let options = RepoCopyOptions::builder()
            .tags(vec!["v2".to_string()])
            .build();
        let summary = copy_repository(
            source,
            dest.clone(),
            &options,
            None,
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(*summary.get_tags_copied(), 1);
        assert!(dest.manifest_digest("v2").is_some());
        assert!(dest.manifest_digest("v1").is_none());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_tag_lists_candidates() -> anyhow::Result<()> {
        let source_registry = MemoryRegistry::new("src.example.com");
        let dest_registry = MemoryRegistry::new("dst.example.com");
        let source = source_registry.repo("src/app");
        let dest = dest_registry.repo("dst/app");

        source.seed_image("v1", &[b"one"]);
        source.seed_image("v2", &[b"two"]);

        let options = RepoCopyOptions::builder()
            .tags(vec!["nope".to_string()])
            .build();
        let summary = copy_repository(
            source,
            dest,
            &options,
            None,
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(*summary.get_error_count(), 1);
        assert!(!summary.success());
        let message = &summary.get_errors()[0];
        assert!(message.contains("available tags include"), "{}", message);
        assert!(message.contains("v1") && message.contains("v2"));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_one_bad_tag_does_not_cancel_peers() -> anyhow::Result<()> {
        let source_registry = MemoryRegistry::new("src.example.com");
        let dest_registry = MemoryRegistry::new("dst.example.com");
        let source = source_registry.repo("src/app");
        let dest = dest_registry.repo("dst/app");

        source.seed_image("good", &[b"bytes"]);

        let options = RepoCopyOptions::builder()
            .tags(vec!["good".to_string(), "missing".to_string()])
            .build();
        let summary = copy_repository(
            source,
            dest.clone(),
            &options,
            None,
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(*summary.get_tags_copied(), 1);
        assert_eq!(*summary.get_error_count(), 1);
        assert!(dest.manifest_digest("good").is_some());
        Ok(())
    }

    #[test]
    fn test_resolve_worker_count() {
        let cpus = detect_worker_count();
        assert_eq!(resolve_worker_count(0, true), cpus);
        assert_eq!(resolve_worker_count(0, false), 1);
        assert_eq!(resolve_worker_count(7, true), 7);
        assert_eq!(resolve_worker_count(10_000, true), MAX_REPLICATION_WORKERS);
    }
}
