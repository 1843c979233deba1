//! The replication service façade: configuration-driven wiring of
//! bootstrap, registry clients, copier, tree replicator, checkpoints, and
//! optional payload encryption.

use std::{path::PathBuf, sync::Arc};

use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    checkpoint::{CheckpointService, FileCheckpointStore},
    config::{EngineConfig, CHECKPOINTS_SUBDIR, FREIGHTER_HOME_DIR},
    copy::{copy_image, copy_repository, CopyOptions, CopyResult, RepoCopyOptions, RepoCopySummary},
    encrypt::{AwsKmsProvider, EnvelopeManager, GcpKmsProvider},
    reference,
    registry::{create_registry_client, parse_registry_path, RegistryClient},
    secrets::bootstrap,
    transport::{register_transport, DockerTransport},
    FreighterResult,
};

use super::{TreeReplicationResult, TreeReplicator, TreeReplicatorOptions};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options for replicating one repository between two registries.
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct RepoReplicationOptions {
    /// The tags to replicate; empty means every tag in the source.
    pub tags: Vec<String>,

    /// Compute the plan but write nothing.
    pub dry_run: bool,

    /// Copy even when the destination already has the digest.
    pub force_overwrite: bool,

    /// Concurrent tag workers. Zero auto-detects from the CPU count.
    pub worker_count: usize,

    /// Seal blob payloads with the configured KMS provider.
    pub enable_encryption: bool,
}

/// The replication engine's top-level entry point.
///
/// Construction runs the secrets bootstrap, re-registers the `docker`
/// transport with the resolved configuration, and builds the envelope
/// manager when encryption is configured.
pub struct ReplicationService {
    config: EngineConfig,
    encryption: Option<Arc<EnvelopeManager>>,
    checkpoints: CheckpointService,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ReplicationService {
    /// Creates a service from an engine configuration.
    pub async fn new(mut config: EngineConfig) -> FreighterResult<Self> {
        bootstrap(&mut config).await?;
        register_transport(Arc::new(DockerTransport::with_config(config.clone())));

        let encryption = build_encryption(&config).await?;
        let checkpoints = CheckpointService::new(Arc::new(FileCheckpointStore::new(
            default_checkpoint_dir(),
        )));

        Ok(Self {
            config,
            encryption,
            checkpoints,
        })
    }

    /// Returns the resolved configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the checkpoint service.
    pub fn checkpoints(&self) -> &CheckpointService {
        &self.checkpoints
    }

    /// Returns the envelope manager, when encryption is configured.
    pub fn encryption(&self) -> Option<&Arc<EnvelopeManager>> {
        self.encryption.as_ref()
    }

    /// Copies a single image between two tool-boundary references
    /// (`docker://`, `dir:`, `oci:`, `docker-archive:`). Failures are
    /// reported in the result rather than as errors.
    pub async fn replicate_image(
        &self,
        source: &str,
        dest: &str,
        options: &CopyOptions,
        cancel: &CancellationToken,
    ) -> CopyResult {
        let start_time = chrono::Utc::now();
        let refs = reference::parse(source).and_then(|s| Ok((s, reference::parse(dest)?)));
        let (source_ref, dest_ref) = match refs {
            Ok(refs) => refs,
            Err(err) => return CopyResult::failed(err.to_string(), start_time),
        };

        match copy_image(
            &source_ref,
            &dest_ref,
            options,
            self.encryption.clone(),
            cancel,
        )
        .await
        {
            Ok(result) => result,
            Err(err) => CopyResult::failed(err.to_string(), start_time),
        }
    }

    /// Copies a batch of image pairs sequentially, returning one result per
    /// pair in order.
    pub async fn replicate_batch(
        &self,
        pairs: &[(String, String)],
        options: &CopyOptions,
        cancel: &CancellationToken,
    ) -> Vec<CopyResult> {
        let mut results = Vec::with_capacity(pairs.len());
        for (source, dest) in pairs {
            results.push(self.replicate_image(source, dest, options, cancel).await);
        }
        results
    }

    /// Replicates one repository given `<host>/<repo>[:tag|@digest]` paths.
    /// A tag/digest suffix on either path is stripped; tags come from the
    /// options or from listing the source.
    pub async fn replicate_repository(
        &self,
        source_path: &str,
        dest_path: &str,
        options: &RepoReplicationOptions,
        cancel: &CancellationToken,
    ) -> FreighterResult<RepoCopySummary> {
        let (source_host, source_repo) = parse_registry_path(source_path)?;
        let (dest_host, dest_repo) = parse_registry_path(dest_path)?;

        let source_client = create_registry_client(&source_host, &self.config).await?;
        let dest_client = create_registry_client(&dest_host, &self.config).await?;

        self.replicate_repository_with(
            source_client,
            dest_client,
            &source_repo,
            &dest_repo,
            options,
            cancel,
        )
        .await
    }

    /// Repository replication over already-built clients.
    pub async fn replicate_repository_with(
        &self,
        source_client: Arc<dyn RegistryClient>,
        dest_client: Arc<dyn RegistryClient>,
        source_repo: &str,
        dest_repo: &str,
        options: &RepoReplicationOptions,
        cancel: &CancellationToken,
    ) -> FreighterResult<RepoCopySummary> {
        let source = source_client.get_repository(source_repo).await?;
        let dest = match dest_client
            .create_repository(dest_repo, &std::collections::HashMap::new())
            .await
        {
            Ok(repo) => repo,
            Err(crate::FreighterError::NotImplemented(_)) => {
                dest_client.get_repository(dest_repo).await?
            }
            Err(err) => return Err(err),
        };

        let workers = self.config.get_workers();
        let copy_options = RepoCopyOptions::builder()
            .tags(options.tags.clone())
            .force_overwrite(options.force_overwrite)
            .dry_run(options.dry_run)
            .worker_count(if options.worker_count == 0 {
                *workers.get_worker_count()
            } else {
                options.worker_count
            })
            .auto_detect_workers(*workers.get_auto_detect())
            .copy(
                CopyOptions::builder()
                    .parallel_copies(*workers.get_parallel_copies())
                    .build(),
            )
            .build();
        let encryption = if options.enable_encryption {
            self.encryption.clone()
        } else {
            None
        };

        copy_repository(source, dest, &copy_options, encryption, cancel).await
    }

    /// Replicates a repository tree given `<host>/<prefix>` paths.
    pub async fn replicate_tree(
        &self,
        source_path: &str,
        dest_path: &str,
        options: &TreeReplicatorOptions,
        cancel: &CancellationToken,
    ) -> FreighterResult<TreeReplicationResult> {
        let (source_host, source_prefix) = parse_registry_path(source_path)?;
        let (dest_host, dest_prefix) = parse_registry_path(dest_path)?;

        let source_client = create_registry_client(&source_host, &self.config).await?;
        let dest_client = create_registry_client(&dest_host, &self.config).await?;

        let mut options = options.clone();
        if options.worker_count == 0 {
            options.worker_count = *self.config.get_workers().get_worker_count();
        }

        let mut replicator = TreeReplicator::new(source_client, dest_client);
        if let Some(encryption) = &self.encryption {
            replicator = replicator.with_encryption(encryption.clone());
        }
        replicator
            .replicate(&source_prefix, &dest_prefix, &options, cancel)
            .await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The default checkpoint directory, under the freighter home.
pub fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("~").join(FREIGHTER_HOME_DIR).join(CHECKPOINTS_SUBDIR)
}

/// Builds the envelope manager and registers the configured KMS providers.
async fn build_encryption(config: &EngineConfig) -> FreighterResult<Option<Arc<EnvelopeManager>>> {
    let encryption = config.get_encryption();
    if !*encryption.get_enabled() {
        return Ok(None);
    }

    let manager = EnvelopeManager::new(encryption.clone());

    let aws_key = encryption.get_aws().get_kms_key_id();
    if !aws_key.is_empty() {
        let region = encryption
            .get_region()
            .clone()
            .unwrap_or_else(|| config.get_registry().get_ecr().get_region().clone());
        manager.register_provider("aws", Arc::new(AwsKmsProvider::new(aws_key, region).await?));
    }

    let gcp = encryption.get_gcp();
    if !gcp.get_kms_key_id().is_empty() {
        let gcr = config.get_registry().get_gcr();
        let key_name = gcp.resource_name(gcr.get_project(), gcr.get_location());
        manager.register_provider("gcp", Arc::new(GcpKmsProvider::new(key_name).await?));
    }

    Ok(Some(Arc::new(manager)))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::MemoryRegistry;

    async fn service() -> ReplicationService {
        ReplicationService::new(EngineConfig::default()).await.unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_replicate_repository_with_memory_registries() -> anyhow::Result<()> {
        let service = service().await;
        let source = Arc::new(MemoryRegistry::new("src.example.com"));
        let dest = Arc::new(MemoryRegistry::new("dst.example.com"));
        source.repo("team/app").seed_image("v1", &[b"layer"]);

        let summary = service
            .replicate_repository_with(
                source,
                dest.clone(),
                "team/app",
                "mirror/app",
                &RepoReplicationOptions::default(),
                &CancellationToken::new(),
            )
            .await?;

        assert_eq!(*summary.get_tags_copied(), 1);
        assert!(dest.repo("mirror/app").manifest_digest("v1").is_some());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_replicate_image_reports_parse_failures() {
        let service = service().await;
        let result = service
            .replicate_image(
                "",
                "dir:/tmp/out",
                &CopyOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(!*result.get_success());
        assert!(result.get_error().as_deref().unwrap().contains("empty"));
    }

    #[test_log::test(tokio::test)]
    async fn test_replicate_image_between_dir_layouts() -> anyhow::Result<()> {
        use tokio::fs;

        let service = service().await;
        let temp = tempfile::tempdir()?;
        let src = temp.path().join("src");
        fs::create_dir_all(&src).await?;

        let layer: &[u8] = b"layer";
        let layer_digest = crate::utils::sha256_digest(layer);
        fs::write(src.join(layer_digest.to_string().replace(':', "-")), layer).await?;
        let config: &[u8] = b"{}";
        let config_digest = crate::utils::sha256_digest(config);
        fs::write(src.join(config_digest.to_string().replace(':', "-")), config).await?;
        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": crate::transport::DOCKER_MANIFEST_MIME_TYPE,
            "config": {"mediaType": crate::transport::DOCKER_CONFIG_MIME_TYPE,
                        "size": config.len(), "digest": config_digest.to_string()},
            "layers": [{"mediaType": crate::transport::DOCKER_LAYER_GZIP_MIME_TYPE,
                        "size": layer.len(), "digest": layer_digest.to_string()}],
        }))?;
        fs::write(src.join("manifest.json"), &manifest).await?;

        let dst = temp.path().join("dst");
        let result = service
            .replicate_image(
                &format!("dir:{}", src.display()),
                &format!("dir:{}", dst.display()),
                &CopyOptions::default(),
                &CancellationToken::new(),
            )
            .await;

        assert!(*result.get_success(), "{:?}", result.get_error());
        assert_eq!(fs::read(dst.join("manifest.json")).await?, manifest);
        Ok(())
    }
}
