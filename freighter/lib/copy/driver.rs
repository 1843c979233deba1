//! The blob-by-blob image copy driver.
//!
//! Ordering within one image: the config blob first, then layers (bounded
//! concurrency where the source allows it), and the manifest strictly last,
//! after every referenced blob was uploaded or deduplicated.

use std::sync::{
    atomic::{AtomicI64, AtomicUsize, Ordering},
    Arc,
};

use futures::{stream, StreamExt};
use oci_spec::image::ImageIndex;
use tokio_util::{io::StreamReader, sync::CancellationToken};

use crate::{
    encrypt::{EncryptOptions, EnvelopeManager},
    transport::{BlobInfo, ImageDestination, ImageSource, Manifest},
    utils::sha256_digest,
    FreighterError, FreighterResult, Reference,
};

use super::{ConcurrencyGroup, CopyOptions, CopyResult, ProgressEvent};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Shared accumulators for one image copy.
#[derive(Debug, Default)]
struct CopyCounters {
    bytes_transferred: AtomicI64,
    layers_copied: AtomicUsize,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Copies one image between two references, blob by blob.
pub async fn copy_image(
    source_ref: &Reference,
    dest_ref: &Reference,
    options: &CopyOptions,
    encryption: Option<Arc<EnvelopeManager>>,
    cancel: &CancellationToken,
) -> FreighterResult<CopyResult> {
    tracing::info!("copying {} to {}", source_ref, dest_ref);
    let source: Arc<dyn ImageSource> = Arc::from(source_ref.new_image_source().await?);
    let dest: Arc<dyn ImageDestination> = Arc::from(dest_ref.new_image_destination().await?);
    copy_between(source, dest, options, encryption, cancel).await
}

/// Copies one image between an already-opened source and destination.
pub async fn copy_between(
    source: Arc<dyn ImageSource>,
    dest: Arc<dyn ImageDestination>,
    options: &CopyOptions,
    encryption: Option<Arc<EnvelopeManager>>,
    cancel: &CancellationToken,
) -> FreighterResult<CopyResult> {
    let start_time = chrono::Utc::now();
    let counters = Arc::new(CopyCounters::default());

    let manifest = source.get_manifest(None).await?;
    if is_index_media_type(manifest.get_media_type()) {
        let index: ImageIndex = serde_json::from_slice(manifest.get_bytes())?;
        for descriptor in index.manifests() {
            if cancel.is_cancelled() {
                return Err(FreighterError::Cancelled);
            }
            let child = source.get_manifest(Some(descriptor.digest())).await?;
            copy_single_manifest(
                &source,
                &dest,
                &child,
                options,
                encryption.clone(),
                &counters,
                cancel,
            )
            .await?;
            if options.include_manifests && !options.dry_run {
                dest.put_manifest(child.get_bytes(), Some(descriptor.digest()))
                    .await?;
            }
        }
    } else {
        copy_single_manifest(
            &source,
            &dest,
            &manifest,
            options,
            encryption.clone(),
            &counters,
            cancel,
        )
        .await?;
    }

    if options.include_manifests && !options.dry_run {
        dest.put_manifest(manifest.get_bytes(), None).await?;
        dest.commit().await?;
    }

    Ok(CopyResult::succeeded(
        counters.bytes_transferred.load(Ordering::SeqCst),
        counters.layers_copied.load(Ordering::SeqCst),
        start_time,
    ))
}

/// Copies the config and layers referenced by one (non-index) manifest.
async fn copy_single_manifest(
    source: &Arc<dyn ImageSource>,
    dest: &Arc<dyn ImageDestination>,
    manifest: &Manifest,
    options: &CopyOptions,
    encryption: Option<Arc<EnvelopeManager>>,
    counters: &Arc<CopyCounters>,
    cancel: &CancellationToken,
) -> FreighterResult<()> {
    let parsed = manifest.parsed()?;

    let config_info = BlobInfo::new(
        parsed.config().digest().clone(),
        parsed.config().size() as i64,
        parsed.config().media_type().to_string(),
    );
    transfer_blob(
        source.clone(),
        dest.clone(),
        config_info,
        true,
        options,
        encryption.clone(),
        counters.clone(),
    )
    .await?;

    if !options.include_layers {
        return Ok(());
    }

    let layer_infos = match source.layer_infos_for_copy().await? {
        Some(infos) => infos,
        None => parsed
            .layers()
            .iter()
            .map(|layer| {
                BlobInfo::new(
                    layer.digest().clone(),
                    layer.size() as i64,
                    layer.media_type().to_string(),
                )
            })
            .collect(),
    };

    // Tar-backed sources read sequentially; only fan out when the source
    // says concurrent reads are safe.
    let parallel = if source.has_thread_safe_get_blob() {
        options.parallel_copies.max(1)
    } else {
        1
    };

    let mut group = ConcurrencyGroup::new(parallel, cancel.clone());
    for info in layer_infos {
        let source = source.clone();
        let dest = dest.clone();
        let options = options.clone();
        let encryption = encryption.clone();
        let counters = counters.clone();
        group.spawn(async move {
            transfer_blob(source, dest, info, false, &options, encryption, counters).await
        });
    }
    group.wait().await.into_result()?;
    Ok(())
}

/// Moves one blob, honoring dedup, dry-run, optional payload encryption,
/// and the layer-level retry budget.
async fn transfer_blob(
    source: Arc<dyn ImageSource>,
    dest: Arc<dyn ImageDestination>,
    info: BlobInfo,
    is_config: bool,
    options: &CopyOptions,
    encryption: Option<Arc<EnvelopeManager>>,
    counters: Arc<CopyCounters>,
) -> FreighterResult<()> {
    if !options.force_overwrite {
        if let Some(existing) = dest.try_reusing_blob(&info, false).await? {
            tracing::debug!("blob {} already at destination, reusing", existing.get_digest());
            return Ok(());
        }
    }

    if options.dry_run {
        counters
            .bytes_transferred
            .fetch_add((*info.get_size()).max(0), Ordering::SeqCst);
        if !is_config {
            counters.layers_copied.fetch_add(1, Ordering::SeqCst);
        }
        return Ok(());
    }

    let attempts = options.retry_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match transfer_blob_once(&source, &dest, &info, is_config, encryption.as_deref()).await {
            Ok(written) => {
                let moved = *written.get_size();
                counters.bytes_transferred.fetch_add(moved, Ordering::SeqCst);
                if !is_config {
                    counters.layers_copied.fetch_add(1, Ordering::SeqCst);
                }
                if let Some(callback) = &options.progress_callback {
                    callback(&ProgressEvent {
                        digest: written.get_digest().to_string(),
                        bytes: moved,
                        is_config,
                    });
                }
                return Ok(());
            }
            Err(err) => {
                if attempt < attempts {
                    tracing::warn!(
                        "blob {} transfer attempt {}/{} failed: {}",
                        info.get_digest(),
                        attempt,
                        attempts,
                        err
                    );
                    tokio::time::sleep(options.retry_delay).await;
                }
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        FreighterError::BlobTransferFailed(format!("blob {} never transferred", info.get_digest()))
    }))
}

async fn transfer_blob_once(
    source: &Arc<dyn ImageSource>,
    dest: &Arc<dyn ImageDestination>,
    info: &BlobInfo,
    is_config: bool,
    encryption: Option<&EnvelopeManager>,
) -> FreighterResult<BlobInfo> {
    let (stream, size) = source.get_blob(info).await?;

    match encryption {
        None => {
            let info = BlobInfo::new(info.get_digest().clone(), size, info.get_media_type().clone());
            dest.put_blob(stream, &info, is_config).await
        }
        Some(manager) => {
            // Sealed payloads are content-addressed by their own digest.
            let reader = StreamReader::new(
                stream.map(|item| item.map_err(std::io::Error::other)),
            );
            let mut sealed = Vec::new();
            manager
                .encrypt_stream(reader, &mut sealed, &EncryptOptions::default())
                .await?;

            let sealed_info = BlobInfo::new(
                sha256_digest(&sealed),
                sealed.len() as i64,
                info.get_media_type().clone(),
            );
            let body = bytes::Bytes::from(sealed);
            dest.put_blob(
                stream::once(async move { Ok(body) }).boxed(),
                &sealed_info,
                is_config,
            )
            .await
        }
    }
}

/// Returns true for manifest-list / image-index media types.
fn is_index_media_type(media_type: &str) -> bool {
    media_type.contains("manifest.list") || media_type.contains("image.index")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        DOCKER_CONFIG_MIME_TYPE, DOCKER_LAYER_GZIP_MIME_TYPE, DOCKER_MANIFEST_MIME_TYPE,
    };
    use tokio::fs;

    async fn write_fixture_image(dir: &std::path::Path) -> anyhow::Result<(Vec<u8>, Vec<Vec<u8>>)> {
        fs::create_dir_all(dir).await?;
        let config = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
        let layers = vec![b"first-layer".to_vec(), b"second-layer-content".to_vec()];

        let mut layer_json = Vec::new();
        for layer in &layers {
            let digest = sha256_digest(layer);
            fs::write(dir.join(digest.to_string().replace(':', "-")), layer).await?;
            layer_json.push(serde_json::json!({
                "mediaType": DOCKER_LAYER_GZIP_MIME_TYPE,
                "size": layer.len(),
                "digest": digest.to_string(),
            }));
        }
        let config_digest = sha256_digest(&config);
        fs::write(dir.join(config_digest.to_string().replace(':', "-")), &config).await?;

        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST_MIME_TYPE,
            "config": {
                "mediaType": DOCKER_CONFIG_MIME_TYPE,
                "size": config.len(),
                "digest": config_digest.to_string(),
            },
            "layers": layer_json,
        }))?;
        fs::write(dir.join("manifest.json"), &manifest).await?;
        fs::write(dir.join("version"), "Directory Transport Version: 1.1\n").await?;
        Ok((manifest, layers))
    }

    #[test_log::test(tokio::test)]
    async fn test_copy_image_dir_to_dir() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let src_dir = temp.path().join("src");
        let dst_dir = temp.path().join("dst");
        let (manifest, layers) = write_fixture_image(&src_dir).await?;

        let source_ref = crate::reference::parse(&format!("dir:{}", src_dir.display()))?;
        let dest_ref = crate::reference::parse(&format!("dir:{}", dst_dir.display()))?;

        let result = copy_image(
            &source_ref,
            &dest_ref,
            &CopyOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await?;

        assert!(*result.get_success());
        assert_eq!(*result.get_layers_copied(), 2);
        let expected_bytes: i64 = layers.iter().map(|l| l.len() as i64).sum::<i64>()
            + br#"{"architecture":"amd64","os":"linux"}"#.len() as i64;
        assert_eq!(*result.get_bytes_transferred(), expected_bytes);

        let copied_manifest = fs::read(dst_dir.join("manifest.json")).await?;
        assert_eq!(copied_manifest, manifest);
        for layer in &layers {
            let digest = sha256_digest(layer).to_string().replace(':', "-");
            assert_eq!(&fs::read(dst_dir.join(digest)).await?, layer);
        }
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_copy_image_dry_run_writes_nothing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let src_dir = temp.path().join("src");
        let dst_dir = temp.path().join("dst");
        write_fixture_image(&src_dir).await?;

        let source_ref = crate::reference::parse(&format!("dir:{}", src_dir.display()))?;
        let dest_ref = crate::reference::parse(&format!("dir:{}", dst_dir.display()))?;

        let options = CopyOptions::builder().dry_run(true).build();
        let result = copy_image(
            &source_ref,
            &dest_ref,
            &options,
            None,
            &CancellationToken::new(),
        )
        .await?;

        assert!(*result.get_success());
        assert_eq!(*result.get_layers_copied(), 2);
        assert!(*result.get_bytes_transferred() > 0);
        assert!(!dst_dir.join("manifest.json").exists());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_copy_image_skips_existing_blobs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let src_dir = temp.path().join("src");
        let dst_dir = temp.path().join("dst");
        write_fixture_image(&src_dir).await?;

        let source_ref = crate::reference::parse(&format!("dir:{}", src_dir.display()))?;
        let dest_ref = crate::reference::parse(&format!("dir:{}", dst_dir.display()))?;

        copy_image(
            &source_ref,
            &dest_ref,
            &CopyOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await?;

        // The second copy finds every blob in place.
        let result = copy_image(
            &source_ref,
            &dest_ref,
            &CopyOptions::default(),
            None,
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(*result.get_bytes_transferred(), 0);
        assert_eq!(*result.get_layers_copied(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_copy_image_with_progress_callback() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let src_dir = temp.path().join("src");
        let dst_dir = temp.path().join("dst");
        write_fixture_image(&src_dir).await?;

        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = events.clone();
        let options = CopyOptions::builder()
            .progress_callback(Some(Arc::new(move |event: &ProgressEvent| {
                seen.lock().unwrap().push(event.clone());
            }) as crate::copy::ProgressCallback))
            .build();

        let source_ref = crate::reference::parse(&format!("dir:{}", src_dir.display()))?;
        let dest_ref = crate::reference::parse(&format!("dir:{}", dst_dir.display()))?;
        copy_image(&source_ref, &dest_ref, &options, None, &CancellationToken::new()).await?;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events.iter().filter(|e| e.is_config).count(), 1);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_copy_image_with_encryption_seals_blobs() -> anyhow::Result<()> {
        use crate::{config::EncryptionConfig, encrypt::MemoryKmsProvider};

        let temp = tempfile::tempdir()?;
        let src_dir = temp.path().join("src");
        let dst_dir = temp.path().join("dst");
        let (_, layers) = write_fixture_image(&src_dir).await?;

        let config = EncryptionConfig::builder()
            .enabled(true)
            .default_provider("mem".to_string())
            .data_key_length(32)
            .build();
        let manager = Arc::new(EnvelopeManager::new(config));
        manager.register_provider("mem", Arc::new(MemoryKmsProvider::new("mem")));

        let source_ref = crate::reference::parse(&format!("dir:{}", src_dir.display()))?;
        let dest_ref = crate::reference::parse(&format!("dir:{}", dst_dir.display()))?;
        let result = copy_image(
            &source_ref,
            &dest_ref,
            &CopyOptions::default(),
            Some(manager),
            &CancellationToken::new(),
        )
        .await?;
        assert!(*result.get_success());

        // Sealed payloads are larger than their plaintexts and stored under
        // their own digests.
        for layer in &layers {
            let plain_name = sha256_digest(layer).to_string().replace(':', "-");
            assert!(!dst_dir.join(plain_name).exists());
        }
        assert!(*result.get_bytes_transferred() > layers.iter().map(|l| l.len() as i64).sum::<i64>());
        Ok(())
    }
}
