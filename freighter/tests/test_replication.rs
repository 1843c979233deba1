//! End-to-end replication tests over the local transports.

use std::sync::Arc;

use freighter::{
    config::{EncryptionConfig, EngineConfig},
    copy::{copy_image, CopyOptions},
    encrypt::{EncryptOptions, EnvelopeManager, MemoryKmsProvider},
    reference,
    replicate::ReplicationService,
    transport::{
        DOCKER_CONFIG_MIME_TYPE, DOCKER_LAYER_GZIP_MIME_TYPE, DOCKER_MANIFEST_MIME_TYPE,
    },
    utils::sha256_digest,
};
use tokio::fs;
use tokio_util::sync::CancellationToken;

//--------------------------------------------------------------------------------------------------
// Helpers
//--------------------------------------------------------------------------------------------------

struct FixtureImage {
    manifest: Vec<u8>,
    config: Vec<u8>,
    layers: Vec<Vec<u8>>,
}

/// Writes a two-layer image into a `dir:` layout and returns its parts.
async fn write_dir_image(dir: &std::path::Path) -> anyhow::Result<FixtureImage> {
    fs::create_dir_all(dir).await?;
    let config = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
    let layers = vec![
        b"first layer content".to_vec(),
        b"the second, rather longer, layer content".to_vec(),
    ];

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
    fs::write(
        dir.join(config_digest.to_string().replace(':', "-")),
        &config,
    )
    .await?;

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

    Ok(FixtureImage {
        manifest,
        config,
        layers,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_replication_dir_to_oci_layout() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let src = temp.path().join("src");
    let layout = temp.path().join("layout");
    let fixture = write_dir_image(&src).await?;

    let source_ref = reference::parse(&format!("dir:{}", src.display()))?;
    let dest_ref = reference::parse(&format!("oci:{}:v1", layout.display()))?;
    let result = copy_image(
        &source_ref,
        &dest_ref,
        &CopyOptions::default(),
        None,
        &CancellationToken::new(),
    )
    .await?;
    assert!(*result.get_success());

    // Layout invariants: marker, index, content-addressed blobs.
    let layout_marker = fs::read_to_string(layout.join("oci-layout")).await?;
    assert!(layout_marker.contains("1.0.0"));

    // The index entry's digest is the full hash of the manifest bytes.
    let index: serde_json::Value =
        serde_json::from_slice(&fs::read(layout.join("index.json")).await?)?;
    let entry = &index["manifests"][0];
    assert_eq!(
        entry["digest"].as_str().unwrap(),
        sha256_digest(&fixture.manifest).to_string()
    );
    assert_eq!(
        entry["annotations"]["org.opencontainers.image.ref.name"]
            .as_str()
            .unwrap(),
        "v1"
    );

    // Reading the image back through the oci transport round-trips.
    let image = dest_ref.new_image().await?;
    assert_eq!(image.manifest().get_bytes(), &fixture.manifest);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_replication_archive_roundtrip() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let src = temp.path().join("src");
    let tar_path = temp.path().join("x.tar");
    let back = temp.path().join("back");
    let fixture = write_dir_image(&src).await?;

    // dir -> docker-archive, committing the tar.
    let source_ref = reference::parse(&format!("dir:{}", src.display()))?;
    let archive_ref =
        reference::parse(&format!("docker-archive:{}:app:v1", tar_path.display()))?;
    copy_image(
        &source_ref,
        &archive_ref,
        &CopyOptions::default(),
        None,
        &CancellationToken::new(),
    )
    .await?;
    assert!(fs::try_exists(&tar_path).await?);

    // docker-archive -> dir again.
    let back_ref = reference::parse(&format!("dir:{}", back.display()))?;
    let result = copy_image(
        &archive_ref,
        &back_ref,
        &CopyOptions::default(),
        None,
        &CancellationToken::new(),
    )
    .await?;
    assert!(*result.get_success());

    // The same config and layer digests come back out.
    let manifest: serde_json::Value =
        serde_json::from_slice(&fs::read(back.join("manifest.json")).await?)?;
    assert_eq!(
        manifest["config"]["digest"].as_str().unwrap(),
        sha256_digest(&fixture.config).to_string()
    );
    let layer_digests: Vec<String> = manifest["layers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["digest"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        layer_digests,
        fixture
            .layers
            .iter()
            .map(|l| sha256_digest(l).to_string())
            .collect::<Vec<_>>()
    );
    for layer in &fixture.layers {
        let name = sha256_digest(layer).to_string().replace(':', "-");
        assert_eq!(&fs::read(back.join(name)).await?, layer);
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_replication_service_image_copy() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let src = temp.path().join("src");
    let dst = temp.path().join("dst");
    let fixture = write_dir_image(&src).await?;

    let service = ReplicationService::new(EngineConfig::default()).await?;
    let result = service
        .replicate_image(
            &format!("dir:{}", src.display()),
            &format!("dir:{}", dst.display()),
            &CopyOptions::default(),
            &CancellationToken::new(),
        )
        .await;

    assert!(*result.get_success(), "{:?}", result.get_error());
    assert_eq!(*result.get_layers_copied(), 2);
    assert_eq!(fs::read(dst.join("manifest.json")).await?, fixture.manifest);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_replication_batch_reports_per_pair() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let src = temp.path().join("src");
    write_dir_image(&src).await?;

    let service = ReplicationService::new(EngineConfig::default()).await?;
    let pairs = vec![
        (
            format!("dir:{}", src.display()),
            format!("dir:{}", temp.path().join("out1").display()),
        ),
        (
            format!("dir:{}", temp.path().join("missing").display()),
            format!("dir:{}", temp.path().join("out2").display()),
        ),
    ];
    let results = service
        .replicate_batch(&pairs, &CopyOptions::default(), &CancellationToken::new())
        .await;

    assert_eq!(results.len(), 2);
    assert!(*results[0].get_success());
    assert!(!*results[1].get_success());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_stream_encryption_large_payload_roundtrip() -> anyhow::Result<()> {
    let config = EncryptionConfig::builder()
        .enabled(true)
        .default_provider("mem".to_string())
        .data_key_length(32)
        .build();
    let manager = EnvelopeManager::new(config);
    manager.register_provider("mem", Arc::new(MemoryKmsProvider::new("mem")));

    // Several chunks' worth of data.
    let payload: Vec<u8> = (0..300_000usize).map(|i| (i % 251) as u8).collect();

    let mut sealed = Vec::new();
    manager
        .encrypt_stream(payload.as_slice(), &mut sealed, &EncryptOptions::default())
        .await?;
    assert!(sealed.len() > payload.len());

    let mut plain = Vec::new();
    manager
        .decrypt_stream(sealed.as_slice(), &mut plain, &EncryptOptions::default())
        .await?;
    assert_eq!(plain, payload);
    Ok(())
}
