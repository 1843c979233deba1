//! The `docker-archive:` transport: a Docker save tar.
//!
//! Layout inside the tar: `manifest.json` (a one-element sequence of
//! `{Config, RepoTags, Layers}`), the config blob as `config.json`, and one
//! `<digest-with-colon-replaced-by-dash>.tar` file per layer. The tar is
//! only assembled at [`ImageDestination::commit`]; until then blobs live in
//! a staging directory. Tar reading is sequential, so the source is not
//! thread-safe for concurrent blob reads.

use std::{
    collections::HashMap,
    io::Read,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use oci_spec::image::Digest;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    reference::{parse_archive_reference, ArchiveReference, TRANSPORT_DOCKER_ARCHIVE},
    utils::{digest_to_filename, sha256_digest},
    FreighterError, FreighterResult, Reference,
};

use super::{
    fsutil::write_blob_file, BlobInfo, BlobStream, ImageDestination, ImageSource, Manifest,
    Transport, DOCKER_CONFIG_MIME_TYPE, DOCKER_LAYER_GZIP_MIME_TYPE, DOCKER_MANIFEST_MIME_TYPE,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The name of the archive manifest inside the tar.
const ARCHIVE_MANIFEST_FILENAME: &str = "manifest.json";

/// The name of the config blob inside the tar.
const ARCHIVE_CONFIG_FILENAME: &str = "config.json";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The `docker-archive:` transport backend.
#[derive(Debug, Default)]
pub struct DockerArchiveTransport;

/// One element of the archive's `manifest.json` sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchiveManifestEntry {
    /// The name of the config blob file within the tar.
    #[serde(rename = "Config")]
    config: String,

    /// The repo:tag references this image was saved under.
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,

    /// The layer file names within the tar, in manifest order.
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Reads an image from a Docker save tar.
#[derive(Debug)]
pub struct DockerArchiveSource {
    reference: Reference,
    path: PathBuf,
    entry: ArchiveManifestEntry,
    config_bytes: Vec<u8>,
    config_digest: Digest,
    layer_sizes: HashMap<String, u64>,
}

/// Writes an image into a Docker save tar, staged until commit.
pub struct DockerArchiveDestination {
    reference: Reference,
    archive_ref: ArchiveReference,
    staging: tempfile::TempDir,
    state: Mutex<ArchiveState>,
}

#[derive(Debug, Default)]
struct ArchiveState {
    blobs: HashMap<String, (PathBuf, i64)>,
    manifest: Option<Vec<u8>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DockerArchiveSource {
    async fn open(reference: &Reference) -> FreighterResult<Self> {
        let archive_ref = archive_reference(reference)?;
        let path = archive_ref.get_path().clone();

        let scan = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || scan_archive(&path)).await??
        };

        let entry = select_entry(scan.entries, archive_ref.get_reference().as_deref())?;
        let config_bytes = scan
            .json_files
            .get(&entry.config)
            .cloned()
            .ok_or_else(|| {
                FreighterError::InvalidLayout(format!(
                    "config blob {} missing from archive {}",
                    entry.config,
                    path.display()
                ))
            })?;
        let config_digest = sha256_digest(&config_bytes);

        Ok(Self {
            reference: reference.clone(),
            path,
            entry,
            config_bytes,
            config_digest,
            layer_sizes: scan.entry_sizes,
        })
    }

    /// Maps a blob digest to the file name it is stored under in the tar.
    fn file_for_digest(&self, digest: &Digest) -> Option<String> {
        if *digest == self.config_digest {
            return Some(self.entry.config.clone());
        }
        let layer_file = format!("{}.tar", digest_to_filename(digest));
        self.entry.layers.iter().find(|l| **l == layer_file).cloned()
    }
}

impl DockerArchiveDestination {
    async fn open(reference: &Reference) -> FreighterResult<Self> {
        let archive_ref = archive_reference(reference)?;
        Ok(Self {
            reference: reference.clone(),
            archive_ref,
            staging: tempfile::tempdir()?,
            state: Mutex::new(ArchiveState::default()),
        })
    }
}

fn archive_reference(reference: &Reference) -> FreighterResult<ArchiveReference> {
    match reference {
        Reference::DockerArchive(r) => Ok(r.clone()),
        other => Err(FreighterError::InvalidInput(format!(
            "not a docker-archive: reference: {}",
            other
        ))),
    }
}

/// Everything learned from one sequential pass over the tar.
struct ArchiveScan {
    entries: Vec<ArchiveManifestEntry>,
    json_files: HashMap<String, Vec<u8>>,
    entry_sizes: HashMap<String, u64>,
}

fn scan_archive(path: &Path) -> FreighterResult<ArchiveScan> {
    let file = std::fs::File::open(path).map_err(|_| {
        FreighterError::NotFound(format!("archive not found: {}", path.display()))
    })?;
    let mut archive = tar::Archive::new(file);

    let mut json_files = HashMap::new();
    let mut entry_sizes = HashMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        entry_sizes.insert(name.clone(), entry.size());
        if name.ends_with(".json") {
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            json_files.insert(name, bytes);
        }
    }

    let manifest_bytes = json_files.get(ARCHIVE_MANIFEST_FILENAME).ok_or_else(|| {
        FreighterError::InvalidLayout(format!(
            "no manifest.json in archive {}",
            path.display()
        ))
    })?;
    let entries: Vec<ArchiveManifestEntry> = serde_json::from_slice(manifest_bytes)
        .map_err(|e| {
            FreighterError::InvalidLayout(format!("corrupt archive manifest.json: {}", e))
        })?;

    Ok(ArchiveScan {
        entries,
        json_files,
        entry_sizes,
    })
}

/// Selects the archive manifest entry matching the requested repo:tag, or
/// the only entry when none was requested.
fn select_entry(
    entries: Vec<ArchiveManifestEntry>,
    wanted: Option<&str>,
) -> FreighterResult<ArchiveManifestEntry> {
    match wanted {
        Some(reference) => entries
            .into_iter()
            .find(|e| e.repo_tags.iter().any(|t| t == reference))
            .ok_or_else(|| {
                FreighterError::ManifestNotFound(format!(
                    "no archive entry tagged {}",
                    reference
                ))
            }),
        None => {
            let mut entries = entries;
            match entries.len() {
                1 => Ok(entries.remove(0)),
                0 => Err(FreighterError::InvalidLayout(
                    "archive manifest.json is empty".into(),
                )),
                n => Err(FreighterError::InvalidInput(format!(
                    "archive contains {} images, a repo:tag reference is required",
                    n
                ))),
            }
        }
    }
}

fn read_archive_entry(path: &Path, name: &str) -> FreighterResult<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == name {
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            return Ok(bytes);
        }
    }
    Err(FreighterError::NotFound(format!(
        "entry {} not found in archive {}",
        name,
        path.display()
    )))
}

/// Converts a layer file name (`sha256-<hex>.tar`) back into its digest.
fn digest_from_layer_file(name: &str) -> FreighterResult<Digest> {
    let stem = name.strip_suffix(".tar").unwrap_or(name);
    stem.replacen('-', ":", 1).parse::<Digest>().map_err(|e| {
        FreighterError::InvalidLayout(format!("layer file name {} is not a digest: {}", name, e))
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Transport for DockerArchiveTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_DOCKER_ARCHIVE
    }

    fn parse_reference(&self, rest: &str) -> FreighterResult<Reference> {
        parse_archive_reference(rest)
    }

    async fn new_image_source(
        &self,
        reference: &Reference,
    ) -> FreighterResult<Box<dyn ImageSource>> {
        Ok(Box::new(DockerArchiveSource::open(reference).await?))
    }

    async fn new_image_destination(
        &self,
        reference: &Reference,
    ) -> FreighterResult<Box<dyn ImageDestination>> {
        Ok(Box::new(DockerArchiveDestination::open(reference).await?))
    }

    async fn delete_image(&self, _reference: &Reference) -> FreighterResult<()> {
        Err(FreighterError::NotImplemented(
            "docker-archive does not support image deletion".into(),
        ))
    }
}

#[async_trait]
impl ImageSource for DockerArchiveSource {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    async fn get_manifest(&self, instance_digest: Option<&Digest>) -> FreighterResult<Manifest> {
        let mut layers = Vec::with_capacity(self.entry.layers.len());
        for layer_file in &self.entry.layers {
            let digest = digest_from_layer_file(layer_file)?;
            let size = self.layer_sizes.get(layer_file).copied().ok_or_else(|| {
                FreighterError::InvalidLayout(format!(
                    "layer {} missing from archive {}",
                    layer_file,
                    self.path.display()
                ))
            })?;
            layers.push(serde_json::json!({
                "mediaType": DOCKER_LAYER_GZIP_MIME_TYPE,
                "size": size,
                "digest": digest.to_string(),
            }));
        }

        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST_MIME_TYPE,
            "config": {
                "mediaType": DOCKER_CONFIG_MIME_TYPE,
                "size": self.config_bytes.len(),
                "digest": self.config_digest.to_string(),
            },
            "layers": layers,
        }))?;

        match instance_digest {
            Some(expected) => Manifest::new_verified(bytes, DOCKER_MANIFEST_MIME_TYPE, expected),
            None => Ok(Manifest::new(bytes, DOCKER_MANIFEST_MIME_TYPE)),
        }
    }

    async fn get_blob(&self, info: &BlobInfo) -> FreighterResult<(BlobStream, i64)> {
        let name = self.file_for_digest(info.get_digest()).ok_or_else(|| {
            FreighterError::NotFound(format!(
                "blob {} not present in archive {}",
                info.get_digest(),
                self.path.display()
            ))
        })?;

        if name == self.entry.config {
            let bytes = Bytes::from(self.config_bytes.clone());
            let size = bytes.len() as i64;
            return Ok((stream::once(async move { Ok(bytes) }).boxed(), size));
        }

        let path = self.path.clone();
        let bytes =
            tokio::task::spawn_blocking(move || read_archive_entry(&path, &name)).await??;
        let size = bytes.len() as i64;
        let bytes = Bytes::from(bytes);
        Ok((stream::once(async move { Ok(bytes) }).boxed(), size))
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        false
    }
}

#[async_trait]
impl ImageDestination for DockerArchiveDestination {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    async fn put_blob(
        &self,
        stream: BlobStream,
        info: &BlobInfo,
        _is_config: bool,
    ) -> FreighterResult<BlobInfo> {
        let staged = self.staging.path().join(digest_to_filename(info.get_digest()));
        let (digest, size) = write_blob_file(stream, &staged, Some(info.get_digest())).await?;

        let mut state = self.state.lock().await;
        state.blobs.insert(digest.to_string(), (staged, size));
        Ok(BlobInfo::new(digest, size, info.get_media_type().clone()))
    }

    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        _can_substitute: bool,
    ) -> FreighterResult<Option<BlobInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .blobs
            .get(&info.get_digest().to_string())
            .map(|(_, size)| {
                BlobInfo::new(info.get_digest().clone(), *size, info.get_media_type().clone())
            }))
    }

    async fn put_manifest(
        &self,
        bytes: &[u8],
        _instance_digest: Option<&Digest>,
    ) -> FreighterResult<()> {
        let mut state = self.state.lock().await;
        state.manifest = Some(bytes.to_vec());
        Ok(())
    }

    /// Assembles the tar. This is the only point where the archive file is
    /// written.
    async fn commit(&self) -> FreighterResult<()> {
        let state = self.state.lock().await;
        let manifest_bytes = state.manifest.clone().ok_or_else(|| {
            FreighterError::InvalidInput(
                "docker-archive commit without a manifest".into(),
            )
        })?;
        let manifest: oci_spec::image::ImageManifest = serde_json::from_slice(&manifest_bytes)?;

        let config_digest = manifest.config().digest().clone();
        let (config_path, _) = state
            .blobs
            .get(&config_digest.to_string())
            .cloned()
            .ok_or_else(|| {
                FreighterError::InvalidInput(format!(
                    "config blob {} was never uploaded",
                    config_digest
                ))
            })?;

        let mut layer_files = Vec::with_capacity(manifest.layers().len());
        for layer in manifest.layers() {
            let digest = layer.digest().clone();
            let (path, _) = state.blobs.get(&digest.to_string()).cloned().ok_or_else(
                || {
                    FreighterError::InvalidInput(format!(
                        "layer blob {} was never uploaded",
                        digest
                    ))
                },
            )?;
            layer_files.push((format!("{}.tar", digest_to_filename(&digest)), path));
        }

        let entry = ArchiveManifestEntry {
            config: ARCHIVE_CONFIG_FILENAME.to_string(),
            repo_tags: self
                .archive_ref
                .get_reference()
                .clone()
                .into_iter()
                .collect(),
            layers: layer_files.iter().map(|(name, _)| name.clone()).collect(),
        };

        let output = self.archive_ref.get_path().clone();
        tokio::task::spawn_blocking(move || {
            assemble_archive(&output, &entry, &config_path, &layer_files)
        })
        .await??;
        Ok(())
    }
}

fn assemble_archive(
    output: &Path,
    entry: &ArchiveManifestEntry,
    config_path: &Path,
    layer_files: &[(String, PathBuf)],
) -> FreighterResult<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(output)?;
    let mut builder = tar::Builder::new(file);

    let manifest_json = serde_json::to_vec(&vec![entry.clone()])?;
    append_bytes(&mut builder, ARCHIVE_MANIFEST_FILENAME, &manifest_json)?;

    let config_bytes = std::fs::read(config_path)?;
    append_bytes(&mut builder, &entry.config, &config_bytes)?;

    for (name, path) in layer_files {
        let mut file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, &mut file)?;
    }

    builder.finish()?;
    Ok(())
}

fn append_bytes(
    builder: &mut tar::Builder<std::fs::File>,
    name: &str,
    bytes: &[u8],
) -> FreighterResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)?;
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
