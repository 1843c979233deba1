//! The `oci:` transport: the OCI image layout on disk.
//!
//! Layout invariants: an `oci-layout` marker (`imageLayoutVersion` 1.0.0),
//! an `index.json` (schema 2), and `blobs/<algo>/<hex>` content-addressed
//! files. Manifest entries in the index are keyed by the
//! `org.opencontainers.image.ref.name` annotation.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use oci_spec::image::{Descriptor, DescriptorBuilder, Digest, ImageIndex, ImageIndexBuilder, MediaType};
use tokio::{fs, sync::Mutex};

use crate::{
    reference::{parse_oci_reference, OciReference, TRANSPORT_OCI},
    utils::sha256_digest,
    FreighterError, FreighterResult, Reference,
};

use super::{
    fsutil::{file_blob_stream, write_blob_file},
    BlobInfo, BlobStream, ImageDestination, ImageSource, Manifest, Transport,
    OCI_MANIFEST_MIME_TYPE,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The name of the layout marker file.
const LAYOUT_FILENAME: &str = "oci-layout";

/// The content of the layout marker file.
const LAYOUT_CONTENT: &str = "{\"imageLayoutVersion\": \"1.0.0\"}\n";

/// The name of the index file.
const INDEX_FILENAME: &str = "index.json";

/// The subdirectory holding content-addressed blobs.
const BLOBS_SUBDIR: &str = "blobs";

/// The annotation keying index entries by reference name.
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The `oci:` transport backend.
#[derive(Debug, Default)]
pub struct OciLayoutTransport;

/// Reads an image from an OCI image layout directory.
#[derive(Debug)]
pub struct OciLayoutSource {
    reference: Reference,
    oci_ref: OciReference,
    path: PathBuf,
}

/// Writes an image into an OCI image layout directory.
#[derive(Debug)]
pub struct OciLayoutDestination {
    reference: Reference,
    oci_ref: OciReference,
    path: PathBuf,
    index_lock: Mutex<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OciLayoutSource {
    async fn open(reference: &Reference) -> FreighterResult<Self> {
        let oci_ref = oci_reference(reference)?;
        let path = oci_ref.get_path().clone();
        if !fs::try_exists(path.join(LAYOUT_FILENAME)).await?
            || !fs::try_exists(path.join(INDEX_FILENAME)).await?
        {
            return Err(FreighterError::InvalidLayout(format!(
                "not an OCI image layout: {}",
                path.display()
            )));
        }
        Ok(Self {
            reference: reference.clone(),
            oci_ref,
            path,
        })
    }

    /// Resolves the manifest descriptor selected by this source's reference.
    async fn resolve_descriptor(&self) -> FreighterResult<Descriptor> {
        let index = read_index(&self.path).await?;
        let found = index.manifests().iter().find(|descriptor| {
            if let Some(digest) = self.oci_ref.get_digest() {
                return descriptor.digest() == digest;
            }
            descriptor
                .annotations()
                .as_ref()
                .and_then(|a| a.get(REF_NAME_ANNOTATION))
                .map(|name| name == self.oci_ref.tag_or_default())
                .unwrap_or(false)
        });
        found.cloned().ok_or_else(|| {
            FreighterError::ManifestNotFound(format!(
                "no index entry for {} in {}",
                self.oci_ref.tag_or_default(),
                self.path.display()
            ))
        })
    }
}

impl OciLayoutDestination {
    async fn open(reference: &Reference) -> FreighterResult<Self> {
        let oci_ref = oci_reference(reference)?;
        let path = oci_ref.get_path().clone();
        fs::create_dir_all(path.join(BLOBS_SUBDIR)).await?;
        fs::write(path.join(LAYOUT_FILENAME), LAYOUT_CONTENT).await?;
        if !fs::try_exists(path.join(INDEX_FILENAME)).await? {
            write_index(&path, &empty_index()?).await?;
        }
        Ok(Self {
            reference: reference.clone(),
            oci_ref,
            path,
            index_lock: Mutex::new(()),
        })
    }
}

fn oci_reference(reference: &Reference) -> FreighterResult<OciReference> {
    match reference {
        Reference::Oci(r) => Ok(r.clone()),
        other => Err(FreighterError::InvalidInput(format!(
            "not an oci: reference: {}",
            other
        ))),
    }
}

fn blob_path(layout: &Path, digest: &Digest) -> PathBuf {
    layout
        .join(BLOBS_SUBDIR)
        .join(digest.algorithm().to_string())
        .join(digest.digest())
}

fn empty_index() -> FreighterResult<ImageIndex> {
    ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(Vec::<Descriptor>::new())
        .build()
        .map_err(|e| FreighterError::InvalidLayout(e.to_string()))
}

async fn read_index(layout: &Path) -> FreighterResult<ImageIndex> {
    let bytes = fs::read(layout.join(INDEX_FILENAME)).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| FreighterError::InvalidLayout(format!("corrupt index.json: {}", e)))
}

async fn write_index(layout: &Path, index: &ImageIndex) -> FreighterResult<()> {
    let bytes = serde_json::to_vec_pretty(index)?;
    fs::write(layout.join(INDEX_FILENAME), bytes).await?;
    Ok(())
}

/// Replaces or appends the index entry for `ref_name` and writes the index
/// back out.
async fn upsert_index_entry(
    layout: &Path,
    ref_name: Option<&str>,
    descriptor: Descriptor,
) -> FreighterResult<()> {
    let index = read_index(layout).await?;
    let mut manifests: Vec<Descriptor> = index
        .manifests()
        .iter()
        .filter(|existing| {
            let same_name = match ref_name {
                Some(name) => existing
                    .annotations()
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .map(|n| n == name)
                    .unwrap_or(false),
                None => false,
            };
            let same_digest = existing.digest() == descriptor.digest();
            !same_name && !same_digest
        })
        .cloned()
        .collect();
    manifests.push(descriptor);

    let updated = ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(manifests)
        .build()
        .map_err(|e| FreighterError::InvalidLayout(e.to_string()))?;
    write_index(layout, &updated).await
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Transport for OciLayoutTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_OCI
    }

    fn parse_reference(&self, rest: &str) -> FreighterResult<Reference> {
        parse_oci_reference(rest)
    }

    async fn new_image_source(
        &self,
        reference: &Reference,
    ) -> FreighterResult<Box<dyn ImageSource>> {
        Ok(Box::new(OciLayoutSource::open(reference).await?))
    }

    async fn new_image_destination(
        &self,
        reference: &Reference,
    ) -> FreighterResult<Box<dyn ImageDestination>> {
        Ok(Box::new(OciLayoutDestination::open(reference).await?))
    }

    async fn delete_image(&self, reference: &Reference) -> FreighterResult<()> {
        let oci_ref = oci_reference(reference)?;
        let path = oci_ref.get_path().clone();
        let index = read_index(&path).await?;
        let tag = oci_ref.tag_or_default();

        let remaining: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|descriptor| {
                let matches = match oci_ref.get_digest() {
                    Some(digest) => descriptor.digest() == digest,
                    None => descriptor
                        .annotations()
                        .as_ref()
                        .and_then(|a| a.get(REF_NAME_ANNOTATION))
                        .map(|n| n == tag)
                        .unwrap_or(false),
                };
                !matches
            })
            .cloned()
            .collect();

        if remaining.len() == index.manifests().len() {
            return Err(FreighterError::NotFound(format!(
                "no index entry for {} in {}",
                tag,
                path.display()
            )));
        }

        let updated = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(remaining)
            .build()
            .map_err(|e| FreighterError::InvalidLayout(e.to_string()))?;
        write_index(&path, &updated).await
    }
}

#[async_trait]
impl ImageSource for OciLayoutSource {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    async fn get_manifest(&self, instance_digest: Option<&Digest>) -> FreighterResult<Manifest> {
        let (digest, media_type) = match instance_digest {
            Some(digest) => (digest.clone(), OCI_MANIFEST_MIME_TYPE.to_string()),
            None => {
                let descriptor = self.resolve_descriptor().await?;
                (
                    descriptor.digest().clone(),
                    descriptor.media_type().to_string(),
                )
            }
        };
        let bytes = fs::read(blob_path(&self.path, &digest)).await.map_err(|_| {
            FreighterError::InvalidLayout(format!(
                "manifest blob {} missing from {}",
                digest,
                self.path.display()
            ))
        })?;
        Manifest::new_verified(bytes, media_type, &digest)
    }

    async fn get_blob(&self, info: &BlobInfo) -> FreighterResult<(BlobStream, i64)> {
        file_blob_stream(&blob_path(&self.path, info.get_digest())).await
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }
}

#[async_trait]
impl ImageDestination for OciLayoutDestination {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    async fn put_blob(
        &self,
        stream: BlobStream,
        info: &BlobInfo,
        _is_config: bool,
    ) -> FreighterResult<BlobInfo> {
        let final_path = blob_path(&self.path, info.get_digest());
        let (digest, size) =
            write_blob_file(stream, &final_path, Some(info.get_digest())).await?;
        Ok(BlobInfo::new(digest, size, info.get_media_type().clone()))
    }

    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        _can_substitute: bool,
    ) -> FreighterResult<Option<BlobInfo>> {
        match fs::metadata(blob_path(&self.path, info.get_digest())).await {
            Ok(metadata) => Ok(Some(BlobInfo::new(
                info.get_digest().clone(),
                metadata.len() as i64,
                info.get_media_type().clone(),
            ))),
            Err(_) => Ok(None),
        }
    }

    async fn put_manifest(
        &self,
        bytes: &[u8],
        instance_digest: Option<&Digest>,
    ) -> FreighterResult<()> {
        let digest = sha256_digest(bytes);
        if let Some(expected) = instance_digest {
            if digest != *expected {
                return Err(FreighterError::BlobTransferFailed(format!(
                    "manifest digest {} does not match expected digest {}",
                    digest, expected
                )));
            }
        }

        let media_type = serde_json::from_slice::<serde_json::Value>(bytes)
            .ok()
            .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_else(|| OCI_MANIFEST_MIME_TYPE.to_string());

        let manifest_path = blob_path(&self.path, &digest);
        if let Some(parent) = manifest_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&manifest_path, bytes).await?;

        let ref_name = self.oci_ref.get_tag().clone();
        let mut annotations = HashMap::new();
        if let Some(name) = &ref_name {
            annotations.insert(REF_NAME_ANNOTATION.to_string(), name.clone());
        }

        let descriptor = DescriptorBuilder::default()
            .media_type(media_type.as_str())
            .digest(digest)
            .size(bytes.len() as u64)
            .annotations(annotations)
            .build()
            .map_err(|e| FreighterError::InvalidLayout(e.to_string()))?;

        let _guard = self.index_lock.lock().await;
        upsert_index_entry(&self.path, ref_name.as_deref(), descriptor).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
