//! The `dir:` transport: an image stored as a plain directory.
//!
//! Layout: a `version` marker file, `manifest.json`, and one
//! `<algo>-<hex>` file per blob.

use std::path::PathBuf;

use async_trait::async_trait;
use oci_spec::image::Digest;
use tokio::fs;

use crate::{
    reference::{parse_dir_reference, TRANSPORT_DIR},
    utils::digest_to_filename,
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

/// The name of the version marker file.
const VERSION_FILENAME: &str = "version";

/// The content of the version marker file.
const VERSION_CONTENT: &str = "Directory Transport Version: 1.1\n";

/// The name of the manifest file.
const MANIFEST_FILENAME: &str = "manifest.json";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The `dir:` transport backend.
#[derive(Debug, Default)]
pub struct DirTransport;

/// Reads an image from a directory layout.
#[derive(Debug)]
pub struct DirSource {
    reference: Reference,
    path: PathBuf,
}

/// Writes an image into a directory layout.
#[derive(Debug)]
pub struct DirDestination {
    reference: Reference,
    path: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DirSource {
    async fn open(reference: &Reference) -> FreighterResult<Self> {
        let path = dir_path(reference)?;
        if !fs::try_exists(path.join(MANIFEST_FILENAME)).await? {
            return Err(FreighterError::InvalidLayout(format!(
                "no manifest.json in directory layout: {}",
                path.display()
            )));
        }
        Ok(Self {
            reference: reference.clone(),
            path,
        })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.path.join(digest_to_filename(digest))
    }
}

impl DirDestination {
    async fn open(reference: &Reference) -> FreighterResult<Self> {
        let path = dir_path(reference)?;
        fs::create_dir_all(&path).await?;
        fs::write(path.join(VERSION_FILENAME), VERSION_CONTENT).await?;
        Ok(Self {
            reference: reference.clone(),
            path,
        })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.path.join(digest_to_filename(digest))
    }
}

fn dir_path(reference: &Reference) -> FreighterResult<PathBuf> {
    match reference {
        Reference::Dir(r) => Ok(r.get_path().clone()),
        other => Err(FreighterError::InvalidInput(format!(
            "not a dir: reference: {}",
            other
        ))),
    }
}

fn manifest_media_type(bytes: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .ok()
        .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| OCI_MANIFEST_MIME_TYPE.to_string())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Transport for DirTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_DIR
    }

    fn parse_reference(&self, rest: &str) -> FreighterResult<Reference> {
        parse_dir_reference(rest)
    }

    async fn new_image_source(
        &self,
        reference: &Reference,
    ) -> FreighterResult<Box<dyn ImageSource>> {
        Ok(Box::new(DirSource::open(reference).await?))
    }

    async fn new_image_destination(
        &self,
        reference: &Reference,
    ) -> FreighterResult<Box<dyn ImageDestination>> {
        Ok(Box::new(DirDestination::open(reference).await?))
    }

    async fn delete_image(&self, reference: &Reference) -> FreighterResult<()> {
        let path = dir_path(reference)?;
        if !fs::try_exists(&path).await? {
            return Err(FreighterError::NotFound(format!(
                "directory layout not found: {}",
                path.display()
            )));
        }
        fs::remove_dir_all(&path).await?;
        Ok(())
    }
}

#[async_trait]
impl ImageSource for DirSource {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    async fn get_manifest(&self, instance_digest: Option<&Digest>) -> FreighterResult<Manifest> {
        let bytes = fs::read(self.path.join(MANIFEST_FILENAME)).await?;
        let media_type = manifest_media_type(&bytes);
        match instance_digest {
            Some(expected) => Manifest::new_verified(bytes, media_type, expected),
            None => Ok(Manifest::new(bytes, media_type)),
        }
    }

    async fn get_blob(&self, info: &BlobInfo) -> FreighterResult<(BlobStream, i64)> {
        file_blob_stream(&self.blob_path(info.get_digest())).await
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }
}

#[async_trait]
impl ImageDestination for DirDestination {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    async fn put_blob(
        &self,
        stream: BlobStream,
        info: &BlobInfo,
        _is_config: bool,
    ) -> FreighterResult<BlobInfo> {
        let final_path = self.blob_path(info.get_digest());
        let (digest, size) =
            write_blob_file(stream, &final_path, Some(info.get_digest())).await?;
        Ok(BlobInfo::new(digest, size, info.get_media_type().clone()))
    }

    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        _can_substitute: bool,
    ) -> FreighterResult<Option<BlobInfo>> {
        let path = self.blob_path(info.get_digest());
        match fs::metadata(&path).await {
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
        _instance_digest: Option<&Digest>,
    ) -> FreighterResult<()> {
        fs::write(self.path.join(MANIFEST_FILENAME), bytes).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::{stream, StreamExt};

    use super::*;
    use crate::utils::sha256_digest;

    fn blob_stream(bytes: &'static [u8]) -> BlobStream {
        stream::once(async move { Ok(Bytes::from_static(bytes)) }).boxed()
    }

    #[test_log::test(tokio::test)]
    async fn test_dir_roundtrip() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = temp.path().join("image");
        let reference = crate::reference::parse(&format!("dir:{}", dir.display()))?;

        let layer: &[u8] = b"layer-bytes";
        let info = BlobInfo::new(sha256_digest(layer), layer.len() as i64, "application/x-test");

        let dest = DirDestination::open(&reference).await?;
        let written = dest.put_blob(blob_stream(layer), &info, false).await?;
        assert_eq!(written.get_digest(), info.get_digest());
        assert_eq!(*written.get_size(), layer.len() as i64);

        let manifest = br#"{"schemaVersion":2}"#;
        dest.put_manifest(manifest, None).await?;
        dest.commit().await?;

        let source = DirSource::open(&reference).await?;
        let read_back = source.get_manifest(None).await?;
        assert_eq!(read_back.get_bytes().as_slice(), manifest);

        let (mut stream, size) = source.get_blob(&info).await?;
        assert_eq!(size, layer.len() as i64);
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk?);
        }
        assert_eq!(collected, layer);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_dir_put_blob_rejects_digest_mismatch() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let reference =
            crate::reference::parse(&format!("dir:{}", temp.path().join("x").display()))?;
        let dest = DirDestination::open(&reference).await?;

        let wrong = BlobInfo::new(sha256_digest(b"other"), 4, "application/x-test");
        let err = dest
            .put_blob(blob_stream(b"data"), &wrong, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_dir_try_reusing_blob() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let reference =
            crate::reference::parse(&format!("dir:{}", temp.path().join("x").display()))?;
        let dest = DirDestination::open(&reference).await?;

        let layer: &[u8] = b"reusable";
        let info = BlobInfo::new(sha256_digest(layer), layer.len() as i64, "application/x-test");
        assert!(dest.try_reusing_blob(&info, false).await?.is_none());

        dest.put_blob(blob_stream(layer), &info, false).await?;
        let reused = dest.try_reusing_blob(&info, false).await?.unwrap();
        assert_eq!(reused.get_digest(), info.get_digest());
        Ok(())
    }
}
