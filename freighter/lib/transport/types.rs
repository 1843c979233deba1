//! The uniform source/destination contract the copy driver operates on.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use getset::Getters;
use oci_spec::image::Digest;

use crate::{utils::sha256_digest, FreighterError, FreighterResult, Reference};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The MIME type of OCI image manifests.
pub const OCI_MANIFEST_MIME_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// The MIME type of OCI image indexes.
pub const OCI_INDEX_MIME_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// The MIME type of OCI image configuration blobs.
pub const OCI_CONFIG_MIME_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// The MIME type of gzip-compressed OCI layers.
pub const OCI_LAYER_GZIP_MIME_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// The MIME type of Docker Registry v2 schema 2 manifests.
pub const DOCKER_MANIFEST_MIME_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// The MIME type of Docker Registry v2 manifest lists.
pub const DOCKER_MANIFEST_LIST_MIME_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// The MIME type of Docker image configuration blobs.
pub const DOCKER_CONFIG_MIME_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// The MIME type of gzip-compressed Docker layers.
pub const DOCKER_LAYER_GZIP_MIME_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Size value used when a blob's size is not known ahead of transfer.
pub const UNKNOWN_BLOB_SIZE: i64 = -1;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A stream of blob bytes moving between a source and a destination.
pub type BlobStream = BoxStream<'static, FreighterResult<Bytes>>;

/// Content-addressed blob metadata: digest, size, and media type.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct BlobInfo {
    /// The `<algo>:<hex>` digest identifying the blob across transports.
    digest: Digest,

    /// The blob size in bytes, or [`UNKNOWN_BLOB_SIZE`] before upload.
    size: i64,

    /// The blob media type.
    media_type: String,
}

/// Manifest bytes together with their declared media type and computed digest.
///
/// The digest is always the full cryptographic hash of the bytes; a manifest
/// cannot be constructed with a digest that does not match.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Manifest {
    /// The raw manifest bytes as served by the source.
    bytes: Vec<u8>,

    /// The declared manifest media type.
    media_type: String,

    /// The digest computed over `bytes`.
    digest: Digest,
}

/// The layer compression a destination prefers to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerCompression {
    /// Pass layers through unchanged.
    #[default]
    PreserveOriginal,

    /// Compress uncompressed layers before upload.
    Compress,

    /// Decompress compressed layers before upload.
    Decompress,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Read side of the transport contract: anything an image can be copied from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Returns the reference this source was opened from.
    fn reference(&self) -> &Reference;

    /// Returns the manifest, either of the referenced image or of the given
    /// instance within a manifest list.
    async fn get_manifest(&self, instance_digest: Option<&Digest>) -> FreighterResult<Manifest>;

    /// Returns a reader over the blob plus its size (which may be
    /// [`UNKNOWN_BLOB_SIZE`] when the transport cannot tell ahead of time).
    async fn get_blob(&self, info: &BlobInfo) -> FreighterResult<(BlobStream, i64)>;

    /// Whether `get_blob` may be called from several tasks concurrently.
    /// Tar-backed sources read sequentially and return false.
    fn has_thread_safe_get_blob(&self) -> bool;

    /// Returns any signatures attached to the image.
    async fn get_signatures(&self) -> FreighterResult<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }

    /// Returns substitute layer infos to copy instead of the manifest's, or
    /// `None` to copy the manifest's layers as declared.
    async fn layer_infos_for_copy(&self) -> FreighterResult<Option<Vec<BlobInfo>>> {
        Ok(None)
    }
}

/// Write side of the transport contract: anything an image can be copied to.
#[async_trait]
pub trait ImageDestination: Send + Sync {
    /// Returns the reference this destination was opened from.
    fn reference(&self) -> &Reference;

    /// Uploads a blob, verifying its digest while streaming, and returns the
    /// info of what was actually written.
    async fn put_blob(
        &self,
        stream: BlobStream,
        info: &BlobInfo,
        is_config: bool,
    ) -> FreighterResult<BlobInfo>;

    /// Attempts to reuse a blob already present at the destination. Returns
    /// the reused blob's info, or `None` when the blob must be uploaded.
    async fn try_reusing_blob(
        &self,
        info: &BlobInfo,
        can_substitute: bool,
    ) -> FreighterResult<Option<BlobInfo>>;

    /// Writes the manifest. Every referenced blob must already have been
    /// uploaded or reused.
    async fn put_manifest(
        &self,
        bytes: &[u8],
        instance_digest: Option<&Digest>,
    ) -> FreighterResult<()>;

    /// Manifest MIME types this destination accepts, in preference order.
    /// Empty means any.
    fn supported_manifest_mime_types(&self) -> Vec<String> {
        Vec::new()
    }

    /// The layer compression this destination prefers.
    fn desired_layer_compression(&self) -> LayerCompression {
        LayerCompression::PreserveOriginal
    }

    /// Finalizes the destination. Directory-backed layouts have nothing to
    /// do; the docker-archive backend assembles its tar here.
    async fn commit(&self) -> FreighterResult<()> {
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BlobInfo {
    /// Creates blob metadata from its parts.
    pub fn new(digest: Digest, size: i64, media_type: impl Into<String>) -> Self {
        Self {
            digest,
            size,
            media_type: media_type.into(),
        }
    }

    /// Creates blob metadata with an unknown size.
    pub fn unknown_size(digest: Digest, media_type: impl Into<String>) -> Self {
        Self::new(digest, UNKNOWN_BLOB_SIZE, media_type)
    }
}

impl Manifest {
    /// Creates a manifest from raw bytes, computing its digest.
    pub fn new(bytes: Vec<u8>, media_type: impl Into<String>) -> Self {
        let digest = sha256_digest(&bytes);
        Self {
            bytes,
            media_type: media_type.into(),
            digest,
        }
    }

    /// Creates a manifest from raw bytes, verifying them against an expected
    /// digest.
    pub fn new_verified(
        bytes: Vec<u8>,
        media_type: impl Into<String>,
        expected: &Digest,
    ) -> FreighterResult<Self> {
        let manifest = Self::new(bytes, media_type);
        if manifest.digest != *expected {
            return Err(FreighterError::BlobTransferFailed(format!(
                "manifest digest {} does not match expected digest {}",
                manifest.digest, expected
            )));
        }
        Ok(manifest)
    }

    /// Parses the manifest bytes into the OCI manifest model. Docker schema 2
    /// manifests share the same field layout and parse identically.
    pub fn parsed(&self) -> FreighterResult<oci_spec::image::ImageManifest> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
