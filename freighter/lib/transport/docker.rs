//! The `docker://` transport: an image in a remote Docker v2 registry.
//!
//! This backend bridges the transport contract onto the registry layer: the
//! factory picks the right client for the reference's hostname (ECR, GCR,
//! generic v2) and the source/destination drive its repository handle.

use std::sync::Arc;

use async_trait::async_trait;
use oci_spec::image::Digest;

use crate::{
    config::EngineConfig,
    reference::{DockerReference, ReferenceSelector, TRANSPORT_DOCKER},
    registry::{create_registry_client, Repository},
    FreighterError, FreighterResult, Reference,
};

use super::{BlobInfo, BlobStream, ImageDestination, ImageSource, Manifest, Transport};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The `docker://` transport backend.
///
/// The default registration carries a default [`EngineConfig`]; the service
/// layer re-registers a configured instance after bootstrap so registry
/// clients pick up resolved credentials.
#[derive(Debug, Default)]
pub struct DockerTransport {
    config: EngineConfig,
}

/// Reads an image from a remote registry repository.
pub struct DockerImageSource {
    reference: Reference,
    docker_ref: DockerReference,
    repo: Arc<dyn Repository>,
}

/// Writes an image into a remote registry repository.
pub struct DockerImageDestination {
    reference: Reference,
    docker_ref: DockerReference,
    repo: Arc<dyn Repository>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DockerTransport {
    /// Creates a transport whose registry clients are built from the given
    /// configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        Self { config }
    }

    async fn open_repository(
        &self,
        reference: &Reference,
    ) -> FreighterResult<(DockerReference, Arc<dyn Repository>)> {
        let docker_ref = docker_reference(reference)?;
        let client = create_registry_client(docker_ref.get_registry(), &self.config).await?;
        let repo = client.get_repository(docker_ref.get_repository()).await?;
        Ok((docker_ref, repo))
    }
}

fn docker_reference(reference: &Reference) -> FreighterResult<DockerReference> {
    match reference {
        Reference::Docker(r) => Ok(r.clone()),
        other => Err(FreighterError::InvalidInput(format!(
            "not a docker:// reference: {}",
            other
        ))),
    }
}

/// The tag-or-digest string used on the manifest endpoint for a reference.
fn manifest_reference(docker_ref: &DockerReference) -> String {
    match docker_ref.get_selector() {
        ReferenceSelector::Tag { tag, .. } => tag.clone(),
        ReferenceSelector::Digest(digest) => digest.to_string(),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Transport for DockerTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_DOCKER
    }

    fn parse_reference(&self, rest: &str) -> FreighterResult<Reference> {
        Ok(Reference::Docker(rest.parse()?))
    }

    async fn new_image_source(
        &self,
        reference: &Reference,
    ) -> FreighterResult<Box<dyn ImageSource>> {
        let (docker_ref, repo) = self.open_repository(reference).await?;
        Ok(Box::new(DockerImageSource {
            reference: reference.clone(),
            docker_ref,
            repo,
        }))
    }

    async fn new_image_destination(
        &self,
        reference: &Reference,
    ) -> FreighterResult<Box<dyn ImageDestination>> {
        let (docker_ref, repo) = self.open_repository(reference).await?;
        Ok(Box::new(DockerImageDestination {
            reference: reference.clone(),
            docker_ref,
            repo,
        }))
    }

    async fn delete_image(&self, reference: &Reference) -> FreighterResult<()> {
        let (docker_ref, repo) = self.open_repository(reference).await?;
        repo.delete_manifest(&manifest_reference(&docker_ref)).await
    }
}

#[async_trait]
impl ImageSource for DockerImageSource {
    fn reference(&self) -> &Reference {
        &self.reference
    }

    async fn get_manifest(&self, instance_digest: Option<&Digest>) -> FreighterResult<Manifest> {
        let reference = match instance_digest {
            Some(digest) => digest.to_string(),
            None => manifest_reference(&self.docker_ref),
        };
        self.repo.get_manifest(&reference).await
    }

    async fn get_blob(&self, info: &BlobInfo) -> FreighterResult<(BlobStream, i64)> {
        self.repo.get_blob(info.get_digest()).await
    }

    fn has_thread_safe_get_blob(&self) -> bool {
        true
    }
}

#[async_trait]
impl ImageDestination for DockerImageDestination {
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
            .unwrap_or_else(|| super::DOCKER_MANIFEST_MIME_TYPE.to_string());
        let manifest = Manifest::new(bytes.to_vec(), media_type);

        let reference = match instance_digest {
            Some(digest) => digest.to_string(),
            None => manifest_reference(&self.docker_ref),
        };
        self.repo.put_manifest(&reference, &manifest).await
    }

    fn supported_manifest_mime_types(&self) -> Vec<String> {
        vec![
            super::DOCKER_MANIFEST_MIME_TYPE.to_string(),
            super::DOCKER_MANIFEST_LIST_MIME_TYPE.to_string(),
            super::OCI_MANIFEST_MIME_TYPE.to_string(),
            super::OCI_INDEX_MIME_TYPE.to_string(),
        ]
    }
}
