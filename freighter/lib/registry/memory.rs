//! In-memory registry used by unit tests.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use oci_spec::image::Digest;

use crate::{
    reference::{DockerReference, ReferenceSelector},
    transport::{
        BlobInfo, BlobStream, Manifest, DOCKER_CONFIG_MIME_TYPE, DOCKER_LAYER_GZIP_MIME_TYPE,
        DOCKER_MANIFEST_MIME_TYPE,
    },
    utils::sha256_digest,
    FreighterError, FreighterResult, Reference,
};

use super::{RegistryClient, Repository};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory registry client.
pub struct MemoryRegistry {
    name: String,
    repos: RwLock<HashMap<String, Arc<MemoryRepository>>>,
}

/// An in-memory repository.
pub struct MemoryRepository {
    registry: String,
    name: String,
    manifests: RwLock<HashMap<String, Manifest>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repos: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the named repository, creating it if absent.
    pub fn repo(&self, name: &str) -> Arc<MemoryRepository> {
        self.repos
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryRepository {
                    registry: self.name.clone(),
                    name: name.to_string(),
                    manifests: RwLock::new(HashMap::new()),
                    blobs: RwLock::new(HashMap::new()),
                })
            })
            .clone()
    }
}

impl MemoryRepository {
    /// Stores a complete image under a tag: a config blob, the given
    /// layers, and a schema 2 manifest referencing them. Returns the
    /// manifest digest.
    pub fn seed_image(&self, tag: &str, layers: &[&[u8]]) -> Digest {
        let config = format!(r#"{{"architecture":"amd64","os":"linux","tag":"{}"}}"#, tag)
            .into_bytes();
        let config_digest = sha256_digest(&config);
        self.blobs
            .write()
            .unwrap()
            .insert(config_digest.to_string(), config.clone());

        let mut layer_json = Vec::new();
        for layer in layers {
            let digest = sha256_digest(layer);
            self.blobs
                .write()
                .unwrap()
                .insert(digest.to_string(), layer.to_vec());
            layer_json.push(serde_json::json!({
                "mediaType": DOCKER_LAYER_GZIP_MIME_TYPE,
                "size": layer.len(),
                "digest": digest.to_string(),
            }));
        }

        let manifest_bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST_MIME_TYPE,
            "config": {
                "mediaType": DOCKER_CONFIG_MIME_TYPE,
                "size": config.len(),
                "digest": config_digest.to_string(),
            },
            "layers": layer_json,
        }))
        .unwrap();
        let manifest = Manifest::new(manifest_bytes, DOCKER_MANIFEST_MIME_TYPE);
        let digest = manifest.get_digest().clone();
        self.manifests
            .write()
            .unwrap()
            .insert(tag.to_string(), manifest);
        digest
    }

    pub fn manifest_digest(&self, tag: &str) -> Option<Digest> {
        self.manifests
            .read()
            .unwrap()
            .get(tag)
            .map(|m| m.get_digest().clone())
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().unwrap().len()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RegistryClient for MemoryRegistry {
    fn get_registry_name(&self) -> &str {
        &self.name
    }

    async fn get_repository(&self, name: &str) -> FreighterResult<Arc<dyn Repository>> {
        Ok(self.repo(name))
    }

    async fn create_repository(
        &self,
        name: &str,
        _tags: &HashMap<String, String>,
    ) -> FreighterResult<Arc<dyn Repository>> {
        Ok(self.repo(name))
    }

    async fn list_repositories(&self, prefix: &str) -> FreighterResult<Vec<String>> {
        let mut names: Vec<String> = self
            .repos
            .read()
            .unwrap()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn get_registry_name(&self) -> &str {
        &self.registry
    }

    fn get_name(&self) -> &str {
        &self.name
    }

    async fn list_tags(&self) -> FreighterResult<Vec<String>> {
        let mut tags: Vec<String> = self.manifests.read().unwrap().keys().cloned().collect();
        tags.sort();
        Ok(tags)
    }

    async fn get_manifest(&self, reference: &str) -> FreighterResult<Manifest> {
        if let Some(manifest) = self.manifests.read().unwrap().get(reference) {
            return Ok(manifest.clone());
        }
        // Digest references resolve against stored manifests.
        if reference.starts_with("sha256:") {
            if let Some(manifest) = self
                .manifests
                .read()
                .unwrap()
                .values()
                .find(|m| m.get_digest().to_string() == reference)
            {
                return Ok(manifest.clone());
            }
        }
        Err(FreighterError::ManifestNotFound(format!(
            "{}/{}:{}",
            self.registry, self.name, reference
        )))
    }

    async fn put_manifest(&self, reference: &str, manifest: &Manifest) -> FreighterResult<()> {
        self.manifests
            .write()
            .unwrap()
            .insert(reference.to_string(), manifest.clone());
        Ok(())
    }

    async fn delete_manifest(&self, reference: &str) -> FreighterResult<()> {
        self.manifests
            .write()
            .unwrap()
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| FreighterError::ManifestNotFound(reference.to_string()))
    }

    async fn get_blob(&self, digest: &Digest) -> FreighterResult<(BlobStream, i64)> {
        let bytes = self
            .blobs
            .read()
            .unwrap()
            .get(&digest.to_string())
            .cloned()
            .ok_or_else(|| FreighterError::NotFound(format!("blob {}", digest)))?;
        let size = bytes.len() as i64;
        let bytes = Bytes::from(bytes);
        Ok((stream::once(async move { Ok(bytes) }).boxed(), size))
    }

    async fn blob_exists(&self, digest: &Digest) -> FreighterResult<bool> {
        Ok(self.blobs.read().unwrap().contains_key(&digest.to_string()))
    }

    async fn put_blob(
        &self,
        digest: &Digest,
        _size: i64,
        mut stream: BlobStream,
    ) -> FreighterResult<BlobInfo> {
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        let actual = sha256_digest(&bytes);
        if actual != *digest {
            return Err(FreighterError::BlobTransferFailed(format!(
                "blob digest {} does not match expected digest {}",
                actual, digest
            )));
        }
        let size = bytes.len() as i64;
        self.blobs.write().unwrap().insert(digest.to_string(), bytes);
        Ok(BlobInfo::new(digest.clone(), size, "application/octet-stream"))
    }

    fn get_image_reference(&self, tag: &str) -> FreighterResult<Reference> {
        Ok(Reference::Docker(DockerReference::new(
            self.registry.clone(),
            self.name.clone(),
            ReferenceSelector::tag(tag),
        )?))
    }
}
