//! Registry clients and the repository contract.
//!
//! A [`RegistryClient`] fronts one registry host and hands out
//! [`Repository`] handles. The factory in this module picks the best
//! specialized client for a hostname (ECR, GCR/Artifact Registry) and falls
//! back to the generic Docker Registry HTTP API v2 client.

mod docker_v2;
mod ecr;
mod factory;
mod gcr;
#[cfg(test)]
pub(crate) mod memory;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use oci_spec::image::Digest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    transport::{BlobInfo, BlobStream, Manifest},
    FreighterError, FreighterResult, Reference,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use docker_v2::*;
pub use ecr::*;
pub use factory::*;
pub use gcr::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A structured error response from a Docker v2 registry.
#[derive(Debug, Serialize, Deserialize, Error)]
#[error("registry error: {errors}")]
pub struct RegistryResponseError {
    /// The `errors` array returned by the registry.
    errors: serde_json::Value,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A client for one registry host.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Returns the registry hostname this client talks to.
    fn get_registry_name(&self) -> &str;

    /// Returns a handle to the named repository.
    async fn get_repository(&self, name: &str) -> FreighterResult<Arc<dyn Repository>>;

    /// Creates the named repository with the given resource tags. Only
    /// registries with an explicit creation API (ECR) implement this.
    async fn create_repository(
        &self,
        name: &str,
        _tags: &HashMap<String, String>,
    ) -> FreighterResult<Arc<dyn Repository>> {
        Err(FreighterError::NotImplemented(format!(
            "registry {} cannot create repositories",
            self.get_registry_name()
        )))
    }

    /// Lists repositories under the given name prefix. An empty prefix lists
    /// everything visible to the credential holder.
    async fn list_repositories(&self, prefix: &str) -> FreighterResult<Vec<String>>;
}

/// A named collection of tags at a specific registry.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Returns the registry hostname this repository lives in.
    fn get_registry_name(&self) -> &str;

    /// Returns the repository name.
    fn get_name(&self) -> &str;

    /// Lists the tags in this repository.
    async fn list_tags(&self) -> FreighterResult<Vec<String>>;

    /// Fetches the manifest for a tag or digest reference.
    async fn get_manifest(&self, reference: &str) -> FreighterResult<Manifest>;

    /// Writes a manifest under a tag or digest reference.
    async fn put_manifest(&self, reference: &str, manifest: &Manifest) -> FreighterResult<()>;

    /// Deletes the manifest for a tag or digest reference.
    async fn delete_manifest(&self, reference: &str) -> FreighterResult<()>;

    /// Returns a reader over a layer or config blob plus its size.
    async fn get_blob(&self, digest: &Digest) -> FreighterResult<(BlobStream, i64)>;

    /// Returns true if the registry already has the blob.
    async fn blob_exists(&self, digest: &Digest) -> FreighterResult<bool>;

    /// Uploads a blob, returning the info of what was written.
    async fn put_blob(
        &self,
        digest: &Digest,
        size: i64,
        stream: BlobStream,
    ) -> FreighterResult<BlobInfo>;

    /// Derives the concrete image reference for a tag in this repository.
    fn get_image_reference(&self, tag: &str) -> FreighterResult<Reference>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryResponseError {
    /// Creates a response error from the registry's JSON error body.
    pub fn new(errors: serde_json::Value) -> Self {
        Self { errors }
    }

    /// Returns true if any contained error reports a missing manifest.
    pub fn is_manifest_unknown(&self) -> bool {
        let codes = self
            .errors
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|e| e.get("code").and_then(|c| c.as_str()));
        for code in codes {
            if code == "MANIFEST_UNKNOWN" || code == "NAME_UNKNOWN" {
                return true;
            }
        }
        self.errors.to_string().contains("not found")
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
