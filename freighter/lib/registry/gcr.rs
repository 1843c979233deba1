//! Google Container Registry / Artifact Registry client.
//!
//! GCR speaks the plain Docker v2 protocol; service-account authentication
//! uses the documented `_json_key` basic-credential form, with the key JSON
//! taken from `GOOGLE_APPLICATION_CREDENTIALS` (which the secrets bootstrap
//! populates).

use std::sync::Arc;

use async_trait::async_trait;

use crate::{config::GcrConfig, FreighterResult};

use super::{DockerV2Client, RegistryAuth, RegistryClient, Repository};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The username GCR expects alongside a service-account key JSON.
const GCR_JSON_KEY_USER: &str = "_json_key";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client for one GCR or Artifact Registry host.
pub struct GcrClient {
    registry: String,
    v2: Arc<DockerV2Client>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GcrClient {
    /// Creates a client for a GCR/Artifact Registry host (`gcr.io`,
    /// `<region>.gcr.io`, `<location>-docker.pkg.dev`).
    pub fn new(registry: impl Into<String>, _config: &GcrConfig) -> FreighterResult<Self> {
        let registry = registry.into();
        let auth = service_account_auth().unwrap_or_default();
        let v2 = Arc::new(DockerV2Client::new(registry.clone(), auth));
        Ok(Self { registry, v2 })
    }
}

/// Builds `_json_key` basic credentials from the application-default
/// credentials file, when one is configured.
fn service_account_auth() -> Option<RegistryAuth> {
    let path = std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok()?;
    let key_json = std::fs::read_to_string(&path)
        .inspect_err(|err| {
            tracing::warn!("cannot read GCP credentials file {}: {}", path, err);
        })
        .ok()?;
    Some(RegistryAuth::Basic {
        username: GCR_JSON_KEY_USER.to_string(),
        password: key_json,
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RegistryClient for GcrClient {
    fn get_registry_name(&self) -> &str {
        &self.registry
    }

    async fn get_repository(&self, name: &str) -> FreighterResult<Arc<dyn Repository>> {
        self.v2.get_repository(name).await
    }

    async fn list_repositories(&self, prefix: &str) -> FreighterResult<Vec<String>> {
        self.v2.list_repositories(prefix).await
    }
}
