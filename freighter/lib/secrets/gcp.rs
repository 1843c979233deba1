//! Google Secret Manager provider.

use async_trait::async_trait;
use google_cloud_secretmanager_v1::client::SecretManagerService;

use crate::{FreighterError, FreighterResult};

use super::SecretsProvider;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A secrets provider backed by Google Secret Manager.
pub struct GcpSecretsProvider {
    client: SecretManagerService,
    project: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GcpSecretsProvider {
    /// Creates a provider for the given project, optionally pointing
    /// application-default credentials at a credentials file first.
    pub async fn new(
        project: impl Into<String>,
        credentials_file: Option<&str>,
    ) -> FreighterResult<Self> {
        let project = project.into();
        if project.is_empty() {
            return Err(FreighterError::InvalidInput(
                "GCP secrets manager project is empty".into(),
            ));
        }
        if let Some(path) = credentials_file {
            std::env::set_var("GOOGLE_APPLICATION_CREDENTIALS", path);
        }

        let client = SecretManagerService::builder().build().await.map_err(|e| {
            FreighterError::UpstreamUnavailable(format!("GCP secret manager client: {}", e))
        })?;
        Ok(Self { client, project })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SecretsProvider for GcpSecretsProvider {
    async fn get_secret(&self, name: &str) -> FreighterResult<Vec<u8>> {
        let resource = format!(
            "projects/{}/secrets/{}/versions/latest",
            self.project, name
        );
        let response = self
            .client
            .access_secret_version()
            .set_name(&resource)
            .send()
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("NOT_FOUND") {
                    FreighterError::NotFound(format!("secret {} not found", resource))
                } else if message.contains("PERMISSION_DENIED") {
                    FreighterError::Forbidden(format!("secret {}: {}", resource, message))
                } else {
                    FreighterError::UpstreamUnavailable(format!(
                        "secret manager: {}",
                        message
                    ))
                }
            })?;

        response
            .payload
            .map(|payload| payload.data.to_vec())
            .ok_or_else(|| FreighterError::NotFound(format!("secret {} has no payload", resource)))
    }
}
