//! AWS Secrets Manager provider.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_secretsmanager::error::ProvideErrorMetadata;
use base64::Engine;

use crate::{FreighterError, FreighterResult};

use super::SecretsProvider;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A secrets provider backed by AWS Secrets Manager.
pub struct AwsSecretsProvider {
    client: aws_sdk_secretsmanager::Client,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AwsSecretsProvider {
    /// Creates a provider in the given region.
    pub async fn new(region: impl Into<String>) -> FreighterResult<Self> {
        let region = region.into();
        if region.is_empty() {
            return Err(FreighterError::InvalidInput(
                "AWS secrets manager region is empty".into(),
            ));
        }
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .load()
            .await;
        Ok(Self {
            client: aws_sdk_secretsmanager::Client::new(&config),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SecretsProvider for AwsSecretsProvider {
    async fn get_secret(&self, name: &str) -> FreighterResult<Vec<u8>> {
        let output = self
            .client
            .get_secret_value()
            .secret_id(name)
            .send()
            .await
            .map_err(|err| match err.code() {
                Some("ResourceNotFoundException") => {
                    FreighterError::NotFound(format!("secret {} not found", name))
                }
                Some("AccessDeniedException") => {
                    FreighterError::Forbidden(format!("secret {}: {:?}", name, err))
                }
                _ => FreighterError::UpstreamUnavailable(format!(
                    "secrets manager: {:?}",
                    err
                )),
            })?;

        if let Some(value) = output.secret_string() {
            return Ok(value.as_bytes().to_vec());
        }
        if let Some(blob) = output.secret_binary() {
            let raw = blob.as_ref();
            // Binary secrets are commonly stored base64-encoded.
            return Ok(base64::engine::general_purpose::STANDARD
                .decode(raw)
                .unwrap_or_else(|_| raw.to_vec()));
        }
        Err(FreighterError::NotFound(format!(
            "secret {} has no value",
            name
        )))
    }
}
