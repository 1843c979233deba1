//! Secrets-backed credential and key-material bootstrap.
//!
//! When a secrets manager is configured, the bootstrap step runs before any
//! registry client or KMS provider is constructed: it fetches credential and
//! encryption-key records and applies them to the in-memory configuration
//! and the process environment.

mod aws;
mod bootstrap;
mod gcp;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{config::SecretsConfig, FreighterError, FreighterResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use aws::*;
pub use bootstrap::*;
pub use gcp::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Registry credentials fetched from a secrets manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryCredentials {
    /// AWS ECR credentials.
    #[serde(default)]
    pub ecr: EcrCredentials,

    /// Google GCR credentials.
    #[serde(default)]
    pub gcr: GcrCredentials,
}

/// AWS ECR credential material.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EcrCredentials {
    /// The AWS access key id.
    #[serde(default)]
    pub access_key: String,

    /// The AWS secret access key.
    #[serde(default)]
    pub secret_key: String,

    /// An optional session token for temporary credentials.
    #[serde(default)]
    pub session_token: Option<String>,

    /// Overrides the configured ECR region when present.
    #[serde(default)]
    pub region: Option<String>,

    /// Overrides the configured ECR account id when present.
    #[serde(default)]
    pub account_id: Option<String>,
}

/// Google GCR credential material.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GcrCredentials {
    /// A base64-encoded service-account JSON key.
    #[serde(default)]
    pub credentials: Option<String>,

    /// Overrides the configured GCP project when present.
    #[serde(default)]
    pub project: Option<String>,

    /// Overrides the configured GCR location when present.
    #[serde(default)]
    pub location: Option<String>,
}

/// Encryption key material fetched from a secrets manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionKeys {
    /// AWS KMS key material.
    #[serde(default)]
    pub aws: AwsEncryptionKeys,

    /// GCP KMS key material.
    #[serde(default)]
    pub gcp: GcpEncryptionKeys,
}

/// AWS KMS key identifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwsEncryptionKeys {
    /// The KMS key id or ARN.
    #[serde(default)]
    pub kms_key_id: String,
}

/// GCP KMS key identifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GcpEncryptionKeys {
    /// The crypto key id, possibly a full resource name.
    #[serde(default)]
    pub kms_key_id: String,

    /// The key ring containing the crypto key.
    #[serde(default)]
    pub key_ring: Option<String>,

    /// The crypto key name within the ring.
    #[serde(default)]
    pub key: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A provider of named secrets.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    /// Fetches the latest value of a secret by name.
    async fn get_secret(&self, name: &str) -> FreighterResult<Vec<u8>>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the configured secrets provider.
pub async fn create_secrets_provider(
    config: &SecretsConfig,
) -> FreighterResult<Arc<dyn SecretsProvider>> {
    match config.get_manager_type().as_str() {
        "aws" => Ok(Arc::new(AwsSecretsProvider::new(config.get_region()).await?)),
        "gcp" => Ok(Arc::new(
            GcpSecretsProvider::new(
                config.get_project(),
                config.get_credentials_file().as_deref(),
            )
            .await?,
        )),
        other => Err(FreighterError::UnsupportedSecretsManager(other.to_string())),
    }
}

/// Validates a secret name against the target cloud's naming rules. Runs
/// before any secret read.
pub fn validate_secret_name(manager_type: &str, name: &str) -> FreighterResult<()> {
    if name.is_empty() {
        return Err(FreighterError::InvalidInput("secret name is empty".into()));
    }
    let valid = match manager_type {
        "aws" => {
            name.len() <= 512
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "/_+=.@-".contains(c))
        }
        "gcp" => {
            name.len() <= 255
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        other => {
            return Err(FreighterError::UnsupportedSecretsManager(other.to_string()));
        }
    };
    if !valid {
        return Err(FreighterError::InvalidInput(format!(
            "secret name {} violates {} naming rules",
            name, manager_type
        )));
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_secret_name() {
        assert!(validate_secret_name("aws", "prod/freighter/registry").is_ok());
        assert!(validate_secret_name("aws", "name with spaces").is_err());
        assert!(validate_secret_name("gcp", "freighter-registry_creds").is_ok());
        assert!(validate_secret_name("gcp", "has/slashes").is_err());
        assert!(validate_secret_name("gcp", "").is_err());
        assert!(matches!(
            validate_secret_name("vault", "x"),
            Err(FreighterError::UnsupportedSecretsManager(_))
        ));
    }

    #[test]
    fn test_registry_credentials_deserialize_partial() {
        let json = r#"{"ecr": {"access_key": "AKIA", "secret_key": "s3cr3t"}}"#;
        let creds: RegistryCredentials = serde_json::from_str(json).unwrap();
        assert_eq!(creds.ecr.access_key, "AKIA");
        assert!(creds.ecr.session_token.is_none());
        assert!(creds.gcr.credentials.is_none());
    }

    #[test]
    fn test_encryption_keys_deserialize() {
        let json = r#"{
            "aws": {"kms_key_id": "alias/freighter"},
            "gcp": {"kms_key_id": "freighter", "key_ring": "replication", "key": "blobs"}
        }"#;
        let keys: EncryptionKeys = serde_json::from_str(json).unwrap();
        assert_eq!(keys.aws.kms_key_id, "alias/freighter");
        assert_eq!(keys.gcp.key_ring.as_deref(), Some("replication"));
    }
}
