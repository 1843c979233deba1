//! AWS KMS provider.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_kms::{
    error::ProvideErrorMetadata, primitives::Blob, types::DataKeySpec,
};

use crate::{FreighterError, FreighterResult};

use super::{DataKey, KmsProvider};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A KMS provider backed by AWS KMS.
pub struct AwsKmsProvider {
    client: aws_sdk_kms::Client,
    key_id: String,
    region: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AwsKmsProvider {
    /// Creates a provider for the given KMS key in the given region.
    pub async fn new(
        key_id: impl Into<String>,
        region: impl Into<String>,
    ) -> FreighterResult<Self> {
        let key_id = key_id.into();
        let region = region.into();
        if key_id.is_empty() {
            return Err(FreighterError::InvalidInput(
                "AWS KMS key id is empty".into(),
            ));
        }

        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .load()
            .await;
        Ok(Self {
            client: aws_sdk_kms::Client::new(&config),
            key_id,
            region,
        })
    }
}

/// Translates a KMS SDK error into the engine's error kinds.
fn translate_kms_error<E>(err: aws_sdk_kms::error::SdkError<E>) -> FreighterError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match err.code() {
        Some("AccessDeniedException") => FreighterError::Forbidden(format!("KMS: {:?}", err)),
        Some("InvalidCiphertextException") => {
            FreighterError::Cryptographic(format!("KMS: {:?}", err))
        }
        Some("NotFoundException") => FreighterError::NotFound(format!("KMS: {:?}", err)),
        _ => FreighterError::UpstreamUnavailable(format!("KMS: {:?}", err)),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl KmsProvider for AwsKmsProvider {
    async fn encrypt(&self, plaintext: &[u8]) -> FreighterResult<Vec<u8>> {
        let output = self
            .client
            .encrypt()
            .key_id(&self.key_id)
            .plaintext(Blob::new(plaintext))
            .send()
            .await
            .map_err(translate_kms_error)?;

        output
            .ciphertext_blob()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| {
                FreighterError::UpstreamUnavailable("KMS returned no ciphertext".into())
            })
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> FreighterResult<Vec<u8>> {
        let output = self
            .client
            .decrypt()
            .key_id(&self.key_id)
            .ciphertext_blob(Blob::new(ciphertext))
            .send()
            .await
            .map_err(translate_kms_error)?;

        output
            .plaintext()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| {
                FreighterError::UpstreamUnavailable("KMS returned no plaintext".into())
            })
    }

    async fn generate_data_key(&self, length: usize) -> FreighterResult<DataKey> {
        let key_spec = match length {
            16 => DataKeySpec::Aes128,
            32 => DataKeySpec::Aes256,
            0 => {
                return Err(FreighterError::InvalidInput(
                    "data key length must be positive".into(),
                ))
            }
            other => {
                return Err(FreighterError::InvalidInput(format!(
                    "unsupported data key length {} for AWS KMS (expected 16 or 32)",
                    other
                )))
            }
        };

        let output = self
            .client
            .generate_data_key()
            .key_id(&self.key_id)
            .key_spec(key_spec)
            .send()
            .await
            .map_err(translate_kms_error)?;

        let plaintext = output
            .plaintext()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| {
                FreighterError::UpstreamUnavailable("KMS returned no data key plaintext".into())
            })?;
        let encrypted = output
            .ciphertext_blob()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| {
                FreighterError::UpstreamUnavailable("KMS returned no wrapped data key".into())
            })?;

        Ok(DataKey::new(plaintext, encrypted))
    }

    fn get_key_info(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("provider".to_string(), "aws".to_string()),
            ("keyID".to_string(), self.key_id.clone()),
            ("region".to_string(), self.region.clone()),
        ])
    }
}
