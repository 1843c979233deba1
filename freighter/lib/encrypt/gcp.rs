//! Google Cloud KMS provider.
//!
//! GCP KMS has no data-key generation call; the data key is generated
//! locally and wrapped with KMS `Encrypt`, the standard GCP envelope
//! pattern.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use google_cloud_kms_v1::client::KeyManagementService;
use rand::RngCore;

use crate::{FreighterError, FreighterResult};

use super::{validate_data_key_length, DataKey, KmsProvider};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A KMS provider backed by Google Cloud KMS.
pub struct GcpKmsProvider {
    client: KeyManagementService,
    key_name: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GcpKmsProvider {
    /// Creates a provider for a crypto key given its full resource name
    /// (`projects/<p>/locations/<l>/keyRings/<r>/cryptoKeys/<k>`).
    pub async fn new(key_name: impl Into<String>) -> FreighterResult<Self> {
        let key_name = key_name.into();
        if !key_name.starts_with("projects/") {
            return Err(FreighterError::InvalidInput(format!(
                "GCP KMS key must be a full resource name: {}",
                key_name
            )));
        }

        let client = KeyManagementService::builder().build().await.map_err(|e| {
            FreighterError::UpstreamUnavailable(format!("GCP KMS client: {}", e))
        })?;
        Ok(Self { client, key_name })
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl KmsProvider for GcpKmsProvider {
    async fn encrypt(&self, plaintext: &[u8]) -> FreighterResult<Vec<u8>> {
        let response = self
            .client
            .encrypt()
            .set_name(&self.key_name)
            .set_plaintext(Bytes::copy_from_slice(plaintext))
            .send()
            .await
            .map_err(|e| FreighterError::UpstreamUnavailable(format!("GCP KMS: {}", e)))?;
        Ok(response.ciphertext.to_vec())
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> FreighterResult<Vec<u8>> {
        let response = self
            .client
            .decrypt()
            .set_name(&self.key_name)
            .set_ciphertext(Bytes::copy_from_slice(ciphertext))
            .send()
            .await
            .map_err(|e| FreighterError::UpstreamUnavailable(format!("GCP KMS: {}", e)))?;
        Ok(response.plaintext.to_vec())
    }

    async fn generate_data_key(&self, length: usize) -> FreighterResult<DataKey> {
        validate_data_key_length(length)?;
        let mut plaintext = vec![0u8; length];
        rand::thread_rng().fill_bytes(&mut plaintext);
        let encrypted = self.encrypt(&plaintext).await?;
        Ok(DataKey::new(plaintext, encrypted))
    }

    fn get_key_info(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("provider".to_string(), "gcp".to_string()),
            ("keyID".to_string(), self.key_name.clone()),
        ])
    }
}
