//! The KMS provider capability set.

use std::collections::BTreeMap;

use async_trait::async_trait;
use getset::Getters;
use rand::RngCore;

use crate::{FreighterError, FreighterResult};

use super::cipher::{AeadCipher, GCM_NONCE_SIZE};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A freshly generated data key: the plaintext used locally and the
/// KMS-wrapped form carried inside envelopes.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DataKey {
    /// The plaintext key bytes.
    plaintext: Vec<u8>,

    /// The key bytes encrypted by the provider's master key.
    encrypted: Vec<u8>,
}

/// An in-memory KMS provider used as a test double and for offline runs.
///
/// The master key lives only in process memory; envelopes sealed by it do
/// not survive a restart.
#[derive(Debug)]
pub struct MemoryKmsProvider {
    name: String,
    master_key: Vec<u8>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A key-management provider: encrypt/decrypt under a master key, generate
/// wrapped data keys, describe itself, optionally release resources.
#[async_trait]
pub trait KmsProvider: Send + Sync {
    /// Encrypts bytes directly under the provider's master key.
    async fn encrypt(&self, plaintext: &[u8]) -> FreighterResult<Vec<u8>>;

    /// Decrypts bytes directly under the provider's master key.
    async fn decrypt(&self, ciphertext: &[u8]) -> FreighterResult<Vec<u8>>;

    /// Generates a data key of the given length in bytes, returning both the
    /// plaintext and the wrapped form.
    async fn generate_data_key(&self, length: usize) -> FreighterResult<DataKey>;

    /// Describes the provider. The map always carries at least `provider`
    /// (the provider name) and may add `keyID`, `region`, and similar.
    fn get_key_info(&self) -> BTreeMap<String, String>;

    /// Releases any held resources. Providers with nothing to release keep
    /// the default.
    async fn close(&self) -> FreighterResult<()> {
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DataKey {
    /// Creates a data key from its parts.
    pub fn new(plaintext: Vec<u8>, encrypted: Vec<u8>) -> Self {
        Self {
            plaintext,
            encrypted,
        }
    }
}

impl MemoryKmsProvider {
    /// Creates a provider with a random master key.
    pub fn new(name: impl Into<String>) -> Self {
        let mut master_key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut master_key);
        Self {
            name: name.into(),
            master_key,
        }
    }
}

/// Validates a requested data-key length. 16 (AES-128) and 32 (AES-256) are
/// the supported sizes.
pub fn validate_data_key_length(length: usize) -> FreighterResult<()> {
    match length {
        16 | 32 => Ok(()),
        0 => Err(FreighterError::InvalidInput(
            "data key length must be positive".into(),
        )),
        other => Err(FreighterError::InvalidInput(format!(
            "unsupported data key length {} (expected 16 or 32)",
            other
        ))),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl KmsProvider for MemoryKmsProvider {
    async fn encrypt(&self, plaintext: &[u8]) -> FreighterResult<Vec<u8>> {
        let cipher = AeadCipher::new(&self.master_key)?;
        let mut nonce = [0u8; GCM_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = cipher.seal(&nonce, plaintext)?;

        let mut out = Vec::with_capacity(GCM_NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> FreighterResult<Vec<u8>> {
        if ciphertext.len() < GCM_NONCE_SIZE {
            return Err(FreighterError::Cryptographic(
                "ciphertext shorter than nonce".into(),
            ));
        }
        let cipher = AeadCipher::new(&self.master_key)?;
        let (nonce, sealed) = ciphertext.split_at(GCM_NONCE_SIZE);
        let mut nonce_buf = [0u8; GCM_NONCE_SIZE];
        nonce_buf.copy_from_slice(nonce);
        cipher.open(&nonce_buf, sealed)
    }

    async fn generate_data_key(&self, length: usize) -> FreighterResult<DataKey> {
        validate_data_key_length(length)?;
        let mut plaintext = vec![0u8; length];
        rand::thread_rng().fill_bytes(&mut plaintext);
        let encrypted = self.encrypt(&plaintext).await?;
        Ok(DataKey::new(plaintext, encrypted))
    }

    fn get_key_info(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("provider".to_string(), self.name.clone())])
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_memory_provider_roundtrip() -> anyhow::Result<()> {
        let provider = MemoryKmsProvider::new("mem");
        let ciphertext = provider.encrypt(b"payload").await?;
        assert_ne!(ciphertext, b"payload");
        assert_eq!(provider.decrypt(&ciphertext).await?, b"payload");
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_memory_provider_data_key() -> anyhow::Result<()> {
        let provider = MemoryKmsProvider::new("mem");
        let key = provider.generate_data_key(32).await?;
        assert_eq!(key.get_plaintext().len(), 32);
        assert_eq!(provider.decrypt(key.get_encrypted()).await?, *key.get_plaintext());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_data_key_length_boundaries() {
        let provider = MemoryKmsProvider::new("mem");
        assert!(provider.generate_data_key(0).await.is_err());
        assert!(provider.generate_data_key(24).await.is_err());
        assert!(provider.generate_data_key(16).await.is_ok());
        assert!(provider.generate_data_key(32).await.is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn test_memory_provider_rejects_short_ciphertext() {
        let provider = MemoryKmsProvider::new("mem");
        let err = provider.decrypt(&[0u8; 4]).await.unwrap_err();
        assert!(err.to_string().contains("shorter than nonce"));
    }
}
