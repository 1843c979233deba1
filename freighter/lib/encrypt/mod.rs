//! Envelope encryption of blob payloads via cloud KMS.
//!
//! A payload is sealed locally with a freshly generated data key (AES-GCM);
//! the data key itself is wrapped by a KMS-held master key and travels
//! inside the envelope, so a ciphertext carries everything needed to
//! decrypt it apart from KMS access.

mod aws;
mod cipher;
mod gcp;
mod provider;
mod stream;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
};

use getset::Getters;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{config::EncryptionConfig, FreighterError, FreighterResult};

use cipher::{AeadCipher, GCM_NONCE_SIZE};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use aws::*;
pub use cipher::GCM_TAG_SIZE;
pub use gcp::*;
pub use provider::*;
pub use stream::STREAM_CHUNK_SIZE;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The envelope format for byte-mode payloads.
pub const ENVELOPE_FORMAT_AES_GCM: &str = "AES-GCM";

/// The envelope format for stream headers.
pub const ENVELOPE_FORMAT_AES_GCM_STREAM: &str = "AES-GCM-STREAM";

/// The provider-info key naming the issuing provider.
pub const PROVIDER_INFO_PROVIDER: &str = "provider";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A self-describing wrapper around an encrypted payload.
///
/// Serialized as JSON with base64 byte fields; the serialization is
/// byte-exact across encode/decode round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Envelope {
    /// The KMS-wrapped data key.
    #[serde(with = "base64_bytes")]
    encrypted_key: Vec<u8>,

    /// `nonce || sealed-payload || tag` for byte-mode envelopes; absent in
    /// stream headers.
    #[serde(with = "base64_bytes_opt", default, skip_serializing_if = "Option::is_none")]
    ciphertext: Option<Vec<u8>>,

    /// Provider metadata; at minimum `provider` names the issuing provider.
    provider_info: BTreeMap<String, String>,

    /// `"AES-GCM"` for byte mode, `"AES-GCM-STREAM"` for stream headers.
    envelope_format: String,
}

/// Per-call encryption/decryption options.
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct EncryptOptions {
    /// Overrides the provider used for this call.
    pub provider: Option<String>,
}

/// The envelope encryption manager: a registry of KMS providers plus the
/// byte- and stream-mode sealing operations.
pub struct EnvelopeManager {
    providers: Arc<RwLock<HashMap<String, Arc<dyn KmsProvider>>>>,
    config: EncryptionConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Envelope {
    /// Creates a byte-mode envelope.
    pub fn byte_mode(
        encrypted_key: Vec<u8>,
        ciphertext: Vec<u8>,
        provider_info: BTreeMap<String, String>,
    ) -> Self {
        Self {
            encrypted_key,
            ciphertext: Some(ciphertext),
            provider_info,
            envelope_format: ENVELOPE_FORMAT_AES_GCM.to_string(),
        }
    }

    /// Creates a stream-header envelope (no ciphertext field).
    pub fn stream_header(
        encrypted_key: Vec<u8>,
        provider_info: BTreeMap<String, String>,
    ) -> Self {
        Self {
            encrypted_key,
            ciphertext: None,
            provider_info,
            envelope_format: ENVELOPE_FORMAT_AES_GCM_STREAM.to_string(),
        }
    }

    /// Serializes the envelope.
    pub fn encode(&self) -> FreighterResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes an envelope.
    pub fn decode(bytes: &[u8]) -> FreighterResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Returns the provider name recorded in the envelope, if any.
    pub fn provider_name(&self) -> Option<&str> {
        self.provider_info
            .get(PROVIDER_INFO_PROVIDER)
            .map(String::as_str)
    }
}

impl EnvelopeManager {
    /// Creates a manager with no registered providers.
    pub fn new(config: EncryptionConfig) -> Self {
        Self {
            providers: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Returns the manager's configuration.
    pub fn config(&self) -> &EncryptionConfig {
        &self.config
    }

    /// Registers a provider under a name, replacing any previous one.
    pub fn register_provider(&self, name: impl Into<String>, provider: Arc<dyn KmsProvider>) {
        self.providers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.into(), provider);
    }

    /// Looks up a provider by name.
    pub fn provider(&self, name: &str) -> FreighterResult<Arc<dyn KmsProvider>> {
        self.providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| {
                FreighterError::NotFound(format!("no KMS provider registered as {}", name))
            })
    }

    /// Resolves which provider a call should use: the envelope's recorded
    /// provider first, then the per-call option, then the configured
    /// default.
    pub(crate) fn resolve_provider_name(
        &self,
        envelope_provider: Option<&str>,
        opts: &EncryptOptions,
    ) -> String {
        envelope_provider
            .map(str::to_string)
            .or_else(|| opts.provider.clone())
            .unwrap_or_else(|| self.config.get_default_provider().clone())
    }

    /// Encrypts a byte payload.
    ///
    /// With envelope encryption off, the payload goes straight through the
    /// provider and the raw ciphertext is returned. Otherwise a data key is
    /// generated, the payload is AES-GCM sealed locally, and the serialized
    /// envelope is returned.
    pub async fn encrypt_data(
        &self,
        plaintext: &[u8],
        opts: &EncryptOptions,
    ) -> FreighterResult<Vec<u8>> {
        let provider_name = self.resolve_provider_name(None, opts);
        let provider = self.provider(&provider_name)?;

        if !self.config.get_envelope_encryption() {
            if plaintext.is_empty() {
                return Err(FreighterError::InvalidInput(
                    "refusing to encrypt empty input without envelope mode".into(),
                ));
            }
            return provider.encrypt(plaintext).await;
        }

        let data_key = provider
            .generate_data_key(*self.config.get_data_key_length())
            .await?;
        let cipher = AeadCipher::new(data_key.get_plaintext())?;

        let mut nonce = [0u8; GCM_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = cipher.seal(&nonce, plaintext)?;

        let mut ciphertext = Vec::with_capacity(GCM_NONCE_SIZE + sealed.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&sealed);

        let envelope = Envelope::byte_mode(
            data_key.get_encrypted().clone(),
            ciphertext,
            provider.get_key_info(),
        );
        envelope.encode()
    }

    /// Decrypts a byte payload.
    ///
    /// Payloads that do not parse as envelopes, and all payloads when
    /// envelope encryption is off, are passed to the provider's raw decrypt.
    pub async fn decrypt_data(
        &self,
        payload: &[u8],
        opts: &EncryptOptions,
    ) -> FreighterResult<Vec<u8>> {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) if *self.config.get_envelope_encryption() => envelope,
            _ => {
                let provider_name = self.resolve_provider_name(None, opts);
                return self.provider(&provider_name)?.decrypt(payload).await;
            }
        };

        let provider_name = self.resolve_provider_name(envelope.provider_name(), opts);
        let provider = self.provider(&provider_name)?;

        let data_key = provider.decrypt(envelope.get_encrypted_key()).await?;
        let cipher = AeadCipher::new(&data_key)?;

        let ciphertext = envelope.get_ciphertext().as_deref().ok_or_else(|| {
            FreighterError::Cryptographic("envelope carries no ciphertext".into())
        })?;
        if ciphertext.len() < GCM_NONCE_SIZE {
            return Err(FreighterError::Cryptographic(
                "ciphertext shorter than nonce".into(),
            ));
        }

        let (nonce, sealed) = ciphertext.split_at(GCM_NONCE_SIZE);
        let mut nonce_buf = [0u8; GCM_NONCE_SIZE];
        nonce_buf.copy_from_slice(nonce);
        cipher.open(&nonce_buf, sealed)
    }

    /// Closes every registered provider, returning the last error seen.
    pub async fn close(&self) -> FreighterResult<()> {
        let providers: Vec<Arc<dyn KmsProvider>> = self
            .providers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();

        let mut last_error = None;
        for provider in providers {
            if let Err(err) = provider.close().await {
                tracing::warn!("KMS provider close failed: {}", err);
                last_error = Some(err);
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Serde helpers
//--------------------------------------------------------------------------------------------------

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer
                .serialize_some(&base64::engine::general_purpose::STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
