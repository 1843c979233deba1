//! AES-GCM sealing over 128- and 256-bit keys.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Aes256Gcm, Nonce,
};

use crate::{FreighterError, FreighterResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The AES-GCM nonce size in bytes.
pub const GCM_NONCE_SIZE: usize = 12;

/// The AES-GCM authentication tag size in bytes.
pub const GCM_TAG_SIZE: usize = 16;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An AES-GCM cipher keyed by a 16- or 32-byte data key.
pub enum AeadCipher {
    /// AES-128-GCM.
    Aes128(Box<Aes128Gcm>),

    /// AES-256-GCM.
    Aes256(Box<Aes256Gcm>),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AeadCipher {
    /// Derives a cipher from a data key. Key lengths other than 16 or 32
    /// bytes are invalid.
    pub fn new(key: &[u8]) -> FreighterResult<Self> {
        match key.len() {
            16 => Ok(Self::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key)
                    .map_err(|e| FreighterError::Cryptographic(e.to_string()))?,
            ))),
            32 => Ok(Self::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|e| FreighterError::Cryptographic(e.to_string()))?,
            ))),
            other => Err(FreighterError::InvalidInput(format!(
                "unsupported key length {} (expected 16 or 32)",
                other
            ))),
        }
    }

    /// Seals plaintext under the given nonce, returning ciphertext plus tag.
    pub fn seal(&self, nonce: &[u8; GCM_NONCE_SIZE], plaintext: &[u8]) -> FreighterResult<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            Self::Aes128(cipher) => cipher.encrypt(nonce, plaintext),
            Self::Aes256(cipher) => cipher.encrypt(nonce, plaintext),
        }
        .map_err(|_| FreighterError::Cryptographic("AES-GCM sealing failed".into()))
    }

    /// Opens ciphertext plus tag under the given nonce. Authentication
    /// failures are fatal and never retried.
    pub fn open(&self, nonce: &[u8; GCM_NONCE_SIZE], sealed: &[u8]) -> FreighterResult<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            Self::Aes128(cipher) => cipher.decrypt(nonce, sealed),
            Self::Aes256(cipher) => cipher.decrypt(nonce, sealed),
        }
        .map_err(|_| {
            FreighterError::Cryptographic("AES-GCM authentication failed".into())
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip_both_key_sizes() {
        for len in [16usize, 32] {
            let key = vec![7u8; len];
            let cipher = AeadCipher::new(&key).unwrap();
            let nonce = [9u8; GCM_NONCE_SIZE];
            let sealed = cipher.seal(&nonce, b"hello").unwrap();
            assert_eq!(sealed.len(), 5 + GCM_TAG_SIZE);
            assert_eq!(cipher.open(&nonce, &sealed).unwrap(), b"hello");
        }
    }

    #[test]
    fn test_open_rejects_tampering() {
        let cipher = AeadCipher::new(&[1u8; 32]).unwrap();
        let nonce = [0u8; GCM_NONCE_SIZE];
        let mut sealed = cipher.seal(&nonce, b"hello").unwrap();
        sealed[0] ^= 0xFF;
        let err = cipher.open(&nonce, &sealed).unwrap_err();
        assert!(err.to_string().contains("authentication failed"));
    }

    #[test]
    fn test_rejects_bad_key_length() {
        assert!(AeadCipher::new(&[0u8; 24]).is_err());
        assert!(AeadCipher::new(&[]).is_err());
    }
}
