//! Digest computation helpers.

use std::str::FromStr;

use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};

use crate::{FreighterError, FreighterResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Computes the `sha256:<hex>` digest of the given bytes.
///
/// Manifest identity everywhere in the engine is the full cryptographic hash
/// of the manifest bytes under the declared algorithm.
pub fn sha256_digest(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let hex = hex::encode(hasher.finalize());
    // A freshly computed sha256 hex string always parses.
    Digest::from_str(&format!("sha256:{}", hex)).unwrap()
}

/// Parses a `<algo>:<hex>` digest string.
pub fn parse_digest(s: &str) -> FreighterResult<Digest> {
    Digest::from_str(s)
        .map_err(|e| FreighterError::InvalidInput(format!("invalid digest {}: {}", s, e)))
}

/// Returns the digest with its `:` replaced by `-`, the form used for
/// filesystem-safe blob file names.
pub fn digest_to_filename(digest: &Digest) -> String {
    digest.to_string().replace(':', "-")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_digest_known_vector() {
        let digest = sha256_digest(b"");
        assert_eq!(
            digest.to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_digest_to_filename() {
        let digest = sha256_digest(b"x");
        assert!(digest_to_filename(&digest).starts_with("sha256-"));
        assert!(!digest_to_filename(&digest).contains(':'));
    }

    #[test]
    fn test_parse_digest_rejects_garbage() {
        assert!(parse_digest("not-a-digest").is_err());
    }
}
