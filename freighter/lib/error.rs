use std::io;
use thiserror::Error;

use crate::registry::RegistryResponseError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a freighter-related operation.
pub type FreighterResult<T> = Result<T, FreighterError>;

/// An error that occurred during a replication, transport, or key-management operation.
#[derive(Debug, Error)]
pub enum FreighterError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred when a Serde JSON error occurred.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that occurred when invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An error that occurred when a requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An error that occurred when a feature is not implemented by the target.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// An error that occurred when the credential holder lacks permission.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// An error that occurred when a reference names an unregistered transport.
    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    /// An error that occurred when an on-disk image layout is corrupt.
    #[error("invalid image layout: {0}")]
    InvalidLayout(String),

    /// An error that occurred when parsing an image reference.
    #[error("invalid image reference: {0}")]
    ImageReferenceError(String),

    /// An error that occurred when a manifest was not found for a tag.
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// An error that occurred during an AES-GCM or envelope operation.
    #[error("cryptographic error: {0}")]
    Cryptographic(String),

    /// An error that occurred when an encrypted stream is truncated or corrupt.
    #[error("malformed stream: {0}")]
    MalformedStream(String),

    /// An error that occurred when a cloud SDK call failed after its own retries.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// An error that occurred when a blob transfer failed or its digest did not verify.
    #[error("blob transfer failed: {0}")]
    BlobTransferFailed(String),

    /// An error that occurred when a checkpoint file exists but cannot be decoded.
    #[error("corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// An error that occurred when the enclosing operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// An error that occurred when a registry returned a structured error response.
    #[error("registry response error: {0}")]
    RegistryResponse(#[from] RegistryResponseError),

    /// An error that occurred when an unsupported secrets manager type was configured.
    #[error("unsupported secrets manager: {0}")]
    UnsupportedSecretsManager(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FreighterError {
    /// Returns true if the error indicates that the requested entity does not exist.
    ///
    /// The digest-skip policy relies on this to tell "destination has no manifest yet"
    /// apart from real failures.
    pub fn is_not_found(&self) -> bool {
        match self {
            FreighterError::NotFound(_) | FreighterError::ManifestNotFound(_) => true,
            FreighterError::RegistryResponse(err) => err.is_manifest_unknown(),
            _ => false,
        }
    }

    /// Returns true if the error reports a cancellation rather than a unit failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FreighterError::Cancelled)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `FreighterResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> FreighterResult<T> {
    Result::Ok(value)
}
