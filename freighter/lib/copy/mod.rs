//! Image and repository copying.

mod driver;
mod group;
mod repository;

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use getset::Getters;
use typed_builder::TypedBuilder;

use crate::config::{DEFAULT_PARALLEL_COPIES, DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY_MS};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use driver::*;
pub use group::*;
pub use repository::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Observer invoked after each transferred blob.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// One progress notification.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// The digest of the transferred blob.
    pub digest: String,

    /// The number of bytes moved for this blob.
    pub bytes: i64,

    /// True when the blob was the image config.
    pub is_config: bool,
}

/// Options for a single image copy.
#[derive(Clone, TypedBuilder)]
pub struct CopyOptions {
    /// Upload blobs and manifest even when the destination already has them.
    #[builder(default)]
    pub force_overwrite: bool,

    /// Compute the copy plan but write nothing.
    #[builder(default)]
    pub dry_run: bool,

    /// Whether manifests are transferred.
    #[builder(default = true)]
    pub include_manifests: bool,

    /// Whether layers are transferred.
    #[builder(default = true)]
    pub include_layers: bool,

    /// Maximum concurrent blob copies within this image copy.
    #[builder(default = DEFAULT_PARALLEL_COPIES)]
    pub parallel_copies: usize,

    /// Layer-level retry attempts.
    #[builder(default = DEFAULT_RETRY_ATTEMPTS)]
    pub retry_attempts: u32,

    /// Delay between layer-level retry attempts.
    #[builder(default = Duration::from_millis(DEFAULT_RETRY_DELAY_MS))]
    pub retry_delay: Duration,

    /// Observer invoked after each transferred blob.
    #[builder(default)]
    pub progress_callback: Option<ProgressCallback>,
}

/// The outcome of a single image copy.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct CopyResult {
    /// True when every blob and the manifest landed.
    success: bool,

    /// The failure message when `success` is false.
    error: Option<String>,

    /// Total bytes moved (or, for a dry run, that would move).
    bytes_transferred: i64,

    /// The number of layer blobs copied.
    layers_copied: usize,

    /// When the copy started.
    start_time: DateTime<Utc>,

    /// When the copy finished.
    end_time: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CopyResult {
    /// Creates a successful result.
    pub fn succeeded(
        bytes_transferred: i64,
        layers_copied: usize,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            success: true,
            error: None,
            bytes_transferred,
            layers_copied,
            start_time,
            end_time: Utc::now(),
        }
    }

    /// Creates a failed result carrying the error message.
    pub fn failed(error: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            bytes_transferred: 0,
            layers_copied: 0,
            start_time,
            end_time: Utc::now(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for CopyOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for CopyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyOptions")
            .field("force_overwrite", &self.force_overwrite)
            .field("dry_run", &self.dry_run)
            .field("include_manifests", &self.include_manifests)
            .field("include_layers", &self.include_layers)
            .field("parallel_copies", &self.parallel_copies)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_delay", &self.retry_delay)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}
