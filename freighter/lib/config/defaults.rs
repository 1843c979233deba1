//! Default values used across the engine.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory name for freighter's global data.
pub const FREIGHTER_HOME_DIR: &str = ".freighter";

/// The subdirectory of the freighter home where checkpoints are stored.
pub const CHECKPOINTS_SUBDIR: &str = "checkpoints";

/// The default tag used when an image reference omits one.
pub const DEFAULT_REFERENCE_TAG: &str = "latest";

/// The canonical Docker Hub registry domain after alias normalization.
pub const DOCKER_HUB_REGISTRY: &str = "docker.io";

/// The default length in bytes of generated data keys (AES-256).
pub const DEFAULT_DATA_KEY_LENGTH: usize = 32;

/// The default number of concurrent blob copies within a single image copy.
pub const DEFAULT_PARALLEL_COPIES: usize = 4;

/// The absolute cap on replication workers regardless of configuration.
pub const MAX_REPLICATION_WORKERS: usize = 100;

/// The default number of layer-level retry attempts.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// The default delay between layer-level retry attempts, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the number of workers to use when auto-detection is requested.
pub fn detect_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
