use getset::{Getters, MutGetters, Setters};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{DEFAULT_DATA_KEY_LENGTH, DEFAULT_PARALLEL_COPIES};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Top-level engine configuration.
///
/// The secrets bootstrap mutates the `registry` and `encryption` subtrees in
/// place before any registry client or KMS provider is constructed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters, MutGetters, Setters, TypedBuilder)]
#[getset(get = "pub with_prefix", get_mut = "pub with_prefix", set = "pub with_prefix")]
#[builder(field_defaults(default))]
pub struct EngineConfig {
    /// Registry-family specific settings.
    registry: RegistryConfig,

    /// Envelope encryption settings.
    encryption: EncryptionConfig,

    /// Secrets manager settings consumed by the bootstrap step.
    secrets: SecretsConfig,

    /// Replication worker settings.
    workers: WorkerConfig,
}

/// Registry-family specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters, MutGetters, Setters)]
#[getset(get = "pub with_prefix", get_mut = "pub with_prefix", set = "pub with_prefix")]
pub struct RegistryConfig {
    /// AWS ECR settings.
    ecr: EcrConfig,

    /// Google GCR / Artifact Registry settings.
    gcr: GcrConfig,
}

/// AWS ECR configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters, MutGetters, Setters)]
#[getset(get = "pub with_prefix", get_mut = "pub with_prefix", set = "pub with_prefix")]
pub struct EcrConfig {
    /// The AWS region the registry lives in.
    region: String,

    /// The twelve-digit AWS account id owning the registry.
    account_id: String,
}

/// Google GCR / Artifact Registry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters, MutGetters, Setters)]
#[getset(get = "pub with_prefix", get_mut = "pub with_prefix", set = "pub with_prefix")]
pub struct GcrConfig {
    /// The GCP project the registry belongs to.
    project: String,

    /// The registry location (e.g. `us`, `europe-west1`).
    location: String,
}

/// Envelope encryption configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, MutGetters, Setters, TypedBuilder)]
#[getset(get = "pub with_prefix", get_mut = "pub with_prefix", set = "pub with_prefix")]
pub struct EncryptionConfig {
    /// Whether blob payload encryption is enabled at all.
    #[builder(default)]
    enabled: bool,

    /// The name of the KMS provider used when none is selected explicitly.
    #[builder(default = "aws".to_string())]
    default_provider: String,

    /// Whether payloads are wrapped in self-describing envelopes. When off,
    /// bytes go straight through the provider's encrypt/decrypt.
    #[builder(default = true)]
    envelope_encryption: bool,

    /// The length in bytes of generated data keys (16 or 32).
    #[builder(default = DEFAULT_DATA_KEY_LENGTH)]
    data_key_length: usize,

    /// A default KMS key id applied when a provider is constructed without one.
    #[builder(default)]
    key_id: Option<String>,

    /// A default region applied when a provider is constructed without one.
    #[builder(default)]
    region: Option<String>,

    /// AWS KMS key settings, typically filled by the secrets bootstrap.
    #[builder(default)]
    aws: AwsKmsConfig,

    /// GCP KMS key settings, typically filled by the secrets bootstrap.
    #[builder(default)]
    gcp: GcpKmsConfig,
}

/// AWS KMS key configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters, MutGetters, Setters)]
#[getset(get = "pub with_prefix", get_mut = "pub with_prefix", set = "pub with_prefix")]
pub struct AwsKmsConfig {
    /// The KMS key id or ARN used to wrap data keys.
    kms_key_id: String,
}

/// GCP KMS key configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters, MutGetters, Setters)]
#[getset(get = "pub with_prefix", get_mut = "pub with_prefix", set = "pub with_prefix")]
pub struct GcpKmsConfig {
    /// The crypto key id. May be a full resource name, in which case the
    /// ring and key fields are ignored.
    kms_key_id: String,

    /// The key ring containing the crypto key.
    key_ring: String,

    /// The crypto key name within the ring.
    key: String,
}

/// Secrets manager configuration consumed by the bootstrap step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Getters, MutGetters, Setters, TypedBuilder)]
#[getset(get = "pub with_prefix", get_mut = "pub with_prefix", set = "pub with_prefix")]
#[builder(field_defaults(default))]
pub struct SecretsConfig {
    /// Whether the secrets bootstrap runs at all.
    enabled: bool,

    /// The secrets manager type: `aws` or `gcp`.
    manager_type: String,

    /// The cloud region the secrets manager client is constructed in.
    region: String,

    /// The GCP project secrets are read from (GCP manager only).
    project: String,

    /// Optional path to a credentials file for the GCP secrets manager.
    credentials_file: Option<String>,

    /// The name of the secret holding registry credentials.
    registry_secret_name: String,

    /// The name of the secret holding encryption key material.
    encryption_secret_name: String,
}

/// Replication worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Getters, MutGetters, Setters)]
#[getset(get = "pub with_prefix", get_mut = "pub with_prefix", set = "pub with_prefix")]
pub struct WorkerConfig {
    /// The number of concurrent tag/repository workers. Zero means
    /// auto-detect from the CPU count when auto-detection is enabled.
    worker_count: usize,

    /// Whether a zero worker count is resolved from the CPU count.
    auto_detect: bool,

    /// The number of concurrent blob copies within one image copy.
    parallel_copies: usize,
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_provider: "aws".to_string(),
            envelope_encryption: true,
            data_key_length: DEFAULT_DATA_KEY_LENGTH,
            key_id: None,
            region: None,
            aws: AwsKmsConfig::default(),
            gcp: GcpKmsConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            auto_detect: true,
            parallel_copies: DEFAULT_PARALLEL_COPIES,
        }
    }
}

impl GcpKmsConfig {
    /// Resolves the full crypto key resource name for the given project and
    /// location, unless `kms_key_id` already is one.
    pub fn resource_name(&self, project: &str, location: &str) -> String {
        if self.kms_key_id.starts_with("projects/") {
            return self.kms_key_id.clone();
        }
        format!(
            "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}",
            project, location, self.key_ring, self.key
        )
    }
}
