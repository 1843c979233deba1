//! Applies secrets-resolved credentials to the in-memory configuration and
//! the process environment.
//!
//! Bootstrap runs once, before any registry client or KMS provider is
//! constructed. Credential environment variables are process-global:
//! re-running bootstrap in the same process is not supported, and running
//! it concurrently is undefined.

use std::sync::{Mutex, OnceLock};

use base64::Engine;
use tempfile::NamedTempFile;

use crate::{config::EngineConfig, FreighterError, FreighterResult};

use super::{
    create_secrets_provider, validate_secret_name, EncryptionKeys, RegistryCredentials,
};

//--------------------------------------------------------------------------------------------------
// Statics
//--------------------------------------------------------------------------------------------------

/// Temp files holding credential material, kept alive for the process
/// lifetime. The OS temp directory reclaims them after exit.
static CREDENTIAL_FILES: OnceLock<Mutex<Vec<NamedTempFile>>> = OnceLock::new();

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves credentials and key material from the configured secrets
/// manager and applies them to `config` and the process environment.
///
/// A no-op when no secrets manager is enabled.
pub async fn bootstrap(config: &mut EngineConfig) -> FreighterResult<()> {
    if !*config.get_secrets().get_enabled() {
        return Ok(());
    }

    let secrets = config.get_secrets().clone();
    let manager_type = secrets.get_manager_type().clone();
    let provider = create_secrets_provider(&secrets).await?;

    let registry_secret = secrets.get_registry_secret_name();
    validate_secret_name(&manager_type, registry_secret)?;
    let raw = provider.get_secret(registry_secret).await?;
    let credentials: RegistryCredentials = serde_json::from_slice(&raw).map_err(|e| {
        FreighterError::InvalidInput(format!(
            "secret {} is not a registry credentials record: {}",
            registry_secret, e
        ))
    })?;
    apply_registry_credentials(config, &credentials)?;

    if *config.get_encryption().get_enabled() {
        let encryption_secret = secrets.get_encryption_secret_name();
        validate_secret_name(&manager_type, encryption_secret)?;
        let raw = provider.get_secret(encryption_secret).await?;
        let keys: EncryptionKeys = serde_json::from_slice(&raw).map_err(|e| {
            FreighterError::InvalidInput(format!(
                "secret {} is not an encryption keys record: {}",
                encryption_secret, e
            ))
        })?;
        apply_encryption_keys(config, &keys);
    }

    Ok(())
}

/// Applies a registry credentials record: AWS env vars, ECR/GCR config
/// overrides, and a temp credentials file for GCR.
pub fn apply_registry_credentials(
    config: &mut EngineConfig,
    credentials: &RegistryCredentials,
) -> FreighterResult<()> {
    let ecr = &credentials.ecr;
    if !ecr.access_key.is_empty() {
        std::env::set_var("AWS_ACCESS_KEY_ID", &ecr.access_key);
        std::env::set_var("AWS_SECRET_ACCESS_KEY", &ecr.secret_key);
        if let Some(token) = &ecr.session_token {
            std::env::set_var("AWS_SESSION_TOKEN", token);
        }
        tracing::info!("applied AWS credentials from secrets manager");
    }
    if let Some(region) = ecr.region.as_deref().filter(|r| !r.is_empty()) {
        config
            .get_registry_mut()
            .get_ecr_mut()
            .set_region(region.to_string());
    }
    if let Some(account) = ecr.account_id.as_deref().filter(|a| !a.is_empty()) {
        config
            .get_registry_mut()
            .get_ecr_mut()
            .set_account_id(account.to_string());
    }

    let gcr = &credentials.gcr;
    if let Some(project) = gcr.project.as_deref().filter(|p| !p.is_empty()) {
        config
            .get_registry_mut()
            .get_gcr_mut()
            .set_project(project.to_string());
    }
    if let Some(location) = gcr.location.as_deref().filter(|l| !l.is_empty()) {
        config
            .get_registry_mut()
            .get_gcr_mut()
            .set_location(location.to_string());
    }
    if let Some(encoded) = gcr.credentials.as_deref().filter(|c| !c.is_empty()) {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| {
                FreighterError::InvalidInput(format!(
                    "GCR credentials are not base64: {}",
                    e
                ))
            })?;
        let path = persist_credentials_file(&decoded)?;
        std::env::set_var("GOOGLE_APPLICATION_CREDENTIALS", &path);
        tracing::info!("applied GCP credentials from secrets manager");
    }

    Ok(())
}

/// Applies an encryption keys record to the encryption subtree.
pub fn apply_encryption_keys(config: &mut EngineConfig, keys: &EncryptionKeys) {
    let encryption = config.get_encryption_mut();
    if !keys.aws.kms_key_id.is_empty() {
        encryption
            .get_aws_mut()
            .set_kms_key_id(keys.aws.kms_key_id.clone());
    }
    if !keys.gcp.kms_key_id.is_empty() {
        encryption
            .get_gcp_mut()
            .set_kms_key_id(keys.gcp.kms_key_id.clone());
    }
    if let Some(ring) = keys.gcp.key_ring.as_deref().filter(|r| !r.is_empty()) {
        encryption.get_gcp_mut().set_key_ring(ring.to_string());
    }
    if let Some(key) = keys.gcp.key.as_deref().filter(|k| !k.is_empty()) {
        encryption.get_gcp_mut().set_key(key.to_string());
    }
}

/// Writes credential bytes to a 0600 temp file that lives for the rest of
/// the process.
fn persist_credentials_file(bytes: &[u8]) -> FreighterResult<String> {
    use std::io::Write;

    let mut file = NamedTempFile::new()?;
    file.write_all(bytes)?;
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    let path = file.path().to_string_lossy().into_owned();
    CREDENTIAL_FILES
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(file);
    Ok(path)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
