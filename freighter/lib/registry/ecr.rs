//! AWS Elastic Container Registry client.
//!
//! The SDK is the control plane (authorization tokens, repository creation
//! and listing); the Docker v2 data plane is shared with the generic client
//! using the basic credentials ECR hands out.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ecr::error::ProvideErrorMetadata;
use base64::Engine;

use crate::{config::EcrConfig, FreighterError, FreighterResult};

use super::{DockerV2Client, RegistryAuth, RegistryClient, Repository};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client for one ECR registry host.
pub struct EcrClient {
    registry: String,
    sdk: aws_sdk_ecr::Client,
    v2: Arc<DockerV2Client>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EcrClient {
    /// Creates a client for an ECR registry host
    /// (`<account>.dkr.ecr.<region>.amazonaws.com`), resolving the region
    /// from the hostname and falling back to the configured one.
    pub async fn new(registry: impl Into<String>, config: &EcrConfig) -> FreighterResult<Self> {
        let registry = registry.into();
        let region = region_from_host(&registry)
            .or_else(|| {
                let configured = config.get_region();
                (!configured.is_empty()).then(|| configured.clone())
            })
            .ok_or_else(|| {
                FreighterError::InvalidInput(format!(
                    "cannot determine AWS region for registry {}",
                    registry
                ))
            })?;

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .load()
            .await;
        let sdk = aws_sdk_ecr::Client::new(&aws_config);

        let auth = fetch_registry_auth(&sdk).await?;
        let v2 = Arc::new(DockerV2Client::new(registry.clone(), auth));

        Ok(Self { registry, sdk, v2 })
    }
}

/// Exchanges an ECR authorization token for Docker v2 basic credentials.
async fn fetch_registry_auth(sdk: &aws_sdk_ecr::Client) -> FreighterResult<RegistryAuth> {
    let output = sdk
        .get_authorization_token()
        .send()
        .await
        .map_err(translate_ecr_error)?;

    let token = output
        .authorization_data()
        .first()
        .and_then(|d| d.authorization_token())
        .ok_or_else(|| {
            FreighterError::UpstreamUnavailable("ECR returned no authorization token".into())
        })?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|e| {
            FreighterError::UpstreamUnavailable(format!("ECR token is not base64: {}", e))
        })?;
    let decoded = String::from_utf8(decoded).map_err(|e| {
        FreighterError::UpstreamUnavailable(format!("ECR token is not UTF-8: {}", e))
    })?;
    let (username, password) = decoded.split_once(':').ok_or_else(|| {
        FreighterError::UpstreamUnavailable("ECR token has no user:password form".into())
    })?;

    Ok(RegistryAuth::Basic {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Extracts the region from an ECR hostname
/// (`<account>.dkr.ecr.<region>.amazonaws.com`).
fn region_from_host(host: &str) -> Option<String> {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() >= 6 && parts[1] == "dkr" && parts[2] == "ecr" {
        return Some(parts[3].to_string());
    }
    None
}

/// Translates an ECR SDK error into the engine's error kinds.
fn translate_ecr_error<E>(err: aws_sdk_ecr::error::SdkError<E>) -> FreighterError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match err.code() {
        Some("AccessDeniedException") | Some("UnauthorizedException") => {
            FreighterError::Forbidden(format!("ECR: {:?}", err))
        }
        Some("RepositoryNotFoundException") => {
            FreighterError::NotFound(format!("ECR: {:?}", err))
        }
        _ => FreighterError::UpstreamUnavailable(format!("ECR: {:?}", err)),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RegistryClient for EcrClient {
    fn get_registry_name(&self) -> &str {
        &self.registry
    }

    async fn get_repository(&self, name: &str) -> FreighterResult<Arc<dyn Repository>> {
        self.v2.get_repository(name).await
    }

    async fn create_repository(
        &self,
        name: &str,
        tags: &HashMap<String, String>,
    ) -> FreighterResult<Arc<dyn Repository>> {
        let resource_tags: Vec<aws_sdk_ecr::types::Tag> = tags
            .iter()
            .filter_map(|(key, value)| {
                aws_sdk_ecr::types::Tag::builder()
                    .key(key)
                    .value(value)
                    .build()
                    .ok()
            })
            .collect();

        let mut request = self.sdk.create_repository().repository_name(name);
        if !resource_tags.is_empty() {
            request = request.set_tags(Some(resource_tags));
        }

        match request.send().await {
            Ok(_) => {
                tracing::info!("created ECR repository {}", name);
            }
            Err(err) if err.code() == Some("RepositoryAlreadyExistsException") => {
                tracing::debug!("ECR repository {} already exists", name);
            }
            Err(err) => return Err(translate_ecr_error(err)),
        }

        self.get_repository(name).await
    }

    async fn list_repositories(&self, prefix: &str) -> FreighterResult<Vec<String>> {
        let mut repositories = Vec::new();
        let mut pages = self.sdk.describe_repositories().into_paginator().send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(translate_ecr_error)?;
            for repo in page.repositories() {
                if let Some(name) = repo.repository_name() {
                    if name.starts_with(prefix) {
                        repositories.push(name.to_string());
                    }
                }
            }
        }

        Ok(repositories)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_from_host() {
        assert_eq!(
            region_from_host("123456789012.dkr.ecr.us-east-1.amazonaws.com").as_deref(),
            Some("us-east-1")
        );
        assert_eq!(region_from_host("docker.io"), None);
        assert_eq!(region_from_host("gcr.io"), None);
    }
}
