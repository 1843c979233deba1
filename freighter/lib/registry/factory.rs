//! Registry client factory: hostname normalization, family auto-detection,
//! and registry path parsing.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::{
    config::{EngineConfig, DOCKER_HUB_REGISTRY},
    utils::looks_like_filesystem_path,
    FreighterError, FreighterResult,
};

use super::{auth_from_env, DockerV2Client, EcrClient, GcrClient, RegistryClient};

//--------------------------------------------------------------------------------------------------
// Statics
//--------------------------------------------------------------------------------------------------

static ECR_HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]{12}\.dkr\.ecr\.[a-z0-9-]+\.amazonaws\.com$").unwrap()
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The registry family a hostname resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryFamily {
    /// AWS Elastic Container Registry.
    Ecr,

    /// Google Container Registry / Artifact Registry.
    Gcr,

    /// Any other Docker v2 endpoint (Docker Hub, GHCR, Quay, Harbor, ...).
    DockerV2,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Normalizes registry hostname aliases. `index.docker.io` and
/// `registry-1.docker.io` are the same registry as `docker.io`.
pub fn normalize_registry_host(host: &str) -> String {
    match host {
        "index.docker.io" | "registry-1.docker.io" => DOCKER_HUB_REGISTRY.to_string(),
        other => other.to_string(),
    }
}

/// Detects the registry family for a normalized hostname.
pub fn detect_registry_family(host: &str) -> RegistryFamily {
    if ECR_HOST_RE.is_match(host) {
        return RegistryFamily::Ecr;
    }
    if host == "gcr.io" || host.ends_with(".gcr.io") || host.ends_with("-docker.pkg.dev") {
        return RegistryFamily::Gcr;
    }
    RegistryFamily::DockerV2
}

/// Constructs the appropriate registry client for a hostname. Any non-empty
/// hostname is accepted; unknown hosts get the generic Docker v2 client.
pub async fn create_registry_client(
    host: &str,
    config: &EngineConfig,
) -> FreighterResult<Arc<dyn RegistryClient>> {
    if host.is_empty() {
        return Err(FreighterError::InvalidInput("empty registry hostname".into()));
    }

    let host = normalize_registry_host(host);
    match detect_registry_family(&host) {
        RegistryFamily::Ecr => {
            tracing::debug!("registry {} detected as ECR", host);
            Ok(Arc::new(
                EcrClient::new(host, config.get_registry().get_ecr()).await?,
            ))
        }
        RegistryFamily::Gcr => {
            tracing::debug!("registry {} detected as GCR", host);
            Ok(Arc::new(GcrClient::new(host, config.get_registry().get_gcr())?))
        }
        RegistryFamily::DockerV2 => {
            tracing::debug!("registry {} using generic Docker v2 client", host);
            Ok(Arc::new(DockerV2Client::new(host, auth_from_env())))
        }
    }
}

/// Parses a `<host>/<repo>[:tag|@digest]` registry path into host and
/// repository, stripping the tag/digest suffix from the repository only
/// (so `localhost:5000/foo` keeps its port).
pub fn parse_registry_path(path: &str) -> FreighterResult<(String, String)> {
    if looks_like_filesystem_path(path) {
        return Err(FreighterError::InvalidInput(format!(
            "registry path looks like a filesystem path: {}",
            path
        )));
    }

    let Some((host, repo)) = path.split_once('/') else {
        return Err(FreighterError::InvalidInput(format!(
            "registry path must contain a '/': {}",
            path
        )));
    };
    if host.is_empty() {
        return Err(FreighterError::InvalidInput(format!(
            "registry path has an empty host: {}",
            path
        )));
    }

    let repo = match repo.find('@') {
        Some(idx) => &repo[..idx],
        None => match repo.rfind(':') {
            Some(idx) => &repo[..idx],
            None => repo,
        },
    };
    if repo.is_empty() {
        return Err(FreighterError::InvalidInput(format!(
            "registry path has an empty repository: {}",
            path
        )));
    }

    Ok((normalize_registry_host(host), repo.to_string()))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_registry_host() {
        assert_eq!(normalize_registry_host("index.docker.io"), "docker.io");
        assert_eq!(normalize_registry_host("registry-1.docker.io"), "docker.io");
        assert_eq!(normalize_registry_host("ghcr.io"), "ghcr.io");
    }

    #[test]
    fn test_detect_registry_family() {
        assert_eq!(
            detect_registry_family("123456789012.dkr.ecr.us-east-1.amazonaws.com"),
            RegistryFamily::Ecr
        );
        assert_eq!(detect_registry_family("gcr.io"), RegistryFamily::Gcr);
        assert_eq!(detect_registry_family("eu.gcr.io"), RegistryFamily::Gcr);
        assert_eq!(
            detect_registry_family("us-central1-docker.pkg.dev"),
            RegistryFamily::Gcr
        );
        assert_eq!(detect_registry_family("quay.io"), RegistryFamily::DockerV2);
        assert_eq!(
            detect_registry_family("registry.corp.example.com"),
            RegistryFamily::DockerV2
        );
    }

    #[test]
    fn test_parse_registry_path() {
        assert_eq!(
            parse_registry_path("ghcr.io/acme/app").unwrap(),
            ("ghcr.io".to_string(), "acme/app".to_string())
        );
        assert_eq!(
            parse_registry_path("ghcr.io/acme/app:v1").unwrap(),
            ("ghcr.io".to_string(), "acme/app".to_string())
        );
        assert_eq!(
            parse_registry_path(
                "ghcr.io/acme/app@sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef"
            )
            .unwrap(),
            ("ghcr.io".to_string(), "acme/app".to_string())
        );
        assert_eq!(
            parse_registry_path("localhost:5000/foo").unwrap(),
            ("localhost:5000".to_string(), "foo".to_string())
        );
        assert_eq!(
            parse_registry_path("index.docker.io/library/alpine").unwrap(),
            ("docker.io".to_string(), "library/alpine".to_string())
        );
    }

    #[test]
    fn test_parse_registry_path_rejects_filesystem_paths() {
        for path in ["/var/tmp/repo", "./repo", "../repo"] {
            assert!(parse_registry_path(path).is_err());
        }
        assert!(parse_registry_path("no-slash").is_err());
        assert!(parse_registry_path("host/").is_err());
    }
}
