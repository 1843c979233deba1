//! Generic client for the Docker Registry HTTP API v2.
//!
//! This client backs Docker Hub, GHCR, Quay, Harbor, and any other
//! v2-compliant endpoint, and serves as the data plane for the specialized
//! ECR and GCR clients. Authentication follows the registry's
//! `WWW-Authenticate` challenge: bearer tokens are fetched from the
//! advertised realm, basic credentials are passed through when the
//! registry asks for them.
//!
//! [See Docker Registry API for more details on the API][Docker Registry API]
//!
//! [Docker Registry API]: https://distribution.github.io/distribution/spec/api/

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use oci_spec::image::Digest;
use reqwest::{Client, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;

use crate::{
    reference::{DockerReference, ReferenceSelector},
    transport::{
        BlobInfo, BlobStream, Manifest, DOCKER_MANIFEST_LIST_MIME_TYPE,
        DOCKER_MANIFEST_MIME_TYPE, OCI_INDEX_MIME_TYPE, OCI_MANIFEST_MIME_TYPE,
    },
    FreighterError, FreighterResult, Reference,
};

use super::{Repository, RegistryClient, RegistryResponseError};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Page size used for tag and catalog listings.
const LIST_PAGE_SIZE: usize = 1000;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Credentials presented to a registry.
#[derive(Debug, Clone, Default)]
pub enum RegistryAuth {
    /// No credentials; anonymous pulls only on most registries.
    #[default]
    Anonymous,

    /// HTTP basic credentials, also used to obtain bearer tokens.
    Basic {
        /// The username.
        username: String,

        /// The password or token.
        password: String,
    },
}

/// A client for one Docker v2 registry host.
#[derive(Debug, Clone)]
pub struct DockerV2Client {
    client: ClientWithMiddleware,
    registry: String,
    base_url: String,
    auth: RegistryAuth,
}

/// A repository handle backed by a [`DockerV2Client`].
pub struct V2Repository {
    client: Arc<DockerV2Client>,
    name: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagListResponse {
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    repositories: Option<Vec<String>>,
}

/// A parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Default)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DockerV2Client {
    /// Creates a client for the given registry host with an HTTP stack
    /// configured to retry transient errors.
    pub fn new(registry: impl Into<String>, auth: RegistryAuth) -> Self {
        let registry = registry.into();
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        let base_url = format!("https://{}", registry);

        Self {
            client,
            registry,
            base_url,
            auth,
        }
    }

    /// Returns the registry host this client talks to.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Obtains a bearer token for the given repository scope, if the
    /// registry uses token auth. Tokens are short-lived, so one is fetched
    /// per request rather than cached.
    async fn get_auth_token(
        &self,
        repository: &str,
        actions: &[&str],
    ) -> FreighterResult<Option<String>> {
        let probe = self
            .client
            .get(format!("{}/v2/", self.base_url))
            .send()
            .await?;

        if probe.status() != StatusCode::UNAUTHORIZED {
            return Ok(None);
        }

        let challenge = probe
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);
        let Some(challenge) = challenge else {
            // Basic challenge: credentials go directly on data requests.
            return Ok(None);
        };

        let scope = format!("repository:{}:{}", repository, actions.join(","));
        let mut request = self.client.get(&challenge.realm).query(&[("scope", scope.as_str())]);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service.as_str())]);
        }
        if let RegistryAuth::Basic { username, password } = &self.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FreighterError::Forbidden(format!(
                "token endpoint {} rejected the request: {}",
                challenge.realm,
                response.status()
            )));
        }

        let token = response.json::<TokenResponse>().await?;
        Ok(token.token.or(token.access_token))
    }

    /// Builds an authenticated request for a repository-scoped URL.
    async fn request(
        &self,
        method: reqwest::Method,
        url: String,
        repository: &str,
        actions: &[&str],
    ) -> FreighterResult<RequestBuilder> {
        let builder = self.client.request(method, url);
        match self.get_auth_token(repository, actions).await? {
            Some(token) => Ok(builder.bearer_auth(token)),
            None => match &self.auth {
                RegistryAuth::Basic { username, password } => {
                    Ok(builder.basic_auth(username, Some(password)))
                }
                RegistryAuth::Anonymous => Ok(builder),
            },
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl V2Repository {
    /// Creates a repository handle.
    pub fn new(client: Arc<DockerV2Client>, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }
}

/// Maps a non-success registry response to an error, consuming the body for
/// diagnostics.
async fn check_response(
    response: reqwest::Response,
    context: &str,
) -> FreighterResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() || status.is_redirection() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&body) {
        if let Some(errors) = parsed.get("errors") {
            let err = RegistryResponseError::new(errors.clone());
            if status == StatusCode::NOT_FOUND && err.is_manifest_unknown() {
                return Err(FreighterError::ManifestNotFound(context.to_string()));
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(FreighterError::Forbidden(format!("{}: {}", context, err)));
            }
            return Err(err.into());
        }
    }

    match status {
        StatusCode::NOT_FOUND => Err(FreighterError::NotFound(context.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(FreighterError::Forbidden(format!("{}: {}", context, status)))
        }
        s if s.is_server_error() => Err(FreighterError::UpstreamUnavailable(format!(
            "{}: {}",
            context, s
        ))),
        s => Err(FreighterError::UpstreamUnavailable(format!(
            "{}: unexpected status {}",
            context, s
        ))),
    }
}

fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut challenge = BearerChallenge::default();
    for part in rest.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        let key = kv.next()?.trim();
        let value = kv.next()?.trim().trim_matches('"');
        match key {
            "realm" => challenge.realm = value.to_string(),
            "service" => challenge.service = Some(value.to_string()),
            _ => {}
        }
    }
    if challenge.realm.is_empty() {
        return None;
    }
    Some(challenge)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RegistryClient for DockerV2Client {
    fn get_registry_name(&self) -> &str {
        &self.registry
    }

    async fn get_repository(&self, name: &str) -> FreighterResult<Arc<dyn Repository>> {
        crate::reference::validate_repository(name)?;
        Ok(Arc::new(V2Repository::new(Arc::new(self.clone()), name)))
    }

    async fn list_repositories(&self, prefix: &str) -> FreighterResult<Vec<String>> {
        let mut repositories = Vec::new();
        let mut last: Option<String> = None;

        loop {
            let mut url = self.url(&format!("/v2/_catalog?n={}", LIST_PAGE_SIZE));
            if let Some(last) = &last {
                url.push_str(&format!("&last={}", last));
            }
            let request = self
                .request(reqwest::Method::GET, url, "", &["pull"])
                .await?;
            let response = check_response(request.send().await?, "listing catalog").await?;
            let page = response.json::<CatalogResponse>().await?;

            let batch = page.repositories.unwrap_or_default();
            let batch_len = batch.len();
            last = batch.last().cloned();
            repositories.extend(batch);
            if batch_len < LIST_PAGE_SIZE {
                break;
            }
        }

        repositories.retain(|r| r.starts_with(prefix));
        Ok(repositories)
    }
}

#[async_trait]
impl Repository for V2Repository {
    fn get_registry_name(&self) -> &str {
        &self.client.registry
    }

    fn get_name(&self) -> &str {
        &self.name
    }

    async fn list_tags(&self) -> FreighterResult<Vec<String>> {
        let mut tags = Vec::new();
        let mut last: Option<String> = None;

        loop {
            let mut url = self
                .client
                .url(&format!("/v2/{}/tags/list?n={}", self.name, LIST_PAGE_SIZE));
            if let Some(last) = &last {
                url.push_str(&format!("&last={}", last));
            }
            let request = self
                .client
                .request(reqwest::Method::GET, url, &self.name, &["pull"])
                .await?;
            let response = check_response(
                request.send().await?,
                &format!("listing tags of {}", self.name),
            )
            .await?;
            let page = response.json::<TagListResponse>().await?;

            let batch = page.tags.unwrap_or_default();
            let batch_len = batch.len();
            last = batch.last().cloned();
            tags.extend(batch);
            if batch_len < LIST_PAGE_SIZE {
                break;
            }
        }

        Ok(tags)
    }

    async fn get_manifest(&self, reference: &str) -> FreighterResult<Manifest> {
        let url = self
            .client
            .url(&format!("/v2/{}/manifests/{}", self.name, reference));
        let accept = [
            DOCKER_MANIFEST_MIME_TYPE,
            DOCKER_MANIFEST_LIST_MIME_TYPE,
            OCI_MANIFEST_MIME_TYPE,
            OCI_INDEX_MIME_TYPE,
        ]
        .join(", ");

        let request = self
            .client
            .request(reqwest::Method::GET, url, &self.name, &["pull"])
            .await?
            .header(reqwest::header::ACCEPT, accept);
        let response = check_response(
            request.send().await?,
            &format!("{}/{}:{}", self.client.registry, self.name, reference),
        )
        .await?;

        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DOCKER_MANIFEST_MIME_TYPE)
            .to_string();
        let bytes = response.bytes().await?;
        Ok(Manifest::new(bytes.to_vec(), media_type))
    }

    async fn put_manifest(&self, reference: &str, manifest: &Manifest) -> FreighterResult<()> {
        let url = self
            .client
            .url(&format!("/v2/{}/manifests/{}", self.name, reference));
        let request = self
            .client
            .request(reqwest::Method::PUT, url, &self.name, &["pull", "push"])
            .await?
            .header(
                reqwest::header::CONTENT_TYPE,
                manifest.get_media_type().clone(),
            )
            .body(manifest.get_bytes().clone());
        check_response(
            request.send().await?,
            &format!("writing manifest {}/{}", self.name, reference),
        )
        .await?;
        Ok(())
    }

    async fn delete_manifest(&self, reference: &str) -> FreighterResult<()> {
        // Deletion requires a digest; resolve tags first.
        let digest = if reference.contains(':') && reference.starts_with("sha") {
            reference.to_string()
        } else {
            self.get_manifest(reference).await?.get_digest().to_string()
        };

        let url = self
            .client
            .url(&format!("/v2/{}/manifests/{}", self.name, digest));
        let request = self
            .client
            .request(reqwest::Method::DELETE, url, &self.name, &["pull", "push"])
            .await?;
        check_response(
            request.send().await?,
            &format!("deleting manifest {}/{}", self.name, reference),
        )
        .await?;
        Ok(())
    }

    async fn get_blob(&self, digest: &Digest) -> FreighterResult<(BlobStream, i64)> {
        tracing::debug!("fetching blob: {}/{} {}", self.client.registry, self.name, digest);

        let url = self
            .client
            .url(&format!("/v2/{}/blobs/{}", self.name, digest));
        let request = self
            .client
            .request(reqwest::Method::GET, url, &self.name, &["pull"])
            .await?;
        let response = check_response(
            request.send().await?,
            &format!("fetching blob {}/{}", self.name, digest),
        )
        .await?;

        let size = response
            .content_length()
            .map(|l| l as i64)
            .unwrap_or(crate::transport::UNKNOWN_BLOB_SIZE);
        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(FreighterError::from));
        Ok((stream.boxed(), size))
    }

    async fn blob_exists(&self, digest: &Digest) -> FreighterResult<bool> {
        let url = self
            .client
            .url(&format!("/v2/{}/blobs/{}", self.name, digest));
        let request = self
            .client
            .request(reqwest::Method::HEAD, url, &self.name, &["pull"])
            .await?;
        let response = request.send().await?;
        Ok(response.status().is_success())
    }

    async fn put_blob(
        &self,
        digest: &Digest,
        size: i64,
        stream: BlobStream,
    ) -> FreighterResult<BlobInfo> {
        // Start a monolithic upload session.
        let start_url = self
            .client
            .url(&format!("/v2/{}/blobs/uploads/", self.name));
        let request = self
            .client
            .request(reqwest::Method::POST, start_url, &self.name, &["pull", "push"])
            .await?;
        let response = check_response(
            request.send().await?,
            &format!("starting blob upload for {}", self.name),
        )
        .await?;

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                FreighterError::UpstreamUnavailable(format!(
                    "registry {} returned no upload location",
                    self.client.registry
                ))
            })?
            .to_string();
        let location = if location.starts_with("http") {
            location
        } else {
            self.client.url(&location)
        };
        let separator = if location.contains('?') { '&' } else { '?' };
        let upload_url = format!("{}{}digest={}", location, separator, digest);

        let body = reqwest::Body::wrap_stream(stream);
        let request = self
            .client
            .request(reqwest::Method::PUT, upload_url, &self.name, &["pull", "push"])
            .await?
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        check_response(
            request.send().await?,
            &format!("uploading blob {}/{}", self.name, digest),
        )
        .await?;

        Ok(BlobInfo::new(
            digest.clone(),
            size,
            "application/octet-stream",
        ))
    }

    fn get_image_reference(&self, tag: &str) -> FreighterResult<Reference> {
        let reference = DockerReference::new(
            self.client.registry.clone(),
            self.name.clone(),
            ReferenceSelector::tag(tag),
        )?;
        Ok(Reference::Docker(reference))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Convenience constructor used by the transports and the factory.
pub fn v2_client(registry: &str, auth: RegistryAuth) -> Arc<DockerV2Client> {
    Arc::new(DockerV2Client::new(registry, auth))
}

/// Resolves credentials for a generic v2 registry from the process
/// environment (`FREIGHTER_REGISTRY_USERNAME` / `FREIGHTER_REGISTRY_PASSWORD`).
pub fn auth_from_env() -> RegistryAuth {
    match (
        std::env::var("FREIGHTER_REGISTRY_USERNAME"),
        std::env::var("FREIGHTER_REGISTRY_PASSWORD"),
    ) {
        (Ok(username), Ok(password)) if !username.is_empty() => RegistryAuth::Basic {
            username,
            password,
        },
        _ => RegistryAuth::Anonymous,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
