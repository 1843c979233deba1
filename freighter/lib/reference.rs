//! Image reference parsing across transports.
//!
//! A reference is an opaque parsed pointer to one image within one transport.
//! The tool-boundary syntax is `<transport>:<rest>`:
//!
//! - `docker://<host>/<repo>[:tag|@digest]` — a remote Docker v2 registry.
//! - `dir:<abs-path>` — a directory layout.
//! - `oci:<abs-path>[:tag|@digest]` — an OCI image layout.
//! - `docker-archive:<abs-path>[:ref|@digest]` — a Docker save tar.
//!
//! Strings with no recognized transport prefix parse as `docker` references.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use getset::Getters;
use oci_spec::image::Digest;
use regex::Regex;

use crate::{config::DEFAULT_REFERENCE_TAG, FreighterError, FreighterResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Transport name for remote Docker v2 registries.
pub const TRANSPORT_DOCKER: &str = "docker";

/// Transport name for the directory layout.
pub const TRANSPORT_DIR: &str = "dir";

/// Transport name for the OCI image layout.
pub const TRANSPORT_OCI: &str = "oci";

/// Transport name for Docker save tars.
pub const TRANSPORT_DOCKER_ARCHIVE: &str = "docker-archive";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed pointer to an image within some transport.
///
/// References are created by parsing and immutable afterwards; each variant
/// can re-derive the exact string it was parsed from via
/// [`Reference::string_within_transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// An image in a remote Docker v2 registry.
    Docker(DockerReference),

    /// An image stored as a plain directory.
    Dir(DirReference),

    /// An image inside an OCI image layout directory.
    Oci(OciReference),

    /// An image inside a Docker save tar.
    DockerArchive(ArchiveReference),
}

/// A reference to an image in a remote Docker v2 registry.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DockerReference {
    /// The registry hostname, optionally with a port.
    registry: String,

    /// The repository name within the registry.
    repository: String,

    /// The tag or digest selecting one image in the repository.
    selector: ReferenceSelector,
}

/// The selector part of a registry reference: a tag, a digest, or both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceSelector {
    /// Tag variant containing the image tag and an optional digest.
    Tag {
        /// The image tag.
        tag: String,

        /// The optional digest pinning the tag.
        digest: Option<Digest>,
    },

    /// Digest variant containing only a digest.
    Digest(Digest),
}

/// A reference to an image stored as a plain directory.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct DirReference {
    /// The absolute path of the directory.
    path: PathBuf,
}

/// A reference to an image inside an OCI image layout directory.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct OciReference {
    /// The absolute path of the layout directory.
    path: PathBuf,

    /// The tag within the layout's index, unless a digest is given.
    tag: Option<String>,

    /// The digest within the layout, unless a tag is given.
    digest: Option<Digest>,
}

/// A reference to an image inside a Docker save tar.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ArchiveReference {
    /// The path of the tar file.
    path: PathBuf,

    /// The repo:tag reference recorded in the archive manifest, if any.
    reference: Option<String>,

    /// The digest selecting one image in the archive, if any.
    digest: Option<Digest>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Reference {
    /// Returns the name of the transport this reference belongs to.
    pub fn transport_name(&self) -> &'static str {
        match self {
            Reference::Docker(_) => TRANSPORT_DOCKER,
            Reference::Dir(_) => TRANSPORT_DIR,
            Reference::Oci(_) => TRANSPORT_OCI,
            Reference::DockerArchive(_) => TRANSPORT_DOCKER_ARCHIVE,
        }
    }

    /// Returns the transport-specific part of the reference string, without
    /// the `<transport>:` prefix. Re-parsing this string with the same
    /// transport yields an equal reference.
    pub fn string_within_transport(&self) -> String {
        match self {
            Reference::Docker(r) => format!("//{}", r),
            Reference::Dir(r) => r.path.display().to_string(),
            Reference::Oci(r) => r.string_within_transport(),
            Reference::DockerArchive(r) => r.string_within_transport(),
        }
    }
}

impl ReferenceSelector {
    /// Creates a tag selector with no digest.
    pub fn tag(tag: impl Into<String>) -> Self {
        Self::Tag {
            tag: tag.into(),
            digest: None,
        }
    }

    /// Creates a digest-only selector.
    pub fn digest(digest: Digest) -> Self {
        Self::Digest(digest)
    }

    /// Returns the tag if this selector carries one.
    pub fn tag_name(&self) -> Option<&str> {
        match self {
            ReferenceSelector::Tag { tag, .. } => Some(tag),
            ReferenceSelector::Digest(_) => None,
        }
    }

    /// Returns the digest if this selector carries one.
    pub fn digest_value(&self) -> Option<&Digest> {
        match self {
            ReferenceSelector::Tag { digest, .. } => digest.as_ref(),
            ReferenceSelector::Digest(digest) => Some(digest),
        }
    }
}

impl DockerReference {
    /// Creates a registry reference from already-validated parts.
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        selector: ReferenceSelector,
    ) -> FreighterResult<Self> {
        let registry = registry.into();
        let repository = repository.into();
        validate_registry(&registry)?;
        validate_repository(&repository)?;
        if let ReferenceSelector::Tag { tag, .. } = &selector {
            validate_tag(tag)?;
        }
        Ok(Self {
            registry,
            repository,
            selector,
        })
    }

    /// Returns a copy of this reference pointing at a different tag.
    pub fn with_tag(&self, tag: &str) -> FreighterResult<Self> {
        validate_tag(tag)?;
        Ok(Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            selector: ReferenceSelector::tag(tag),
        })
    }
}

impl OciReference {
    fn string_within_transport(&self) -> String {
        match (&self.tag, &self.digest) {
            (_, Some(digest)) => format!("{}@{}", self.path.display(), digest),
            (Some(tag), None) => format!("{}:{}", self.path.display(), tag),
            (None, None) => self.path.display().to_string(),
        }
    }

    /// Returns the tag or the default tag when only a digest selects the image.
    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_REFERENCE_TAG)
    }
}

impl ArchiveReference {
    fn string_within_transport(&self) -> String {
        match (&self.reference, &self.digest) {
            (_, Some(digest)) => format!("{}@{}", self.path.display(), digest),
            (Some(r), None) => format!("{}:{}", self.path.display(), r),
            (None, None) => self.path.display().to_string(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Reference {
    type Err = FreighterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.transport_name(),
            self.string_within_transport()
        )
    }
}

impl fmt::Display for DockerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.selector {
            ReferenceSelector::Tag {
                tag,
                digest: Some(d),
            } => write!(f, ":{}@{}", tag, d),
            ReferenceSelector::Tag { tag, digest: None } => write!(f, ":{}", tag),
            ReferenceSelector::Digest(d) => write!(f, "@{}", d),
        }
    }
}

impl FromStr for DockerReference {
    type Err = FreighterError;

    /// Parses a registry reference of the form
    /// `[registry/]repository[:tag][@digest]`.
    ///
    /// When the registry is omitted it defaults to `docker.io`, and a bare
    /// single-segment Docker Hub repository gains the `library/` namespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(FreighterError::ImageReferenceError(
                "input string is empty".into(),
            ));
        }

        let (pre, digest) = match s.find('@') {
            Some(at_idx) => {
                let digest_str = &s[at_idx + 1..];
                if !digest_str.contains(':') {
                    return Err(FreighterError::ImageReferenceError(format!(
                        "invalid digest: {}",
                        digest_str
                    )));
                }
                let parsed = digest_str.parse::<Digest>().map_err(|e| {
                    FreighterError::ImageReferenceError(format!("invalid digest: {}", e))
                })?;
                (&s[..at_idx], Some(parsed))
            }
            None => (s, None),
        };

        let (registry, remainder) = extract_registry_and_path(pre);
        let (repository, tag) = extract_repository_and_tag(&registry, remainder)?;

        validate_registry(&registry)?;
        validate_repository(&repository)?;

        let selector = match (tag, digest) {
            (Some(tag), digest) => {
                validate_tag(&tag)?;
                ReferenceSelector::Tag { tag, digest }
            }
            (None, Some(digest)) => ReferenceSelector::Digest(digest),
            (None, None) => ReferenceSelector::tag(DEFAULT_REFERENCE_TAG),
        };

        Ok(DockerReference {
            registry,
            repository,
            selector,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a tool-boundary reference string into a [`Reference`].
///
/// The transport name is everything before the first `:`; an optional `//`
/// after the delimiter is stripped and the registered transport's parser is
/// invoked. Strings whose prefix is not a registered transport name parse as
/// `docker` references in their entirety; if no `docker` transport is
/// registered that is an [`FreighterError::UnknownTransport`].
pub fn parse(s: &str) -> FreighterResult<Reference> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FreighterError::ImageReferenceError(
            "input string is empty".into(),
        ));
    }

    if let Some(idx) = s.find(':') {
        let scheme = &s[..idx];
        if let Some(transport) = crate::transport::lookup_transport(scheme) {
            let rest = s[idx + 1..].strip_prefix("//").unwrap_or(&s[idx + 1..]);
            return transport.parse_reference(rest);
        }
    }

    // No transport prefix: the whole string is a docker reference.
    let docker = crate::transport::lookup_transport(TRANSPORT_DOCKER)
        .ok_or_else(|| FreighterError::UnknownTransport(TRANSPORT_DOCKER.to_string()))?;
    docker.parse_reference(s)
}

/// Parses the rest of a `dir:` reference. The rest is an absolute path.
pub fn parse_dir_reference(rest: &str) -> FreighterResult<Reference> {
    if rest.is_empty() {
        return Err(FreighterError::ImageReferenceError(
            "dir: reference has an empty path".into(),
        ));
    }
    if !Path::new(rest).is_absolute() {
        return Err(FreighterError::ImageReferenceError(format!(
            "dir: path must be absolute: {}",
            rest
        )));
    }
    Ok(Reference::Dir(DirReference {
        path: PathBuf::from(rest),
    }))
}

/// Parses the rest of an `oci:` reference: `<path>[:<tag>|@<digest>]`.
///
/// A `:` immediately preceded by `sha256` is part of a digest, never a tag
/// separator. The tag defaults to `latest` when unspecified.
pub fn parse_oci_reference(rest: &str) -> FreighterResult<Reference> {
    if rest.is_empty() {
        return Err(FreighterError::ImageReferenceError(
            "oci: reference has an empty path".into(),
        ));
    }

    if let Some(at_idx) = rest.rfind('@') {
        let digest = rest[at_idx + 1..].parse::<Digest>().map_err(|e| {
            FreighterError::ImageReferenceError(format!("invalid digest: {}", e))
        })?;
        return build_oci_reference(&rest[..at_idx], None, Some(digest));
    }

    if let Some(idx) = rest.rfind(':') {
        if !is_digest_algorithm_colon(rest, idx) {
            let tag = &rest[idx + 1..];
            validate_tag(tag)?;
            return build_oci_reference(&rest[..idx], Some(tag.to_string()), None);
        }
    }

    build_oci_reference(rest, Some(DEFAULT_REFERENCE_TAG.to_string()), None)
}

/// Parses the rest of a `docker-archive:` reference: `<path>[:<ref>|@<digest>]`.
///
/// A `:` at index 1 followed by `\` marks a Windows drive path, not a
/// reference separator.
pub fn parse_archive_reference(rest: &str) -> FreighterResult<Reference> {
    if rest.is_empty() {
        return Err(FreighterError::ImageReferenceError(
            "docker-archive: reference has an empty path".into(),
        ));
    }

    if let Some(at_idx) = rest.rfind('@') {
        let digest = rest[at_idx + 1..].parse::<Digest>().map_err(|e| {
            FreighterError::ImageReferenceError(format!("invalid digest: {}", e))
        })?;
        return Ok(Reference::DockerArchive(ArchiveReference {
            path: PathBuf::from(&rest[..at_idx]),
            reference: None,
            digest: Some(digest),
        }));
    }

    if let Some(idx) = rest.find(':') {
        let is_windows_drive = idx == 1 && rest.as_bytes().get(2) == Some(&b'\\');
        if !is_windows_drive {
            return Ok(Reference::DockerArchive(ArchiveReference {
                path: PathBuf::from(&rest[..idx]),
                reference: Some(rest[idx + 1..].to_string()),
                digest: None,
            }));
        }
    }

    Ok(Reference::DockerArchive(ArchiveReference {
        path: PathBuf::from(rest),
        reference: None,
        digest: None,
    }))
}

fn build_oci_reference(
    path: &str,
    tag: Option<String>,
    digest: Option<Digest>,
) -> FreighterResult<Reference> {
    if path.is_empty() {
        return Err(FreighterError::ImageReferenceError(
            "oci: reference has an empty path".into(),
        ));
    }
    Ok(Reference::Oci(OciReference {
        path: PathBuf::from(path),
        tag,
        digest,
    }))
}

/// Returns true if the `:` at `idx` follows the six characters `sha256`,
/// i.e. belongs to a digest rather than separating a tag.
fn is_digest_algorithm_colon(s: &str, idx: usize) -> bool {
    idx >= 6 && &s[idx - 6..idx] == "sha256"
}

/// Validates the given registry string.
///
/// The registry may contain alphanumeric characters, dashes, dots, and
/// optionally a port number.
pub fn validate_registry(registry: &str) -> FreighterResult<()> {
    let re = Regex::new(r"^[a-zA-Z0-9.-]+(:[0-9]+)?$").unwrap();
    if re.is_match(registry) {
        Ok(())
    } else {
        Err(FreighterError::ImageReferenceError(format!(
            "invalid registry: {}",
            registry
        )))
    }
}

/// Validates a repository name against the Docker distribution grammar.
pub fn validate_repository(repository: &str) -> FreighterResult<()> {
    let repo_re =
        Regex::new(r"^([a-z0-9]+(?:[._-][a-z0-9]+)*)(/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$").unwrap();
    if repo_re.is_match(repository) {
        Ok(())
    } else {
        Err(FreighterError::ImageReferenceError(format!(
            "invalid repository: {}",
            repository
        )))
    }
}

/// Validates a tag: a word character followed by up to 127 word characters,
/// dots, or dashes.
pub fn validate_tag(tag: &str) -> FreighterResult<()> {
    let tag_re = Regex::new(r"^\w[\w.-]{0,127}$").unwrap();
    if tag_re.is_match(tag) {
        Ok(())
    } else {
        Err(FreighterError::ImageReferenceError(format!(
            "invalid tag: {}",
            tag
        )))
    }
}

/// Extracts the registry and the remaining path from a registry reference.
/// A first segment counts as a registry when it contains a dot, a colon, or
/// equals `localhost`; otherwise the registry defaults to `docker.io`.
fn extract_registry_and_path(reference: &str) -> (String, &str) {
    let segments: Vec<&str> = reference.splitn(2, '/').collect();
    if segments.len() > 1
        && (segments[0].contains('.') || segments[0].contains(':') || segments[0] == "localhost")
    {
        (segments[0].to_string(), segments[1])
    } else {
        (crate::config::DOCKER_HUB_REGISTRY.to_string(), reference)
    }
}

/// Extracts the repository and optional tag from the path part. A bare
/// single-segment Docker Hub repository gains the `library/` namespace.
fn extract_repository_and_tag(
    registry: &str,
    path: &str,
) -> FreighterResult<(String, Option<String>)> {
    let (repo_part, tag) = match path.rfind(':') {
        Some(idx) => (&path[..idx], Some(path[idx + 1..].to_string())),
        None => (path, None),
    };
    if repo_part.is_empty() {
        return Err(FreighterError::ImageReferenceError(
            "repository is empty".into(),
        ));
    }
    let repository =
        if registry == crate::config::DOCKER_HUB_REGISTRY && !repo_part.contains('/') {
            format!("library/{}", repo_part)
        } else {
            repo_part.to_string()
        };
    Ok((repository, tag))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_DIGEST: &str =
        "sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

    #[test]
    fn test_parse_docker_reference_with_registry_and_tag() {
        let reference = parse("docker://docker.io/library/alpine:3.12").unwrap();
        let Reference::Docker(r) = &reference else {
            panic!("expected docker reference");
        };
        assert_eq!(r.get_registry(), "docker.io");
        assert_eq!(r.get_repository(), "library/alpine");
        assert_eq!(r.get_selector().tag_name(), Some("3.12"));
        assert_eq!(
            reference.string_within_transport(),
            "//docker.io/library/alpine:3.12"
        );
    }

    #[test]
    fn test_parse_schemeless_falls_back_to_docker() {
        let reference = parse("ghcr.io/acme/app:v1").unwrap();
        let Reference::Docker(r) = &reference else {
            panic!("expected docker reference");
        };
        assert_eq!(r.get_registry(), "ghcr.io");
        assert_eq!(r.get_repository(), "acme/app");
        assert_eq!(r.get_selector().tag_name(), Some("v1"));
    }

    #[test]
    fn test_parse_schemeless_single_segment_gains_hub_namespace() {
        let reference = parse("alpine").unwrap();
        let Reference::Docker(r) = &reference else {
            panic!("expected docker reference");
        };
        assert_eq!(r.get_registry(), "docker.io");
        assert_eq!(r.get_repository(), "library/alpine");
        assert_eq!(r.get_selector().tag_name(), Some(DEFAULT_REFERENCE_TAG));
    }

    #[test]
    fn test_parse_docker_reference_with_digest() {
        let s = format!("docker://quay.io/acme/app@{}", VALID_DIGEST);
        let Reference::Docker(r) = parse(&s).unwrap() else {
            panic!("expected docker reference");
        };
        assert_eq!(r.get_registry(), "quay.io");
        assert_eq!(
            r.get_selector().digest_value().unwrap().to_string(),
            VALID_DIGEST
        );
        assert!(r.get_selector().tag_name().is_none());
    }

    #[test]
    fn test_parse_docker_reference_registry_with_port() {
        let Reference::Docker(r) = parse("localhost:5000/myrepo:1.0").unwrap() else {
            panic!("expected docker reference");
        };
        assert_eq!(r.get_registry(), "localhost:5000");
        assert_eq!(r.get_repository(), "myrepo");
        assert_eq!(r.get_selector().tag_name(), Some("1.0"));
    }

    #[test]
    fn test_parse_dir_reference() {
        let reference = parse("dir:/tmp/images/app").unwrap();
        let Reference::Dir(r) = &reference else {
            panic!("expected dir reference");
        };
        assert_eq!(r.get_path(), Path::new("/tmp/images/app"));
        assert_eq!(reference.string_within_transport(), "/tmp/images/app");
    }

    #[test]
    fn test_parse_dir_reference_relative_path_rejected() {
        let err = parse("dir:images/app").unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    fn test_parse_oci_reference_with_tag() {
        let reference = parse("oci:/var/lib/layout:v2").unwrap();
        let Reference::Oci(r) = &reference else {
            panic!("expected oci reference");
        };
        assert_eq!(r.get_path(), Path::new("/var/lib/layout"));
        assert_eq!(r.get_tag().as_deref(), Some("v2"));
        assert_eq!(reference.string_within_transport(), "/var/lib/layout:v2");
    }

    #[test]
    fn test_parse_oci_reference_default_tag() {
        let Reference::Oci(r) = parse("oci:/var/lib/layout").unwrap() else {
            panic!("expected oci reference");
        };
        assert_eq!(r.get_tag().as_deref(), Some("latest"));
        assert!(r.get_digest().is_none());
    }

    #[test]
    fn test_parse_oci_reference_digest_colon_is_not_a_tag() {
        let s = format!("oci:/var/lib/layout@{}", VALID_DIGEST);
        let Reference::Oci(r) = parse(&s).unwrap() else {
            panic!("expected oci reference");
        };
        assert_eq!(r.get_path(), Path::new("/var/lib/layout"));
        assert_eq!(r.get_digest().as_ref().unwrap().to_string(), VALID_DIGEST);
        assert!(r.get_tag().is_none());
    }

    #[test]
    fn test_parse_archive_reference_with_ref() {
        let reference = parse("docker-archive:/tmp/x.tar:app:v1").unwrap();
        let Reference::DockerArchive(r) = &reference else {
            panic!("expected archive reference");
        };
        assert_eq!(r.get_path(), Path::new("/tmp/x.tar"));
        assert_eq!(r.get_reference().as_deref(), Some("app:v1"));
        assert_eq!(reference.string_within_transport(), "/tmp/x.tar:app:v1");
    }

    #[test]
    fn test_parse_archive_reference_windows_drive_guard() {
        let Reference::DockerArchive(r) = parse(r"docker-archive:C:\images\x.tar").unwrap()
        else {
            panic!("expected archive reference");
        };
        assert_eq!(r.get_path(), Path::new(r"C:\images\x.tar"));
        assert!(r.get_reference().is_none());
    }

    #[test]
    fn test_parse_empty_input() {
        let err = parse("").unwrap_err();
        assert!(err.to_string().contains("input string is empty"));
    }

    #[test]
    fn test_parse_invalid_tag() {
        let err = parse("docker://docker.io/library/alpine:t!ag").unwrap_err();
        assert!(err.to_string().contains("invalid tag"));
    }

    #[test]
    fn test_parse_invalid_repository() {
        let err = parse("docker://docker.io/Library/alpine:3.12").unwrap_err();
        assert!(err.to_string().contains("invalid repository"));
    }

    #[test]
    fn test_parse_tag_length_exceeds_limit() {
        let long_tag = "a".repeat(129);
        let err = parse(&format!("docker.io/library/alpine:{}", long_tag)).unwrap_err();
        assert!(err.to_string().contains("invalid tag"));
    }

    #[test]
    fn test_string_within_transport_roundtrip() {
        for input in [
            "docker://ghcr.io/acme/app:v1",
            "dir:/tmp/images/app",
            "oci:/var/lib/layout:v2",
            "docker-archive:/tmp/x.tar:app:v1",
        ] {
            let first = parse(input).unwrap();
            let reparsed = parse(&format!(
                "{}:{}",
                first.transport_name(),
                first.string_within_transport()
            ))
            .unwrap();
            assert_eq!(
                first.string_within_transport(),
                reparsed.string_within_transport()
            );
        }
    }

    #[test]
    fn test_docker_reference_with_tag_helper() {
        let Reference::Docker(r) = parse("ghcr.io/acme/app:v1").unwrap() else {
            panic!("expected docker reference");
        };
        let retagged = r.with_tag("v2").unwrap();
        assert_eq!(retagged.get_selector().tag_name(), Some("v2"));
        assert_eq!(retagged.get_repository(), "acme/app");
        assert!(r.with_tag("in valid").is_err());
    }
}
