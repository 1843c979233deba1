//! Pluggable image transports.
//!
//! A transport backs one reference scheme (`docker://`, `dir:`, `oci:`,
//! `docker-archive:`) with implementations of the [`ImageSource`] and
//! [`ImageDestination`] contracts. A process-wide registry maps transport
//! names to implementations; [`crate::reference::parse`] consults it.

mod dir;
mod docker;
mod docker_archive;
mod fsutil;
mod oci_layout;
mod types;

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock, RwLock},
};

use async_trait::async_trait;

use crate::{
    reference::{TRANSPORT_DIR, TRANSPORT_DOCKER, TRANSPORT_DOCKER_ARCHIVE, TRANSPORT_OCI},
    FreighterError, FreighterResult, Reference,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use dir::*;
pub use docker::*;
pub use docker_archive::*;
pub use oci_layout::*;
pub use types::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A transport backend: parses references for its scheme and opens image
/// sources and destinations for them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the transport name used as the reference scheme.
    fn name(&self) -> &'static str;

    /// Parses the transport-specific part of a reference string (everything
    /// after `<name>:`, with a leading `//` already stripped).
    fn parse_reference(&self, rest: &str) -> FreighterResult<Reference>;

    /// Validates a reference string without keeping the parse result.
    fn validate_reference(&self, rest: &str) -> FreighterResult<()> {
        self.parse_reference(rest).map(|_| ())
    }

    /// Opens an image source for a reference of this transport.
    async fn new_image_source(&self, reference: &Reference)
        -> FreighterResult<Box<dyn ImageSource>>;

    /// Opens an image destination for a reference of this transport.
    async fn new_image_destination(
        &self,
        reference: &Reference,
    ) -> FreighterResult<Box<dyn ImageDestination>>;

    /// Deletes the image a reference points at, where the layout permits.
    async fn delete_image(&self, reference: &Reference) -> FreighterResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Statics
//--------------------------------------------------------------------------------------------------

static TRANSPORTS: LazyLock<RwLock<HashMap<&'static str, Arc<dyn Transport>>>> =
    LazyLock::new(|| {
        let mut map: HashMap<&'static str, Arc<dyn Transport>> = HashMap::new();
        map.insert(TRANSPORT_DOCKER, Arc::new(DockerTransport::default()));
        map.insert(TRANSPORT_DIR, Arc::new(DirTransport));
        map.insert(TRANSPORT_OCI, Arc::new(OciLayoutTransport));
        map.insert(TRANSPORT_DOCKER_ARCHIVE, Arc::new(DockerArchiveTransport));
        RwLock::new(map)
    });

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Registers a transport, replacing any previous registration of the same
/// name. The service layer re-registers a configured `docker` transport
/// after bootstrap.
pub fn register_transport(transport: Arc<dyn Transport>) {
    TRANSPORTS
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(transport.name(), transport);
}

/// Looks up a transport by name.
pub fn lookup_transport(name: &str) -> Option<Arc<dyn Transport>> {
    TRANSPORTS
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(name)
        .cloned()
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

/// An opened image: a source plus the manifest it currently points at.
pub struct Image {
    source: Box<dyn ImageSource>,
    manifest: Manifest,
}

impl Image {
    /// Returns the image's manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Returns the underlying source.
    pub fn source(&self) -> &dyn ImageSource {
        self.source.as_ref()
    }
}

impl Reference {
    fn transport(&self) -> FreighterResult<Arc<dyn Transport>> {
        lookup_transport(self.transport_name())
            .ok_or_else(|| FreighterError::UnknownTransport(self.transport_name().to_string()))
    }

    /// Opens the image this reference points at, resolving its manifest.
    pub async fn new_image(&self) -> FreighterResult<Image> {
        let source = self.new_image_source().await?;
        let manifest = source.get_manifest(None).await?;
        Ok(Image { source, manifest })
    }

    /// Opens an image source for this reference via its transport.
    pub async fn new_image_source(&self) -> FreighterResult<Box<dyn ImageSource>> {
        self.transport()?.new_image_source(self).await
    }

    /// Opens an image destination for this reference via its transport.
    pub async fn new_image_destination(&self) -> FreighterResult<Box<dyn ImageDestination>> {
        self.transport()?.new_image_destination(self).await
    }

    /// Deletes the image this reference points at.
    pub async fn delete_image(&self) -> FreighterResult<()> {
        self.transport()?.delete_image(self).await
    }
}
