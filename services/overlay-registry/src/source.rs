//! Where images come from.
//!
//! [ImageSource] is the capability the composer needs from a registry: look
//! up an image by reference, and open one of its layers. [RemoteSource] talks
//! to real registries; [crate::MemorySource] serves fixtures for tests.

use std::fmt;

use registry_client::{
    BlobStream, ClientError, Descriptor, Digest, Platform, Reference, RegistryClient, RemoteImage,
};
use thiserror::Error;

/// An image or blob could not be fetched.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source has no image by that reference.
    #[error("image {0} not found")]
    ImageNotFound(Reference),

    /// The image exists but does not contain that blob.
    #[error("blob {digest} not found in {reference}")]
    BlobNotFound {
        /// The image that was searched.
        reference: Reference,
        /// The missing blob.
        digest: Digest,
    },

    /// Talking to the upstream registry failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl SourceError {
    /// Whether the source reported the requested object as missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            SourceError::ImageNotFound(_) | SourceError::BlobNotFound { .. } => true,
            SourceError::Client(error) => error.is_not_found(),
        }
    }
}

/// A read-only store of container images.
#[async_trait::async_trait]
pub trait ImageSource: fmt::Debug + Send + Sync {
    /// Fetch the manifest and config of the image `reference` names.
    async fn image(&self, reference: &Reference) -> Result<RemoteImage, SourceError>;

    /// Open the compressed bytes of blob `digest` in `reference`'s repository.
    async fn blob(&self, reference: &Reference, digest: &Digest) -> Result<BlobStream, SourceError>;
}

/// One filesystem layer, and the image it was found in.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    descriptor: Descriptor,
    diff_id: Option<Digest>,
    origin: Reference,
}

impl Layer {
    /// The layers of `image`, base first.
    pub fn from_image(image: &RemoteImage) -> Vec<Layer> {
        image
            .layers()
            .map(|(descriptor, diff_id)| Layer {
                descriptor: descriptor.clone(),
                diff_id: diff_id.cloned(),
                origin: image.reference.clone(),
            })
            .collect()
    }

    /// Digest of the compressed blob.
    pub fn digest(&self) -> &Digest {
        &self.descriptor.digest
    }

    /// Size of the compressed blob in bytes.
    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    /// Media type of the compressed blob.
    pub fn media_type(&self) -> &str {
        &self.descriptor.media_type
    }

    /// Digest of the uncompressed tar, when the origin config records it.
    pub fn diff_id(&self) -> Option<&Digest> {
        self.diff_id.as_ref()
    }

    /// The image this layer belongs to.
    pub fn origin(&self) -> &Reference {
        &self.origin
    }

    /// The descriptor to list this layer under in a manifest.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(
            self.descriptor.media_type.clone(),
            self.descriptor.size,
            self.descriptor.digest.clone(),
        )
    }

    /// Stream the compressed layer from its origin repository.
    pub async fn open(&self, source: &dyn ImageSource) -> Result<BlobStream, SourceError> {
        source.blob(&self.origin, self.digest()).await
    }
}

/// Images fetched over the network from their registries.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    client: RegistryClient,
    platform: Platform,
}

impl RemoteSource {
    /// Fetch images with `client`, choosing `platform` from multi-platform
    /// indexes.
    pub fn new(client: RegistryClient, platform: Platform) -> Self {
        Self { client, platform }
    }
}

#[async_trait::async_trait]
impl ImageSource for RemoteSource {
    async fn image(&self, reference: &Reference) -> Result<RemoteImage, SourceError> {
        match self.client.image(reference, &self.platform).await {
            Ok(image) => Ok(image),
            Err(error) if error.is_not_found() => {
                tracing::debug!(%reference, %error, "upstream reported image missing");
                Err(SourceError::ImageNotFound(reference.clone()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn blob(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> Result<BlobStream, SourceError> {
        match self.client.blob(reference, digest).await {
            Ok(stream) => Ok(stream),
            Err(error) if error.is_not_found() => Err(SourceError::BlobNotFound {
                reference: reference.clone(),
                digest: digest.clone(),
            }),
            Err(error) => Err(error.into()),
        }
    }
}
