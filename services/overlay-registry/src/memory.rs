//! In-memory image source.

use std::collections::HashMap;

use bytes::Bytes;
use registry_client::manifest::{Config, ConfigFile, RootFs, media_types};
use registry_client::{BlobStream, Descriptor, Digest, Manifest, Platform, Reference, RemoteImage};

use crate::source::{ImageSource, SourceError};

/// Image source that serves images held in memory.
///
/// Layer bytes are stored as given, so a fixture layer's digest and diff-id
/// are the same value.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    images: HashMap<Reference, RemoteImage>,
    blobs: HashMap<String, HashMap<Digest, Bytes>>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image built from `layers` (base first) and runtime `config`.
    ///
    /// Returns the stored image, so tests can read back digests.
    pub fn add_image(
        &mut self,
        reference: Reference,
        config: Config,
        layers: &[&[u8]],
    ) -> RemoteImage {
        let platform = Platform::default();
        let mut descriptors = Vec::with_capacity(layers.len());
        let mut diff_ids = Vec::with_capacity(layers.len());

        for layer in layers {
            let digest = self.insert_blob(&reference, Bytes::copy_from_slice(layer));
            descriptors.push(Descriptor::new(
                media_types::DOCKER_LAYER,
                layer.len() as u64,
                digest.clone(),
            ));
            diff_ids.push(digest);
        }

        let config = ConfigFile {
            architecture: platform.architecture,
            os: platform.os,
            config,
            rootfs: RootFs {
                diff_ids,
                ..Default::default()
            },
            ..Default::default()
        };

        self.add_config(reference, config, descriptors)
    }

    /// Add an image with an explicit config file and layer descriptors.
    ///
    /// Layer blobs are not stored; add them with [MemorySource::insert_blob].
    pub fn add_config(
        &mut self,
        reference: Reference,
        config: ConfigFile,
        layers: Vec<Descriptor>,
    ) -> RemoteImage {
        let raw_config =
            Bytes::from(serde_json::to_vec(&config).expect("config file serializes to JSON"));
        let config_digest = self.insert_blob(&reference, raw_config.clone());

        let manifest = Manifest::new(
            media_types::DOCKER_MANIFEST,
            Descriptor::new(
                media_types::DOCKER_CONFIG,
                raw_config.len() as u64,
                config_digest,
            ),
            layers,
        );

        let image = RemoteImage {
            reference: reference.clone(),
            manifest,
            config,
            raw_config,
        };
        self.images.insert(reference, image.clone());
        image
    }

    /// Store a blob in `reference`'s repository.
    pub fn insert_blob(&mut self, reference: &Reference, data: Bytes) -> Digest {
        let digest = Digest::of(&data);
        self.blobs
            .entry(repository_key(reference))
            .or_default()
            .insert(digest.clone(), data);
        digest
    }
}

fn repository_key(reference: &Reference) -> String {
    format!("{}/{}", reference.registry(), reference.repository())
}

#[async_trait::async_trait]
impl ImageSource for MemorySource {
    async fn image(&self, reference: &Reference) -> Result<RemoteImage, SourceError> {
        self.images
            .get(reference)
            .cloned()
            .ok_or_else(|| SourceError::ImageNotFound(reference.clone()))
    }

    async fn blob(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> Result<BlobStream, SourceError> {
        let data = self
            .blobs
            .get(&repository_key(reference))
            .and_then(|blobs| blobs.get(digest))
            .cloned()
            .ok_or_else(|| SourceError::BlobNotFound {
                reference: reference.clone(),
                digest: digest.clone(),
            })?;

        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt as _;

    use super::*;

    #[tokio::test]
    async fn blobs_are_scoped_to_repository() {
        let mut source = MemorySource::new();
        let reference = Reference::parse("localhost/base/image:v1").unwrap();
        let image = source.add_image(reference.clone(), Config::default(), &[b"aaa"]);
        let digest = image.manifest.layers[0].digest.clone();

        let stream = source.blob(&reference, &digest).await.unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"aaa");

        let other = Reference::parse("localhost/other/image:v1").unwrap();
        let error = source.blob(&other, &digest).await.err().unwrap();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn config_blob_matches_manifest() {
        let mut source = MemorySource::new();
        let reference = Reference::parse("localhost/app/image:v2").unwrap();
        let image = source.add_image(reference.clone(), Config::default(), &[b"b", b"c"]);

        assert_eq!(image.manifest.config.digest, Digest::of(&image.raw_config));
        assert_eq!(image.config.rootfs.diff_ids.len(), 2);

        let fetched = source.image(&reference).await.unwrap();
        assert_eq!(fetched.manifest, image.manifest);
    }
}
