//! Composing virtual images.
//!
//! A virtual image is the executable image's layers stacked on top of the
//! configured base layers. It exists only for the duration of one request:
//! nothing is cached, and nothing is written back to any registry.

use std::sync::Arc;

use bytes::Bytes;
use registry_client::manifest::{ConfigFile, History, RootFs, media_types};
use registry_client::{Descriptor, Digest, Manifest, Reference};
use thiserror::Error;

use crate::config::BaseLayerMap;
use crate::resolve::{LayerResolver, ResolutionError};
use crate::source::{ImageSource, Layer, SourceError};

/// A virtual image could not be composed.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// A base layer could not be resolved.
    #[error("resolving base layers")]
    Resolution(#[from] ResolutionError),

    /// The executable image could not be fetched.
    #[error("fetching executable image {reference}")]
    Executable {
        /// The executable image.
        reference: Reference,
        #[source]
        /// Underlying error.
        source: SourceError,
    },

    /// An origin image config has fewer diff-ids than layers.
    #[error("no diff-id for layer {digest} of {reference}")]
    MissingDiffId {
        /// The layer without a diff-id.
        digest: Digest,
        /// The image it came from.
        reference: Reference,
    },

    /// The composed config or manifest could not be serialized.
    #[error("serializing composed image")]
    Serialize(#[from] serde_json::Error),
}

impl ComposeError {
    /// Whether the upstream registry reported the executable image missing.
    pub fn is_executable_not_found(&self) -> bool {
        matches!(self, ComposeError::Executable { source, .. } if source.is_not_found())
    }
}

/// An image assembled from base layers and an executable image.
#[derive(Debug, Clone)]
pub struct VirtualImage {
    layers: Vec<Layer>,
    config: ConfigFile,
    raw_config: Bytes,
    config_digest: Digest,
    manifest: Manifest,
    raw_manifest: Bytes,
    manifest_digest: Digest,
}

impl VirtualImage {
    /// Layers, base layers first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Find a layer by digest.
    pub fn layer(&self, digest: &Digest) -> Option<&Layer> {
        self.layers.iter().find(|layer| layer.digest() == digest)
    }

    /// The composed config file.
    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// The serialized config file.
    pub fn raw_config(&self) -> &Bytes {
        &self.raw_config
    }

    /// sha256 of [VirtualImage::raw_config].
    pub fn config_digest(&self) -> &Digest {
        &self.config_digest
    }

    /// The composed manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The serialized manifest.
    pub fn raw_manifest(&self) -> &Bytes {
        &self.raw_manifest
    }

    /// sha256 of [VirtualImage::raw_manifest].
    pub fn manifest_digest(&self) -> &Digest {
        &self.manifest_digest
    }

    /// The manifest media type.
    pub fn media_type(&self) -> &'static str {
        media_types::DOCKER_MANIFEST
    }
}

/// Builds virtual images on top of the configured base layers.
#[derive(Debug, Clone)]
pub struct ImageComposer {
    source: Arc<dyn ImageSource>,
    resolver: LayerResolver,
}

impl ImageComposer {
    /// Compose images from `source`, on top of the layers named in `base`.
    pub fn new(source: Arc<dyn ImageSource>, base: Arc<BaseLayerMap>) -> Self {
        Self {
            resolver: LayerResolver::new(source.clone(), base),
            source,
        }
    }

    /// The source images and layers are fetched from.
    pub fn source(&self) -> &dyn ImageSource {
        self.source.as_ref()
    }

    /// Compose the virtual image for `executable`.
    ///
    /// Base layers come first, sorted by digest, then the executable's own
    /// layers in their original order. The runtime config is the executable's,
    /// unchanged.
    #[tracing::instrument(skip(self), fields(%executable))]
    pub async fn compose(&self, executable: &Reference) -> Result<VirtualImage, ComposeError> {
        let base = self.resolver.resolve().await?;
        tracing::debug!(layers = base.len(), "resolved base layers");

        let image = self
            .source
            .image(executable)
            .await
            .map_err(|source| ComposeError::Executable {
                reference: executable.clone(),
                source,
            })?;

        let layers: Vec<Layer> = base
            .into_layers()
            .chain(Layer::from_image(&image))
            .collect();

        let mut diff_ids = Vec::with_capacity(layers.len());
        let mut history = Vec::with_capacity(layers.len());
        for layer in &layers {
            let diff_id = layer
                .diff_id()
                .ok_or_else(|| ComposeError::MissingDiffId {
                    digest: layer.digest().clone(),
                    reference: layer.origin().clone(),
                })?;
            diff_ids.push(diff_id.clone());
            history.push(History {
                created_by: Some(format!("{} from {}", layer.digest(), layer.origin())),
                ..Default::default()
            });
        }

        let config = ConfigFile {
            architecture: image.config.architecture.clone(),
            os: image.config.os.clone(),
            variant: image.config.variant.clone(),
            config: image.config.config.clone(),
            rootfs: RootFs {
                diff_ids,
                ..Default::default()
            },
            history,
            ..Default::default()
        };

        let raw_config = Bytes::from(serde_json::to_vec(&config)?);
        let config_digest = Digest::of(&raw_config);

        let manifest = Manifest::new(
            media_types::DOCKER_MANIFEST,
            Descriptor::new(
                media_types::DOCKER_CONFIG,
                raw_config.len() as u64,
                config_digest.clone(),
            ),
            layers.iter().map(Layer::descriptor).collect(),
        );
        let raw_manifest = Bytes::from(serde_json::to_vec(&manifest)?);
        let manifest_digest = Digest::of(&raw_manifest);

        tracing::debug!(
            layers = layers.len(),
            config = %config_digest,
            manifest = %manifest_digest,
            "composed image"
        );

        Ok(VirtualImage {
            layers,
            config,
            raw_config,
            config_digest,
            manifest,
            raw_manifest,
            manifest_digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use registry_client::manifest::Config;

    use crate::MemorySource;

    use super::*;

    const APP: &str = "localhost/app/image:v2";

    fn reference(s: &str) -> Reference {
        Reference::parse(s).unwrap()
    }

    fn env(vars: &[&str]) -> Config {
        Config {
            env: Some(vars.iter().map(|var| var.to_string()).collect()),
            ..Default::default()
        }
    }

    fn composer(source: MemorySource, base: BaseLayerMap) -> ImageComposer {
        ImageComposer::new(Arc::new(source), Arc::new(base))
    }

    #[tokio::test]
    async fn base_layers_precede_executable_layers() {
        let mut source = MemorySource::new();
        let a = reference("localhost/base/a:v1");
        let z = reference("localhost/base/z:v1");
        source.add_image(a, Config::default(), &[b"aaa"]);
        source.add_image(z, Config::default(), &[b"zzz"]);
        source.add_image(reference(APP), env(&["X=1"]), &[b"bbb", b"ccc"]);

        let base: BaseLayerMap = [
            (Digest::of(b"zzz").hex().to_owned(), "localhost/base/z:v1"),
            (Digest::of(b"aaa").hex().to_owned(), "localhost/base/a:v1"),
        ]
        .into_iter()
        .collect();

        let composer = composer(source, base);
        let image = composer.compose(&reference(APP)).await.unwrap();

        let mut expected: Vec<Digest> = vec![Digest::of(b"aaa"), Digest::of(b"zzz")];
        expected.sort();
        expected.extend([Digest::of(b"bbb"), Digest::of(b"ccc")]);

        let digests: Vec<Digest> = image
            .manifest()
            .layers
            .iter()
            .map(|layer| layer.digest.clone())
            .collect();
        assert_eq!(digests, expected);
        assert_eq!(image.config().rootfs.diff_ids, expected);
        assert_eq!(image.config().history.len(), 4);
        assert_eq!(image.config().config, env(&["X=1"]));
        assert_eq!(image.config().os, "linux");
    }

    #[tokio::test]
    async fn config_passthrough_without_base_layers() {
        let mut config = env(&["PATH=/bin"]);
        config.entrypoint = Some(vec!["/bin/app".into()]);
        config
            .other
            .insert("Healthcheck".into(), serde_json::json!({"Test": ["NONE"]}));

        let mut source = MemorySource::new();
        source.add_image(reference(APP), config.clone(), &[b"bbb"]);

        let composer = composer(source, BaseLayerMap::new());
        let image = composer.compose(&reference(APP)).await.unwrap();

        assert_eq!(image.config().config, config);
        assert_eq!(image.layers().len(), 1);

        let decoded: ConfigFile = serde_json::from_slice(image.raw_config()).unwrap();
        assert_eq!(decoded.config, config);
    }

    #[tokio::test]
    async fn composition_is_deterministic() {
        let mut source = MemorySource::new();
        let base_image = reference("localhost/base/a:v1");
        source.add_image(base_image, Config::default(), &[b"aaa"]);
        source.add_image(reference(APP), env(&["X=1"]), &[b"bbb"]);

        let base: BaseLayerMap = [(Digest::of(b"aaa").hex(), "localhost/base/a:v1")]
            .into_iter()
            .collect();

        let composer = composer(source, base);
        let first = composer.compose(&reference(APP)).await.unwrap();
        let second = composer.compose(&reference(APP)).await.unwrap();

        assert_eq!(first.raw_manifest(), second.raw_manifest());
        assert_eq!(first.manifest_digest(), second.manifest_digest());
        assert_eq!(first.config_digest(), &Digest::of(first.raw_config()));
        assert_eq!(first.manifest().config.digest, *first.config_digest());
    }

    #[tokio::test]
    async fn missing_diff_id_is_error() {
        let mut source = MemorySource::new();
        let app = reference(APP);
        let layer = Descriptor::new(media_types::DOCKER_LAYER, 3, Digest::of(b"bbb"));
        source.add_config(app.clone(), ConfigFile::default(), vec![layer]);

        let composer = composer(source, BaseLayerMap::new());
        let error = composer.compose(&app).await.unwrap_err();
        assert!(matches!(error, ComposeError::MissingDiffId { .. }));
    }

    #[tokio::test]
    async fn missing_executable_is_reported() {
        let composer = composer(MemorySource::new(), BaseLayerMap::new());
        let missing = reference("localhost/app/missing:v1");
        let error = composer.compose(&missing).await.unwrap_err();
        assert!(error.is_executable_not_found());
    }

    #[tokio::test]
    async fn resolver_failure_fails_composition() {
        let mut source = MemorySource::new();
        source.add_image(reference(APP), Config::default(), &[b"bbb"]);

        let base: BaseLayerMap = [(Digest::of(b"aaa").hex(), "localhost/base/gone:v1")]
            .into_iter()
            .collect();

        let composer = composer(source, base);
        let error = composer.compose(&reference(APP)).await.unwrap_err();
        assert!(matches!(error, ComposeError::Resolution(_)));
        assert!(!error.is_executable_not_found());
    }
}
