//! Resolve configured base layers to concrete layers.

use std::collections::BTreeMap;
use std::sync::Arc;

use registry_client::{Digest, DigestError, Reference, ReferenceError};
use thiserror::Error;

use crate::config::BaseLayerMap;
use crate::source::{ImageSource, Layer, SourceError};

/// A base layer could not be resolved.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The configured key is not a digest.
    #[error("base layer key {key:?} is not a sha256 digest")]
    InvalidDigest {
        /// The configured key.
        key: String,
        #[source]
        /// Underlying error.
        source: DigestError,
    },

    /// The configured value is not an image reference.
    #[error("base layer {digest} has invalid image reference {reference:?}")]
    InvalidReference {
        /// The layer being resolved.
        digest: Digest,
        /// The configured value.
        reference: String,
        #[source]
        /// Underlying error.
        source: ReferenceError,
    },

    /// The image containing the layer could not be fetched.
    #[error("fetching {reference} for base layer {digest}")]
    Fetch {
        /// The layer being resolved.
        digest: Digest,
        /// The image that was fetched.
        reference: Reference,
        #[source]
        /// Underlying error.
        source: SourceError,
    },

    /// The image does not contain the layer.
    #[error("image {reference} has no layer {digest}")]
    LayerNotFound {
        /// The layer being resolved.
        digest: Digest,
        /// The image that was searched.
        reference: Reference,
    },
}

/// Base layers keyed by digest, iterated in ascending digest order.
#[derive(Debug, Clone, Default)]
pub struct ResolvedLayers {
    layers: BTreeMap<Digest, Layer>,
}

impl ResolvedLayers {
    /// Layer digests, sorted ascending by their `sha256:<hex>` string.
    pub fn digests(&self) -> impl Iterator<Item = &Digest> {
        self.layers.keys()
    }

    /// Look up a resolved layer.
    pub fn get(&self, digest: &Digest) -> Option<&Layer> {
        self.layers.get(digest)
    }

    /// Number of resolved layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether there are no base layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// The layers in digest order.
    pub fn into_layers(self) -> impl Iterator<Item = Layer> {
        self.layers.into_values()
    }
}

/// Looks up every configured base layer in the image that holds it.
#[derive(Debug, Clone)]
pub struct LayerResolver {
    source: Arc<dyn ImageSource>,
    base: Arc<BaseLayerMap>,
}

impl LayerResolver {
    /// Resolve the layers in `base` using `source`.
    pub fn new(source: Arc<dyn ImageSource>, base: Arc<BaseLayerMap>) -> Self {
        Self { source, base }
    }

    /// Fetch each configured image and pick out its layer.
    ///
    /// Any entry failing to resolve fails the whole resolution.
    pub async fn resolve(&self) -> Result<ResolvedLayers, ResolutionError> {
        let mut resolved = ResolvedLayers::default();

        for (key, reference) in self.base.iter() {
            let layer = self.resolve_one(key, reference).await?;
            resolved.layers.insert(layer.digest().clone(), layer);
        }

        Ok(resolved)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve_one(&self, key: &str, reference: &str) -> Result<Layer, ResolutionError> {
        let digest = Digest::from_hex(key).map_err(|source| ResolutionError::InvalidDigest {
            key: key.to_owned(),
            source,
        })?;

        let reference =
            Reference::parse(reference).map_err(|source| ResolutionError::InvalidReference {
                digest: digest.clone(),
                reference: reference.to_owned(),
                source,
            })?;

        let image = self
            .source
            .image(&reference)
            .await
            .map_err(|source| ResolutionError::Fetch {
                digest: digest.clone(),
                reference: reference.clone(),
                source,
            })?;

        Layer::from_image(&image)
            .into_iter()
            .find(|layer| layer.digest() == &digest)
            .ok_or(ResolutionError::LayerNotFound { digest, reference })
    }
}

#[cfg(test)]
mod tests {
    use registry_client::manifest::Config;

    use crate::MemorySource;

    use super::*;

    fn reference(s: &str) -> Reference {
        Reference::parse(s).unwrap()
    }

    fn resolver(source: MemorySource, base: BaseLayerMap) -> LayerResolver {
        LayerResolver::new(Arc::new(source), Arc::new(base))
    }

    #[tokio::test]
    async fn resolves_in_digest_order() {
        let mut source = MemorySource::new();
        let one = reference("localhost/base/one:v1");
        let two = reference("localhost/base/two:v1");
        let one = source.add_image(one, Config::default(), &[b"one", b"zzz"]);
        let two = source.add_image(two, Config::default(), &[b"two"]);

        let one_digest = one.manifest.layers[0].digest.clone();
        let two_digest = two.manifest.layers[0].digest.clone();

        let base: BaseLayerMap = [
            (two_digest.hex(), "localhost/base/two:v1"),
            (one_digest.hex(), "localhost/base/one:v1"),
        ]
        .into_iter()
        .collect();

        let resolved = resolver(source, base).resolve().await.unwrap();

        let mut expected = vec![one_digest.clone(), two_digest.clone()];
        expected.sort();
        assert_eq!(resolved.digests().cloned().collect::<Vec<_>>(), expected);

        let layer = resolved.get(&one_digest).unwrap();
        assert_eq!(layer.origin(), &reference("localhost/base/one:v1"));
        assert_eq!(layer.size(), 3);
    }

    #[tokio::test]
    async fn missing_layer_is_error() {
        let mut source = MemorySource::new();
        let one = reference("localhost/base/one:v1");
        source.add_image(one, Config::default(), &[b"one"]);

        let base: BaseLayerMap = [(Digest::of(b"other").hex(), "localhost/base/one:v1")]
            .into_iter()
            .collect();

        let error = resolver(source, base).resolve().await.unwrap_err();
        assert!(matches!(error, ResolutionError::LayerNotFound { .. }));
    }

    #[tokio::test]
    async fn unfetchable_image_is_error() {
        let base: BaseLayerMap = [(Digest::of(b"one").hex(), "localhost/base/gone:v1")]
            .into_iter()
            .collect();

        let resolver = resolver(MemorySource::new(), base);
        let error = resolver.resolve().await.unwrap_err();
        assert!(matches!(error, ResolutionError::Fetch { .. }));
    }

    #[tokio::test]
    async fn invalid_entries_are_errors() {
        let base = [("not-a-digest", "base/image")].into_iter().collect();
        let bad_digest = resolver(MemorySource::new(), base);
        let error = bad_digest.resolve().await.unwrap_err();
        assert!(matches!(error, ResolutionError::InvalidDigest { .. }));

        let base = [(Digest::of(b"one").hex(), "Not A Reference")]
            .into_iter()
            .collect();
        let bad_reference = resolver(MemorySource::new(), base);
        let error = bad_reference.resolve().await.unwrap_err();
        assert!(matches!(error, ResolutionError::InvalidReference { .. }));
    }

    #[tokio::test]
    async fn empty_map_resolves_nothing() {
        let resolver = resolver(MemorySource::new(), BaseLayerMap::new());
        assert!(resolver.resolve().await.unwrap().is_empty());
    }
}
