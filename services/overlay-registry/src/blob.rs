//! Blob operations for the registry

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt as _;
use registry_client::Digest;
use registry_client::manifest::media_types;

use crate::api::{DOCKER_CONTENT_DIGEST, Overlay};
use crate::error::{RegistryError, RegistryResult};

/// Serve the config or a layer of the composed image.
///
/// Layers are streamed from the registry they came from as they are read;
/// nothing is buffered or stored here.
pub(crate) async fn get_blob(
    overlay: &Overlay,
    repository: &str,
    digest: &Digest,
    head: bool,
) -> RegistryResult<Response> {
    let image = overlay.compose_for_blobs(repository).await?;

    if digest == image.config_digest() {
        let headers = [
            (header::CONTENT_TYPE, media_types::DOCKER_CONFIG.to_owned()),
            (DOCKER_CONTENT_DIGEST.clone(), digest.to_string()),
            (header::CONTENT_LENGTH, image.raw_config().len().to_string()),
        ];

        if head {
            return Ok((StatusCode::OK, headers).into_response());
        }
        return Ok((StatusCode::OK, headers, image.raw_config().clone()).into_response());
    }

    let layer = image
        .layer(digest)
        .ok_or_else(|| RegistryError::BlobNotFound(digest.clone()))?;

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
        (DOCKER_CONTENT_DIGEST.clone(), digest.to_string()),
        (header::CONTENT_LENGTH, layer.size().to_string()),
    ];

    if head {
        return Ok((StatusCode::OK, headers).into_response());
    }

    tracing::debug!(origin = %layer.origin(), size = layer.size(), "streaming layer");
    let stream = layer.open(overlay.source()).await?;

    let digest = digest.clone();
    let stream = stream.inspect_err(move |error| {
        tracing::warn!(%digest, %error, "layer stream ended early");
    });

    Ok((StatusCode::OK, headers, Body::from_stream(stream)).into_response())
}
