//! Manifest operations for the registry

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use registry_client::reference::DEFAULT_TAG;

use crate::api::{DOCKER_CONTENT_DIGEST, Overlay};
use crate::error::{RegistryError, RegistryResult};
use crate::route::ManifestReference;

/// Serve the manifest of the composed image.
///
/// Manifests can also be fetched by their digest, which clients do after
/// resolving a tag. Only the manifest currently served as `latest` can be
/// found that way.
pub(crate) async fn get_manifest(
    overlay: &Overlay,
    repository: &str,
    reference: &ManifestReference,
    head: bool,
) -> RegistryResult<Response> {
    let image = match reference {
        ManifestReference::Tag(tag) => overlay.compose(repository, tag).await?,
        ManifestReference::Digest(digest) => {
            let image = overlay.compose(repository, DEFAULT_TAG).await?;
            if image.manifest_digest() != digest {
                return Err(RegistryError::ManifestNotFound(digest.clone()));
            }
            image
        }
    };

    let headers = [
        (header::CONTENT_TYPE, image.media_type().to_owned()),
        (DOCKER_CONTENT_DIGEST.clone(), image.manifest_digest().to_string()),
        (header::CONTENT_LENGTH, image.raw_manifest().len().to_string()),
    ];

    if head {
        return Ok((StatusCode::OK, headers).into_response());
    }

    Ok((StatusCode::OK, headers, image.raw_manifest().clone()).into_response())
}
