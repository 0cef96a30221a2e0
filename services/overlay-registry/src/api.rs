//! API server builder and router

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use registry_client::reference::DEFAULT_TAG;
use registry_client::{Reference, ReferenceError};
use tower_http::trace::TraceLayer;

use crate::compose::{ImageComposer, VirtualImage};
use crate::config::BaseLayerMap;
use crate::error::{RegistryError, RegistryResult};
use crate::route::Route;
use crate::source::ImageSource;

pub(crate) static DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");

static API_VERSION: HeaderName = HeaderName::from_static("docker-distribution-api-version");

/// Which image a request runs on top of the base layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executable {
    /// Every request is served from this one image.
    Pinned(Reference),

    /// Requests for `<repository>:<tag>` are served from the same repository
    /// and tag on this upstream registry.
    Upstream(String),
}

impl Executable {
    /// The executable image for a request naming `repository` and `tag`.
    pub fn reference(&self, repository: &str, tag: &str) -> Result<Reference, ReferenceError> {
        match self {
            Executable::Pinned(reference) => Ok(reference.clone()),
            Executable::Upstream(registry) => {
                Reference::from_parts(registry, repository, Some(tag), None)
            }
        }
    }
}

/// Shared state for request handlers.
#[derive(Debug, Clone)]
pub(crate) struct Overlay {
    composer: ImageComposer,
    executable: Arc<Executable>,
}

impl Overlay {
    /// Compose the image served as `repository:tag`.
    pub(crate) async fn compose(
        &self,
        repository: &str,
        tag: &str,
    ) -> RegistryResult<VirtualImage> {
        let executable = self.executable.reference(repository, tag)?;
        Ok(self.composer.compose(&executable).await?)
    }

    /// Compose the image whose blobs are served from `repository`.
    ///
    /// Blob requests carry no tag, so blobs are looked up in the image
    /// served as `repository:latest`.
    pub(crate) async fn compose_for_blobs(&self, repository: &str) -> RegistryResult<VirtualImage> {
        self.compose(repository, DEFAULT_TAG).await
    }

    pub(crate) fn source(&self) -> &dyn ImageSource {
        self.composer.source()
    }
}

/// Registry builder for configuring and creating the overlay registry service
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    source: Option<Arc<dyn ImageSource>>,
    base: BaseLayerMap,
    executable: Option<Executable>,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set where images and layers are fetched from
    pub fn source<S: ImageSource + 'static>(mut self, source: S) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Set the base layers every served image is composed on
    pub fn base_layers(mut self, base: BaseLayerMap) -> Self {
        self.base = base;
        self
    }

    /// Set how the executable image is chosen
    pub fn executable(mut self, executable: Executable) -> Self {
        self.executable = Some(executable);
        self
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let source = self.source.expect("image source must be configured");
        let executable = self.executable.expect("executable image must be configured");

        let overlay = Overlay {
            composer: ImageComposer::new(source, Arc::new(self.base)),
            executable: Arc::new(executable),
        };

        Router::new()
            .route("/v2", get(api_version_check))
            .route("/v2/", get(api_version_check))
            .route("/v2/{*path}", any(dispatch))
            .fallback(not_found)
            .layer(TraceLayer::new_for_http())
            .with_state(overlay)
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> impl IntoResponse {
    (StatusCode::OK, [(API_VERSION.clone(), "registry/2.0")], "OK")
}

async fn not_found(method: Method, uri: axum::http::Uri) -> RegistryError {
    tracing::debug!(%method, %uri, "no route");
    RegistryError::NotFound(uri.path().to_owned())
}

/// Route manifest and blob requests.
async fn dispatch(
    State(overlay): State<Overlay>,
    method: Method,
    Path(path): Path<String>,
) -> RegistryResult<Response> {
    let route = Route::parse(&path)?;

    let head = match method {
        Method::GET => false,
        Method::HEAD => true,
        other => return Err(RegistryError::Unsupported(other)),
    };

    tracing::info!(%method, ?route, "registry request");

    match route {
        Route::Manifest {
            repository,
            reference,
        } => crate::manifest::get_manifest(&overlay, &repository, &reference, head).await,
        Route::Blob { repository, digest } => {
            crate::blob::get_blob(&overlay, &repository, &digest, head).await
        }
    }
}
