//! # Registry client
//!
//! A read-only client for Docker Registry v2 / OCI distribution servers.
//!
//! It resolves an image [Reference] into a [RemoteImage] (manifest and config),
//! and opens layer blobs as byte streams. Token authentication is handled
//! transparently using credentials from a docker [Keychain].
//!
//! ```no_run
//! use registry_client::{Keychain, Platform, Reference, RegistryClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RegistryClient::new(Keychain::from_env()?);
//! let reference = Reference::parse("gcr.io/distroless/static:latest")?;
//! let image = client.image(&reference, &Platform::default()).await?;
//! println!("{} layers", image.manifest.layers.len());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::TryStreamExt as _;
use http::header::HeaderValue;
use http::{Method, StatusCode, Uri};
use http_body_util::BodyExt as _;
use hyperdriver::service::SharedService;
use hyperdriver::Body;
use tower::ServiceExt as _;

mod auth;
pub mod credentials;
pub mod digest;
mod error;
pub mod manifest;
pub mod mock;
pub mod reference;

pub use self::credentials::{Credential, Keychain, KeychainError, Secret};
pub use self::digest::{Digest, DigestError};
pub use self::error::{ClientError, HttpResponseError};
pub use self::manifest::{ConfigFile, Descriptor, Manifest, ManifestList, Platform};
pub use self::reference::{Reference, ReferenceError};

use self::auth::{Challenge, TokenResponse};
use self::manifest::media_types;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A stream of blob bytes, read straight from the registry connection.
pub type BlobStream = futures::stream::BoxStream<'static, Result<Bytes, BoxError>>;

/// Manifest types we ask registries for, most preferred first.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.oci.image.index.v1+json";

const MAX_REDIRECTS: usize = 5;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A manifest exactly as the registry returned it.
#[derive(Debug, Clone)]
pub struct RawManifest {
    /// The manifest media type.
    pub media_type: String,

    /// sha256 of `body`.
    pub digest: Digest,

    /// The manifest bytes.
    pub body: Bytes,
}

/// A single-platform image fetched from a registry.
#[derive(Debug, Clone)]
pub struct RemoteImage {
    /// The reference the image was fetched by. When the original reference
    /// named a multi-platform index, this is pinned to the selected entry.
    pub reference: Reference,

    /// The image manifest.
    pub manifest: Manifest,

    /// The decoded config file.
    pub config: ConfigFile,

    /// The config file bytes, as stored in the registry.
    pub raw_config: Bytes,
}

impl RemoteImage {
    /// The manifest's layer descriptors paired with the matching diff-ids from
    /// the config, base layer first.
    pub fn layers(&self) -> impl Iterator<Item = (&Descriptor, Option<&Digest>)> {
        self.manifest
            .layers
            .iter()
            .enumerate()
            .map(|(index, layer)| (layer, self.config.rootfs.diff_ids.get(index)))
    }
}

/// A client for pulling from container registries over HTTP / HTTPS
///
/// Cheap to clone; clones share the connection pool and token cache.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    inner: hyperdriver::client::SharedClientService<Body, Body>,
    keychain: Arc<Keychain>,
    authorizations: Arc<DashMap<String, HeaderValue>>,
}

impl RegistryClient {
    /// Create a client that connects over TCP, with TLS where the registry
    /// calls for it.
    pub fn new(keychain: Keychain) -> Self {
        let inner = hyperdriver::Client::build_tcp_http()
            .with_default_tls()
            .with_user_agent(USER_AGENT.to_owned())
            .build_service();

        Self::from_shared(keychain, inner)
    }

    /// Create a client over an arbitrary HTTP service, such as
    /// [mock::MockService].
    pub fn with_service<S>(keychain: Keychain, service: S) -> Self
    where
        S: tower::Service<
                http::Request<hyperdriver::Body>,
                Response = http::Response<hyperdriver::Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let inner = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .service(service);

        Self::from_shared(keychain, inner)
    }

    fn from_shared(
        keychain: Keychain,
        inner: hyperdriver::client::SharedClientService<Body, Body>,
    ) -> Self {
        Self {
            inner,
            keychain: Arc::new(keychain),
            authorizations: Default::default(),
        }
    }

    /// The credentials this client authenticates with.
    pub fn keychain(&self) -> &Keychain {
        &self.keychain
    }

    /// Fetch the manifest `reference` points at, verbatim.
    ///
    /// If the reference is pinned to a digest the body is checked against it.
    #[tracing::instrument(skip(self), fields(%reference))]
    pub async fn manifest(&self, reference: &Reference) -> Result<RawManifest, ClientError> {
        let uri = reference.manifest_uri()?;
        let response = self.get(reference, uri, Some(MANIFEST_ACCEPT)).await?;

        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned);
        let body = collect(response).await?;
        let digest = Digest::of(&body);

        if let Some(expected) = reference.digest() {
            if expected != &digest {
                return Err(ClientError::DigestMismatch {
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        }

        let media_type = manifest::detect_media_type(content_type.as_deref(), &body);
        tracing::debug!(%media_type, %digest, "fetched manifest");

        Ok(RawManifest {
            media_type,
            digest,
            body,
        })
    }

    /// Resolve `reference` to a single image: its manifest and config.
    ///
    /// Multi-platform indexes are resolved to the entry for `platform`.
    #[tracing::instrument(skip(self), fields(%reference, %platform))]
    pub async fn image(
        &self,
        reference: &Reference,
        platform: &Platform,
    ) -> Result<RemoteImage, ClientError> {
        let mut reference = reference.clone();
        let mut raw = self.manifest(&reference).await?;

        if media_types::is_index(&raw.media_type) {
            let list: ManifestList = decode("manifest list", &raw.body)?;
            let entry = list
                .find(platform)
                .ok_or_else(|| ClientError::NoMatchingPlatform {
                    reference: reference.clone(),
                    platform: platform.clone(),
                })?;

            tracing::debug!(digest = %entry.digest, "selected platform manifest");
            reference = reference.with_digest(entry.digest.clone());
            raw = self.manifest(&reference).await?;
        }

        if !media_types::is_manifest(&raw.media_type) {
            return Err(ClientError::UnsupportedMediaType(raw.media_type));
        }

        let manifest: Manifest = decode("manifest", &raw.body)?;
        let raw_config = self.blob_bytes(&reference, &manifest.config.digest).await?;
        let config: ConfigFile = decode("config", &raw_config)?;

        Ok(RemoteImage {
            reference,
            manifest,
            config,
            raw_config,
        })
    }

    /// Open a blob in `reference`'s repository as a stream.
    ///
    /// The stream holds the upstream connection; dropping it releases the
    /// connection whether or not it was read to the end.
    #[tracing::instrument(skip(self), fields(%reference, %digest))]
    pub async fn blob(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> Result<BlobStream, ClientError> {
        let uri = reference.blob_uri(digest)?;
        let response = self.get(reference, uri, None).await?;

        let stream = response
            .into_body()
            .into_data_stream()
            .map_err(|error| -> BoxError { error.into() });
        Ok(Box::pin(stream))
    }

    /// Read a whole blob into memory, checking its digest.
    pub async fn blob_bytes(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> Result<Bytes, ClientError> {
        let uri = reference.blob_uri(digest)?;
        let response = self.get(reference, uri, None).await?;
        let body = collect(response).await?;

        let actual = Digest::of(&body);
        if &actual != digest {
            return Err(ClientError::DigestMismatch {
                expected: digest.clone(),
                actual,
            });
        }

        Ok(body)
    }

    /// GET `uri`, authenticating against `reference`'s repository and
    /// following redirects. Error statuses become [ClientError::Response].
    async fn get(
        &self,
        reference: &Reference,
        uri: Uri,
        accept: Option<&str>,
    ) -> Result<http::Response<Body>, ClientError> {
        let scope = reference.scope_key();
        let origin = uri.authority().cloned();
        let mut uri = uri;
        let mut authenticated = false;

        for _ in 0..=MAX_REDIRECTS {
            // Credentials only go to the registry itself, never to the
            // storage hosts it may redirect to.
            let authorization = if uri.authority() == origin.as_ref() {
                self.authorizations.get(&scope).map(|value| value.clone())
            } else {
                None
            };

            let request = build_request(&uri, accept, authorization)?;
            tracing::trace!(%uri, "GET");
            let response = self.inner.clone().oneshot(request).await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !authenticated {
                let challenge = response
                    .headers()
                    .get(http::header::WWW_AUTHENTICATE)
                    .and_then(|value| value.to_str().ok())
                    .and_then(Challenge::parse);

                if let Some(challenge) = challenge {
                    self.authenticate(reference, challenge).await?;
                    authenticated = true;
                    continue;
                }
            }

            if status.is_redirection() {
                if let Some(location) = response.headers().get(http::header::LOCATION) {
                    uri = resolve_location(&uri, location)?;
                    tracing::trace!(%uri, "following redirect");
                    continue;
                }
            }

            return error_for_status(uri, response).await;
        }

        Err(ClientError::TooManyRedirects(uri))
    }

    /// Answer `challenge` for `reference`'s repository and remember the
    /// resulting authorization header.
    #[tracing::instrument(
        level = "debug",
        skip(self, challenge),
        fields(registry = reference.registry())
    )]
    async fn authenticate(
        &self,
        reference: &Reference,
        challenge: Challenge,
    ) -> Result<(), ClientError> {
        let credential = self.keychain.resolve(reference.registry());

        let header = match challenge {
            Challenge::Basic => {
                credential
                    .basic_header()
                    .ok_or_else(|| ClientError::Authentication {
                        registry: reference.registry().to_owned(),
                        reason: "basic authentication required but no credentials".into(),
                    })?
            }
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let request = auth::token_request(
                    &realm,
                    service.as_deref(),
                    scope.as_deref(),
                    reference,
                    &credential,
                )?;
                let token_uri = request.uri().clone();
                let response = self.inner.clone().oneshot(request).await?;
                let response = error_for_status(token_uri, response).await?;
                let body = collect(response).await?;

                let token: TokenResponse = decode("token response", &body)?;
                let secret = token
                    .into_secret()
                    .ok_or_else(|| ClientError::Authentication {
                        registry: reference.registry().to_owned(),
                        reason: "token service returned no token".into(),
                    })?;

                secret.bearer().map_err(|_| ClientError::Authentication {
                    registry: reference.registry().to_owned(),
                    reason: "token is not a valid header value".into(),
                })?
            }
        };

        tracing::debug!("authenticated");
        self.authorizations.insert(reference.scope_key(), header);
        Ok(())
    }
}

fn build_request(
    uri: &Uri,
    accept: Option<&str>,
    authorization: Option<HeaderValue>,
) -> Result<http::Request<hyperdriver::Body>, ClientError> {
    let mut builder = http::Request::builder()
        .method(Method::GET)
        .uri(uri.clone());

    if let Some(accept) = accept {
        builder = builder.header(http::header::ACCEPT, accept);
    }

    if let Some(authorization) = authorization {
        builder = builder.header(http::header::AUTHORIZATION, authorization);
    }

    Ok(builder.body(Body::empty())?)
}

/// Resolve a `Location` header, which may be relative, against `base`.
fn resolve_location(base: &Uri, location: &HeaderValue) -> Result<Uri, ClientError> {
    let location = location
        .to_str()
        .map_err(|error| ClientError::ResponseBody(error.into()))?;

    let base = url::Url::parse(&base.to_string())
        .map_err(|error| ClientError::ResponseBody(error.into()))?;
    let joined = base
        .join(location)
        .map_err(|error| ClientError::ResponseBody(error.into()))?;

    Ok(joined.as_str().parse()?)
}

async fn error_for_status(
    uri: Uri,
    response: http::Response<Body>,
) -> Result<http::Response<Body>, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match collect(response).await {
        Ok(body) => String::from_utf8_lossy(&body).trim().to_owned(),
        Err(error) => format!("failed to read response body: {error}"),
    };

    Err(ClientError::Response(HttpResponseError {
        status,
        uri,
        message,
    }))
}

async fn collect(response: http::Response<Body>) -> Result<Bytes, ClientError> {
    let collected = response
        .into_body()
        .collect()
        .await
        .map_err(|error| ClientError::ResponseBody(error.into()))?;
    Ok(collected.to_bytes())
}

fn decode<T: serde::de::DeserializeOwned>(
    what: &'static str,
    body: &[u8],
) -> Result<T, ClientError> {
    serde_json::from_slice(body).map_err(|source| ClientError::Decode { what, source })
}
