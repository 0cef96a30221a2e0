//! Error types for the registry client
use std::fmt;

use http::StatusCode;
use thiserror::Error;

use crate::digest::Digest;
use crate::manifest::Platform;
use crate::reference::{Reference, ReferenceError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error occured while talking to a registry
#[derive(Debug, Error)]
pub enum ClientError {
    /// The registry answered with an error status
    #[error(transparent)]
    Response(HttpResponseError),

    /// An error occured while recieving the response body
    #[error("error reading response body: {0}")]
    ResponseBody(#[source] BoxError),

    /// An error occured while sending the request
    #[error(transparent)]
    Request(#[from] hyperdriver::client::Error),

    /// A request could not be built
    #[error("building request: {0}")]
    Http(#[from] http::Error),

    /// A request URI could not be built
    #[error(transparent)]
    Uri(#[from] http::uri::InvalidUri),

    /// A reference handed back by the registry could not be parsed
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    /// A manifest or config did not deserialize
    #[error("decoding {what}: {source}")]
    Decode {
        /// What was being decoded
        what: &'static str,
        #[source]
        /// Underlying error
        source: serde_json::Error,
    },

    /// The registry returned a manifest type this client does not handle
    #[error("unsupported manifest media type {0:?}")]
    UnsupportedMediaType(String),

    /// A manifest list had no entry for the requested platform
    #[error("no image for platform {platform} in {reference}")]
    NoMatchingPlatform {
        /// The index that was searched
        reference: Reference,
        /// The platform that was wanted
        platform: Platform,
    },

    /// Content did not hash to the digest it was requested by
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Requested digest
        expected: Digest,
        /// Computed digest
        actual: Digest,
    },

    /// The registry demanded an authentication scheme we cannot satisfy
    #[error("authentication failed for {registry}: {reason}")]
    Authentication {
        /// The registry host
        registry: String,
        /// What went wrong
        reason: String,
    },

    /// Too many redirects while fetching a blob
    #[error("too many redirects fetching {0}")]
    TooManyRedirects(http::Uri),
}

impl ClientError {
    /// The upstream HTTP status, when the registry answered with an error.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Response(response) => Some(response.status),
            _ => None,
        }
    }

    /// Whether the registry reported the requested object as missing.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

/// A registry returned an error response
#[derive(Debug, Clone)]
pub struct HttpResponseError {
    /// The HTTP status code of the response
    pub status: StatusCode,

    /// The URI that was requested
    pub uri: http::Uri,

    /// The message body of the response
    pub message: String,
}

impl fmt::Display for HttpResponseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HTTP {} from {}: {}", self.status, self.uri, self.message)
    }
}

impl std::error::Error for HttpResponseError {}
