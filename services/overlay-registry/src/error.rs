//! Error types for the registry

use std::fmt::Write as _;

use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use registry_client::{Digest, DigestError, ReferenceError};

use crate::compose::ComposeError;
use crate::source::SourceError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(Digest),

    /// Invalid digest format
    #[error("invalid digest {digest:?}")]
    InvalidDigest {
        /// The digest as requested.
        digest: String,
        #[source]
        /// Underlying error.
        source: DigestError,
    },

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Invalid tag
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// The executable reference derived from the request is invalid
    #[error("invalid image reference")]
    InvalidReference(#[from] ReferenceError),

    /// The virtual image could not be composed
    #[error("composing image")]
    Compose(#[from] ComposeError),

    /// A layer could not be opened upstream
    #[error("opening layer")]
    Source(#[from] SourceError),

    /// No route for this path
    #[error("no such endpoint: {0}")]
    NotFound(String),

    /// Method not allowed on this route
    #[error("method {0} not supported")]
    Unsupported(Method),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Source(error) if error.is_not_found() => StatusCode::NOT_FOUND,
            RegistryError::Compose(error) if error.is_executable_not_found() => {
                StatusCode::NOT_FOUND
            }
            RegistryError::InvalidDigest { .. }
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::InvalidReference(_) => StatusCode::BAD_REQUEST,
            RegistryError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::Compose(_) | RegistryError::Source(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::Source(error) if error.is_not_found() => "BLOB_UNKNOWN",
            RegistryError::InvalidDigest { .. } => "DIGEST_INVALID",
            RegistryError::InvalidRepository(_) | RegistryError::InvalidReference(_) => {
                "NAME_INVALID"
            }
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::NotFound(_) => "NAME_UNKNOWN",
            RegistryError::Unsupported(_) => "UNSUPPORTED",
            RegistryError::Compose(error) if error.is_executable_not_found() => {
                "MANIFEST_UNKNOWN"
            }
            RegistryError::Compose(_) | RegistryError::Source(_) => "UNKNOWN",
        }
    }

    /// The error and its chain of causes, on one line.
    fn message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            let _ = write!(message, ": {cause}");
            source = cause.source();
        }
        message
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.message();

        if status.is_server_error() {
            tracing::error!(%status, code, "{message}");
        } else {
            tracing::warn!(%status, code, "{message}");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_includes_causes() {
        let error = RegistryError::InvalidDigest {
            digest: "sha256:zz".into(),
            source: Digest::parse("sha256:zz").unwrap_err(),
        };
        let message = error.message();
        assert!(message.starts_with("invalid digest \"sha256:zz\": "), "{message}");
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(error.error_code(), "DIGEST_INVALID");
    }

    #[tokio::test]
    async fn error_envelope() {
        let response = RegistryError::BlobNotFound(Digest::of(b"missing")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["errors"][0]["code"], "BLOB_UNKNOWN");
        assert_eq!(
            body["errors"][0]["message"],
            format!("blob not found: {}", Digest::of(b"missing"))
        );
    }
}
