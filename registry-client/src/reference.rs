//! Docker-style image references.
//!
//! A reference names an image hosted on some registry:
//! `[registry/]repository[:tag][@digest]`. Parsing follows the conventions
//! of the docker CLI, so `ubuntu` means `index.docker.io/library/ubuntu:latest`.
//!
//! The first path component is treated as a registry host only if it contains
//! a `.` or `:` or is exactly `localhost`.

use std::fmt;
use std::str::FromStr;

use http::Uri;
use thiserror::Error;

use crate::digest::{Digest, DigestError};

/// Registry used when a reference does not name one.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Tag used when a reference names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// The API host for Docker Hub, which is not the same as its name.
const DOCKER_HUB_API: &str = "registry-1.docker.io";

const MAX_TAG_LEN: usize = 128;

/// An image reference could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReferenceError {
    /// Nothing to parse.
    #[error("empty image reference")]
    Empty,

    /// The registry host portion is malformed.
    #[error("invalid registry {0:?}")]
    InvalidRegistry(String),

    /// The repository path is malformed.
    #[error("invalid repository {0:?}")]
    InvalidRepository(String),

    /// The tag is malformed.
    #[error("invalid tag {0:?}")]
    InvalidTag(String),

    /// The `@digest` suffix is malformed.
    #[error(transparent)]
    Digest(#[from] DigestError),
}

/// A parsed image reference.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    /// Parse a reference string.
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest)?)),
            None => (s, None),
        };

        // A colon after the last slash separates the tag. A colon before it
        // belongs to a registry port.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(&name[split + 1..]))
            }
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first, rest),
            _ => (DEFAULT_REGISTRY, name),
        };

        Self::from_parts(registry, repository, tag, digest)
    }

    /// Assemble a reference from its components, validating each.
    ///
    /// Docker Hub repositories without a namespace get the `library/` prefix.
    pub fn from_parts(
        registry: &str,
        repository: &str,
        tag: Option<&str>,
        digest: Option<Digest>,
    ) -> Result<Self, ReferenceError> {
        let registry = match registry {
            "docker.io" | DOCKER_HUB_API => DEFAULT_REGISTRY,
            other => other,
        };
        validate_registry(registry)?;

        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_owned()
        };
        validate_repository(&repository)?;

        if let Some(tag) = tag {
            validate_tag(tag)?;
        }

        Ok(Reference {
            registry: registry.to_owned(),
            repository,
            tag: tag.map(ToOwned::to_owned),
            digest,
        })
    }

    /// The registry host, e.g. `gcr.io` or `localhost:5000`.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The explicit tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The pinned digest, if any.
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// The most specific version identifier: the digest if pinned, otherwise
    /// the tag, otherwise `latest`.
    pub fn version(&self) -> &str {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.as_str(),
            (None, Some(tag)) => tag,
            (None, None) => DEFAULT_TAG,
        }
    }

    /// The same repository pinned to `digest`.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Reference {
            digest: Some(digest),
            ..self.clone()
        }
    }

    /// URL scheme used to reach this registry.
    ///
    /// Local registries are assumed to be plain HTTP.
    pub fn scheme(&self) -> &'static str {
        let host = self
            .registry
            .rsplit_once(':')
            .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
            .map(|(host, _)| host)
            .unwrap_or(&self.registry);

        if host == "localhost"
            || host == "[::1]"
            || host.starts_with("127.")
            || host.ends_with(".local")
        {
            "http"
        } else {
            "https"
        }
    }

    /// The host which serves the registry API.
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API
        } else {
            &self.registry
        }
    }

    /// Key identifying the authentication scope of this reference.
    pub(crate) fn scope_key(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// `/v2/<repository>/manifests/<version>` on the API host.
    pub fn manifest_uri(&self) -> Result<Uri, http::uri::InvalidUri> {
        self.endpoint(&format!("manifests/{}", self.version()))
    }

    /// `/v2/<repository>/blobs/<digest>` on the API host.
    pub fn blob_uri(&self, digest: &Digest) -> Result<Uri, http::uri::InvalidUri> {
        self.endpoint(&format!("blobs/{digest}"))
    }

    fn endpoint(&self, tail: &str) -> Result<Uri, http::uri::InvalidUri> {
        format!(
            "{}://{}/v2/{}/{}",
            self.scheme(),
            self.api_host(),
            self.repository,
            tail
        )
        .parse()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference({self})")
    }
}

impl FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::parse(s)
    }
}

fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn validate_registry(registry: &str) -> Result<(), ReferenceError> {
    let valid = !registry.is_empty()
        && registry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));

    if valid {
        Ok(())
    } else {
        Err(ReferenceError::InvalidRegistry(registry.to_owned()))
    }
}

fn validate_repository(repository: &str) -> Result<(), ReferenceError> {
    let component_ok = |component: &str| {
        let bytes = component.as_bytes();
        let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

        !bytes.is_empty()
            && bytes.first().is_some_and(alnum)
            && bytes.last().is_some_and(alnum)
            && bytes
                .iter()
                .all(|b| alnum(b) || matches!(b, b'.' | b'_' | b'-'))
    };

    if repository.split('/').all(component_ok) {
        Ok(())
    } else {
        Err(ReferenceError::InvalidRepository(repository.to_owned()))
    }
}

fn validate_tag(tag: &str) -> Result<(), ReferenceError> {
    let word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let mut chars = tag.chars();

    let valid = tag.len() <= MAX_TAG_LEN
        && chars.next().is_some_and(word)
        && chars.all(|c| word(c) || c == '.' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(ReferenceError::InvalidTag(tag.to_owned()))
    }
}
