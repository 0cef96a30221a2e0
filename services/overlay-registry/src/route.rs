//! Parsing registry request paths.
//!
//! Repository names contain slashes, so a path like
//! `/v2/team/app/manifests/v1` can't be matched with fixed path segments.
//! The path is split at its last `/manifests/` or `/blobs/` instead.

use registry_client::Digest;

use crate::error::{RegistryError, RegistryResult};

const MAX_TAG_LENGTH: usize = 128;

/// What a manifest request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ManifestReference {
    Tag(String),
    Digest(Digest),
}

/// A parsed registry API path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    Manifest {
        repository: String,
        reference: ManifestReference,
    },
    Blob {
        repository: String,
        digest: Digest,
    },
}

impl Route {
    /// Parse the part of a request path after `/v2/`.
    pub(crate) fn parse(path: &str) -> RegistryResult<Route> {
        let manifests = path.rfind("/manifests/");
        let blobs = path.rfind("/blobs/");

        let route = match (manifests, blobs) {
            (Some(m), b) if b.is_none_or(|b| m > b) => {
                let (repository, reference) = (&path[..m], &path[m + "/manifests/".len()..]);
                validate_repository(repository)?;

                let reference = if reference.contains(':') {
                    ManifestReference::Digest(parse_digest(reference)?)
                } else {
                    validate_tag(reference)?;
                    ManifestReference::Tag(reference.to_owned())
                };

                Route::Manifest {
                    repository: repository.to_owned(),
                    reference,
                }
            }
            (_, Some(b)) => {
                let (repository, digest) = (&path[..b], &path[b + "/blobs/".len()..]);
                validate_repository(repository)?;

                Route::Blob {
                    repository: repository.to_owned(),
                    digest: parse_digest(digest)?,
                }
            }
            _ => return Err(RegistryError::NotFound(format!("/v2/{path}"))),
        };

        Ok(route)
    }
}

/// Repositories are `[a-z0-9-_]` components separated by single slashes.
fn validate_repository(name: &str) -> RegistryResult<()> {
    let valid = !name.is_empty()
        && name.split('/').all(|component| {
            !component.is_empty()
                && component
                    .bytes()
                    .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_'))
        });

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidRepository(name.to_owned()))
    }
}

fn validate_tag(tag: &str) -> RegistryResult<()> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_TAG_LENGTH
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidTag(tag.to_owned()))
    }
}

fn parse_digest(digest: &str) -> RegistryResult<Digest> {
    Digest::parse(digest).map_err(|source| RegistryError::InvalidDigest {
        digest: digest.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> Digest {
        Digest::of(b"layer")
    }

    #[test]
    fn manifest_route() {
        assert_eq!(
            Route::parse("team/app/manifests/v1.2").unwrap(),
            Route::Manifest {
                repository: "team/app".into(),
                reference: ManifestReference::Tag("v1.2".into()),
            }
        );

        assert_eq!(
            Route::parse(&format!("app/manifests/{}", digest())).unwrap(),
            Route::Manifest {
                repository: "app".into(),
                reference: ManifestReference::Digest(digest()),
            }
        );
    }

    #[test]
    fn blob_route() {
        assert_eq!(
            Route::parse(&format!("team/app/blobs/{}", digest())).unwrap(),
            Route::Blob {
                repository: "team/app".into(),
                digest: digest(),
            }
        );
    }

    #[test]
    fn repository_may_contain_keywords() {
        assert_eq!(
            Route::parse("blobs/manifests/manifests/latest").unwrap(),
            Route::Manifest {
                repository: "blobs/manifests".into(),
                reference: ManifestReference::Tag("latest".into()),
            }
        );
    }

    #[test]
    fn tag_characters() {
        for tag in ["-v1", ".hidden", "V1.2_rc-3", "latest"] {
            assert_eq!(
                Route::parse(&format!("app/manifests/{tag}")).unwrap(),
                Route::Manifest {
                    repository: "app".into(),
                    reference: ManifestReference::Tag(tag.into()),
                }
            );
        }
    }

    #[test]
    fn invalid_paths() {
        assert!(matches!(
            Route::parse("Team/app/manifests/v1"),
            Err(RegistryError::InvalidRepository(_))
        ));
        assert!(matches!(
            Route::parse("team//app/manifests/v1"),
            Err(RegistryError::InvalidRepository(_))
        ));
        assert!(matches!(
            Route::parse("/manifests/v1"),
            Err(RegistryError::InvalidRepository(_))
        ));
        assert!(matches!(
            Route::parse("my.app/image/manifests/v2"),
            Err(RegistryError::InvalidRepository(_))
        ));
        assert!(matches!(
            Route::parse("app/manifests/v1+build"),
            Err(RegistryError::InvalidTag(_))
        ));
        assert!(matches!(
            Route::parse(&format!("app/manifests/{}", "v".repeat(129))),
            Err(RegistryError::InvalidTag(_))
        ));
        assert!(matches!(
            Route::parse("app/blobs/sha256:abc"),
            Err(RegistryError::InvalidDigest { .. })
        ));
        assert!(matches!(
            Route::parse("app/blobs/md5:abc"),
            Err(RegistryError::InvalidDigest { .. })
        ));
        assert!(matches!(
            Route::parse("app/tags/list"),
            Err(RegistryError::NotFound(_))
        ));
    }
}
