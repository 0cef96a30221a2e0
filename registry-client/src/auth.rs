//! Registry token authentication.
//!
//! Registries answer unauthenticated requests with `401` and a
//! `WWW-Authenticate` challenge. For `Bearer` challenges the client fetches a
//! token from the named realm, scoped to pulling one repository, and retries.
//!
//! Reference: <https://distribution.github.io/distribution/spec/auth/token/>

use std::collections::BTreeMap;

use hyperdriver::Body;
use serde::Deserialize;

use crate::credentials::{Credential, Secret};
use crate::error::ClientError;
use crate::reference::Reference;

const CLIENT_ID: &str = "overlay-registry";

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

impl Challenge {
    /// Parse a challenge, returning `None` for schemes we do not speak.
    pub(crate) fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }

        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut params = parse_params(params);
        Some(Challenge::Bearer {
            realm: params.remove("realm")?,
            service: params.remove("service"),
            scope: params.remove("scope"),
        })
    }
}

/// Split `key="value", key=value` pairs. Quoted values may contain commas.
fn parse_params(input: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, tail)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let tail = tail.trim_start();

        let (value, tail) = match tail.strip_prefix('"') {
            Some(quoted) => match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            },
            None => match tail.find(',') {
                Some(end) => (tail[..end].trim(), &tail[end..]),
                None => (tail.trim(), ""),
            },
        };

        params.insert(key, value.to_owned());
        rest = tail.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

/// The body of a token service response. Docker Hub sends `token`, OAuth2
/// servers send `access_token`; some send both.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    token: Option<Secret>,
    access_token: Option<Secret>,
}

impl TokenResponse {
    pub(crate) fn into_secret(self) -> Option<Secret> {
        self.token.or(self.access_token)
    }
}

/// Build the request that exchanges `credential` for a pull token for
/// `reference`'s repository.
pub(crate) fn token_request(
    realm: &str,
    service: Option<&str>,
    scope: Option<&str>,
    reference: &Reference,
    credential: &Credential,
) -> Result<http::Request<Body>, ClientError> {
    let default_scope = format!("repository:{}:pull", reference.repository());
    let scope = scope.unwrap_or(&default_scope);

    let mut url = url::Url::parse(realm).map_err(|error| ClientError::Authentication {
        registry: reference.registry().to_owned(),
        reason: format!("invalid token realm {realm:?}: {error}"),
    })?;

    match credential {
        Credential::IdentityToken(refresh) => {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("grant_type", "refresh_token")
                .append_pair("client_id", CLIENT_ID)
                .append_pair("scope", scope)
                .append_pair("refresh_token", refresh.revealed());
            if let Some(service) = service {
                form.append_pair("service", service);
            }

            let request = http::Request::post(url.as_str())
                .header(
                    http::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .body(Body::from(form.finish()))?;
            Ok(request)
        }
        Credential::Basic { .. } | Credential::Anonymous => {
            {
                let mut query = url.query_pairs_mut();
                if let Some(service) = service {
                    query.append_pair("service", service);
                }
                query.append_pair("scope", scope);
            }

            let mut builder = http::Request::get(url.as_str());
            if let Some(header) = credential.basic_header() {
                builder = builder.header(http::header::AUTHORIZATION, header);
            }
            Ok(builder.body(Body::empty())?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_docker_hub_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/ubuntu:pull""#,
        )
        .unwrap();

        assert_eq!(
            challenge,
            Challenge::Bearer {
                realm: "https://auth.docker.io/token".into(),
                service: Some("registry.docker.io".into()),
                scope: Some("repository:library/ubuntu:pull".into()),
            }
        );
    }

    #[test]
    fn parse_scope_with_commas() {
        let challenge = Challenge::parse(
            r#"bearer realm="https://gcr.io/v2/token", scope="repository:a/b:pull,push", service=gcr.io"#,
        )
        .unwrap();

        match challenge {
            Challenge::Bearer { scope, service, .. } => {
                assert_eq!(scope.as_deref(), Some("repository:a/b:pull,push"));
                assert_eq!(service.as_deref(), Some("gcr.io"));
            }
            other => panic!("unexpected challenge {other:?}"),
        }
    }

    #[test]
    fn parse_other_schemes() {
        assert_eq!(
            Challenge::parse(r#"Basic realm="registry""#),
            Some(Challenge::Basic)
        );
        assert_eq!(Challenge::parse("Negotiate"), None);
        assert_eq!(Challenge::parse(r#"Bearer service="x""#), None);
    }

    #[test]
    fn anonymous_token_request() {
        let reference = Reference::parse("gcr.io/proj/app").unwrap();
        let request = token_request(
            "https://gcr.io/v2/token",
            Some("gcr.io"),
            None,
            &reference,
            &Credential::Anonymous,
        )
        .unwrap();

        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().to_string(),
            "https://gcr.io/v2/token?service=gcr.io&scope=repository%3Aproj%2Fapp%3Apull"
        );
        assert!(request.headers().get(http::header::AUTHORIZATION).is_none());
    }

    #[test]
    fn basic_token_request_carries_credentials() {
        let reference = Reference::parse("gcr.io/proj/app").unwrap();
        let credential = Credential::Basic {
            username: "username".into(),
            password: Secret::from("password"),
        };
        let request = token_request(
            "https://gcr.io/v2/token",
            None,
            Some("repository:proj/app:pull"),
            &reference,
            &credential,
        )
        .unwrap();

        assert_eq!(
            request.headers()[http::header::AUTHORIZATION],
            "Basic dXNlcm5hbWU6cGFzc3dvcmQ="
        );
    }

    #[test]
    fn token_response_prefers_token() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"token": "a", "access_token": "b"}"#).unwrap();
        assert_eq!(response.into_secret().unwrap().revealed(), "a");

        let response: TokenResponse = serde_json::from_str(r#"{"access_token": "b"}"#).unwrap();
        assert_eq!(response.into_secret().unwrap().revealed(), "b");
    }
}
