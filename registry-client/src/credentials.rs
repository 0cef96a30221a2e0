//! Registry credentials and the docker `config.json` keychain.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use camino::{Utf8Path, Utf8PathBuf};
use http::header::InvalidHeaderValue;
use http::HeaderValue;
use serde::Deserialize;
use thiserror::Error;
use zeroize::Zeroize;

/// A password, token or other semi-secret value.
///
/// This wrapper keeps the value out of debug output and zeroes it on drop.
/// Use [Secret::revealed] to get the underlying value.
#[derive(Clone, Deserialize)]
#[serde(from = "String")]
pub struct Secret(Cow<'static, str>);

impl Secret {
    /// Expose the underlying value.
    pub fn revealed(&self) -> &str {
        self.0.deref()
    }

    /// A sensitive `Bearer <secret>` authorization header.
    pub fn bearer(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut header = HeaderValue::try_from(format!("Bearer {}", self.revealed()))?;
        header.set_sensitive(true);
        Ok(header)
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        if let Cow::Owned(ref mut s) = self.0 {
            s.zeroize()
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value.into())
    }
}

impl From<&'static str> for Secret {
    fn from(value: &'static str) -> Self {
        Secret(value.into())
    }
}

/// Create a sensitive basic authentication header value.
///
/// Basic authentication Base64 encodes the username and password, separated
/// by a colon.
pub fn basic_auth(username: &str, password: &Secret) -> HeaderValue {
    let encoded = BASE64_STANDARD.encode(format!("{username}:{}", password.revealed()));
    let mut header = HeaderValue::try_from(format!("Basic {encoded}"))
        .expect("base64 is always a valid HeaderValue");
    header.set_sensitive(true);
    header
}

/// Credentials for one registry.
#[derive(Debug, Clone, Default)]
pub enum Credential {
    /// No credentials; registries may still hand out anonymous pull tokens.
    #[default]
    Anonymous,

    /// Username and password, sent as basic auth to the token service.
    Basic {
        /// Login name.
        username: String,
        /// Password or personal access token.
        password: Secret,
    },

    /// An OAuth2 refresh token, exchanged at the token service.
    IdentityToken(Secret),
}

impl Credential {
    /// The basic authorization header for this credential, if it has one.
    pub fn basic_header(&self) -> Option<HeaderValue> {
        match self {
            Credential::Basic { username, password } => Some(basic_auth(username, password)),
            _ => None,
        }
    }
}

/// The docker config file could not be read.
#[derive(Debug, Error)]
pub enum KeychainError {
    /// Reading the file failed for a reason other than it not existing.
    #[error("reading {path}")]
    Io {
        /// The config file.
        path: Utf8PathBuf,
        #[source]
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid docker config JSON.
    #[error("parsing {path}")]
    Json {
        /// The config file.
        path: Utf8PathBuf,
        #[source]
        /// Underlying error.
        source: serde_json::Error,
    },

    /// An `auth` entry is not base64 `user:password`.
    #[error("malformed auth entry for {registry}")]
    MalformedAuth {
        /// The registry whose entry is broken.
        registry: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    auth: Option<Secret>,
    username: Option<String>,
    password: Option<Secret>,
    identitytoken: Option<Secret>,
}

/// Resolves credentials per registry host.
///
/// Loaded from a docker `config.json`, the same file `docker login` writes.
#[derive(Debug, Clone, Default)]
pub struct Keychain {
    entries: BTreeMap<String, Credential>,
}

impl Keychain {
    /// A keychain with no credentials.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Load from `$DOCKER_CONFIG/config.json`, falling back to
    /// `$HOME/.docker/config.json`.
    ///
    /// A missing file yields an anonymous keychain.
    pub fn from_env() -> Result<Self, KeychainError> {
        let dir = std::env::var("DOCKER_CONFIG")
            .map(Utf8PathBuf::from)
            .or_else(|_| std::env::var("HOME").map(|home| Utf8PathBuf::from(home).join(".docker")));

        match dir {
            Ok(dir) => Self::from_file(&dir.join("config.json")),
            Err(_) => {
                tracing::debug!("no docker config directory, using anonymous credentials");
                Ok(Self::anonymous())
            }
        }
    }

    /// Load from a specific docker config file.
    pub fn from_file(path: &Utf8Path) -> Result<Self, KeychainError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(%path, "docker config not found, using anonymous credentials");
                return Ok(Self::anonymous());
            }
            Err(source) => {
                return Err(KeychainError::Io {
                    path: path.to_owned(),
                    source,
                })
            }
        };

        let config: DockerConfig =
            serde_json::from_slice(&data).map_err(|source| KeychainError::Json {
                path: path.to_owned(),
                source,
            })?;

        let keychain = Self::from_config(config)?;
        tracing::debug!(%path, registries = keychain.entries.len(), "loaded docker credentials");
        Ok(keychain)
    }

    fn from_config(config: DockerConfig) -> Result<Self, KeychainError> {
        let mut entries = BTreeMap::new();

        for (server, entry) in config.auths {
            let registry = normalize_registry(&server);
            let credential = match entry {
                AuthEntry {
                    identitytoken: Some(token),
                    ..
                } => Credential::IdentityToken(token),
                AuthEntry {
                    username: Some(username),
                    password: Some(password),
                    ..
                } => Credential::Basic { username, password },
                AuthEntry {
                    auth: Some(auth), ..
                } => decode_auth(&registry, &auth)?,
                _ => continue,
            };
            entries.insert(registry, credential);
        }

        Ok(Keychain { entries })
    }

    /// Add or replace the credential for `registry`.
    pub fn insert(&mut self, registry: &str, credential: Credential) {
        self.entries.insert(normalize_registry(registry), credential);
    }

    /// The credential for `registry`, anonymous if none is stored.
    pub fn resolve(&self, registry: &str) -> Credential {
        self.entries
            .get(&normalize_registry(registry))
            .cloned()
            .unwrap_or_default()
    }
}

fn decode_auth(registry: &str, auth: &Secret) -> Result<Credential, KeychainError> {
    let malformed = || KeychainError::MalformedAuth {
        registry: registry.to_owned(),
    };

    let mut decoded = BASE64_STANDARD
        .decode(auth.revealed())
        .map_err(|_| malformed())?;
    let text = std::str::from_utf8(&decoded).map_err(|_| malformed())?;
    let (username, password) = text.split_once(':').ok_or_else(malformed)?;

    let credential = Credential::Basic {
        username: username.to_owned(),
        password: Secret::from(password.to_owned()),
    };
    decoded.zeroize();
    Ok(credential)
}

/// Docker writes hub credentials under its legacy v1 URL, and other entries
/// may carry a scheme or path.
fn normalize_registry(server: &str) -> String {
    let host = server
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);

    match host {
        "docker.io" | "registry-1.docker.io" | "index.docker.io" => {
            crate::reference::DEFAULT_REGISTRY.to_owned()
        }
        other => other.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn secret_hidden_debug() {
        let secret = Secret::from("secret garden");
        assert_eq!(format!("{secret:?}"), "Secret(****)");
        assert_eq!(secret.revealed(), "secret garden");
        assert_eq!(secret.bearer().unwrap(), "Bearer secret garden");
    }

    #[test]
    fn basic_header() {
        let header = basic_auth("username", &Secret::from("password"));
        assert_eq!(header.to_str().unwrap(), "Basic dXNlcm5hbWU6cGFzc3dvcmQ=");
        assert!(header.is_sensitive());
    }

    #[test]
    fn keychain_from_docker_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "auths": {{
                    "https://index.docker.io/v1/": {{"auth": "dXNlcm5hbWU6cGFzc3dvcmQ="}},
                    "gcr.io": {{"username": "_json_key", "password": "{{}}"}},
                    "ghcr.io": {{"identitytoken": "refresh"}},
                    "quay.io": {{}}
                }}
            }}"#
        )
        .unwrap();

        let path = Utf8Path::from_path(file.path()).unwrap();
        let keychain = Keychain::from_file(path).unwrap();

        match keychain.resolve("index.docker.io") {
            Credential::Basic { username, password } => {
                assert_eq!(username, "username");
                assert_eq!(password.revealed(), "password");
            }
            other => panic!("unexpected credential {other:?}"),
        }
        assert!(matches!(keychain.resolve("gcr.io"), Credential::Basic { .. }));
        assert!(matches!(keychain.resolve("ghcr.io"), Credential::IdentityToken(_)));
        assert!(matches!(keychain.resolve("quay.io"), Credential::Anonymous));
    }

    #[test]
    fn keychain_missing_file_is_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("config.json")).unwrap();
        let keychain = Keychain::from_file(&path).unwrap();
        assert!(matches!(keychain.resolve("gcr.io"), Credential::Anonymous));
    }

    #[test]
    fn keychain_malformed_auth() {
        let config: DockerConfig =
            serde_json::from_str(r#"{"auths": {"gcr.io": {"auth": "bm9jb2xvbg=="}}}"#).unwrap();
        assert!(matches!(
            Keychain::from_config(config),
            Err(KeychainError::MalformedAuth { .. })
        ));
    }
}
