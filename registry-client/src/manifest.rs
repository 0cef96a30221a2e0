//! Image manifest and config wire types.
//!
//! Covers the Docker image manifest v2 schema 2 and the equivalent OCI image
//! manifest, their multi-platform index forms, and the image config file.
//!
//! Reference: <https://distribution.github.io/distribution/spec/manifest-v2-2/>

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::digest::Digest;

/// Media type strings understood by the client.
pub mod media_types {
    /// Docker image manifest, schema 2.
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    /// Docker multi-platform manifest list.
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    /// Docker image config.
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    /// Docker gzip layer.
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    /// OCI image manifest.
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    /// OCI image index.
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    /// OCI image config.
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    /// OCI gzip layer.
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

    /// Whether `media_type` is a single-image manifest.
    pub fn is_manifest(media_type: &str) -> bool {
        matches!(media_type, DOCKER_MANIFEST | OCI_MANIFEST)
    }

    /// Whether `media_type` is a multi-platform manifest list or index.
    pub fn is_index(media_type: &str) -> bool {
        matches!(media_type, DOCKER_MANIFEST_LIST | OCI_INDEX)
    }
}

/// A reference to a blob: its media type, size and digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,

    /// Size in bytes of the referenced content.
    pub size: u64,

    /// Digest of the referenced content.
    pub digest: Digest,

    /// Alternate download locations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Platform of the referenced image, for index entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// A descriptor with only the required fields set.
    pub fn new(media_type: impl Into<String>, size: u64, digest: Digest) -> Self {
        Self {
            media_type: media_type.into(),
            size,
            digest,
            urls: Vec::new(),
            annotations: BTreeMap::new(),
            platform: None,
        }
    }
}

/// A single-image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Always 2.
    pub schema_version: u32,

    /// Docker manifests always carry this; OCI manifests may omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// The image config blob.
    pub config: Descriptor,

    /// Filesystem layers, base first.
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// A schema 2 manifest with the given media type.
    pub fn new(media_type: &str, config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_type.to_owned()),
            config,
            layers,
        }
    }
}

/// A multi-platform manifest list or OCI index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    /// Always 2.
    pub schema_version: u32,

    /// Media type of the list itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// One entry per platform image.
    pub manifests: Vec<Descriptor>,
}

impl ManifestList {
    /// Find the entry for `platform`.
    pub fn find(&self, platform: &Platform) -> Option<&Descriptor> {
        self.manifests.iter().find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|candidate| platform.matches(candidate))
        })
    }
}

/// The platform a manifest-list entry was built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture, e.g. `amd64`.
    pub architecture: String,

    /// Operating system, e.g. `linux`.
    pub os: String,

    /// Architecture variant, e.g. `v8`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// A platform without a variant.
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
            variant: None,
        }
    }

    /// Whether `candidate` satisfies this platform. A variant is only compared
    /// when this platform asks for one.
    pub fn matches(&self, candidate: &Platform) -> bool {
        self.os == candidate.os
            && self.architecture == candidate.architecture
            && (self.variant.is_none() || self.variant == candidate.variant)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::new("linux", "amd64")
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// A platform string was not `os/arch[/variant]`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid platform {0:?}, expected os/arch[/variant]")]
pub struct PlatformError(String);

impl FromStr for Platform {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Platform::new(*os, *arch)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Platform {
                    variant: Some((*variant).to_owned()),
                    ..Platform::new(*os, *arch)
                })
            }
            _ => Err(PlatformError(s.to_owned())),
        }
    }
}

/// The runtime configuration of an image: what a container runtime needs to
/// start it.
///
/// Keys this type does not model are kept in `other` so that a config read
/// from one image can be written into another without losing anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, Value>>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, Value>>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,

    /// Everything else, passed through untouched.
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// The root filesystem description in a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub fs_type: String,

    /// Digests of the uncompressed layer tarballs, base first.
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: RootFs::LAYERS.to_owned(),
            diff_ids: Vec::new(),
        }
    }
}

impl RootFs {
    /// The only root filesystem type in use.
    pub const LAYERS: &'static str = "layers";
}

/// One entry of image build history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// An image config file: the blob a manifest's `config` descriptor points at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[allow(missing_docs)]
    #[serde(default)]
    pub architecture: String,

    #[allow(missing_docs)]
    #[serde(default)]
    pub os: String,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Runtime configuration.
    #[serde(default)]
    pub config: Config,

    #[allow(missing_docs)]
    #[serde(default)]
    pub rootfs: RootFs,

    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

/// Peek at the media type of a manifest body.
///
/// Prefers the `Content-Type` the registry sent, then the body's own
/// `mediaType` field, then infers from its shape.
pub fn detect_media_type(content_type: Option<&str>, body: &[u8]) -> String {
    if let Some(content_type) = content_type {
        let content_type = content_type.split(';').next().unwrap_or_default().trim();
        if media_types::is_manifest(content_type) || media_types::is_index(content_type) {
            return content_type.to_owned();
        }
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        media_type: Option<String>,
        manifests: Option<Value>,
    }

    match serde_json::from_slice::<Probe>(body) {
        Ok(Probe {
            media_type: Some(media_type),
            ..
        }) => media_type,
        Ok(Probe {
            manifests: Some(_), ..
        }) => media_types::OCI_INDEX.to_owned(),
        _ => media_types::OCI_MANIFEST.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn config_passthrough_keeps_unknown_keys() {
        let raw = json!({
            "Env": ["X=1"],
            "Entrypoint": ["/app"],
            "Healthcheck": {"Test": ["CMD", "true"]},
            "ArgsEscaped": true
        });

        let config: Config = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(config.env.as_deref(), Some(&["X=1".to_owned()][..]));
        assert!(config.other.contains_key("Healthcheck"));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn manifest_serializes_in_registry_field_order() {
        let manifest = Manifest::new(
            media_types::DOCKER_MANIFEST,
            Descriptor::new(media_types::DOCKER_CONFIG, 2, Digest::of(b"{}")),
            vec![Descriptor::new(media_types::DOCKER_LAYER, 3, Digest::of(b"abc"))],
        );

        let text = serde_json::to_string(&manifest).unwrap();
        assert!(text.starts_with(
            r#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json","config":{"mediaType""#
        ));
        assert!(!text.contains("urls"));
        assert!(!text.contains("annotations"));
    }

    #[test]
    fn platform_parse_and_match() {
        let wanted: Platform = "linux/arm64".parse().unwrap();
        let mut candidate = Platform::new("linux", "arm64");
        candidate.variant = Some("v8".into());
        assert!(wanted.matches(&candidate));

        let strict: Platform = "linux/arm64/v7".parse().unwrap();
        assert!(!strict.matches(&candidate));
        assert_eq!(strict.to_string(), "linux/arm64/v7");

        assert!("linux".parse::<Platform>().is_err());
        assert!("linux//".parse::<Platform>().is_err());
    }

    #[test]
    fn manifest_list_find() {
        let list: ManifestList = serde_json::from_value(json!({
            "schemaVersion": 2,
            "mediaType": media_types::DOCKER_MANIFEST_LIST,
            "manifests": [
                {
                    "mediaType": media_types::DOCKER_MANIFEST,
                    "size": 10,
                    "digest": Digest::of(b"arm"),
                    "platform": {"architecture": "arm64", "os": "linux"}
                },
                {
                    "mediaType": media_types::DOCKER_MANIFEST,
                    "size": 11,
                    "digest": Digest::of(b"amd"),
                    "platform": {"architecture": "amd64", "os": "linux"}
                }
            ]
        }))
        .unwrap();

        let entry = list.find(&Platform::default()).unwrap();
        assert_eq!(entry.digest, Digest::of(b"amd"));
        assert!(list.find(&Platform::new("windows", "amd64")).is_none());
    }

    #[test]
    fn detect_media_type_sources() {
        assert_eq!(
            detect_media_type(
                Some("application/vnd.docker.distribution.manifest.v2+json; charset=utf-8"),
                b"{}"
            ),
            media_types::DOCKER_MANIFEST
        );
        assert_eq!(
            detect_media_type(
                Some("application/json"),
                br#"{"mediaType":"application/vnd.oci.image.index.v1+json"}"#
            ),
            media_types::OCI_INDEX
        );
        assert_eq!(
            detect_media_type(None, br#"{"schemaVersion":2,"manifests":[]}"#),
            media_types::OCI_INDEX
        );
        assert_eq!(
            detect_media_type(None, br#"{"schemaVersion":2,"layers":[]}"#),
            media_types::OCI_MANIFEST
        );
    }

    #[test]
    fn config_file_defaults_rootfs() {
        let file: ConfigFile = serde_json::from_value(json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Env": ["PATH=/bin"]},
            "rootfs": {"type": "layers", "diff_ids": [Digest::of(b"layer")]},
            "container_config": {"ignored": true}
        }))
        .unwrap();

        assert_eq!(file.rootfs.diff_ids, vec![Digest::of(b"layer")]);
        assert_eq!(file.config.env, Some(vec!["PATH=/bin".to_owned()]));
        assert_eq!(RootFs::default().fs_type, "layers");
    }
}
