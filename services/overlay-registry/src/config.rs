//! Base layer configuration.
//!
//! The base layers are read from a directory of files, the layout Kubernetes
//! uses when it mounts a ConfigMap: each file name is a layer digest (the hex
//! part only) and each file holds the reference of an image containing that
//! layer.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use registry_client::{Digest, DigestError};
use thiserror::Error;

/// The default mount point for the base layer configuration.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/recipe";

/// The base layer configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The directory or one of its files could not be read.
    #[error("reading {path}")]
    Io {
        /// The path being read.
        path: Utf8PathBuf,
        #[source]
        /// Underlying error.
        source: std::io::Error,
    },

    /// A file name is not a layer digest.
    #[error("{path} is not named for a sha256 layer digest")]
    InvalidDigest {
        /// The offending file.
        path: Utf8PathBuf,
        #[source]
        /// Underlying error.
        source: DigestError,
    },

    /// A file does not hold an image reference.
    #[error("{0} is empty")]
    EmptyReference(Utf8PathBuf),
}

/// Mapping from base layer digest (hex) to the reference of an image which
/// contains that layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseLayerMap {
    entries: BTreeMap<String, String>,
}

impl BaseLayerMap {
    /// An empty map: composed images contain only the executable's layers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer digest (hex) and the reference of an image containing it.
    pub fn insert(&mut self, digest: impl Into<String>, reference: impl Into<String>) {
        self.entries.insert(digest.into(), reference.into());
    }

    /// Number of configured base layers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no base layers are configured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(digest hex, reference)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(digest, reference)| (digest.as_str(), reference.as_str()))
    }

    /// Load every regular file in `dir` as one entry.
    ///
    /// Symlinks are followed. Entries starting with `.` are skipped, which
    /// covers the `..data` and timestamped directories of a mounted ConfigMap.
    #[tracing::instrument(level = "debug")]
    pub fn from_dir(dir: &Utf8Path) -> Result<Self, ConfigError> {
        let mut map = BaseLayerMap::new();

        for entry in dir.read_dir_utf8().map_err(io_error(dir))? {
            let entry = entry.map_err(io_error(dir))?;
            let name = entry.file_name();

            if name.starts_with('.') {
                continue;
            }

            let path = entry.path().to_owned();
            let metadata = path.metadata().map_err(io_error(&path))?;
            if !metadata.is_file() {
                tracing::trace!(%path, "skipping non-file entry");
                continue;
            }

            Digest::from_hex(name).map_err(|source| ConfigError::InvalidDigest {
                path: path.clone(),
                source,
            })?;

            let contents = std::fs::read_to_string(&path).map_err(io_error(&path))?;
            let reference = contents.trim();
            if reference.is_empty() {
                return Err(ConfigError::EmptyReference(path));
            }

            tracing::debug!(digest = %name, %reference, "base layer");
            map.insert(name, reference);
        }

        tracing::info!(%dir, layers = map.len(), "loaded base layer configuration");
        Ok(map)
    }
}

fn io_error(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> ConfigError {
    let path = path.to_owned();
    move |source| ConfigError::Io { path, source }
}

impl<K, V> FromIterator<(K, V)> for BaseLayerMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(digest, reference)| (digest.into(), reference.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(byte: char) -> String {
        std::iter::repeat_n(byte, 64).collect()
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        (dir, path)
    }

    #[test]
    fn load_configmap_layout() {
        let (_guard, dir) = tempdir();

        // Kubernetes mounts files as symlinks into a hidden data directory.
        let data = dir.join("..2024_01_01");
        std::fs::create_dir(&data).unwrap();
        std::fs::write(data.join(hex('a')), "base/image:v1\n").unwrap();
        std::os::unix::fs::symlink(data.join(hex('a')), dir.join(hex('a'))).unwrap();
        let pinned = format!("gcr.io/proj/other@sha256:{}", hex('c'));
        std::fs::write(dir.join(hex('b')), format!("  {pinned}  ")).unwrap();

        let map = BaseLayerMap::from_dir(&dir).unwrap();
        let entries: Vec<_> = map.iter().collect();
        assert_eq!(
            entries,
            vec![
                (hex('a').as_str(), "base/image:v1"),
                (hex('b').as_str(), pinned.as_str()),
            ]
        );
    }

    #[test]
    fn empty_directory_is_empty_map() {
        let (_guard, dir) = tempdir();
        assert!(BaseLayerMap::from_dir(&dir).unwrap().is_empty());
    }

    #[test]
    fn missing_directory_is_error() {
        let (_guard, dir) = tempdir();
        let error = BaseLayerMap::from_dir(&dir.join("missing")).unwrap_err();
        assert!(matches!(error, ConfigError::Io { .. }));
    }

    #[test]
    fn non_digest_file_name_is_error() {
        let (_guard, dir) = tempdir();
        std::fs::write(dir.join("README"), "base/image:v1").unwrap();

        let error = BaseLayerMap::from_dir(&dir).unwrap_err();
        assert!(matches!(error, ConfigError::InvalidDigest { .. }));
    }

    #[test]
    fn empty_file_is_error() {
        let (_guard, dir) = tempdir();
        std::fs::write(dir.join(hex('d')), "\n").unwrap();

        let error = BaseLayerMap::from_dir(&dir).unwrap_err();
        assert!(matches!(error, ConfigError::EmptyReference(_)));
    }
}
