//! Content digests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// The only digest algorithm accepted by this crate.
pub const SHA256: &str = "sha256";

const SHA256_HEX_LEN: usize = 64;

/// A content digest could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DigestError {
    /// The digest has no `algorithm:` prefix.
    #[error("digest {0:?} is missing an algorithm prefix")]
    MissingAlgorithm(String),

    /// The algorithm is not sha256.
    #[error("unsupported digest algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    /// The hex portion is not 64 lowercase hexadecimal characters.
    #[error("invalid sha256 hex {0:?}")]
    InvalidHex(String),
}

/// A `sha256:<hex>` content digest.
///
/// Equality, hashing and ordering all use the canonical string form, so
/// sorting a list of digests sorts them lexicographically by `sha256:<hex>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse a digest of the form `sha256:<64 lowercase hex>`.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| DigestError::MissingAlgorithm(s.to_owned()))?;

        if algorithm != SHA256 {
            return Err(DigestError::UnsupportedAlgorithm(algorithm.to_owned()));
        }

        Self::from_hex(hex)
    }

    /// Build a sha256 digest from its hex portion alone.
    pub fn from_hex(hex: &str) -> Result<Self, DigestError> {
        let valid = hex.len() == SHA256_HEX_LEN
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        if !valid {
            return Err(DigestError::InvalidHex(hex.to_owned()));
        }

        Ok(Digest(format!("{SHA256}:{hex}")))
    }

    /// Hash `content` with sha256.
    pub fn of(content: &[u8]) -> Self {
        Digest(format!("{SHA256}:{}", hex::encode(Sha256::digest(content))))
    }

    /// The algorithm part, always `sha256`.
    pub fn algorithm(&self) -> &str {
        SHA256
    }

    /// The lowercase hex part.
    pub fn hex(&self) -> &str {
        &self.0[SHA256.len() + 1..]
    }

    /// The canonical `sha256:<hex>` form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
