//! Digest, digester and chain ID definitions.

use std::fmt;
use std::io;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

use crate::DigestError;

/// Hash algorithm of a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Algorithm {
    /// SHA-256, the only algorithm content is addressed by.
    Sha256,
}

impl Algorithm {
    /// Returns the canonical algorithm name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
        }
    }

    /// Returns the number of hex characters in an encoded digest.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated content digest in `{algorithm}:{hex}` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    encoded: String,
}

impl Digest {
    /// Parses a digest from a string.
    ///
    /// The string must be in the format `sha256:{64 lowercase hex chars}`.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        if s.is_empty() {
            return Err(DigestError::Empty);
        }

        let Some((algorithm, encoded)) = s.split_once(':') else {
            return Err(DigestError::MissingSeparator);
        };

        let algorithm =
            Algorithm::parse(algorithm).ok_or_else(|| DigestError::UnsupportedAlgorithm {
                actual: algorithm.to_string(),
            })?;

        if encoded.len() != algorithm.encoded_len() {
            return Err(DigestError::InvalidLength {
                expected: algorithm.encoded_len(),
                actual: encoded.len(),
            });
        }

        if let Some(bad) = encoded
            .chars()
            .find(|c| !matches!(c, '0'..='9' | 'a'..='f'))
        {
            return Err(DigestError::InvalidEncoding(format!(
                "unexpected character '{bad}'"
            )));
        }

        Ok(Self {
            algorithm,
            encoded: encoded.to_string(),
        })
    }

    /// Computes the SHA-256 digest of `data`.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::from_sha256(Sha256::digest(data).as_slice())
    }

    fn from_sha256(hash: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            encoded: hex::encode(hash),
        }
    }

    /// Returns the digest algorithm.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Returns the hex-encoded portion without the algorithm prefix.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Running SHA-256 accumulator.
///
/// Implements [`io::Write`] so it can sit on one side of a tee while the
/// same bytes go to a compressor or a file.
#[derive(Clone, Default)]
pub struct Digester {
    hasher: Sha256,
    written: u64,
}

impl Digester {
    /// Creates an empty digester.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.written += data.len() as u64;
    }

    /// Returns the number of bytes digested so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Returns the digest of everything written so far without consuming the digester.
    #[must_use]
    pub fn digest(&self) -> Digest {
        Digest::from_sha256(self.hasher.clone().finalize().as_slice())
    }

    /// Consumes the digester and returns the final digest.
    #[must_use]
    pub fn finalize(self) -> Digest {
        Digest::from_sha256(self.hasher.finalize().as_slice())
    }
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Digester")
            .field("written", &self.written)
            .finish()
    }
}

impl io::Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Computes the OCI chain ID of a layer.
///
/// The bottom layer's chain ID is its diff ID. Every other layer's chain ID is
/// `sha256(parent_chain_id + " " + diff_id)`.
#[must_use]
pub fn chain_id(parent: Option<&Digest>, diff_id: &Digest) -> Digest {
    match parent {
        None => diff_id.clone(),
        Some(parent) => Digest::from_bytes(format!("{parent} {diff_id}").as_bytes()),
    }
}
