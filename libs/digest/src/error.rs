//! Error types for digest parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating digests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// The digest string is empty.
    #[error("digest cannot be empty")]
    Empty,

    /// The digest is missing the `:` separator.
    #[error("digest missing ':' separator")]
    MissingSeparator,

    /// The algorithm portion is not supported.
    #[error("unsupported digest algorithm: '{actual}'")]
    UnsupportedAlgorithm { actual: String },

    /// The encoded portion has the wrong length for its algorithm.
    #[error("invalid digest length: expected {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The encoded portion is not lowercase hex.
    #[error("invalid digest encoding: {0}")]
    InvalidEncoding(String),
}

impl DigestError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, DigestError::Empty)
    }

    /// Returns true if the input looked like a digest but its encoded part was malformed.
    pub fn is_encoding_error(&self) -> bool {
        matches!(
            self,
            DigestError::InvalidLength { .. } | DigestError::InvalidEncoding(_)
        )
    }
}
