//! # plfm-digest
//!
//! Content digests for the plfm-vt image tooling.
//!
//! ## Design Principles
//!
//! - Digests are the sole identity of stored content; two equal digests
//!   always name byte-identical content
//! - All digests have a canonical string representation with strict parsing
//! - Digests can be computed incrementally while content streams past
//!
//! ## Digest Format
//!
//! Digests use the OCI format: `{algorithm}:{encoded}`
//!
//! Example:
//! - `sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4`
//!
//! Only `sha256` is accepted; the encoded part is exactly 64 lowercase hex
//! characters.

mod error;
mod types;

pub use error::DigestError;
pub use types::{chain_id, Algorithm, Digest, Digester};
