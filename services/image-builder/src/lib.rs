//! plfm-vt Image Builder Library
//!
//! The image builder turns OCI layer chains into nydus accelerated images.
//! It keeps every layer blob it has produced in a content-addressed store
//! and remembers, per layer, which blob variants and artifacts exist so
//! repeated work is skipped.
//!
//! ## Modules
//!
//! - `builder`: Artifact builders (the `nydus-image` executable, and a mock)
//! - `cancel`: Cooperative cancellation shared by every operation
//! - `content`: Content-addressed blob store
//! - `image`: Layer chains, blob resolution, bootstrap merge and chain build
//! - `state`: Local SQLite layer metadata

pub mod builder;
pub mod cancel;
pub mod content;
pub mod image;
pub mod state;

// Exposed for the binary and integration tests
pub mod config;
