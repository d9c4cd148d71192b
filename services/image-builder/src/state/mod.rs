//! Local state persistence for the image builder.
//!
//! This module provides SQLite-based storage for:
//! - Layer properties (string key/value pairs per chain ID)
//! - Layer blob links (the primary blob and per-compression variants)
//!
//! Entries are never deleted here; they go away with the content they
//! point at.

mod store;

pub use store::{LayerStore, LayerUpdate, StateStoreError, PRIMARY_SLOT};
