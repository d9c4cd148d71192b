//! Image layers and their accelerated artifacts.
//!
//! This module handles:
//! - Layer chains and their chain IDs
//! - Resolving a layer's blob in a wanted compression, converting on demand
//! - Merging a chain's nydus bootstraps into one gzip artifact
//! - Building per-layer nydus artifacts with a per-layer cache

pub mod cache;
pub mod chain;
pub mod compress;
pub mod descriptor;
pub mod layer;
pub mod merge;
pub mod pipe;
pub mod resolve;

pub use cache::{BlobRecord, CacheError, CachedArtifacts, LayerCache};
pub use chain::{BuildLayer, ChainBuilder, ChainBuilderConfig, ChainError, LayerMount, MountError};
pub use descriptor::{
    Compression, Descriptor, ANNOTATION_NYDUS_BLOB, ANNOTATION_NYDUS_BLOB_IDS,
    ANNOTATION_NYDUS_BOOTSTRAP, ANNOTATION_UNCOMPRESSED, MEDIA_TYPE_DOCKER_LAYER,
    MEDIA_TYPE_DOCKER_LAYER_GZIP, MEDIA_TYPE_LAYER, MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_LAYER_ZSTD,
    MEDIA_TYPE_NYDUS_BLOB,
};
pub use layer::{Layer, LayerChain, LayerError};
pub use merge::{ChainMerger, MergeConfig, MergeError};
pub use resolve::{BlobResolver, ResolveConfig, ResolveError};
