//! Nydus artifact builders.
//!
//! An [`ArtifactBuilder`] does the format work the pipelines delegate:
//! converting a raw layer diff into a nydus blob, merging per-layer
//! bootstraps into one, and building a whole chain from mounted layers.
//! [`ExternalBuilder`] drives the `nydus-image` executable; [`MockBuilder`]
//! produces deterministic stand-in artifacts for tests.

pub mod bootstrap;
mod external;
mod mock;

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use plfm_digest::Digest;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cancel::{Cancellation, Cancelled};
use crate::content::{self, ContentError, ContentStore, Labels, ReaderAt};
use crate::image::compress::{self, CompressError};
use crate::image::{
    BuildLayer, Descriptor, MountError, ANNOTATION_NYDUS_BLOB,
    ANNOTATION_NYDUS_BOOTSTRAP, ANNOTATION_UNCOMPRESSED, MEDIA_TYPE_LAYER_GZIP,
    MEDIA_TYPE_NYDUS_BLOB,
};

pub use external::ExternalBuilder;
pub use mock::MockBuilder;

/// Environment variable overriding the builder executable.
pub const BUILDER_ENV: &str = "NYDUS_BUILDER";
/// Builder executable used when [`BUILDER_ENV`] is unset.
pub const DEFAULT_BUILDER: &str = "nydus-image";

/// Errors from artifact builders.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("content store: {0}")]
    Content(#[from] ContentError),

    #[error("compress artifact: {0}")]
    Compress(#[from] CompressError),

    #[error("mount layer {chain_id}: {source}")]
    Mount {
        chain_id: Digest,
        #[source]
        source: MountError,
    },

    #[error("spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} exited with {status}: {stderr}")]
    CommandFailed {
        path: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl BuilderError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            BuilderError::Cancelled(_) => true,
            BuilderError::Content(ContentError::Cancelled(_)) => true,
            BuilderError::Compress(CompressError::Cancelled(_)) => true,
            BuilderError::Mount { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// One input to a bootstrap merge.
pub struct MergeLayer {
    /// Digest of the layer's nydus blob.
    pub digest: Digest,
    /// The blob's content.
    pub reader: Box<dyn ReaderAt>,
}

/// Options for [`ArtifactBuilder::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Wrap the merged bootstrap in a tar under `image/image.boot`.
    pub with_tar: bool,
}

/// What a chain build produced for one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerArtifacts {
    pub bootstrap: Descriptor,
    /// Absent when the layer has no file data.
    pub blob: Option<Descriptor>,
}

/// Nydus format operations.
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    /// Convert a raw layer diff (tar, optionally gzip-compressed) into a
    /// nydus blob tar written to `dest`.
    async fn convert(
        &self,
        raw: &mut (dyn AsyncRead + Send + Unpin),
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &Cancellation,
    ) -> Result<(), BuilderError>;

    /// Merge the bootstraps of `layers`, ancestor first, into `dest`.
    async fn merge(
        &self,
        layers: &[MergeLayer],
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        options: MergeOptions,
        cancel: &Cancellation,
    ) -> Result<(), BuilderError>;

    /// Build artifacts for every layer of a chain, ancestor first.
    ///
    /// Returns one entry per input layer. Layers with a cache entry are
    /// reused; freshly built layers are committed and cached. Failing to
    /// cache a built layer is logged and does not fail the build.
    async fn build(
        &self,
        work_dir: &Path,
        builder_path: &Path,
        layers: &[BuildLayer],
        cancel: &Cancellation,
    ) -> Result<Vec<LayerArtifacts>, BuilderError>;
}

/// Gzip a bootstrap-only tar of `bootstrap` into the store.
pub async fn commit_bootstrap(
    store: &dyn ContentStore,
    staging_ref: &str,
    bootstrap: &[u8],
    cancel: &Cancellation,
) -> Result<Descriptor, BuilderError> {
    let tarball = bootstrap::pack_bootstrap(bootstrap)?;

    let mut writer = content::open_writer(store, staging_ref, cancel).await?;
    let mut source = tarball.as_slice();
    let compressed = compress::gzip_into(&mut source, writer.as_mut(), cancel).await?;

    let digest = writer.digest();
    let size = writer.offset();
    let uncompressed = compressed.uncompressed.to_string();

    let mut labels = Labels::new();
    labels.insert(ANNOTATION_UNCOMPRESSED.to_string(), uncompressed.clone());
    content::commit(writer, &digest, labels, cancel).await?;

    Ok(Descriptor::new(MEDIA_TYPE_LAYER_GZIP, digest, size)
        .with_annotation(ANNOTATION_UNCOMPRESSED, uncompressed)
        .with_annotation(ANNOTATION_NYDUS_BOOTSTRAP, "true"))
}

/// Store a nydus data blob.
pub async fn commit_blob<R>(
    store: &dyn ContentStore,
    staging_ref: &str,
    blob: &mut R,
    cancel: &Cancellation,
) -> Result<Descriptor, BuilderError>
where
    R: AsyncRead + Unpin + Send,
{
    let (digest, size) =
        content::write_blob(store, staging_ref, blob, Labels::new(), cancel).await?;
    Ok(nydus_blob(digest, size))
}

/// Descriptor of a nydus data blob.
pub fn nydus_blob(digest: Digest, size: u64) -> Descriptor {
    Descriptor::new(MEDIA_TYPE_NYDUS_BLOB, digest, size)
        .with_annotation(ANNOTATION_NYDUS_BLOB, "true")
}

/// Staging ref for a layer's built bootstrap.
fn bootstrap_ref(chain_id: &Digest) -> String {
    format!("nydus-bootstrap-{chain_id}")
}

/// Staging ref for a layer's built data blob.
fn blob_ref(chain_id: &Digest) -> String {
    format!("nydus-blob-{chain_id}")
}
