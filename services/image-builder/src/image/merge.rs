//! Merging a layer chain's nydus bootstraps into one artifact.
//!
//! The merge streams end to end. A producer task runs the builder's merge
//! into a bounded pipe; the consumer gzips the pipe into a content writer
//! staged under the chain's ref while digesting the uncompressed bytes. The
//! result is committed under its compressed digest, so merging the same
//! chain twice yields the same descriptor. Concurrent merges of one chain
//! take turns on the staging ref.

use std::io;
use std::sync::Arc;

use plfm_digest::Digest;
use thiserror::Error;
use tracing::{debug, info};

use super::compress::{self, CompressError};
use super::descriptor::{
    Compression, Descriptor, ANNOTATION_NYDUS_BLOB_IDS, ANNOTATION_NYDUS_BOOTSTRAP,
    ANNOTATION_UNCOMPRESSED, MEDIA_TYPE_LAYER_GZIP,
};
use super::layer::Layer;
use super::pipe::{pipe, Producer, DEFAULT_PIPE_CAPACITY};
use super::resolve::{BlobResolver, ResolveError};
use crate::builder::{ArtifactBuilder, MergeLayer, MergeOptions};
use crate::cancel::{Cancellation, Cancelled};
use crate::content::{self, ContentError, ContentStore, Labels};

/// Merge settings.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Buffer size of the pipe between merge and compression.
    pub pipe_capacity: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

/// Errors from merging a chain.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("chain to merge can't be empty")]
    EmptyChain,

    #[error("get compression blob {compression} for layer {chain_id}: {source}")]
    ResolveBlob {
        compression: Compression,
        chain_id: Digest,
        #[source]
        source: ResolveError,
    },

    #[error("get reader for compression blob {digest}: {source}")]
    OpenReader {
        digest: Digest,
        #[source]
        source: ContentError,
    },

    #[error("open content store writer: {0}")]
    OpenWriter(#[source] ContentError),

    #[error("copy bootstrap targz into content store: {0}")]
    Copy(#[source] CompressError),

    #[error("merge nydus bootstrap: {0}")]
    Producer(#[source] io::Error),

    #[error("commit to content store: {0}")]
    Commit(#[source] ContentError),

    #[error("get info from content store: {0}")]
    Info(#[source] ContentError),

    #[error("marshal blob ids: {0}")]
    MarshalBlobIds(#[source] serde_json::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl MergeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MergeError::Cancelled(_))
    }
}

/// Route content store cancellation to [`MergeError::Cancelled`].
fn content_err(wrap: fn(ContentError) -> MergeError) -> impl Fn(ContentError) -> MergeError {
    move |err| match err {
        ContentError::Cancelled(c) => MergeError::Cancelled(c),
        other => wrap(other),
    }
}

/// Merges the bootstraps of layer chains.
pub struct ChainMerger {
    content: Arc<dyn ContentStore>,
    resolver: Arc<BlobResolver>,
    builder: Arc<dyn ArtifactBuilder>,
    config: MergeConfig,
}

impl ChainMerger {
    pub fn new(
        content: Arc<dyn ContentStore>,
        resolver: Arc<BlobResolver>,
        builder: Arc<dyn ArtifactBuilder>,
        config: MergeConfig,
    ) -> Self {
        Self {
            content,
            resolver,
            builder,
            config,
        }
    }

    /// Merge the bootstraps of `chain`, ancestor first.
    ///
    /// Returns the descriptor of the committed gzip artifact, annotated with
    /// its uncompressed digest, the bootstrap marker and the hex digests of
    /// the chain's nydus blobs in layer order.
    pub async fn merge(
        &self,
        chain: &[Layer],
        cancel: &Cancellation,
    ) -> Result<Descriptor, MergeError> {
        let Some(terminal) = chain.last() else {
            return Err(MergeError::EmptyChain);
        };
        let chain_id = terminal.chain_id();

        info!(chain_id = %chain_id, layers = chain.len(), "Merging nydus bootstraps");

        let mut layers = Vec::with_capacity(chain.len());
        let mut blob_ids = Vec::with_capacity(chain.len());
        for layer in chain {
            let blob = self
                .resolver
                .blob_with_compression_with_retry(layer, Compression::Nydus, cancel)
                .await
                .map_err(|source| match source {
                    ResolveError::Cancelled(c) => MergeError::Cancelled(c),
                    source => MergeError::ResolveBlob {
                        compression: Compression::Nydus,
                        chain_id: layer.chain_id().clone(),
                        source,
                    },
                })?;

            let reader = cancel
                .run(self.content.reader_at(&blob))
                .await
                .map_err(|source| match source {
                    ContentError::Cancelled(c) => MergeError::Cancelled(c),
                    source => MergeError::OpenReader {
                        digest: blob.digest.clone(),
                        source,
                    },
                })?;

            debug!(chain_id = %layer.chain_id(), blob = %blob.digest, "Merge input resolved");
            blob_ids.push(blob.digest.hex().to_string());
            layers.push(MergeLayer {
                digest: blob.digest,
                reader,
            });
        }

        let staging_ref = format!("nydus-merge-{chain_id}");
        let mut writer = content::open_writer(self.content.as_ref(), &staging_ref, cancel)
            .await
            .map_err(content_err(MergeError::OpenWriter))?;

        let (mut reader, pipe_writer) = pipe(self.config.pipe_capacity);
        let builder = Arc::clone(&self.builder);
        let producer_cancel = cancel.clone();
        let producer = Producer::spawn(async move {
            let mut pipe_writer = pipe_writer;
            let result = builder
                .merge(
                    &layers,
                    &mut pipe_writer,
                    MergeOptions { with_tar: true },
                    &producer_cancel,
                )
                .await
                .map_err(|e| io::Error::other(format!("merge nydus bootstrap: {e}")));
            pipe_writer.finish(result).await;
        });

        // On any early return the producer is aborted and the uncommitted
        // ingest is discarded with the writer.
        let compressed = compress::gzip_into(&mut reader, writer.as_mut(), cancel)
            .await
            .map_err(|err| match err {
                CompressError::Cancelled(c) | CompressError::Write(ContentError::Cancelled(c)) => {
                    MergeError::Cancelled(c)
                }
                err => MergeError::Copy(err),
            })?;
        producer.join().await.map_err(MergeError::Producer)?;

        let digest = writer.digest();
        let uncompressed = compressed.uncompressed.to_string();
        let mut labels = Labels::new();
        labels.insert(ANNOTATION_UNCOMPRESSED.to_string(), uncompressed.clone());
        content::commit(writer, &digest, labels, cancel)
            .await
            .map_err(content_err(MergeError::Commit))?;

        let info = cancel
            .run(self.content.info(&digest))
            .await
            .map_err(content_err(MergeError::Info))?;

        let blob_ids = serde_json::to_string(&blob_ids).map_err(MergeError::MarshalBlobIds)?;

        info!(
            chain_id = %chain_id,
            digest = %digest,
            size = info.size,
            uncompressed = %uncompressed,
            "Merged nydus bootstrap committed"
        );

        Ok(Descriptor::new(MEDIA_TYPE_LAYER_GZIP, digest, info.size)
            .with_annotation(ANNOTATION_UNCOMPRESSED, uncompressed)
            .with_annotation(ANNOTATION_NYDUS_BOOTSTRAP, "true")
            .with_annotation(ANNOTATION_NYDUS_BLOB_IDS, blob_ids))
    }
}
