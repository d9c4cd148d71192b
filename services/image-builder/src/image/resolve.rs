//! Resolving a layer's blob in a requested compression.
//!
//! Candidates are tried in order: the layer's own diff, the blob in its
//! primary slot, then the variant linked for the compression. The first one
//! that is in that compression and still present in the content store wins.
//! Failing that, the blob is converted from the diff, committed and linked
//! as the variant so later lookups find it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use plfm_digest::Digest;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::compress::{self, CompressError};
use super::descriptor::{
    Compression, Descriptor, ANNOTATION_UNCOMPRESSED, MEDIA_TYPE_LAYER_GZIP,
};
use super::layer::Layer;
use super::pipe::{pipe, Producer, DEFAULT_PIPE_CAPACITY};
use crate::builder::{nydus_blob, ArtifactBuilder};
use crate::cancel::{Cancellation, Cancelled};
use crate::content::{self, ContentError, ContentStore, Labels, ReaderAtStream};
use crate::state::{LayerStore, StateStoreError, PRIMARY_SLOT};

/// Retry settings for blob resolution.
#[derive(Debug, Clone)]
pub struct ResolveConfig {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
    /// Buffer size of the conversion pipe.
    pub pipe_capacity: usize,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            retry_delay: Duration::from_secs(1),
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

/// Errors from blob resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("layer state: {0}")]
    State(#[from] StateStoreError),

    #[error("content store: {0}")]
    Content(#[source] ContentError),

    #[error("no way to convert {from} layer {chain_id} to {to}")]
    Unconvertible {
        chain_id: Digest,
        from: String,
        to: Compression,
    },

    #[error("convert layer {chain_id} to {to}: {source}")]
    Convert {
        chain_id: Digest,
        to: Compression,
        #[source]
        source: io::Error,
    },

    #[error("compress layer: {0}")]
    Compress(#[source] CompressError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl From<ContentError> for ResolveError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::Cancelled(c) => ResolveError::Cancelled(c),
            other => ResolveError::Content(other),
        }
    }
}

impl From<CompressError> for ResolveError {
    fn from(err: CompressError) -> Self {
        match err {
            CompressError::Cancelled(c) => ResolveError::Cancelled(c),
            CompressError::Write(ContentError::Cancelled(c)) => ResolveError::Cancelled(c),
            other => ResolveError::Compress(other),
        }
    }
}

impl ResolveError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResolveError::Cancelled(_))
    }
}

/// Finds or produces layer blobs in a given compression.
pub struct BlobResolver {
    content: Arc<dyn ContentStore>,
    state: Arc<LayerStore>,
    builder: Arc<dyn ArtifactBuilder>,
    config: ResolveConfig,
}

impl BlobResolver {
    pub fn new(
        content: Arc<dyn ContentStore>,
        state: Arc<LayerStore>,
        builder: Arc<dyn ArtifactBuilder>,
        config: ResolveConfig,
    ) -> Self {
        Self {
            content,
            state,
            builder,
            config,
        }
    }

    /// Get the layer's blob in `compression`, converting it if needed.
    pub async fn blob_with_compression(
        &self,
        layer: &Layer,
        compression: Compression,
        cancel: &Cancellation,
    ) -> Result<Descriptor, ResolveError> {
        cancel.check()?;

        if let Some(found) = self.find(layer, compression).await? {
            debug!(
                chain_id = %layer.chain_id(),
                compression = %compression,
                digest = %found.digest,
                "Found layer blob"
            );
            return Ok(found);
        }

        let converted = match compression {
            Compression::Nydus => self.convert_nydus(layer, cancel).await?,
            Compression::Gzip => self.convert_gzip(layer, cancel).await?,
            Compression::Uncompressed => {
                return Err(ResolveError::Unconvertible {
                    chain_id: layer.chain_id().clone(),
                    from: layer.diff().media_type.clone(),
                    to: compression,
                })
            }
        };

        self.state
            .link_blob(layer.chain_id(), compression.as_str(), &converted)?;

        info!(
            chain_id = %layer.chain_id(),
            compression = %compression,
            digest = %converted.digest,
            "Converted layer blob"
        );
        Ok(converted)
    }

    /// [`Self::blob_with_compression`] with bounded retries.
    ///
    /// Cancellation is never retried. After the last attempt its error is
    /// returned.
    pub async fn blob_with_compression_with_retry(
        &self,
        layer: &Layer,
        compression: Compression,
        cancel: &Cancellation,
    ) -> Result<Descriptor, ResolveError> {
        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.blob_with_compression(layer, compression, cancel).await {
                Ok(desc) => return Ok(desc),
                Err(err) if err.is_cancelled() || attempt >= attempts => return Err(err),
                Err(err) => {
                    warn!(
                        chain_id = %layer.chain_id(),
                        compression = %compression,
                        attempt,
                        attempts,
                        error = %err,
                        "Resolving layer blob failed, retrying"
                    );
                    cancel.sleep(self.config.retry_delay).await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn find(
        &self,
        layer: &Layer,
        compression: Compression,
    ) -> Result<Option<Descriptor>, ResolveError> {
        let chain_id = layer.chain_id();
        let mut candidates = vec![layer.diff().clone()];
        candidates.extend(self.state.get_blob(chain_id, PRIMARY_SLOT)?);
        candidates.extend(self.state.get_blob(chain_id, compression.as_str())?);

        for candidate in candidates {
            // A bootstrap describes a chain; it never stands in for a layer blob.
            if candidate.is_nydus_bootstrap() || Compression::of(&candidate) != Some(compression) {
                continue;
            }
            match self.content.info(&candidate.digest).await {
                Ok(_) => return Ok(Some(candidate)),
                Err(e) if e.is_not_found() => {
                    debug!(
                        chain_id = %chain_id,
                        digest = %candidate.digest,
                        "Layer blob candidate missing from content store"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn convert_nydus(
        &self,
        layer: &Layer,
        cancel: &Cancellation,
    ) -> Result<Descriptor, ResolveError> {
        let chain_id = layer.chain_id();
        let raw = self.content.reader_at(layer.diff()).await?;
        let staging_ref = format!("convert-{}-{chain_id}", Compression::Nydus);
        let mut writer = content::open_writer(self.content.as_ref(), &staging_ref, cancel).await?;

        let (mut reader, pipe_writer) = pipe(self.config.pipe_capacity);
        let builder = Arc::clone(&self.builder);
        let producer_cancel = cancel.clone();
        let producer = Producer::spawn(async move {
            let mut pipe_writer = pipe_writer;
            let mut raw = ReaderAtStream::new(raw);
            let result = builder
                .convert(&mut raw, &mut pipe_writer, &producer_cancel)
                .await
                .map_err(|e| io::Error::other(format!("convert to nydus: {e}")));
            pipe_writer.finish(result).await;
        });

        let convert_err = |source: io::Error| ResolveError::Convert {
            chain_id: chain_id.clone(),
            to: Compression::Nydus,
            source,
        };

        // Dropping the producer on error aborts it.
        match content::copy_into(&mut reader, writer.as_mut(), cancel).await {
            Ok(_) => {}
            Err(ContentError::Io(e)) => return Err(convert_err(e)),
            Err(e) => return Err(e.into()),
        }
        producer.join().await.map_err(convert_err)?;

        let digest = writer.digest();
        let size = writer.offset();
        content::commit(writer, &digest, Labels::new(), cancel).await?;

        Ok(nydus_blob(digest, size))
    }

    async fn convert_gzip(
        &self,
        layer: &Layer,
        cancel: &Cancellation,
    ) -> Result<Descriptor, ResolveError> {
        let diff = layer.diff();
        if Compression::of(diff) != Some(Compression::Uncompressed) {
            return Err(ResolveError::Unconvertible {
                chain_id: layer.chain_id().clone(),
                from: diff.media_type.clone(),
                to: Compression::Gzip,
            });
        }

        let raw = self.content.reader_at(diff).await?;
        let staging_ref = format!("convert-{}-{}", Compression::Gzip, layer.chain_id());
        let mut writer = content::open_writer(self.content.as_ref(), &staging_ref, cancel).await?;

        let mut source = ReaderAtStream::new(raw);
        let compressed = compress::gzip_into(&mut source, writer.as_mut(), cancel).await?;

        let digest = writer.digest();
        let size = writer.offset();
        let uncompressed = compressed.uncompressed.to_string();
        let mut labels = Labels::new();
        labels.insert(ANNOTATION_UNCOMPRESSED.to_string(), uncompressed.clone());
        content::commit(writer, &digest, labels, cancel).await?;

        Ok(Descriptor::new(MEDIA_TYPE_LAYER_GZIP, digest, size)
            .with_annotation(ANNOTATION_UNCOMPRESSED, uncompressed))
    }
}
