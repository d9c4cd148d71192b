//! Content-addressed blob store.
//!
//! The store is consumed through three operations: a random-access reader by
//! descriptor, a streaming writer bound to a staging ref that commits under a
//! digest, and an info lookup. Commits are idempotent at the digest level:
//! committing content that already exists reports
//! [`ContentError::AlreadyExists`], which callers treat as success.

mod local;

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use plfm_digest::Digest;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::debug;

use crate::cancel::{Cancellation, Cancelled};
use crate::image::Descriptor;

pub use local::LocalContentStore;

/// Labels attached to committed content.
pub type Labels = BTreeMap<String, String>;

/// Chunk size for streaming copies.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

const WRITER_BACKOFF_START: Duration = Duration::from_millis(16);
const WRITER_BACKOFF_MAX: Duration = Duration::from_millis(2048);

/// Errors from content store operations.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("content not found: {0}")]
    NotFound(String),

    #[error("content already exists: {0}")]
    AlreadyExists(Digest),

    #[error("staging ref is locked by another writer: {0}")]
    Locked(String),

    #[error("invalid staging ref: {0}")]
    InvalidRef(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ContentError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContentError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ContentError::AlreadyExists(_))
    }
}

/// Metadata about committed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub digest: Digest,
    pub size: u64,
    pub labels: Labels,
}

/// Random-access reader over committed content.
pub trait ReaderAt: Send + Sync {
    /// Read into `buf` starting at `offset`; returns 0 at end of content.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Total content size.
    fn size(&self) -> u64;
}

impl ReaderAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.len());
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }
}

/// Sequential [`Read`] over a [`ReaderAt`].
pub struct SectionReader<'a> {
    inner: &'a dyn ReaderAt,
    offset: u64,
}

impl<'a> SectionReader<'a> {
    pub fn new(inner: &'a dyn ReaderAt) -> Self {
        Self { inner, offset: 0 }
    }
}

impl Read for SectionReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.inner.size() {
            return Ok(0);
        }
        let n = self.inner.read_at(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// [`AsyncRead`] over an owned [`ReaderAt`].
///
/// Reads are served synchronously; store readers are local files or memory.
pub struct ReaderAtStream {
    inner: Box<dyn ReaderAt>,
    offset: u64,
}

impl ReaderAtStream {
    pub fn new(inner: Box<dyn ReaderAt>) -> Self {
        Self { inner, offset: 0 }
    }
}

impl AsyncRead for ReaderAtStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset >= self.inner.size() {
            return Poll::Ready(Ok(()));
        }
        let offset = self.offset;
        let n = self.inner.read_at(buf.initialize_unfilled(), offset)?;
        buf.advance(n);
        self.offset += n as u64;
        Poll::Ready(Ok(()))
    }
}

/// Streaming writer bound to a staging ref.
#[async_trait]
pub trait ContentWriter: Send {
    /// Append bytes.
    async fn write(&mut self, data: &[u8]) -> Result<(), ContentError>;

    /// Digest of everything written so far.
    fn digest(&self) -> Digest;

    /// Number of bytes written so far.
    fn offset(&self) -> u64;

    /// Commit the written bytes under `expected` with `labels`.
    ///
    /// Returns [`ContentError::AlreadyExists`] if the digest is already stored.
    async fn commit(self: Box<Self>, expected: &Digest, labels: Labels)
        -> Result<(), ContentError>;
}

/// Content-addressed blob store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Open a random-access reader for committed content.
    async fn reader_at(&self, desc: &Descriptor) -> Result<Box<dyn ReaderAt>, ContentError>;

    /// Open a writer on a staging ref. A ref held by a live writer is `Locked`.
    async fn writer(&self, staging_ref: &str) -> Result<Box<dyn ContentWriter>, ContentError>;

    /// Look up committed content.
    async fn info(&self, digest: &Digest) -> Result<ContentInfo, ContentError>;
}

/// Open a writer, waiting with backoff while another writer holds the ref.
pub async fn open_writer(
    store: &dyn ContentStore,
    staging_ref: &str,
    cancel: &Cancellation,
) -> Result<Box<dyn ContentWriter>, ContentError> {
    let mut backoff = WRITER_BACKOFF_START;
    loop {
        match cancel.run(store.writer(staging_ref)).await {
            Err(ContentError::Locked(_)) => {
                debug!(
                    staging_ref = %staging_ref,
                    backoff_ms = backoff.as_millis() as u64,
                    "Staging ref locked, waiting"
                );
                cancel.sleep(backoff).await?;
                backoff = (backoff * 2).min(WRITER_BACKOFF_MAX);
            }
            other => return other,
        }
    }
}

/// Commit a writer, treating "already exists" as success.
pub async fn commit(
    writer: Box<dyn ContentWriter>,
    expected: &Digest,
    labels: Labels,
    cancel: &Cancellation,
) -> Result<(), ContentError> {
    match cancel.run(writer.commit(expected, labels)).await {
        Err(ContentError::AlreadyExists(digest)) => {
            debug!(digest = %digest, "Content already exists");
            Ok(())
        }
        other => other,
    }
}

/// Stream `reader` into the store under `staging_ref` and commit it.
///
/// Returns the committed digest and size.
pub async fn write_blob<R>(
    store: &dyn ContentStore,
    staging_ref: &str,
    reader: &mut R,
    labels: Labels,
    cancel: &Cancellation,
) -> Result<(Digest, u64), ContentError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut writer = open_writer(store, staging_ref, cancel).await?;
    copy_into(reader, writer.as_mut(), cancel).await?;

    let digest = writer.digest();
    let size = writer.offset();
    commit(writer, &digest, labels, cancel).await?;
    Ok((digest, size))
}

/// Copy `reader` to end of stream into `writer` without committing.
///
/// Returns the number of bytes copied.
pub async fn copy_into<R>(
    reader: &mut R,
    writer: &mut dyn ContentWriter,
    cancel: &Cancellation,
) -> Result<u64, ContentError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = cancel
            .run(async { reader.read(&mut buf).await.map_err(ContentError::from) })
            .await?;
        if n == 0 {
            return Ok(copied);
        }
        cancel.run(writer.write(&buf[..n])).await?;
        copied += n as u64;
    }
}
