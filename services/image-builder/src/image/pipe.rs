//! Bounded in-memory pipe between a producer task and a consumer.
//!
//! The byte channel is a `tokio::io::duplex` with a fixed buffer, so a fast
//! producer blocks until the consumer catches up. The producer closes the
//! pipe either cleanly or with an error; in the error case the consumer's
//! next read at end of stream returns that error instead of a clean EOF.
//!
//! A [`Producer`] is the task feeding a pipe. It is aborted when dropped,
//! so a consumer that gives up never leaves the producer blocked on a full
//! buffer.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Default pipe buffer size.
pub const DEFAULT_PIPE_CAPACITY: usize = 256 * 1024;

/// Create a pipe whose buffer holds at most `capacity` bytes.
pub fn pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    let (read_half, write_half) = tokio::io::duplex(capacity.max(1));
    let (err_tx, err_rx) = oneshot::channel();
    (
        PipeReader {
            inner: read_half,
            closed: err_rx,
            failed: false,
        },
        PipeWriter {
            inner: write_half,
            closed: Some(err_tx),
        },
    )
}

/// Producer end of a [`pipe`].
pub struct PipeWriter {
    inner: DuplexStream,
    closed: Option<oneshot::Sender<io::Error>>,
}

impl PipeWriter {
    /// Close the pipe cleanly; the reader sees EOF after the buffered bytes.
    pub async fn close(mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    /// Close the pipe with an error; the reader gets `err` at end of stream.
    pub fn close_with_error(mut self, err: io::Error) {
        if let Some(tx) = self.closed.take() {
            let _ = tx.send(err);
        }
    }

    /// Close cleanly on `Ok`, with the error otherwise.
    pub async fn finish(self, result: io::Result<()>) {
        match result {
            Ok(()) => {
                // A consumer that already went away has nothing left to tell.
                let _ = self.close().await;
            }
            Err(err) => self.close_with_error(err),
        }
    }
}

/// Background task writing into a pipe.
pub struct Producer {
    handle: Option<JoinHandle<()>>,
}

impl Producer {
    /// Spawn `task` on the runtime.
    pub fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(task)),
        }
    }

    /// Wait for the task; a panic or abort becomes an error.
    pub async fn join(mut self) -> io::Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.await.map_err(|e| {
            if e.is_panic() {
                io::Error::other("producer task panicked")
            } else {
                io::Error::other("producer task aborted")
            }
        })
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Consumer end of a [`pipe`].
pub struct PipeReader {
    inner: DuplexStream,
    closed: oneshot::Receiver<io::Error>,
    failed: bool,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.failed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe closed with error",
            )));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;

        let at_eof = buf.filled().len() == before && buf.remaining() > 0;
        if at_eof {
            // The producer sends its error before dropping its half, so it is
            // already here once the reader observes end of stream.
            if let Ok(err) = self.closed.try_recv() {
                self.failed = true;
                return Poll::Ready(Err(err));
            }
        }

        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_clean_close_yields_all_bytes() {
        let (mut reader, mut writer) = pipe(8);

        let producer = tokio::spawn(async move {
            writer.write_all(b"0123456789abcdef").await.unwrap();
            writer.close().await.unwrap();
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        producer.await.unwrap();

        assert_eq!(out, b"0123456789abcdef");
    }

    #[tokio::test]
    async fn test_close_with_error_surfaces_on_read() {
        let (mut reader, mut writer) = pipe(64);

        tokio::spawn(async move {
            writer.write_all(b"partial").await.unwrap();
            writer.close_with_error(io::Error::other("merge exploded"));
        });

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert!(err.to_string().contains("merge exploded"));
    }

    #[tokio::test]
    async fn test_dropped_writer_is_clean_eof() {
        let (mut reader, writer) = pipe(64);
        drop(writer);

        let mut out = Vec::new();
        assert_eq!(reader.read_to_end(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_producer_panic_is_reported() {
        let producer = Producer::spawn(async { panic!("boom") });
        let err = producer.join().await.unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn test_dropped_producer_is_aborted() {
        let (mut reader, mut writer) = pipe(4);
        let producer = Producer::spawn(async move {
            let _ = writer.write_all(&[0u8; 64]).await;
            writer.finish(Ok(())).await;
        });
        drop(producer);

        // The aborted task drops its writer, so the reader sees EOF.
        let mut out = Vec::new();
        tokio::time::timeout(std::time::Duration::from_secs(1), reader.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert!(out.len() <= 64);
    }

    #[tokio::test]
    async fn test_finish_with_error() {
        let (mut reader, writer) = pipe(16);
        Producer::spawn(async move {
            writer.finish(Err(io::Error::other("bad layer"))).await;
        })
        .join()
        .await
        .unwrap();

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert!(err.to_string().contains("bad layer"));
    }

    #[tokio::test]
    async fn test_writer_blocks_when_buffer_full() {
        let (mut reader, mut writer) = pipe(4);

        let write = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            writer.write_all(b"more than four bytes"),
        )
        .await;
        assert!(write.is_err(), "writer should wait for the reader");

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"more");
    }
}
