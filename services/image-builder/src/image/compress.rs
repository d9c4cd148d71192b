//! Streaming gzip into the content store.
//!
//! Every chunk read from the source goes two ways: into the gzip encoder,
//! whose output is flushed to the content writer as it is produced, and into
//! a digester over the uncompressed bytes. Consumers record that uncompressed
//! digest as the layer's diff ID while only the compressed bytes are stored.

use std::io::{self, Write};

use flate2::write::GzEncoder;
use plfm_digest::{Digest, Digester};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cancel::{Cancellation, Cancelled};
use crate::content::{ContentError, ContentWriter, COPY_BUFFER_SIZE};

/// Errors from streaming compression.
#[derive(Debug, Error)]
pub enum CompressError {
    #[error("read uncompressed stream: {0}")]
    Read(#[source] io::Error),

    #[error("gzip: {0}")]
    Encode(#[source] io::Error),

    #[error("write compressed stream: {0}")]
    Write(#[source] ContentError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Outcome of [`gzip_into`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    /// Digest of the bytes read from the source.
    pub uncompressed: Digest,
    /// Number of bytes read from the source.
    pub uncompressed_size: u64,
}

/// Gzip everything from `reader` into `writer`.
pub async fn gzip_into<R>(
    reader: &mut R,
    writer: &mut dyn ContentWriter,
    cancel: &Cancellation,
) -> Result<Compressed, CompressError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(COPY_BUFFER_SIZE),
        flate2::Compression::default(),
    );
    let mut uncompressed = Digester::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = cancel
            .run(async { reader.read(&mut buf).await.map_err(CompressError::Read) })
            .await?;
        if n == 0 {
            break;
        }

        uncompressed.update(&buf[..n]);
        encoder.write_all(&buf[..n]).map_err(CompressError::Encode)?;

        if !encoder.get_ref().is_empty() {
            let chunk = std::mem::take(encoder.get_mut());
            write_chunk(writer, &chunk, cancel).await?;
        }
    }

    let tail = encoder.finish().map_err(CompressError::Encode)?;
    if !tail.is_empty() {
        write_chunk(writer, &tail, cancel).await?;
    }

    Ok(Compressed {
        uncompressed_size: uncompressed.written(),
        uncompressed: uncompressed.finalize(),
    })
}

async fn write_chunk(
    writer: &mut dyn ContentWriter,
    chunk: &[u8],
    cancel: &Cancellation,
) -> Result<(), CompressError> {
    cancel
        .run(async { writer.write(chunk).await.map_err(CompressError::Write) })
        .await
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::content::{ContentStore, LocalContentStore};
    use crate::image::{Descriptor, MEDIA_TYPE_LAYER_GZIP};

    #[tokio::test]
    async fn test_gzip_into_records_uncompressed_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::open(dir.path()).await.unwrap();
        let payload: Vec<u8> = b"bootstrap bytes ".repeat(10_000);

        let mut writer = store.writer("gzip-test").await.unwrap();
        let mut source = payload.as_slice();
        let out = gzip_into(&mut source, writer.as_mut(), &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(out.uncompressed, Digest::from_bytes(&payload));
        assert_eq!(out.uncompressed_size, payload.len() as u64);

        let compressed = writer.digest();
        assert_ne!(compressed, out.uncompressed);
        let size = writer.offset();
        writer
            .commit(&compressed, Default::default())
            .await
            .unwrap();

        let reader = store
            .reader_at(&Descriptor::new(MEDIA_TYPE_LAYER_GZIP, compressed, size))
            .await
            .unwrap();
        let mut decoded = Vec::new();
        GzDecoder::new(crate::content::SectionReader::new(reader.as_ref()))
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_gzip_into_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::open(dir.path()).await.unwrap();

        let mut digests = Vec::new();
        for i in 0..2 {
            let mut writer = store.writer(&format!("det-{i}")).await.unwrap();
            let mut source: &[u8] = b"same input";
            gzip_into(&mut source, writer.as_mut(), &Cancellation::never())
                .await
                .unwrap();
            digests.push(writer.digest());
        }
        assert_eq!(digests[0], digests[1]);
    }
}
