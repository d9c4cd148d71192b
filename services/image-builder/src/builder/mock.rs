//! Mock artifact builder for testing.
//!
//! Produces deterministic stand-ins for nydus artifacts without the
//! `nydus-image` executable:
//!
//! - a converted blob is a tar whose `image/image.blob` is the concatenated
//!   file data of the layer and whose `image/image.boot` lists each file as
//!   `<path> <offset> <size>`;
//! - a merged bootstrap is, per layer, a `# <blob digest>` line followed by
//!   that layer's bootstrap;
//! - a built bootstrap is the parent's bootstrap followed by one
//!   `<chain id> <path> <offset> <size>` line per file of the layer.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::bootstrap::{self, BLOB_ENTRY, BOOTSTRAP_ENTRY};
use super::{
    blob_ref, bootstrap_ref, commit_blob, commit_bootstrap, ArtifactBuilder, BuilderError,
    LayerArtifacts, MergeLayer, MergeOptions,
};
use crate::cancel::Cancellation;
use crate::image::BuildLayer;

/// Mock builder.
#[derive(Debug, Default)]
pub struct MockBuilder {
    converts: AtomicUsize,
    merges: AtomicUsize,
    layers_built: AtomicUsize,

    /// Whether merges should fail after writing part of their output.
    fail_merges: AtomicBool,

    /// Number of upcoming converts that fail.
    convert_failures: AtomicUsize,
}

impl MockBuilder {
    /// Create a new mock builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock builder whose merges fail.
    pub fn failing_merge() -> Self {
        let builder = Self::new();
        builder.fail_merges.store(true, Ordering::SeqCst);
        builder
    }

    /// Make the next `n` converts fail.
    pub fn fail_next_converts(&self, n: usize) {
        self.convert_failures.store(n, Ordering::SeqCst);
    }

    /// Number of converts started.
    pub fn converts(&self) -> usize {
        self.converts.load(Ordering::SeqCst)
    }

    /// Number of merges started.
    pub fn merges(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }

    /// Number of layers built from a mount, cache hits excluded.
    pub fn layers_built(&self) -> usize {
        self.layers_built.load(Ordering::SeqCst)
    }

    fn take_convert_failure(&self) -> bool {
        self.convert_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ArtifactBuilder for MockBuilder {
    async fn convert(
        &self,
        raw: &mut (dyn AsyncRead + Send + Unpin),
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &Cancellation,
    ) -> Result<(), BuilderError> {
        self.converts.fetch_add(1, Ordering::SeqCst);
        if self.take_convert_failure() {
            return Err(BuilderError::Failed(
                "mock builder configured to fail converts".to_string(),
            ));
        }

        let mut data = Vec::new();
        cancel
            .run(async { raw.read_to_end(&mut data).await.map_err(BuilderError::from) })
            .await?;

        let files = bootstrap::layer_files(&data)?;
        let (blob, boot) = lay_out(&files, "");
        let tarball = bootstrap::pack(&[
            (BLOB_ENTRY, blob.as_slice()),
            (BOOTSTRAP_ENTRY, boot.as_slice()),
        ])?;

        debug!(files = files.len(), blob_size = blob.len(), "[MOCK] Converted layer");
        write_out(dest, &tarball, cancel).await
    }

    async fn merge(
        &self,
        layers: &[MergeLayer],
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        options: MergeOptions,
        cancel: &Cancellation,
    ) -> Result<(), BuilderError> {
        self.merges.fetch_add(1, Ordering::SeqCst);

        let mut merged = Vec::new();
        for layer in layers {
            cancel.check()?;
            let boot = bootstrap::extract_bootstrap(layer.reader.as_ref())?;
            merged.extend_from_slice(format!("# {}\n", layer.digest).as_bytes());
            merged.extend_from_slice(&boot);
        }

        if self.fail_merges.load(Ordering::SeqCst) {
            write_out(dest, &merged[..merged.len() / 2], cancel).await?;
            return Err(BuilderError::Failed(
                "mock builder configured to fail merges".to_string(),
            ));
        }

        let out = if options.with_tar {
            bootstrap::pack_bootstrap(&merged)?
        } else {
            merged
        };

        info!(layers = layers.len(), size = out.len(), "[MOCK] Merged bootstraps");
        write_out(dest, &out, cancel).await
    }

    async fn build(
        &self,
        _work_dir: &Path,
        _builder_path: &Path,
        layers: &[BuildLayer],
        cancel: &Cancellation,
    ) -> Result<Vec<LayerArtifacts>, BuilderError> {
        let mut parent = Vec::new();
        let mut built = Vec::with_capacity(layers.len());

        for layer in layers {
            cancel.check()?;
            let chain_id = layer.layer().chain_id();
            let store = layer.content_store();

            if let Some(cached) = layer.cache_get().await {
                let reader = store.reader_at(&cached.bootstrap).await?;
                parent = bootstrap::extract_bootstrap(reader.as_ref())?;
                built.push(LayerArtifacts {
                    bootstrap: cached.bootstrap.clone(),
                    blob: cached.blob().cloned(),
                });
                continue;
            }

            let mount = layer
                .mount(cancel)
                .await
                .map_err(|source| BuilderError::Mount {
                    chain_id: chain_id.clone(),
                    source,
                })?;
            let files = walk_files(mount.path())?;
            let (blob, own) = lay_out(&files, &chain_id.to_string());
            let mut boot = parent;
            boot.extend_from_slice(&own);
            self.layers_built.fetch_add(1, Ordering::SeqCst);

            let bootstrap =
                commit_bootstrap(store, &bootstrap_ref(chain_id), &boot, cancel).await?;
            let blob = if blob.is_empty() {
                None
            } else {
                let mut source = blob.as_slice();
                Some(commit_blob(store, &blob_ref(chain_id), &mut source, cancel).await?)
            };

            let artifacts = LayerArtifacts { bootstrap, blob };
            if let Err(e) = layer.cache_set(&artifacts).await {
                warn!(chain_id = %chain_id, error = %e, "[MOCK] Failed to cache layer artifacts");
            }

            debug!(chain_id = %chain_id, files = files.len(), "[MOCK] Built layer");
            parent = boot;
            built.push(artifacts);
        }

        Ok(built)
    }
}

/// Concatenate file data into a blob and describe it in a bootstrap.
fn lay_out(files: &[(String, Vec<u8>)], prefix: &str) -> (Vec<u8>, Vec<u8>) {
    let mut blob = Vec::new();
    let mut boot = Vec::new();
    for (path, data) in files {
        let line = if prefix.is_empty() {
            format!("{path} {} {}\n", blob.len(), data.len())
        } else {
            format!("{prefix} {path} {} {}\n", blob.len(), data.len())
        };
        boot.extend_from_slice(line.as_bytes());
        blob.extend_from_slice(data);
    }
    (blob, boot)
}

/// Regular files under `root` as (relative path, contents), sorted by path.
fn walk_files(root: &Path) -> io::Result<Vec<(String, Vec<u8>)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .map_err(io::Error::other)?
                    .to_string_lossy()
                    .into_owned();
                files.push((rel, fs::read(&path)?));
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

async fn write_out(
    dest: &mut (dyn AsyncWrite + Send + Unpin),
    data: &[u8],
    cancel: &Cancellation,
) -> Result<(), BuilderError> {
    cancel
        .run(async {
            dest.write_all(data).await?;
            dest.flush().await.map_err(BuilderError::from)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lay_out_offsets() {
        let files = vec![
            ("a".to_string(), b"xx".to_vec()),
            ("b/c".to_string(), b"yyy".to_vec()),
        ];
        let (blob, boot) = lay_out(&files, "");
        assert_eq!(blob, b"xxyyy");
        assert_eq!(boot, b"a 0 2\nb/c 2 3\n");
    }

    #[test]
    fn test_walk_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("z/y")).unwrap();
        fs::write(dir.path().join("z/y/file"), b"1").unwrap();
        fs::write(dir.path().join("a"), b"2").unwrap();

        let files = walk_files(dir.path()).unwrap();
        let paths: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["a", "z/y/file"]);
    }

    #[tokio::test]
    async fn test_mock_convert_produces_blob_and_bootstrap() {
        let builder = MockBuilder::new();
        let layer =
            bootstrap::pack(&[("etc/hosts", &b"127.0.0.1"[..]), ("bin/sh", &b"#!"[..])]).unwrap();

        let mut raw = layer.as_slice();
        let mut out = Vec::new();
        builder
            .convert(&mut raw, &mut out, &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(bootstrap::extract_entry(&out, BLOB_ENTRY).unwrap(), b"127.0.0.1#!");
        assert_eq!(
            bootstrap::extract_bootstrap(&out).unwrap(),
            b"etc/hosts 0 9\nbin/sh 9 2\n"
        );
        assert_eq!(builder.converts(), 1);
    }

    #[tokio::test]
    async fn test_mock_convert_failures_are_counted_down() {
        let builder = MockBuilder::new();
        builder.fail_next_converts(1);
        let layer = bootstrap::pack(&[("f", &b"x"[..])]).unwrap();

        let mut out = Vec::new();
        let mut raw = layer.as_slice();
        assert!(builder
            .convert(&mut raw, &mut out, &Cancellation::never())
            .await
            .is_err());

        let mut raw = layer.as_slice();
        assert!(builder
            .convert(&mut raw, &mut out, &Cancellation::never())
            .await
            .is_ok());
        assert_eq!(builder.converts(), 2);
    }

    #[tokio::test]
    async fn test_mock_merge_keeps_layer_order() {
        let builder = MockBuilder::new();
        let first = bootstrap::pack_bootstrap(b"one\n").unwrap();
        let second = bootstrap::pack_bootstrap(b"two\n").unwrap();
        let d1 = plfm_digest::Digest::from_bytes(&first);
        let d2 = plfm_digest::Digest::from_bytes(&second);
        let layers = vec![
            MergeLayer {
                digest: d1.clone(),
                reader: Box::new(first),
            },
            MergeLayer {
                digest: d2.clone(),
                reader: Box::new(second),
            },
        ];

        let mut out = Vec::new();
        builder
            .merge(&layers, &mut out, MergeOptions::default(), &Cancellation::never())
            .await
            .unwrap();

        let expected = format!("# {d1}\none\n# {d2}\ntwo\n");
        assert_eq!(out, expected.as_bytes());
    }

    #[tokio::test]
    async fn test_failing_merge() {
        let builder = MockBuilder::failing_merge();
        let mut out = Vec::new();
        let result = builder
            .merge(&[], &mut out, MergeOptions { with_tar: true }, &Cancellation::never())
            .await;
        assert!(matches!(result, Err(BuilderError::Failed(_))));
        assert_eq!(builder.merges(), 1);
    }
}
