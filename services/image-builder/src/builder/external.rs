//! Builder backed by the `nydus-image` executable.
//!
//! Each operation runs in a scratch directory under the work dir: inputs are
//! staged as files, the executable is invoked, and its outputs are streamed
//! back. The child is killed if the operation is cancelled or dropped.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use flate2::write::GzDecoder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::bootstrap::{self, BLOB_ENTRY, BOOTSTRAP_ENTRY};
use super::{
    blob_ref, bootstrap_ref, commit_blob, commit_bootstrap, ArtifactBuilder, BuilderError,
    LayerArtifacts, MergeLayer, MergeOptions,
};
use crate::cancel::Cancellation;
use crate::content::{ReaderAt, COPY_BUFFER_SIZE};
use crate::image::BuildLayer;

/// Builder driving an external executable.
#[derive(Debug, Clone)]
pub struct ExternalBuilder {
    path: PathBuf,
    work_dir: PathBuf,
}

impl ExternalBuilder {
    /// Use the executable at `path`, staging files under `work_dir`.
    pub fn new(path: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            work_dir: work_dir.into(),
        }
    }

    fn scratch(&self, prefix: &str) -> Result<tempfile::TempDir, BuilderError> {
        std::fs::create_dir_all(&self.work_dir)?;
        Ok(tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.work_dir)?)
    }
}

/// Run `program` with `args`, failing on a non-zero exit.
async fn run(
    program: &Path,
    args: Vec<OsString>,
    cancel: &Cancellation,
) -> Result<(), BuilderError> {
    debug!(program = %program.display(), args = ?args, "Running builder");

    let child = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BuilderError::Spawn {
            path: program.to_path_buf(),
            source,
        })?;

    let output = cancel
        .run(async { child.wait_with_output().await.map_err(BuilderError::from) })
        .await?;

    if !output.status.success() {
        return Err(BuilderError::CommandFailed {
            path: program.to_path_buf(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

fn arg(value: impl Into<OsString>) -> OsString {
    value.into()
}

/// Where a staged layer is written.
enum Sink {
    Plain(File),
    Gzip(GzDecoder<File>),
}

impl Sink {
    fn write_all(&mut self, chunk: &[u8]) -> io::Result<()> {
        match self {
            Sink::Plain(file) => file.write_all(chunk),
            Sink::Gzip(decoder) => decoder.write_all(chunk),
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            Sink::Plain(mut file) => file.flush(),
            Sink::Gzip(decoder) => decoder.finish()?.flush(),
        }
    }
}

/// Copy a stream into a file, gunzipping it when it starts with gzip magic.
async fn stage_layer(
    raw: &mut (dyn AsyncRead + Send + Unpin),
    dest: &Path,
    cancel: &Cancellation,
) -> Result<(), BuilderError> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let file = File::create(dest)?;
    let n = cancel
        .run(async { raw.read(&mut buf).await.map_err(BuilderError::from) })
        .await?;
    let mut sink = if bootstrap::is_gzip(&buf[..n]) {
        Sink::Gzip(GzDecoder::new(file))
    } else {
        Sink::Plain(file)
    };

    let mut n = n;
    while n > 0 {
        sink.write_all(&buf[..n])?;
        n = cancel
            .run(async { raw.read(&mut buf).await.map_err(BuilderError::from) })
            .await?;
    }

    sink.finish()?;
    Ok(())
}

/// Stream a file into `dest`.
async fn send_file(
    path: &Path,
    dest: &mut (dyn AsyncWrite + Send + Unpin),
    cancel: &Cancellation,
) -> Result<(), BuilderError> {
    let mut file = tokio::fs::File::open(path).await?;
    cancel
        .run(async {
            tokio::io::copy(&mut file, &mut *dest).await?;
            dest.flush().await.map_err(BuilderError::from)
        })
        .await
}

/// Stream the bootstrap of a stored artifact into a file.
fn write_bootstrap(reader: &dyn ReaderAt, dest: &Path) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(dest)?);
    bootstrap::copy_bootstrap(reader, &mut file)?;
    file.flush()
}

#[async_trait]
impl ArtifactBuilder for ExternalBuilder {
    async fn convert(
        &self,
        raw: &mut (dyn AsyncRead + Send + Unpin),
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &Cancellation,
    ) -> Result<(), BuilderError> {
        let scratch = self.scratch("convert-")?;
        let layer = scratch.path().join("layer.tar");
        let blob = scratch.path().join("image.blob");
        let boot = scratch.path().join("image.boot");
        let out = scratch.path().join("converted.tar");

        stage_layer(raw, &layer, cancel).await?;

        run(
            &self.path,
            vec![
                arg("create"),
                arg("--type"),
                arg("tar-rafs"),
                arg("--bootstrap"),
                arg(&boot),
                arg("--blob"),
                arg(&blob),
                arg("--whiteout-spec"),
                arg("oci"),
                arg(&layer),
            ],
            cancel,
        )
        .await?;

        if !blob.exists() {
            File::create(&blob)?;
        }
        bootstrap::pack_files(&[(BLOB_ENTRY, &blob), (BOOTSTRAP_ENTRY, &boot)], &out)?;
        send_file(&out, dest, cancel).await?;

        info!(builder = %self.path.display(), "Converted layer to nydus blob");
        Ok(())
    }

    async fn merge(
        &self,
        layers: &[MergeLayer],
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        options: MergeOptions,
        cancel: &Cancellation,
    ) -> Result<(), BuilderError> {
        let scratch = self.scratch("merge-")?;
        let merged = scratch.path().join("merged.boot");

        let mut args = vec![arg("merge"), arg("--bootstrap"), arg(&merged)];
        let digests: Vec<&str> = layers.iter().map(|l| l.digest.hex()).collect();
        if !digests.is_empty() {
            args.push(arg("--blob-digests"));
            args.push(arg(digests.join(",")));
        }

        for (index, layer) in layers.iter().enumerate() {
            cancel.check()?;
            let path = scratch.path().join(format!("{index}.boot"));
            write_bootstrap(layer.reader.as_ref(), &path)?;
            args.push(arg(&path));
        }

        run(&self.path, args, cancel).await?;

        if options.with_tar {
            let tarball = scratch.path().join("merged.tar");
            bootstrap::pack_files(&[(BOOTSTRAP_ENTRY, &merged)], &tarball)?;
            send_file(&tarball, dest, cancel).await?;
        } else {
            send_file(&merged, dest, cancel).await?;
        }

        info!(layers = layers.len(), "Merged nydus bootstraps");
        Ok(())
    }

    async fn build(
        &self,
        work_dir: &Path,
        builder_path: &Path,
        layers: &[BuildLayer],
        cancel: &Cancellation,
    ) -> Result<Vec<LayerArtifacts>, BuilderError> {
        let mut parent: Option<PathBuf> = None;
        let mut built = Vec::with_capacity(layers.len());

        for (index, layer) in layers.iter().enumerate() {
            cancel.check()?;
            let chain_id = layer.layer().chain_id();
            let store = layer.content_store();
            let boot_path = work_dir.join(format!("{index}.boot"));

            if let Some(cached) = layer.cache_get().await {
                let reader = store.reader_at(&cached.bootstrap).await?;
                write_bootstrap(reader.as_ref(), &boot_path)?;
                parent = Some(boot_path);
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
            let blob_path = work_dir.join(format!("{index}.blob"));

            let mut args = vec![
                arg("create"),
                arg("--type"),
                arg("dir-rafs"),
                arg("--bootstrap"),
                arg(&boot_path),
                arg("--blob"),
                arg(&blob_path),
                arg("--whiteout-spec"),
                arg("oci"),
            ];
            if let Some(parent) = &parent {
                args.push(arg("--parent-bootstrap"));
                args.push(arg(parent));
            }
            args.push(arg(mount.path()));

            run(builder_path, args, cancel).await?;
            drop(mount);

            let boot = std::fs::read(&boot_path)?;
            let bootstrap =
                commit_bootstrap(store, &bootstrap_ref(chain_id), &boot, cancel).await?;

            let has_blob = std::fs::metadata(&blob_path)
                .map(|m| m.len() > 0)
                .unwrap_or(false);
            let blob = if has_blob {
                let mut file = tokio::fs::File::open(&blob_path).await?;
                Some(commit_blob(store, &blob_ref(chain_id), &mut file, cancel).await?)
            } else {
                None
            };

            let artifacts = LayerArtifacts { bootstrap, blob };
            if let Err(e) = layer.cache_set(&artifacts).await {
                warn!(chain_id = %chain_id, error = %e, "Failed to cache layer artifacts");
            }

            info!(
                chain_id = %chain_id,
                bootstrap = %artifacts.bootstrap.digest,
                has_blob,
                "Built layer"
            );
            parent = Some(boot_path);
            built.push(artifacts);
        }

        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-nydus-image");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_stage_layer_gunzips() {
        let dir = tempfile::tempdir().unwrap();
        let tarball = bootstrap::pack(&[("f", &b"data"[..])]).unwrap();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tarball).unwrap();
        let gz = encoder.finish().unwrap();

        let dest = dir.path().join("layer.tar");
        let mut raw = gz.as_slice();
        stage_layer(&mut raw, &dest, &Cancellation::never()).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), tarball);
    }

    #[tokio::test]
    async fn test_failed_command_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "echo 'bad bootstrap' >&2\nexit 3");

        let err = run(&program, vec![arg("merge")], &Cancellation::never())
            .await
            .unwrap_err();
        match err {
            BuilderError::CommandFailed { stderr, .. } => assert_eq!(stderr, "bad bootstrap"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let err = run(
            Path::new("/nonexistent/nydus-image"),
            Vec::new(),
            &Cancellation::never(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BuilderError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "sleep 30");
        let (handle, cancel) = Cancellation::new();

        let task = tokio::spawn(async move { run(&program, Vec::new(), &cancel).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_merge_invokes_builder() {
        let dir = tempfile::tempdir().unwrap();
        // Writes its argument list as the merged bootstrap.
        let program = script(
            dir.path(),
            "out=\"$3\"\nshift 3\necho \"$@\" > \"$out\"",
        );
        let builder = ExternalBuilder::new(&program, dir.path().join("work"));

        let blob =
            bootstrap::pack(&[(BLOB_ENTRY, &b"x"[..]), (BOOTSTRAP_ENTRY, &b"boot"[..])]).unwrap();
        let digest = plfm_digest::Digest::from_bytes(&blob);
        let layers = vec![MergeLayer {
            digest: digest.clone(),
            reader: Box::new(blob),
        }];

        let mut out = Vec::new();
        builder
            .merge(&layers, &mut out, MergeOptions::default(), &Cancellation::never())
            .await
            .unwrap();

        let args = String::from_utf8(out).unwrap();
        assert!(args.starts_with(&format!("--blob-digests {}", digest.hex())));
        assert!(args.trim_end().ends_with("0.boot"));
    }

    #[tokio::test]
    async fn test_merge_with_tar_wraps_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "printf merged > \"$3\"");
        let builder = ExternalBuilder::new(&program, dir.path().join("work"));

        let blob =
            bootstrap::pack(&[(BLOB_ENTRY, &b"x"[..]), (BOOTSTRAP_ENTRY, &b"boot"[..])]).unwrap();
        let layers = vec![MergeLayer {
            digest: plfm_digest::Digest::from_bytes(&blob),
            reader: Box::new(blob),
        }];

        let mut out = Vec::new();
        builder
            .merge(
                &layers,
                &mut out,
                MergeOptions { with_tar: true },
                &Cancellation::never(),
            )
            .await
            .unwrap();

        assert_eq!(out, bootstrap::pack_bootstrap(b"merged").unwrap());
        assert_eq!(bootstrap::extract_bootstrap(&out).unwrap(), b"merged");
    }

    #[test]
    fn test_write_bootstrap_streams_entry() {
        let dir = tempfile::tempdir().unwrap();
        let artifact =
            bootstrap::pack(&[(BLOB_ENTRY, &b"x"[..]), (BOOTSTRAP_ENTRY, &b"boot"[..])]).unwrap();
        let dest = dir.path().join("0.boot");

        write_bootstrap(&artifact, &dest).unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"boot");
    }
}
