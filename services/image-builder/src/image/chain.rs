//! Building the accelerated artifacts of a layer chain.
//!
//! Each layer is offered to the artifact builder as a [`BuildLayer`]: its
//! identity, the content store, a way to mount its diff and its cache entry.
//! The builder walks the chain ancestor first, so the last layer's bootstrap
//! describes the whole chain; that bootstrap is the one artifact the chain
//! builder hands back.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tar::Archive;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::cache::{CacheError, CachedArtifacts, LayerCache};
use super::descriptor::{Descriptor, ANNOTATION_NYDUS_BLOB_IDS, ANNOTATION_NYDUS_BOOTSTRAP};
use super::layer::{Layer, LayerChain};
use crate::builder::{
    bootstrap, ArtifactBuilder, BuilderError, LayerArtifacts, DEFAULT_BUILDER,
};
use crate::cancel::{Cancellation, Cancelled};
use crate::content::{ContentError, ContentStore, ReaderAt, SectionReader};

/// Chain builder settings.
#[derive(Debug, Clone)]
pub struct ChainBuilderConfig {
    /// Builder executable handed to the artifact builder.
    pub builder_path: PathBuf,
    /// Parent of the per-build working directories.
    pub work_dir: PathBuf,
}

impl Default for ChainBuilderConfig {
    fn default() -> Self {
        Self {
            builder_path: PathBuf::from(DEFAULT_BUILDER),
            work_dir: std::env::temp_dir().join("plfm-image-builder"),
        }
    }
}

/// Errors from mounting a layer.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("open layer diff: {0}")]
    Content(#[from] ContentError),

    #[error("unpack layer diff: {0}")]
    Io(#[from] std::io::Error),

    #[error("unpack task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl MountError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            MountError::Cancelled(_) | MountError::Content(ContentError::Cancelled(_))
        )
    }
}

/// Errors from building a chain.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain to build can't be empty")]
    EmptyChain,

    #[error("prepare work directory: {0}")]
    WorkDir(#[source] std::io::Error),

    #[error("build nydus artifacts: {0}")]
    Build(#[source] BuilderError),

    #[error("builder returned {actual} results for {expected} layers")]
    ArtifactCount { expected: usize, actual: usize },

    #[error("marshal blob ids: {0}")]
    MarshalBlobIds(#[source] serde_json::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ChainError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChainError::Cancelled(_))
    }
}

/// A layer's diff unpacked into a temporary directory, removed on drop.
#[derive(Debug)]
pub struct LayerMount {
    dir: TempDir,
}

impl LayerMount {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// One layer as seen by an artifact builder.
pub struct BuildLayer {
    layer: Layer,
    content: Arc<dyn ContentStore>,
    cache: Arc<LayerCache>,
    scratch: PathBuf,
}

impl BuildLayer {
    pub fn new(
        layer: Layer,
        content: Arc<dyn ContentStore>,
        cache: Arc<LayerCache>,
        scratch: impl Into<PathBuf>,
    ) -> Self {
        Self {
            layer,
            content,
            cache,
            scratch: scratch.into(),
        }
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    pub fn content_store(&self) -> &dyn ContentStore {
        self.content.as_ref()
    }

    /// Unpack the layer's diff into a fresh directory.
    ///
    /// Whiteout markers are kept as entries for the builder to interpret;
    /// entries that would escape the directory are skipped.
    pub async fn mount(&self, cancel: &Cancellation) -> Result<LayerMount, MountError> {
        let reader = cancel.run(self.content.reader_at(self.layer.diff())).await?;
        fs::create_dir_all(&self.scratch)?;
        let dir = tempfile::Builder::new()
            .prefix("mount-")
            .tempdir_in(&self.scratch)?;

        let chain_id = self.layer.chain_id().clone();
        let unpack = tokio::task::spawn_blocking(move || {
            unpack_diff(reader.as_ref(), dir.path())?;
            Ok::<_, std::io::Error>(dir)
        });

        let dir = cancel
            .run(async {
                unpack
                    .await
                    .map_err(|e| MountError::Task(e.to_string()))?
                    .map_err(MountError::from)
            })
            .await?;

        debug!(chain_id = %chain_id, path = %dir.path().display(), "Layer mounted");
        Ok(LayerMount { dir })
    }

    /// The layer's cache entry, if usable.
    pub async fn cache_get(&self) -> Option<CachedArtifacts> {
        self.cache.lookup(&self.layer).await
    }

    /// Record freshly built artifacts for the layer.
    pub async fn cache_set(&self, artifacts: &LayerArtifacts) -> Result<(), CacheError> {
        self.cache
            .store(&self.layer, &artifacts.bootstrap, artifacts.blob.as_ref())
            .await
    }
}

fn unpack_diff(reader: &dyn ReaderAt, dest: &Path) -> std::io::Result<()> {
    if reader.size() == 0 {
        return Ok(());
    }
    let mut magic = [0u8; 2];
    let n = reader.read_at(&mut magic, 0)?;
    let section = SectionReader::new(reader);
    if bootstrap::is_gzip(&magic[..n]) {
        extract_archive(&mut Archive::new(GzDecoder::new(section)), dest)
    } else {
        extract_archive(&mut Archive::new(section), dest)
    }
}

fn extract_archive<R: Read>(archive: &mut Archive<R>, dest: &Path) -> std::io::Result<()> {
    archive.set_preserve_permissions(true);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        // Check for path traversal
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            warn!(path = %path.display(), "Skipping path outside layer root");
            continue;
        }

        if !entry.unpack_in(dest)? {
            warn!(path = %path.display(), "Skipping unsafe layer entry");
        }
    }
    Ok(())
}

/// Builds a chain's accelerated artifacts through an [`ArtifactBuilder`].
pub struct ChainBuilder {
    content: Arc<dyn ContentStore>,
    cache: Arc<LayerCache>,
    builder: Arc<dyn ArtifactBuilder>,
    config: ChainBuilderConfig,
}

impl ChainBuilder {
    pub fn new(
        content: Arc<dyn ContentStore>,
        cache: Arc<LayerCache>,
        builder: Arc<dyn ArtifactBuilder>,
        config: ChainBuilderConfig,
    ) -> Self {
        Self {
            content,
            cache,
            builder,
            config,
        }
    }

    /// Build every layer of `chain` and return the trailing bootstrap
    /// artifact that completes the accelerated image.
    ///
    /// Its `nydus-blob-ids` annotation lists only the layers that produced a
    /// data blob, in chain order. Layers without file data are left out, so
    /// the list can be shorter than the chain. A merged bootstrap from
    /// [`ChainMerger`](crate::image::ChainMerger) carries one entry per layer
    /// under the same key.
    pub async fn build(
        &self,
        chain: &LayerChain,
        cancel: &Cancellation,
    ) -> Result<Vec<Descriptor>, ChainError> {
        let Some(chain_id) = chain.chain_id() else {
            return Err(ChainError::EmptyChain);
        };

        fs::create_dir_all(&self.config.work_dir).map_err(ChainError::WorkDir)?;
        let work = tempfile::Builder::new()
            .prefix("build-")
            .tempdir_in(&self.config.work_dir)
            .map_err(ChainError::WorkDir)?;

        let layers: Vec<BuildLayer> = chain
            .layers()
            .iter()
            .map(|layer| {
                BuildLayer::new(
                    layer.clone(),
                    Arc::clone(&self.content),
                    Arc::clone(&self.cache),
                    work.path(),
                )
            })
            .collect();

        info!(chain_id = %chain_id, layers = layers.len(), "Building nydus chain");

        let built = self
            .builder
            .build(work.path(), &self.config.builder_path, &layers, cancel)
            .await
            .map_err(|err| match err {
                BuilderError::Cancelled(c) => ChainError::Cancelled(c),
                err if err.is_cancelled() => ChainError::Cancelled(Cancelled),
                err => ChainError::Build(err),
            })?;

        if built.len() != layers.len() {
            return Err(ChainError::ArtifactCount {
                expected: layers.len(),
                actual: built.len(),
            });
        }

        let blob_ids: Vec<String> = built
            .iter()
            .filter_map(|a| a.blob.as_ref())
            .map(|blob| blob.digest.hex().to_string())
            .collect();
        let blob_ids = serde_json::to_string(&blob_ids).map_err(ChainError::MarshalBlobIds)?;

        let Some(last) = built.into_iter().last() else {
            return Err(ChainError::ArtifactCount {
                expected: layers.len(),
                actual: 0,
            });
        };

        let bootstrap = last
            .bootstrap
            .with_annotation(ANNOTATION_NYDUS_BOOTSTRAP, "true")
            .with_annotation(ANNOTATION_NYDUS_BLOB_IDS, blob_ids);

        info!(
            chain_id = %chain_id,
            bootstrap = %bootstrap.digest,
            "Nydus chain built"
        );

        Ok(vec![bootstrap])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::bootstrap::pack;

    #[test]
    fn test_extract_skips_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let raw = {
            let mut builder = tar::Builder::new(Vec::new());
            let mut header = tar::Header::new_gnu();
            header.set_size(4);
            header.set_mode(0o644);
            // `append_data` refuses `..`, so write the name directly.
            header.as_gnu_mut().unwrap().name[..13].copy_from_slice(b"../escape.txt");
            header.set_cksum();
            builder.append(&header, &b"evil"[..]).unwrap();

            let mut ok = tar::Header::new_gnu();
            ok.set_size(2);
            ok.set_mode(0o644);
            builder.append_data(&mut ok, "etc/ok", &b"ok"[..]).unwrap();
            builder.into_inner().unwrap()
        };

        let dest = dir.path().join("root");
        fs::create_dir_all(&dest).unwrap();
        unpack_diff(&raw, &dest).unwrap();

        assert!(!dir.path().join("escape.txt").exists());
        assert_eq!(fs::read(dest.join("etc/ok")).unwrap(), b"ok");
    }

    #[test]
    fn test_whiteouts_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let raw = pack(&[("etc/.wh.hosts", &b""[..]), ("etc/passwd", &b"root"[..])]).unwrap();

        unpack_diff(&raw, dir.path()).unwrap();

        assert!(dir.path().join("etc/.wh.hosts").exists());
        assert_eq!(fs::read(dir.path().join("etc/passwd")).unwrap(), b"root");
    }

    #[test]
    fn test_empty_diff_mounts_empty() {
        let dir = tempfile::tempdir().unwrap();
        unpack_diff(&Vec::new(), dir.path()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
