//! plfm-vt Image Builder
//!
//! Command line entry point for the nydus image pipeline.
//!
//! - **ingest**: Adds a layer tarball to the content store
//! - **merge**: Resolves each layer's nydus blob and merges their bootstraps
//! - **build**: Builds per-layer nydus artifacts, reusing cached layers
//!
//! Chains are read as a JSON array of layer diff descriptors, ancestor first.
//! Results are printed to stdout as JSON descriptors.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flate2::read::GzDecoder;
use plfm_digest::Digester;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_image_builder::builder::{bootstrap, ArtifactBuilder, ExternalBuilder};
use plfm_image_builder::cancel::Cancellation;
use plfm_image_builder::config::Config;
use plfm_image_builder::content::{self, ContentStore, Labels, LocalContentStore};
use plfm_image_builder::image::{
    BlobResolver, ChainBuilder, ChainMerger, Descriptor, LayerCache, LayerChain, MergeConfig,
    ANNOTATION_UNCOMPRESSED, MEDIA_TYPE_LAYER, MEDIA_TYPE_LAYER_GZIP,
};
use plfm_image_builder::state::LayerStore;

/// plfm-vt image builder - nydus artifacts for OCI layer chains.
#[derive(Debug, Parser)]
#[command(name = "image-builder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add a layer tarball (plain or gzip) to the content store.
    Ingest {
        /// Path of the layer tarball.
        path: PathBuf,
    },

    /// Merge the nydus bootstraps of a layer chain.
    Merge {
        /// JSON file holding the chain's diff descriptors.
        chain: PathBuf,
    },

    /// Build nydus artifacts for every layer of a chain.
    Build {
        /// JSON file holding the chain's diff descriptors.
        chain: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!(
        content_dir = %config.content_dir.display(),
        state_db = %config.state_db.display(),
        builder = %config.builder_path.display(),
        "Configuration loaded"
    );

    let (cancel_handle, cancel) = Cancellation::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal, cancelling");
            cancel_handle.cancel();
        }
    });

    let content: Arc<dyn ContentStore> = Arc::new(
        LocalContentStore::open(&config.content_dir)
            .await
            .context("open content store")?,
    );

    let output = match cli.command {
        Command::Ingest { path } => {
            let desc = ingest(content.as_ref(), &path, &cancel).await?;
            serde_json::to_string_pretty(&desc)?
        }
        Command::Merge { chain } => {
            let chain = read_chain(&chain).await?;
            let state = open_state(&config)?;
            let builder = external_builder(&config);
            let resolver = Arc::new(BlobResolver::new(
                Arc::clone(&content),
                state,
                Arc::clone(&builder),
                config.resolve_config(),
            ));
            let merger = ChainMerger::new(content, resolver, builder, MergeConfig::default());
            let merged = merger.merge(chain.layers(), &cancel).await?;
            serde_json::to_string_pretty(&merged)?
        }
        Command::Build { chain } => {
            let chain = read_chain(&chain).await?;
            let state = open_state(&config)?;
            let cache = Arc::new(LayerCache::new(state, Arc::clone(&content)));
            let chain_builder = ChainBuilder::new(
                content,
                Arc::clone(&cache),
                external_builder(&config),
                config.chain_builder_config(),
            );
            let artifacts = chain_builder.build(&chain, &cancel).await?;
            let (hits, misses, stores) = cache.stats();
            info!(hits, misses, stores, "Layer cache usage");
            serde_json::to_string_pretty(&artifacts)?
        }
    };

    println!("{output}");
    Ok(())
}

fn open_state(config: &Config) -> Result<Arc<LayerStore>> {
    if let Some(parent) = config.state_db.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create state directory {}", parent.display()))?;
    }
    let store = LayerStore::open(&config.state_db)
        .with_context(|| format!("open layer state {}", config.state_db.display()))?;
    Ok(Arc::new(store))
}

fn external_builder(config: &Config) -> Arc<dyn ArtifactBuilder> {
    Arc::new(ExternalBuilder::new(
        config.builder_path.clone(),
        config.work_dir.clone(),
    ))
}

async fn read_chain(path: &Path) -> Result<LayerChain> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("read chain {}", path.display()))?;
    let diffs: Vec<Descriptor> =
        serde_json::from_slice(&raw).with_context(|| format!("parse chain {}", path.display()))?;
    Ok(LayerChain::from_diffs(diffs)?)
}

/// Store a layer tarball, labelled with its uncompressed digest.
async fn ingest(
    store: &dyn ContentStore,
    path: &Path,
    cancel: &Cancellation,
) -> Result<Descriptor> {
    let owned = path.to_path_buf();
    let (gzipped, uncompressed) = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut file = std::fs::File::open(&owned)?;
        let mut magic = [0u8; 2];
        let n = file.read(&mut magic)?;
        let gzipped = bootstrap::is_gzip(&magic[..n]);

        let file = std::fs::File::open(&owned)?;
        let mut digester = Digester::new();
        if gzipped {
            std::io::copy(&mut GzDecoder::new(file), &mut digester)?;
        } else {
            std::io::copy(&mut std::io::BufReader::new(file), &mut digester)?;
        }
        Ok((gzipped, digester.finalize()))
    })
    .await??;

    let mut labels = Labels::new();
    labels.insert(ANNOTATION_UNCOMPRESSED.to_string(), uncompressed.to_string());

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open layer {}", path.display()))?;
    let (digest, size) =
        content::write_blob(store, &format!("ingest-{uncompressed}"), &mut file, labels, cancel)
            .await?;

    let media_type = if gzipped {
        MEDIA_TYPE_LAYER_GZIP
    } else {
        MEDIA_TYPE_LAYER
    };
    info!(digest = %digest, size, uncompressed = %uncompressed, "Layer ingested");
    Ok(Descriptor::new(media_type, digest, size)
        .with_annotation(ANNOTATION_UNCOMPRESSED, uncompressed.to_string()))
}
