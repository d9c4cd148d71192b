//! Configuration for the image builder.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::builder::{BUILDER_ENV, DEFAULT_BUILDER};
use crate::image::{ChainBuilderConfig, ResolveConfig};

/// Image builder configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the content store.
    pub content_dir: PathBuf,

    /// Path of the layer state database.
    pub state_db: PathBuf,

    /// Parent of temporary build and staging directories.
    pub work_dir: PathBuf,

    /// The `nydus-image` executable.
    pub builder_path: PathBuf,

    /// Attempts made to resolve a layer blob, including the first.
    pub resolve_attempts: u32,

    /// Delay between resolve attempts.
    pub resolve_retry_delay: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup("PLFM_IMAGE_BUILDER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/plfm/image-builder"));

        let content_dir = lookup("PLFM_IMAGE_BUILDER_CONTENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("content"));

        let state_db = lookup("PLFM_IMAGE_BUILDER_STATE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("layers.db"));

        let work_dir = lookup("PLFM_IMAGE_BUILDER_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("work"));

        let builder_path = lookup(BUILDER_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BUILDER));

        let resolve_attempts = match lookup("PLFM_IMAGE_BUILDER_RESOLVE_ATTEMPTS") {
            Some(v) => v
                .parse()
                .with_context(|| format!("invalid PLFM_IMAGE_BUILDER_RESOLVE_ATTEMPTS: {v}"))?,
            None => ResolveConfig::default().attempts,
        };
        if resolve_attempts == 0 {
            anyhow::bail!("PLFM_IMAGE_BUILDER_RESOLVE_ATTEMPTS must be at least 1");
        }

        let resolve_retry_delay = match lookup("PLFM_IMAGE_BUILDER_RESOLVE_DELAY_MS") {
            Some(v) => Duration::from_millis(
                v.parse()
                    .with_context(|| format!("invalid PLFM_IMAGE_BUILDER_RESOLVE_DELAY_MS: {v}"))?,
            ),
            None => ResolveConfig::default().retry_delay,
        };

        let log_level =
            lookup("PLFM_IMAGE_BUILDER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            content_dir,
            state_db,
            work_dir,
            builder_path,
            resolve_attempts,
            resolve_retry_delay,
            log_level,
        })
    }

    pub fn resolve_config(&self) -> ResolveConfig {
        ResolveConfig {
            attempts: self.resolve_attempts,
            retry_delay: self.resolve_retry_delay,
            ..ResolveConfig::default()
        }
    }

    pub fn chain_builder_config(&self) -> ChainBuilderConfig {
        ChainBuilderConfig {
            builder_path: self.builder_path.clone(),
            work_dir: self.work_dir.clone(),
        }
    }
}
