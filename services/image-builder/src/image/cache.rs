//! Per-layer artifact cache.
//!
//! Remembers, per chain ID, the bootstrap and data blob a previous build
//! produced for that layer so an unchanged layer is never rebuilt. Entries
//! live in the layer state store as two properties plus blob links; the
//! artifacts themselves live in the content store.
//!
//! A lookup only hits when every referenced artifact is still linked to the
//! layer and present in the content store. Anything else is a miss, logged
//! with its reason, so a damaged entry costs a rebuild and nothing more.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use plfm_digest::{Digest, DigestError};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::descriptor::Descriptor;
use super::layer::Layer;
use crate::content::{ContentError, ContentStore};
use crate::state::{LayerStore, LayerUpdate, StateStoreError, PRIMARY_SLOT};

/// Property holding the bootstrap digest.
pub const BOOTSTRAP_PROPERTY: &str = "nydus.bootstrap";
/// Property holding the data blob digest or [`EMPTY_BLOB`].
pub const BLOB_PROPERTY: &str = "nydus.blob";
/// Recorded when a layer produced no data blob.
pub const EMPTY_BLOB: &str = "empty";
/// Variant slot linking the layer's bootstrap.
pub const BOOTSTRAP_SLOT: &str = "nydus-bootstrap";
/// Variant slot linking the layer's data blob.
pub const BLOB_SLOT: &str = "nydus-blob";

/// Errors from recording a cache entry.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("bootstrap {digest} is not in the content store: {source}")]
    BootstrapUnavailable {
        digest: Digest,
        #[source]
        source: ContentError,
    },

    #[error("blob {digest} is not in the content store: {source}")]
    BlobUnavailable {
        digest: Digest,
        #[source]
        source: ContentError,
    },

    #[error("record artifacts of layer {chain_id}: {source}")]
    Record {
        chain_id: Digest,
        #[source]
        source: StateStoreError,
    },
}

/// What a layer's blob property records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobRecord {
    /// The layer produced this data blob.
    Present(Digest),
    /// The layer produced no data blob.
    Empty,
}

impl BlobRecord {
    /// Property value for this record.
    pub fn to_property(&self) -> String {
        match self {
            Self::Present(digest) => digest.to_string(),
            Self::Empty => EMPTY_BLOB.to_string(),
        }
    }

    /// Parse a property value.
    pub fn from_property(value: &str) -> Result<Self, DigestError> {
        if value == EMPTY_BLOB {
            return Ok(Self::Empty);
        }
        Digest::parse(value).map(Self::Present)
    }
}

/// Artifacts found for a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifacts {
    pub bootstrap: Descriptor,
    /// The data blob, or nothing for a layer without one.
    pub blobs: Vec<Descriptor>,
}

impl CachedArtifacts {
    /// The data blob, if the layer has one.
    pub fn blob(&self) -> Option<&Descriptor> {
        self.blobs.first()
    }
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub stores: AtomicU64,
}

/// Why a lookup missed.
#[derive(Debug, Error)]
enum Miss {
    #[error("no bootstrap recorded")]
    NoBootstrap,

    #[error("no blob recorded")]
    NoBlob,

    #[error("unparseable {key} property: {source}")]
    BadProperty {
        key: &'static str,
        #[source]
        source: DigestError,
    },

    #[error("{digest} is not linked to the layer")]
    Unlinked { digest: Digest },

    #[error("{digest} is missing from the content store: {source}")]
    Missing {
        digest: Digest,
        #[source]
        source: ContentError,
    },

    #[error("state store: {0}")]
    State(#[from] StateStoreError),
}

impl Miss {
    /// Plain misses are expected; everything else means a damaged entry.
    fn is_plain(&self) -> bool {
        matches!(self, Miss::NoBootstrap | Miss::NoBlob)
    }
}

/// Per-layer artifact cache.
pub struct LayerCache {
    state: Arc<LayerStore>,
    content: Arc<dyn ContentStore>,
    stats: CacheStats,
}

impl fmt::Debug for LayerCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerCache")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl LayerCache {
    pub fn new(state: Arc<LayerStore>, content: Arc<dyn ContentStore>) -> Self {
        Self {
            state,
            content,
            stats: CacheStats::default(),
        }
    }

    /// Look up the artifacts previously built for `layer`.
    pub async fn lookup(&self, layer: &Layer) -> Option<CachedArtifacts> {
        match self.try_lookup(layer).await {
            Ok(found) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    chain_id = %layer.chain_id(),
                    bootstrap = %found.bootstrap.digest,
                    blobs = found.blobs.len(),
                    "Layer cache hit"
                );
                Some(found)
            }
            Err(miss) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                if miss.is_plain() {
                    debug!(chain_id = %layer.chain_id(), reason = %miss, "Layer cache miss");
                } else {
                    warn!(
                        chain_id = %layer.chain_id(),
                        reason = %miss,
                        "Layer cache entry unusable"
                    );
                }
                None
            }
        }
    }

    async fn try_lookup(&self, layer: &Layer) -> Result<CachedArtifacts, Miss> {
        let chain_id = layer.chain_id();

        let bootstrap = self
            .state
            .get_property(chain_id, BOOTSTRAP_PROPERTY)?
            .ok_or(Miss::NoBootstrap)?;
        let bootstrap = Digest::parse(&bootstrap).map_err(|source| Miss::BadProperty {
            key: BOOTSTRAP_PROPERTY,
            source,
        })?;

        let blob = self
            .state
            .get_property(chain_id, BLOB_PROPERTY)?
            .ok_or(Miss::NoBlob)?;
        let blob = BlobRecord::from_property(&blob).map_err(|source| Miss::BadProperty {
            key: BLOB_PROPERTY,
            source,
        })?;

        let bootstrap = self.resolve(chain_id, BOOTSTRAP_SLOT, &bootstrap).await?;
        let blobs = match blob {
            BlobRecord::Present(digest) => vec![self.resolve(chain_id, BLOB_SLOT, &digest).await?],
            BlobRecord::Empty => Vec::new(),
        };

        Ok(CachedArtifacts { bootstrap, blobs })
    }

    /// Find the linked descriptor for `digest` and confirm the content exists.
    async fn resolve(
        &self,
        chain_id: &Digest,
        slot: &str,
        digest: &Digest,
    ) -> Result<Descriptor, Miss> {
        let linked = match self.state.get_blob(chain_id, slot)? {
            Some(desc) if &desc.digest == digest => Some(desc),
            _ => self
                .state
                .get_blob(chain_id, PRIMARY_SLOT)?
                .filter(|desc| &desc.digest == digest),
        };
        let desc = linked.ok_or_else(|| Miss::Unlinked {
            digest: digest.clone(),
        })?;

        self.content
            .info(digest)
            .await
            .map_err(|source| Miss::Missing {
                digest: digest.clone(),
                source,
            })?;

        Ok(desc)
    }

    /// Record the artifacts built for `layer`.
    ///
    /// Both artifacts must already be committed to the content store. The
    /// links and properties are written in one transaction, so a failure
    /// leaves no partial entry behind.
    pub async fn store(
        &self,
        layer: &Layer,
        bootstrap: &Descriptor,
        blob: Option<&Descriptor>,
    ) -> Result<(), CacheError> {
        let chain_id = layer.chain_id();

        self.content
            .info(&bootstrap.digest)
            .await
            .map_err(|source| CacheError::BootstrapUnavailable {
                digest: bootstrap.digest.clone(),
                source,
            })?;
        if let Some(blob) = blob {
            self.content
                .info(&blob.digest)
                .await
                .map_err(|source| CacheError::BlobUnavailable {
                    digest: blob.digest.clone(),
                    source,
                })?;
        }

        let record = match blob {
            Some(blob) => BlobRecord::Present(blob.digest.clone()),
            None => BlobRecord::Empty,
        };

        let mut links = vec![(BOOTSTRAP_SLOT.to_string(), bootstrap.clone())];
        if let Some(blob) = blob {
            links.push((BLOB_SLOT.to_string(), blob.clone()));
        }

        let update = LayerUpdate {
            primary: Some(bootstrap.clone()),
            links,
            properties: vec![
                (BOOTSTRAP_PROPERTY.to_string(), bootstrap.digest.to_string()),
                (BLOB_PROPERTY.to_string(), record.to_property()),
            ],
        };

        self.state
            .commit_layer(chain_id, &update)
            .map_err(|source| CacheError::Record {
                chain_id: chain_id.clone(),
                source,
            })?;

        self.stats.stores.fetch_add(1, Ordering::Relaxed);
        info!(
            chain_id = %chain_id,
            bootstrap = %bootstrap.digest,
            blob = %record.to_property(),
            "Layer artifacts cached"
        );

        Ok(())
    }

    /// Get cache statistics as (hits, misses, stores).
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
            self.stats.stores.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{self, LocalContentStore};
    use crate::cancel::Cancellation;
    use crate::image::{ANNOTATION_NYDUS_BLOB, MEDIA_TYPE_LAYER, MEDIA_TYPE_NYDUS_BLOB};

    struct Fixture {
        _dir: tempfile::TempDir,
        content: Arc<LocalContentStore>,
        state: Arc<LayerStore>,
        cache: LayerCache,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let content = Arc::new(LocalContentStore::open(dir.path()).await.unwrap());
        let state = Arc::new(LayerStore::open_in_memory().unwrap());
        let cache = LayerCache::new(Arc::clone(&state), content.clone());
        Fixture {
            _dir: dir,
            content,
            state,
            cache,
        }
    }

    async fn put(store: &LocalContentStore, data: &[u8], media_type: &str) -> Descriptor {
        let mut source = data;
        let (digest, size) = content::write_blob(
            store,
            &format!("test-{}", Digest::from_bytes(data).hex()),
            &mut source,
            Default::default(),
            &Cancellation::never(),
        )
        .await
        .unwrap();
        Descriptor::new(media_type, digest, size)
    }

    fn layer(name: &[u8]) -> Layer {
        let diff = Descriptor::new(MEDIA_TYPE_LAYER, Digest::from_bytes(name), 1);
        Layer::new(Digest::from_bytes(name), diff)
    }

    #[test]
    fn test_blob_record_property() {
        assert_eq!(BlobRecord::Empty.to_property(), "empty");
        assert_eq!(BlobRecord::from_property("empty").unwrap(), BlobRecord::Empty);

        let digest = Digest::from_bytes(b"blob");
        let present = BlobRecord::Present(digest.clone());
        assert_eq!(BlobRecord::from_property(&present.to_property()).unwrap(), present);
        assert!(BlobRecord::from_property("garbage").is_err());
    }

    #[tokio::test]
    async fn test_store_then_lookup() {
        let f = fixture().await;
        let bootstrap = put(&f.content, b"bootstrap", MEDIA_TYPE_LAYER).await;
        let blob = put(&f.content, b"blob", MEDIA_TYPE_NYDUS_BLOB)
            .await
            .with_annotation(ANNOTATION_NYDUS_BLOB, "true");
        let layer = layer(b"l1");

        assert!(f.cache.lookup(&layer).await.is_none());

        f.cache.store(&layer, &bootstrap, Some(&blob)).await.unwrap();

        let found = f.cache.lookup(&layer).await.unwrap();
        assert_eq!(found.bootstrap, bootstrap);
        assert_eq!(found.blobs, vec![blob]);
        assert_eq!(f.cache.stats(), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_empty_blob_sentinel() {
        let f = fixture().await;
        let bootstrap = put(&f.content, b"only metadata", MEDIA_TYPE_LAYER).await;
        let layer = layer(b"l2");

        f.cache.store(&layer, &bootstrap, None).await.unwrap();

        assert_eq!(
            f.state
                .get_property(layer.chain_id(), BLOB_PROPERTY)
                .unwrap()
                .as_deref(),
            Some(EMPTY_BLOB)
        );
        let found = f.cache.lookup(&layer).await.unwrap();
        assert!(found.blobs.is_empty());
        assert!(found.blob().is_none());
    }

    #[tokio::test]
    async fn test_store_rejects_missing_content() {
        let f = fixture().await;
        let bootstrap = put(&f.content, b"bootstrap", MEDIA_TYPE_LAYER).await;
        let ghost = Descriptor::new(MEDIA_TYPE_NYDUS_BLOB, Digest::from_bytes(b"ghost"), 5);
        let layer = layer(b"l3");

        let err = f
            .cache
            .store(&layer, &bootstrap, Some(&ghost))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::BlobUnavailable { .. }));

        // Nothing was recorded.
        assert!(f
            .state
            .get_property(layer.chain_id(), BOOTSTRAP_PROPERTY)
            .unwrap()
            .is_none());
        assert!(f.state.list_blobs(layer.chain_id()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlinked_bootstrap_is_miss() {
        let f = fixture().await;
        let bootstrap = put(&f.content, b"bootstrap", MEDIA_TYPE_LAYER).await;
        let layer = layer(b"l4");

        f.state
            .set_property(layer.chain_id(), BOOTSTRAP_PROPERTY, &bootstrap.digest.to_string())
            .unwrap();
        f.state
            .set_property(layer.chain_id(), BLOB_PROPERTY, EMPTY_BLOB)
            .unwrap();

        assert!(f.cache.lookup(&layer).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_blob_content_is_miss() {
        let f = fixture().await;
        let bootstrap = put(&f.content, b"bootstrap", MEDIA_TYPE_LAYER).await;
        let blob = put(&f.content, b"doomed", MEDIA_TYPE_NYDUS_BLOB).await;
        let layer = layer(b"l5");

        f.cache.store(&layer, &bootstrap, Some(&blob)).await.unwrap();
        std::fs::remove_file(f.content.blob_path(&blob.digest)).unwrap();

        assert!(f.cache.lookup(&layer).await.is_none());
    }

    #[tokio::test]
    async fn test_primary_link_satisfies_lookup() {
        let f = fixture().await;
        let bootstrap = put(&f.content, b"bootstrap", MEDIA_TYPE_LAYER).await;
        let layer = layer(b"l6");

        f.state
            .set_primary_if_absent(layer.chain_id(), &bootstrap)
            .unwrap();
        f.state
            .set_property(layer.chain_id(), BOOTSTRAP_PROPERTY, &bootstrap.digest.to_string())
            .unwrap();
        f.state
            .set_property(layer.chain_id(), BLOB_PROPERTY, EMPTY_BLOB)
            .unwrap();

        let found = f.cache.lookup(&layer).await.unwrap();
        assert_eq!(found.bootstrap, bootstrap);
    }

    #[tokio::test]
    async fn test_garbage_property_is_miss() {
        let f = fixture().await;
        let layer = layer(b"l7");
        f.state
            .set_property(layer.chain_id(), BOOTSTRAP_PROPERTY, "sha256:nope")
            .unwrap();
        f.state
            .set_property(layer.chain_id(), BLOB_PROPERTY, EMPTY_BLOB)
            .unwrap();

        assert!(f.cache.lookup(&layer).await.is_none());
    }
}
