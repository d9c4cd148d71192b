//! Layers and layer chains.
//!
//! A layer is identified by its chain ID, which covers its own diff and the
//! diffs of every ancestor. Chains are always ordered ancestor first.

use plfm_digest::{chain_id, Digest};
use thiserror::Error;

use super::descriptor::{Compression, Descriptor};

/// Errors from building a layer chain.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("layer {index} ({digest}) has no uncompressed digest to derive its diff ID from")]
    MissingDiffId { index: usize, digest: Digest },
}

/// One filesystem layer of an image chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    chain_id: Digest,
    diff: Descriptor,
}

impl Layer {
    /// Create a layer from an already computed chain ID.
    pub fn new(chain_id: Digest, diff: Descriptor) -> Self {
        Self { chain_id, diff }
    }

    /// Chain ID of this layer.
    pub fn chain_id(&self) -> &Digest {
        &self.chain_id
    }

    /// Raw diff of this layer in the content store.
    pub fn diff(&self) -> &Descriptor {
        &self.diff
    }

    /// Diff ID (digest of the uncompressed diff), if known.
    pub fn diff_id(&self) -> Option<Digest> {
        diff_id(&self.diff)
    }
}

fn diff_id(diff: &Descriptor) -> Option<Digest> {
    match Compression::of(diff) {
        Some(Compression::Uncompressed) => Some(diff.digest.clone()),
        _ => diff.uncompressed_digest(),
    }
}

/// An ordered chain of layers, ancestor first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerChain {
    layers: Vec<Layer>,
}

impl LayerChain {
    /// Build a chain from raw diffs in order, computing every chain ID.
    pub fn from_diffs(diffs: Vec<Descriptor>) -> Result<Self, LayerError> {
        let mut layers: Vec<Layer> = Vec::with_capacity(diffs.len());
        for (index, diff) in diffs.into_iter().enumerate() {
            let Some(diff_id) = diff_id(&diff) else {
                return Err(LayerError::MissingDiffId {
                    index,
                    digest: diff.digest,
                });
            };
            let parent = layers.last().map(Layer::chain_id);
            let id = chain_id(parent, &diff_id);
            layers.push(Layer::new(id, diff));
        }
        Ok(Self { layers })
    }

    /// Layers, ancestor first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Chain ID of the terminal layer.
    pub fn chain_id(&self) -> Option<&Digest> {
        self.layers.last().map(Layer::chain_id)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::descriptor::{
        ANNOTATION_UNCOMPRESSED, MEDIA_TYPE_LAYER, MEDIA_TYPE_LAYER_GZIP,
    };

    #[test]
    fn test_chain_ids_follow_oci_rule() {
        let d1 = Descriptor::new(MEDIA_TYPE_LAYER, Digest::from_bytes(b"one"), 3);
        let d2 = Descriptor::new(MEDIA_TYPE_LAYER, Digest::from_bytes(b"two"), 3);

        let chain = LayerChain::from_diffs(vec![d1.clone(), d2.clone()]).unwrap();
        assert_eq!(chain.len(), 2);

        let first = &chain.layers()[0];
        assert_eq!(first.chain_id(), &d1.digest);

        let expected = chain_id(Some(&d1.digest), &d2.digest);
        assert_eq!(chain.chain_id(), Some(&expected));
    }

    #[test]
    fn test_gzip_diff_uses_uncompressed_annotation() {
        let uncompressed = Digest::from_bytes(b"raw");
        let gz = Descriptor::new(MEDIA_TYPE_LAYER_GZIP, Digest::from_bytes(b"gz"), 2)
            .with_annotation(ANNOTATION_UNCOMPRESSED, uncompressed.to_string());

        let chain = LayerChain::from_diffs(vec![gz]).unwrap();
        assert_eq!(chain.chain_id(), Some(&uncompressed));
    }

    #[test]
    fn test_gzip_diff_without_diff_id_rejected() {
        let gz = Descriptor::new(MEDIA_TYPE_LAYER_GZIP, Digest::from_bytes(b"gz"), 2);
        let err = LayerChain::from_diffs(vec![gz]).unwrap_err();
        assert!(matches!(err, LayerError::MissingDiffId { index: 0, .. }));
    }

    #[test]
    fn test_empty_chain() {
        let chain = LayerChain::from_diffs(Vec::new()).unwrap();
        assert!(chain.is_empty());
        assert!(chain.chain_id().is_none());
    }
}
