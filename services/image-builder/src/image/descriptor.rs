//! OCI content descriptors and the annotations nydus artifacts carry.
//!
//! Reference: https://github.com/opencontainers/image-spec/blob/main/descriptor.md

use std::collections::BTreeMap;
use std::fmt;

use plfm_digest::Digest;

/// OCI layer, uncompressed tar.
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
/// OCI layer, gzip-compressed tar.
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// OCI layer, zstd-compressed tar.
pub const MEDIA_TYPE_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
/// Docker schema 2 layer, uncompressed tar.
pub const MEDIA_TYPE_DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
/// Docker schema 2 layer, gzip-compressed tar.
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// Nydus data blob.
pub const MEDIA_TYPE_NYDUS_BLOB: &str = "application/vnd.oci.image.layer.nydus.blob.v1";

/// Digest of the uncompressed content; used to derive the layer's diff ID.
pub const ANNOTATION_UNCOMPRESSED: &str = "containerd.io/uncompressed";
/// Marks a nydus data blob.
pub const ANNOTATION_NYDUS_BLOB: &str = "containerd.io/snapshot/nydus-blob";
/// Marks a nydus bootstrap (metadata index).
pub const ANNOTATION_NYDUS_BOOTSTRAP: &str = "containerd.io/snapshot/nydus-bootstrap";
/// JSON array of the hex digests of the blobs a merged bootstrap refers to.
pub const ANNOTATION_NYDUS_BLOB_IDS: &str = "containerd.io/snapshot/nydus-blob-ids";

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Format specific flags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Create a descriptor without annotations.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: BTreeMap::new(),
        }
    }

    /// Add an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Get an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Whether this descriptor is a nydus data blob.
    pub fn is_nydus_blob(&self) -> bool {
        self.annotations.contains_key(ANNOTATION_NYDUS_BLOB)
    }

    /// Whether this descriptor is a nydus bootstrap.
    pub fn is_nydus_bootstrap(&self) -> bool {
        self.annotations.contains_key(ANNOTATION_NYDUS_BOOTSTRAP)
    }

    /// The uncompressed digest, if this descriptor records one and it parses.
    pub fn uncompressed_digest(&self) -> Option<Digest> {
        self.annotation(ANNOTATION_UNCOMPRESSED)
            .and_then(|d| Digest::parse(d).ok())
    }
}

/// Compression form a layer blob can be stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Plain tar.
    Uncompressed,
    /// Gzip-compressed tar.
    Gzip,
    /// Nydus blob or bootstrap.
    Nydus,
}

impl Compression {
    /// Classify a descriptor. Nydus annotations take precedence over the media type.
    pub fn of(desc: &Descriptor) -> Option<Self> {
        if desc.is_nydus_blob() || desc.is_nydus_bootstrap() {
            return Some(Self::Nydus);
        }
        match desc.media_type.as_str() {
            MEDIA_TYPE_LAYER | MEDIA_TYPE_DOCKER_LAYER => Some(Self::Uncompressed),
            MEDIA_TYPE_LAYER_GZIP | MEDIA_TYPE_DOCKER_LAYER_GZIP => Some(Self::Gzip),
            _ => None,
        }
    }

    /// Key used for the layer's blob variant slot.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uncompressed => "uncompressed",
            Self::Gzip => "gzip",
            Self::Nydus => "nydus",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn desc(media_type: &str) -> Descriptor {
        Descriptor::new(media_type, Digest::from_bytes(b"x"), 1)
    }

    #[rstest]
    #[case(MEDIA_TYPE_LAYER, Some(Compression::Uncompressed))]
    #[case(MEDIA_TYPE_DOCKER_LAYER, Some(Compression::Uncompressed))]
    #[case(MEDIA_TYPE_LAYER_GZIP, Some(Compression::Gzip))]
    #[case(MEDIA_TYPE_DOCKER_LAYER_GZIP, Some(Compression::Gzip))]
    #[case(MEDIA_TYPE_LAYER_ZSTD, None)]
    #[case(MEDIA_TYPE_NYDUS_BLOB, None)]
    fn test_compression_from_media_type(
        #[case] media_type: &str,
        #[case] expected: Option<Compression>,
    ) {
        assert_eq!(Compression::of(&desc(media_type)), expected);
    }

    #[test]
    fn test_nydus_annotation_wins() {
        let bootstrap =
            desc(MEDIA_TYPE_LAYER_GZIP).with_annotation(ANNOTATION_NYDUS_BOOTSTRAP, "true");
        assert_eq!(Compression::of(&bootstrap), Some(Compression::Nydus));
        assert!(bootstrap.is_nydus_bootstrap());
        assert!(!bootstrap.is_nydus_blob());
    }

    #[test]
    fn test_descriptor_json_shape() {
        let d = desc(MEDIA_TYPE_LAYER_GZIP)
            .with_annotation(ANNOTATION_UNCOMPRESSED, Digest::from_bytes(b"y").to_string());
        let json = serde_json::to_value(&d).unwrap();

        assert_eq!(json["mediaType"], MEDIA_TYPE_LAYER_GZIP);
        assert_eq!(json["size"], 1);
        assert!(json["annotations"][ANNOTATION_UNCOMPRESSED].is_string());
        assert_eq!(d.uncompressed_digest(), Some(Digest::from_bytes(b"y")));

        let plain = serde_json::to_value(desc(MEDIA_TYPE_LAYER)).unwrap();
        assert!(plain.get("annotations").is_none());
    }
}
