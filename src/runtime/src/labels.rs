//! Media types and snapshotter annotation keys of the accelerated format.

/// Media type of an accelerated-format data blob layer.
pub const MEDIA_TYPE_NYDUS_BLOB: &str = "application/vnd.oci.image.layer.nydus.blob.v1";

/// Media type of a gzipped image layer (carries the bootstrap).
pub const MEDIA_TYPE_IMAGE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Uncompressed content digest of a layer.
pub const LAYER_ANNOTATION_UNCOMPRESSED: &str = "containerd.io/uncompressed";

/// Marks a layer as an accelerated-format data blob.
pub const LAYER_ANNOTATION_NYDUS_BLOB: &str = "containerd.io/snapshot/nydus-blob";

/// Marks a layer as the accelerated-format bootstrap.
pub const LAYER_ANNOTATION_NYDUS_BOOTSTRAP: &str = "containerd.io/snapshot/nydus-bootstrap";

/// Filesystem version of the bootstrap layer.
pub const LAYER_ANNOTATION_NYDUS_FS_VERSION: &str = "containerd.io/snapshot/nydus-fs-version";

/// Comma-joined digests of the blobs added by successive commits.
pub const LAYER_ANNOTATION_NYDUS_COMMIT_BLOBS: &str = "containerd.io/snapshot/nydus-commit-blobs";

/// JSON array of blob ids, set when blobs live in an external backend.
pub const LAYER_ANNOTATION_NYDUS_BLOB_IDS: &str = "containerd.io/snapshot/nydus-blob-ids";
