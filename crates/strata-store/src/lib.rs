//! Storage layer for Strata.
//!
//! A content-addressable [`BlobStore`] backed by blake3, an [`ImageLayout`]
//! holding manifests, configs and named references, the persisted build
//! [`CacheStore`], named filesystem bundles behind [`SnapshotStore`], and the
//! [`FingerprintManifest`] used to diff a bundle against its last committed
//! state. Every record is replaced atomically via a temp file and rename.

pub mod blobs;
pub mod bundle;
pub mod cache;
pub mod fingerprint;
pub mod gc;
pub mod image;
pub mod layers;
pub mod layout;
pub mod snapshot;

pub use blobs::BlobStore;
pub use bundle::{BundleMeta, BUNDLE_META_FILE};
pub use cache::{CacheEntry, CacheRecord, CacheStore};
pub use fingerprint::{FileKind, Fingerprint, FingerprintManifest};
pub use gc::{GarbageCollector, GcReport};
pub use image::{
    Descriptor, History, ImageConfig, ImageLayout, ImageManifest, ImageStore, Mutation,
    RootFs, RuntimeConfig, MEDIA_TYPE_CONFIG, MEDIA_TYPE_LAYER_SQUASHFS, MEDIA_TYPE_LAYER_TAR,
    MEDIA_TYPE_MANIFEST,
};
pub use layers::{
    is_whiteout_device, make_node, make_whiteout, pack_layer, pack_paths, running_as_root,
    unpack_layer,
};
pub use layout::{StateLayout, StoreLayout, STORE_FORMAT_VERSION};
pub use snapshot::{copy_tree, DirSnapshotStore, SnapshotStore};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Replace `dest` with `data` via a synced temp file in the same directory.
pub(crate) fn write_atomic(dest: &Path, data: &[u8]) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .ok_or_else(|| std::io::Error::other(format!("{} has no parent", dest.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{name}': expected {expected}, got {actual}")]
    IntegrityFailure {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("blob not found: {0}")]
    BlobNotFound(String),
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("snapshot already exists: {0}")]
    SnapshotExists(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid name '{0}'")]
    InvalidName(String),
}
