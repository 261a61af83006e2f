use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current image layout format version.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "strata-layout";

/// Directory layout of an image store: blobs, named references, and a
/// staging area for blobs that are still being written.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("blake3")
    }

    #[inline]
    pub fn refs_dir(&self) -> PathBuf {
        self.root.join("refs")
    }

    #[inline]
    pub fn ref_path(&self, name: &str) -> PathBuf {
        self.refs_dir().join(format!("{name}.json"))
    }

    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    #[inline]
    fn version_path(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    pub fn is_initialized(&self) -> bool {
        self.version_path().exists()
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.blobs_dir())?;
        fs::create_dir_all(self.refs_dir())?;
        fs::create_dir_all(self.staging_dir())?;

        if self.is_initialized() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            crate::write_atomic(
                &self.version_path(),
                serde_json::to_string_pretty(&ver)?.as_bytes(),
            )?;
        }
        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.version_path())?;
        let ver: StoreVersion = serde_json::from_str(&content)?;
        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

/// Directory layout of the builder's own state: cache records, per-layer
/// import directories, and the process lock.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    #[inline]
    pub fn imports_dir(&self) -> PathBuf {
        self.root.join("imports")
    }

    #[inline]
    pub fn import_dir(&self, layer: &str) -> PathBuf {
        self.imports_dir().join(layer)
    }

    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.cache_dir())?;
        fs::create_dir_all(self.imports_dir())?;
        fs::create_dir_all(self.staging_dir())?;
        Ok(())
    }
}
