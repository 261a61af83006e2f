use crate::image::Descriptor;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use strata_schema::LayerIdentity;
use tracing::warn;

/// What a successful layer build left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheEntry {
    /// Committed image manifest for the layer.
    Packaged(Descriptor),
    /// Build-only layers exist only as a snapshot.
    BuildOnly { snapshot: String },
}

/// One persisted cache record, keyed by layer name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub layer: String,
    pub identity: LayerIdentity,
    pub entry: CacheEntry,
    pub created_at: String,
    /// blake3 over the record without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl CacheRecord {
    pub fn new(layer: impl Into<String>, identity: LayerIdentity, entry: CacheEntry) -> Self {
        Self {
            layer: layer.into(),
            identity,
            entry,
            created_at: chrono::Utc::now().to_rfc3339(),
            checksum: None,
        }
    }

    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// One JSON record per layer under a directory, each replaced atomically.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, layer: &str) -> Result<PathBuf, StoreError> {
        strata_schema::validate_layer_name(layer)
            .map_err(|_| StoreError::InvalidName(layer.to_owned()))?;
        Ok(self.dir.join(format!("{layer}.json")))
    }

    pub fn put(&self, record: &CacheRecord) -> Result<(), StoreError> {
        let dest = self.record_path(&record.layer)?;
        fs::create_dir_all(&self.dir)?;

        let mut with_checksum = record.clone();
        with_checksum.checksum = Some(with_checksum.compute_checksum()?);
        let content = serde_json::to_string_pretty(&with_checksum)?;
        crate::write_atomic(&dest, content.as_bytes())
    }

    /// The record for `layer`, or `None` if there is none.
    pub fn get(&self, layer: &str) -> Result<Option<CacheRecord>, StoreError> {
        let path = self.record_path(layer)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let record: CacheRecord = serde_json::from_str(&content)?;

        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    name: layer.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(Some(record))
    }

    pub fn remove(&self, layer: &str) -> Result<(), StoreError> {
        let path = self.record_path(layer)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Every readable record, sorted by layer. Corrupt records are skipped.
    pub fn list(&self) -> Result<Vec<CacheRecord>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(layer) = name.strip_suffix(".json") {
                    if !layer.starts_with('.') {
                        names.push(layer.to_owned());
                    }
                }
            }
        }
        names.sort();

        let mut records = Vec::new();
        for layer in names {
            match self.get(&layer) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("skipping cache record {layer}: {e}"),
            }
        }
        Ok(records)
    }

    /// Delete every record. Returns how many were removed.
    pub fn clear(&self) -> Result<usize, StoreError> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
