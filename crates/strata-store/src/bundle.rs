use crate::fingerprint::FingerprintManifest;
use crate::image::Descriptor;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const BUNDLE_META_FILE: &str = "strata-bundle.json";

/// What a bundle's rootfs looked like when it was last committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMeta {
    /// Image this rootfs corresponds to; `None` for scratch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Descriptor>,
    pub fingerprint: FingerprintManifest,
    #[serde(default)]
    pub updated_at: String,
}

impl BundleMeta {
    pub fn new(from: Option<Descriptor>, fingerprint: FingerprintManifest) -> Self {
        Self {
            from,
            fingerprint,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Read the metadata of the bundle at `bundle_dir`. A bundle without
    /// metadata is treated as an empty scratch bundle.
    pub fn load(bundle_dir: &Path) -> Result<Self, StoreError> {
        let path = bundle_dir.join(BUNDLE_META_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, bundle_dir: &Path) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(self)?;
        crate::write_atomic(&bundle_dir.join(BUNDLE_META_FILE), content.as_bytes())
    }
}
