use crate::blobs::BlobStore;
use crate::image::{Descriptor, ImageManifest};
use crate::layout::StoreLayout;
use crate::StoreError;
use std::collections::HashSet;
use std::fs;
use tracing::warn;

/// Removes blobs that no reference (or extra root) can reach.
pub struct GarbageCollector {
    layout: StoreLayout,
}

#[derive(Debug, Default)]
pub struct GcReport {
    pub orphaned_blobs: Vec<String>,
    pub removed_blobs: usize,
    pub removed_staging: usize,
}

impl GarbageCollector {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn collect(
        &self,
        extra_roots: &[Descriptor],
        dry_run: bool,
    ) -> Result<GcReport, StoreError> {
        let blobs = BlobStore::new(self.layout.clone());
        let mut report = GcReport::default();

        let mut roots: Vec<Descriptor> = extra_roots.to_vec();
        let refs_dir = self.layout.refs_dir();
        if refs_dir.exists() {
            for entry in fs::read_dir(&refs_dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match fs::read_to_string(&path)
                    .map_err(StoreError::from)
                    .and_then(|c| Ok(serde_json::from_str::<Descriptor>(&c)?))
                {
                    Ok(desc) => roots.push(desc),
                    Err(e) => warn!("skipping unreadable reference {}: {e}", path.display()),
                }
            }
        }

        let mut live: HashSet<String> = HashSet::new();
        for root in &roots {
            live.insert(root.digest.to_string());
            let manifest: ImageManifest = match blobs
                .get(&root.digest)
                .and_then(|d| Ok(serde_json::from_slice(&d)?))
            {
                Ok(m) => m,
                Err(e) => {
                    warn!("manifest {} unreadable: {e}", root.digest.short());
                    continue;
                }
            };
            if let Some(config) = &manifest.config {
                live.insert(config.digest.to_string());
            }
            for layer in &manifest.layers {
                live.insert(layer.digest.to_string());
            }
        }

        for digest in blobs.list()? {
            if !live.contains(&digest) {
                report.orphaned_blobs.push(digest);
            }
        }

        if !dry_run {
            for digest in &report.orphaned_blobs {
                blobs.remove(digest)?;
                report.removed_blobs += 1;
            }

            let staging = self.layout.staging_dir();
            if staging.exists() {
                for entry in fs::read_dir(&staging)? {
                    let path = entry?.path();
                    if path.is_dir() {
                        fs::remove_dir_all(&path)?;
                    } else {
                        fs::remove_file(&path)?;
                    }
                    report.removed_staging += 1;
                }
            }
        }

        Ok(report)
    }
}
