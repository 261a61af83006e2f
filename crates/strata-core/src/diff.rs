//! Change-set computation between a bundle's last committed state and its
//! working rootfs, and packaging of that change-set into a layer blob.

use crate::package::{package, LayerType};
use crate::CoreError;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use strata_store::{make_whiteout, Descriptor, Fingerprint, FingerprintManifest, ImageStore};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Added,
    Modified,
    Removed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRecord {
    pub path: String,
    pub kind: DiffKind,
    pub old: Option<Fingerprint>,
    pub new: Option<Fingerprint>,
}

impl DiffRecord {
    /// Whether the path is a directory on the side that decides its payload.
    pub fn is_dir(&self) -> bool {
        self.new.as_ref().or(self.old.as_ref()).is_some_and(Fingerprint::is_dir)
    }
}

/// Classify every path found in either manifest, in path order.
pub fn compare(
    old: &FingerprintManifest,
    new: &FingerprintManifest,
    consider_timestamps: bool,
) -> Vec<DiffRecord> {
    let mut records = Vec::with_capacity(new.len().max(old.len()));

    for (path, after) in new.iter() {
        let kind = match old.get(path) {
            None => DiffKind::Added,
            Some(before) if before.same_as(after, consider_timestamps) => DiffKind::Unchanged,
            Some(_) => DiffKind::Modified,
        };
        records.push(DiffRecord {
            path: path.to_owned(),
            kind,
            old: old.get(path).cloned(),
            new: Some(after.clone()),
        });
    }
    for (path, before) in old.iter() {
        if !new.contains(path) {
            records.push(DiffRecord {
                path: path.to_owned(),
                kind: DiffKind::Removed,
                old: Some(before.clone()),
                new: None,
            });
        }
    }

    records.sort_by(|a, b| a.path.cmp(&b.path));
    records
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    pub layer_type: LayerType,
    pub consider_timestamps: bool,
}

/// Result of diffing and packaging one layer.
#[derive(Debug, Clone)]
pub struct DiffOutcome {
    pub records: Vec<DiffRecord>,
    /// Paths written to the layer, whiteouts included.
    pub included: Vec<String>,
    /// Removed paths that received a whiteout marker.
    pub whiteouts: Vec<String>,
    pub layer: Descriptor,
    /// Fingerprint of the rootfs as packaged; becomes the bundle's new state.
    pub fingerprint: FingerprintManifest,
}

impl DiffOutcome {
    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }

    pub fn count(&self, kind: DiffKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }
}

/// Whiteout markers made in the working rootfs, removed again on drop.
struct Whiteouts {
    created: Vec<PathBuf>,
}

impl Whiteouts {
    fn create(&mut self, rootfs: &Path, rel: &str) -> Result<bool, CoreError> {
        let path = rootfs.join(rel);
        match make_whiteout(&path) {
            Ok(()) => {
                self.created.push(path);
                Ok(true)
            }
            // the parent went too and carries its own marker
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT | libc::ENOTDIR)) => {
                debug!("no whiteout needed for {rel}: {e}");
                Ok(false)
            }
            Err(source) => Err(CoreError::Whiteout {
                path: rel.to_owned(),
                source,
            }),
        }
    }
}

impl Drop for Whiteouts {
    fn drop(&mut self) {
        for path in self.created.iter().rev() {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove whiteout {}: {e}", path.display());
                }
            }
        }
    }
}

/// Diff `rootfs` against `previous`, package the change-set with the
/// configured backend and commit it to `store`.
///
/// Removed paths are represented by character-device 0/0 markers created in
/// `rootfs` for the duration of packaging. On any error nothing has been
/// recorded and the rootfs is left without markers.
pub fn diff_and_package(
    rootfs: &Path,
    previous: &FingerprintManifest,
    opts: &DiffOptions,
    staging: &Path,
    store: &dyn ImageStore,
) -> Result<DiffOutcome, CoreError> {
    let current = FingerprintManifest::walk(rootfs)?;
    let records = compare(previous, &current, opts.consider_timestamps);

    let mut included = Vec::new();
    let mut excluded = Vec::new();
    let mut removed = Vec::new();
    for record in &records {
        match record.kind {
            DiffKind::Added | DiffKind::Modified => included.push(record.path.clone()),
            DiffKind::Unchanged => excluded.push(record.path.clone()),
            DiffKind::Removed => removed.push(record.path.as_str()),
        }
    }

    let mut markers = Whiteouts {
        created: Vec::new(),
    };
    let mut whiteouts = Vec::new();
    for rel in removed {
        if markers.create(rootfs, rel)? {
            whiteouts.push(rel.to_owned());
            included.push(rel.to_owned());
        }
    }
    included.sort();

    debug!(
        "diff: {} included ({} whiteouts), {} unchanged",
        included.len(),
        whiteouts.len(),
        excluded.len()
    );
    let blob = package(opts.layer_type, rootfs, &included, &excluded, staging)?;
    drop(markers);

    let mut reader = blob.open()?;
    let layer = store.add_blob(opts.layer_type.media_type(), &mut reader)?;

    Ok(DiffOutcome {
        records,
        included,
        whiteouts,
        layer,
        fingerprint: current,
    })
}
