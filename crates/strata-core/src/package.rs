use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use strata_store::{pack_paths, MEDIA_TYPE_LAYER_SQUASHFS, MEDIA_TYPE_LAYER_TAR};
use tempfile::TempDir;
use tracing::debug;

/// Packaging backend for a layer's change-set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    #[default]
    Tar,
    Squashfs,
}

impl LayerType {
    pub fn name(self) -> &'static str {
        match self {
            LayerType::Tar => "tar",
            LayerType::Squashfs => "squashfs",
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            LayerType::Tar => MEDIA_TYPE_LAYER_TAR,
            LayerType::Squashfs => MEDIA_TYPE_LAYER_SQUASHFS,
        }
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LayerType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tar" => Ok(LayerType::Tar),
            "squashfs" => Ok(LayerType::Squashfs),
            other => Err(CoreError::Config(format!(
                "unknown layer type '{other}' (expected tar or squashfs)"
            ))),
        }
    }
}

/// Include/exclude bookkeeping for `mksquashfs`, which can only be told
/// what to leave out. An excluded directory that is an ancestor of an
/// included path is dropped from the exclude list, or the included path
/// would be lost with it.
#[derive(Debug, Default, Clone)]
pub struct ExcludePaths {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

fn is_ancestor_or_self(ancestor: &str, path: &str) -> bool {
    path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl ExcludePaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_include(&mut self, path: impl Into<String>) {
        self.include.insert(path.into());
    }

    pub fn add_exclude(&mut self, path: impl Into<String>) {
        self.exclude.insert(path.into());
    }

    /// Paths to hand to `mksquashfs -ef`, sorted.
    pub fn excluded(&self) -> Vec<&str> {
        self.exclude
            .iter()
            .filter(|e| !self.include.iter().any(|i| is_ancestor_or_self(e, i)))
            .map(String::as_str)
            .collect()
    }

    pub fn included(&self) -> impl Iterator<Item = &str> {
        self.include.iter().map(String::as_str)
    }
}

/// A packaged blob waiting to be committed. The file lives in a temporary
/// directory removed on drop.
pub struct PackagedBlob {
    _dir: TempDir,
    path: PathBuf,
}

impl PackagedBlob {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> std::io::Result<File> {
        File::open(&self.path)
    }
}

/// Package the selection of `rootfs` into a blob under `staging`.
///
/// `included` are relative paths that go into the layer (changed paths and
/// whiteout markers); `excluded` are unchanged paths, used only by the
/// squashfs backend.
pub fn package(
    layer_type: LayerType,
    rootfs: &Path,
    included: &[String],
    excluded: &[String],
    staging: &Path,
) -> Result<PackagedBlob, CoreError> {
    fs::create_dir_all(staging)?;
    let dir = tempfile::Builder::new()
        .prefix("layer-")
        .tempdir_in(staging)?;

    let path = match layer_type {
        LayerType::Tar => {
            let path = dir.path().join("layer.tar");
            let out = BufWriter::new(File::create(&path)?);
            let mut out = pack_paths(rootfs, included, out)?;
            out.flush()?;
            path
        }
        LayerType::Squashfs => {
            let mut paths = ExcludePaths::new();
            for p in included {
                paths.add_include(rootfs.join(p).to_string_lossy().into_owned());
            }
            for p in excluded {
                paths.add_exclude(rootfs.join(p).to_string_lossy().into_owned());
            }
            let exclude_file = dir.path().join("excludes");
            let mut list = String::new();
            for e in paths.excluded() {
                list.push_str(e);
                list.push('\n');
            }
            fs::write(&exclude_file, list)?;

            let path = dir.path().join("layer.squashfs");
            make_squashfs(rootfs, &path, &exclude_file)?;
            path
        }
    };
    debug!("packaged {} paths as {layer_type}", included.len());
    Ok(PackagedBlob { _dir: dir, path })
}

fn make_squashfs(rootfs: &Path, out: &Path, exclude_file: &Path) -> Result<(), CoreError> {
    let output = Command::new("mksquashfs")
        .arg(rootfs)
        .arg(out)
        .arg("-ef")
        .arg(exclude_file)
        .output()
        .map_err(|e| CoreError::Config(format!("mksquashfs not found or failed to start: {e}")))?;
    if !output.status.success() {
        return Err(CoreError::Diff(format!(
            "mksquashfs failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_type_parses_known_names() {
        assert_eq!("tar".parse::<LayerType>().unwrap(), LayerType::Tar);
        assert_eq!(
            "squashfs".parse::<LayerType>().unwrap(),
            LayerType::Squashfs
        );
        assert!(matches!(
            "zip".parse::<LayerType>(),
            Err(CoreError::Config(_))
        ));
        assert_eq!(LayerType::Squashfs.to_string(), "squashfs");
    }

    #[test]
    fn excluded_ancestors_of_includes_are_dropped() {
        let mut p = ExcludePaths::new();
        p.add_exclude("/r/etc");
        p.add_exclude("/r/etc-old");
        p.add_exclude("/r/usr");
        p.add_exclude("/r/usr/bin/ls");
        p.add_include("/r/etc/hostname");
        p.add_include("/r/usr/bin");
        assert_eq!(p.excluded(), vec!["/r/etc-old", "/r/usr/bin/ls"]);
    }

    #[test]
    fn tar_package_contains_only_selection() {
        let rootfs = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        fs::write(rootfs.path().join("a"), "1").unwrap();
        fs::write(rootfs.path().join("b"), "3").unwrap();
        fs::write(rootfs.path().join("c"), "4").unwrap();

        let blob = package(
            LayerType::Tar,
            rootfs.path(),
            &["b".to_owned(), "c".to_owned()],
            &["a".to_owned()],
            staging.path(),
        )
        .unwrap();
        let mut ar = tar::Archive::new(blob.open().unwrap());
        let names: Vec<String> = ar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn packaged_blob_is_removed_on_drop() {
        let rootfs = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let blob = package(LayerType::Tar, rootfs.path(), &[], &[], staging.path()).unwrap();
        let path = blob.path().to_path_buf();
        assert!(path.exists());
        drop(blob);
        assert!(!path.exists());
    }
}
