use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Dir,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileKind {
    pub fn from_file_type(ft: fs::FileType) -> Self {
        if ft.is_dir() {
            FileKind::Dir
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::File
        }
    }
}

/// The recorded state of one path. Two fingerprints that compare equal (with
/// or without timestamps) describe content that packages identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub kind: FileKind,
    /// Permission bits including setuid/setgid/sticky.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Regular files and symlinks only; directory sizes are filesystem noise.
    #[serde(default)]
    pub size: u64,
    /// Non-directories only; directory link counts track subdirectory count.
    #[serde(default)]
    pub nlink: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub rdev: u64,
    /// blake3 of the file content, regular files only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub mtime: i64,
    #[serde(default)]
    pub mtime_nsec: i64,
}

impl Fingerprint {
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let meta = path.symlink_metadata()?;
        let kind = FileKind::from_file_type(meta.file_type());

        let (size, digest) = match kind {
            FileKind::File => (meta.len(), Some(content_digest(path)?)),
            FileKind::Symlink => (meta.len(), None),
            _ => (0, None),
        };
        let link = if kind == FileKind::Symlink {
            Some(fs::read_link(path)?.to_string_lossy().into_owned())
        } else {
            None
        };
        let rdev = match kind {
            FileKind::CharDevice | FileKind::BlockDevice => meta.rdev(),
            _ => 0,
        };

        Ok(Self {
            kind,
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            size,
            nlink: if kind == FileKind::Dir { 0 } else { meta.nlink() },
            link,
            rdev,
            digest,
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        })
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    /// Compare every keyed attribute; modification time only when asked.
    pub fn same_as(&self, other: &Fingerprint, consider_timestamps: bool) -> bool {
        let content_equal = self.kind == other.kind
            && self.mode == other.mode
            && self.uid == other.uid
            && self.gid == other.gid
            && self.size == other.size
            && self.nlink == other.nlink
            && self.link == other.link
            && self.rdev == other.rdev
            && self.digest == other.digest;
        content_equal
            && (!consider_timestamps
                || (self.mtime == other.mtime && self.mtime_nsec == other.mtime_nsec))
    }
}

/// blake3 of a file's bytes, streamed.
pub fn content_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Ordered map of relative path to [`Fingerprint`] for a whole tree.
/// The root itself is not recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FingerprintManifest {
    entries: BTreeMap<String, Fingerprint>,
}

impl FingerprintManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn walk(root: &Path) -> Result<Self, StoreError> {
        Self::walk_filtered(root, |_| false)
    }

    /// Walk `root`, skipping any relative path for which `skip` returns true
    /// (and everything beneath it).
    pub fn walk_filtered(root: &Path, skip: impl Fn(&str) -> bool) -> Result<Self, StoreError> {
        let mut manifest = Self::new();
        if root.exists() {
            walk_dir(root, root, &skip, &mut manifest.entries)?;
        }
        Ok(manifest)
    }

    pub fn insert(&mut self, path: impl Into<String>, fingerprint: Fingerprint) {
        self.entries.insert(path.into(), fingerprint);
    }

    pub fn get(&self, path: &str) -> Option<&Fingerprint> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Fingerprint)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Digest of the tree's content, ignoring modification times.
    pub fn content_digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (path, fp) in &self.entries {
            let line = format!(
                "{path}\0{:?}\0{:o}\0{}\0{}\0{}\0{}\0{}\0{}\n",
                fp.kind,
                fp.mode,
                fp.uid,
                fp.gid,
                fp.size,
                fp.link.as_deref().unwrap_or(""),
                fp.rdev,
                fp.digest.as_deref().unwrap_or(""),
            );
            hasher.update(line.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

fn walk_dir(
    root: &Path,
    current: &Path,
    skip: &dyn Fn(&str) -> bool,
    out: &mut BTreeMap<String, Fingerprint>,
) -> Result<(), StoreError> {
    for entry in fs::read_dir(current)? {
        let full = entry?.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| StoreError::Io(io::Error::other(format!("path strip: {e}"))))?
            .to_string_lossy()
            .into_owned();
        if skip(&rel) {
            continue;
        }
        let fp = Fingerprint::from_path(&full)?;
        let is_dir = fp.is_dir();
        out.insert(rel, fp);
        if is_dir {
            walk_dir(root, &full, skip, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), "1").unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d").join("f"), "nested").unwrap();
        std::os::unix::fs::symlink("a", dir.path().join("l")).unwrap();
        dir
    }

    #[test]
    fn walk_records_every_path_except_root() {
        let dir = fixture();
        let m = FingerprintManifest::walk(dir.path()).unwrap();
        assert_eq!(m.paths().collect::<Vec<_>>(), vec!["a", "d", "d/f", "l"]);
        assert_eq!(m.get("a").unwrap().kind, FileKind::File);
        assert!(m.get("d").unwrap().is_dir());
        assert_eq!(m.get("l").unwrap().link.as_deref(), Some("a"));
        assert_eq!(
            m.get("d/f").unwrap().digest.as_deref(),
            Some(blake3::hash(b"nested").to_hex().as_str())
        );
    }

    #[test]
    fn walk_filtered_skips_subtrees() {
        let dir = fixture();
        let m = FingerprintManifest::walk_filtered(dir.path(), |p| p == "d").unwrap();
        assert!(!m.contains("d"));
        assert!(!m.contains("d/f"));
        assert!(m.contains("a"));
    }

    #[test]
    fn walk_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let m = FingerprintManifest::walk(&dir.path().join("absent")).unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn content_change_is_detected() {
        let dir = fixture();
        let before = Fingerprint::from_path(&dir.path().join("a")).unwrap();
        fs::write(dir.path().join("a"), "2").unwrap();
        let after = Fingerprint::from_path(&dir.path().join("a")).unwrap();
        assert!(!before.same_as(&after, false));
    }

    #[test]
    fn mode_change_is_detected() {
        let dir = fixture();
        let path = dir.path().join("a");
        let before = Fingerprint::from_path(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        let after = Fingerprint::from_path(&path).unwrap();
        assert!(!before.same_as(&after, false));
    }

    #[test]
    fn timestamps_only_count_when_asked() {
        let dir = fixture();
        let path = dir.path().join("a");
        let before = Fingerprint::from_path(&path).unwrap();
        let when = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1000);
        File::open(&path).unwrap().set_modified(when).unwrap();
        let after = Fingerprint::from_path(&path).unwrap();
        assert!(before.same_as(&after, false));
        assert!(!before.same_as(&after, true));
    }

    #[test]
    fn content_digest_ignores_mtime() {
        let dir = fixture();
        let before = FingerprintManifest::walk(dir.path()).unwrap().content_digest();
        let when = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(5);
        File::open(dir.path().join("a"))
            .unwrap()
            .set_modified(when)
            .unwrap();
        let after = FingerprintManifest::walk(dir.path()).unwrap().content_digest();
        assert_eq!(before, after);

        fs::write(dir.path().join("a"), "changed").unwrap();
        let changed = FingerprintManifest::walk(dir.path()).unwrap().content_digest();
        assert_ne!(before, changed);
    }

    #[test]
    fn manifest_serializes_as_plain_map() {
        let dir = fixture();
        let m = FingerprintManifest::walk(dir.path()).unwrap();
        let json = serde_json::to_value(&m).unwrap();
        assert!(json.get("d/f").is_some());
        let back: FingerprintManifest = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }
}
