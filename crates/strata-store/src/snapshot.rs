use crate::layers::make_node;
use crate::{fsync_dir, StoreError};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Named filesystem states. A bundle is a directory holding `rootfs/` and
/// its metadata file.
pub trait SnapshotStore {
    /// Create an empty bundle. Fails if `name` already exists.
    fn create(&self, name: &str) -> Result<(), StoreError>;
    /// Create `dest` as a copy of `source`. Fails if `dest` already exists.
    fn restore(&self, source: &str, dest: &str) -> Result<(), StoreError>;
    /// Replace `dest` with a copy of `source`.
    fn snapshot(&self, source: &str, dest: &str) -> Result<(), StoreError>;
    /// Delete a bundle. Deleting a missing bundle is not an error.
    fn delete(&self, name: &str) -> Result<(), StoreError>;
    fn exists(&self, name: &str) -> bool;
    /// Bundle directory for `name`.
    fn path(&self, name: &str) -> PathBuf;
    /// Persistent bundles, sorted. Names starting with `.` are not listed.
    fn list(&self) -> Result<Vec<String>, StoreError>;

    fn rootfs(&self, name: &str) -> PathBuf {
        self.path(name).join("rootfs")
    }
}

/// [`SnapshotStore`] that snapshots by copying directory trees.
#[derive(Debug, Clone)]
pub struct DirSnapshotStore {
    root: PathBuf,
}

impl DirSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bundle_dir(&self, name: &str) -> Result<PathBuf, StoreError> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(StoreError::InvalidName(name.to_owned()));
        }
        Ok(self.root.join(name))
    }

    fn copy_bundle(&self, source: &str, dest: &str, replace: bool) -> Result<(), StoreError> {
        let src = self.bundle_dir(source)?;
        let dst = self.bundle_dir(dest)?;
        if !src.is_dir() {
            return Err(StoreError::SnapshotNotFound(source.to_owned()));
        }
        if dst.exists() && !replace {
            return Err(StoreError::SnapshotExists(dest.to_owned()));
        }

        let tmp = self
            .root
            .join(format!(".tmp-{dest}-{}", std::process::id()));
        if tmp.exists() {
            remove_tree(&tmp)?;
        }
        copy_tree(&src, &tmp)?;
        if dst.exists() {
            remove_tree(&dst)?;
        }
        fs::rename(&tmp, &dst)?;
        fsync_dir(&self.root)?;
        debug!("copied bundle {source} -> {dest}");
        Ok(())
    }
}

impl SnapshotStore for DirSnapshotStore {
    fn create(&self, name: &str) -> Result<(), StoreError> {
        let dir = self.bundle_dir(name)?;
        if dir.exists() {
            return Err(StoreError::SnapshotExists(name.to_owned()));
        }
        fs::create_dir_all(dir.join("rootfs"))?;
        Ok(())
    }

    fn restore(&self, source: &str, dest: &str) -> Result<(), StoreError> {
        self.copy_bundle(source, dest, false)
    }

    fn snapshot(&self, source: &str, dest: &str) -> Result<(), StoreError> {
        self.copy_bundle(source, dest, true)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        let dir = self.bundle_dir(name)?;
        if dir.exists() {
            remove_tree(&dir)?;
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.bundle_dir(name).is_ok_and(|d| d.is_dir())
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Remove a tree, first making directories writable so read-only
/// directories left by build scripts do not block removal.
fn remove_tree(path: &Path) -> Result<(), StoreError> {
    make_dirs_writable(path)?;
    fs::remove_dir_all(path)?;
    Ok(())
}

fn make_dirs_writable(path: &Path) -> io::Result<()> {
    let meta = path.symlink_metadata()?;
    if !meta.is_dir() {
        return Ok(());
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700))?;
    }
    for entry in fs::read_dir(path)? {
        make_dirs_writable(&entry?.path())?;
    }
    Ok(())
}

/// Recursively copy `src` to `dst`, preserving file types, permissions,
/// modification times, hard links, and (when permitted) ownership.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), StoreError> {
    let mut links = HashMap::new();
    copy_entry(src, dst, &mut links)
}

fn copy_entry(
    src: &Path,
    dst: &Path,
    links: &mut HashMap<(u64, u64), PathBuf>,
) -> Result<(), StoreError> {
    let meta = src.symlink_metadata()?;
    let ft = meta.file_type();

    if !ft.is_dir() && meta.nlink() > 1 {
        let key = (meta.dev(), meta.ino());
        if let Some(first) = links.get(&key) {
            fs::hard_link(first, dst)?;
            return Ok(());
        }
        links.insert(key, dst.to_path_buf());
    }

    if ft.is_dir() {
        fs::create_dir(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_entry(&entry.path(), &dst.join(entry.file_name()), links)?;
        }
        fs::set_permissions(dst, meta.permissions())?;
    } else if ft.is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(src)?, dst)?;
    } else if ft.is_file() {
        fs::copy(src, dst)?;
    } else if ft.is_char_device() || ft.is_block_device() || ft.is_fifo() {
        match make_node(dst, meta.mode(), meta.rdev()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!("skipping special file {}: {e}", src.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        warn!("skipping socket {}", src.display());
        return Ok(());
    }

    match std::os::unix::fs::lchown(dst, Some(meta.uid()), Some(meta.gid())) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {}
        Err(e) => return Err(e.into()),
    }
    // chown clears setuid/setgid, so the mode goes on last.
    if !ft.is_symlink() {
        fs::set_permissions(dst, meta.permissions())?;
    }
    set_times(dst, &meta)?;
    Ok(())
}

/// Copy access and modification times onto `path` without following a
/// final symlink.
#[allow(unsafe_code)]
fn set_times(path: &Path, meta: &fs::Metadata) -> io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let times = [
        libc::timespec {
            tv_sec: meta.atime(),
            tv_nsec: meta.atime_nsec(),
        },
        libc::timespec {
            tv_sec: meta.mtime(),
            tv_nsec: meta.mtime_nsec(),
        },
    ];
    // SAFETY: c_path is NUL-terminated and `times` holds exactly two entries,
    // both valid for the duration of the call.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
