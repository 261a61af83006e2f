use crate::StoreError;
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// An overlay whiteout: a character device with device number 0/0.
pub fn is_whiteout_device(meta: &fs::Metadata) -> bool {
    meta.file_type().is_char_device() && meta.rdev() == 0
}

/// Whether the process has root privileges (device nodes, chroot, chown).
#[allow(unsafe_code)]
pub fn running_as_root() -> bool {
    // SAFETY: getuid() takes no arguments and cannot fail.
    unsafe { libc::getuid() == 0 }
}

/// Create a device node (or fifo) at `path`.
#[allow(unsafe_code)]
pub fn make_node(path: &Path, mode: libc::mode_t, rdev: libc::dev_t) -> io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mknod(c_path.as_ptr(), mode, rdev) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Create an overlay whiteout marker at `path`.
pub fn make_whiteout(path: &Path) -> io::Result<()> {
    make_node(path, libc::S_IFCHR, 0)
}

/// Pack the whole tree under `source_dir` into a deterministic tar archive.
pub fn pack_layer(source_dir: &Path) -> Result<Vec<u8>, StoreError> {
    let mut paths = Vec::new();
    collect_paths(source_dir, source_dir, &mut paths)?;
    paths.sort();
    pack_paths(source_dir, &paths, Vec::new())
}

/// Write a tar archive of the given relative paths under `root` to `out`.
///
/// Entries are emitted in sorted order, each preceded by any ancestor
/// directories not yet written. Timestamps are zeroed; ownership and
/// permissions are kept. Character devices 0/0 are written as-is, which is
/// how whiteouts are carried in the archive. A file whose inode was already
/// written is emitted as a hard link to the first path.
pub fn pack_paths<W: Write>(root: &Path, paths: &[String], out: W) -> Result<W, StoreError> {
    let mut sorted: Vec<&String> = paths.iter().collect();
    sorted.sort();

    let mut ar = tar::Builder::new(out);
    ar.follow_symlinks(false);
    let mut emitted: BTreeSet<String> = BTreeSet::new();
    let mut links: HashMap<(u64, u64), String> = HashMap::new();

    for rel in sorted {
        let mut ancestor = PathBuf::new();
        let components: Vec<_> = Path::new(rel).components().collect();
        for comp in &components[..components.len().saturating_sub(1)] {
            ancestor.push(comp);
            let key = ancestor.to_string_lossy().into_owned();
            if emitted.insert(key.clone()) {
                append_entry(&mut ar, &key, &root.join(&ancestor), &mut links)?;
            }
        }
        if emitted.insert(rel.clone()) {
            append_entry(&mut ar, rel, &root.join(rel), &mut links)?;
        }
    }

    Ok(ar.into_inner()?)
}

/// Extract a tar layer on top of `target_dir`, applying whiteouts.
///
/// Both whiteout encodings are honoured: `.wh.<name>` / `.wh..wh..opq`
/// entries and character devices 0/0. A path whose type changes (directory
/// to file or back) is removed before the new entry is written.
pub fn unpack_layer(reader: impl Read, target_dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(target_dir)?;
    let mut ar = tar::Archive::new(reader);
    ar.set_preserve_permissions(true);
    ar.set_preserve_ownerships(running_as_root());
    ar.set_preserve_mtime(true);
    ar.set_unpack_xattrs(false);
    ar.set_overwrite(true);

    for entry in ar.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let Some(rel) = normalize_entry_path(&rel) else {
            continue;
        };
        let entry_type = entry.header().entry_type();
        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if name == OPAQUE_WHITEOUT {
            let dir = target_dir.join(rel.parent().unwrap_or(Path::new("")));
            clear_dir(&dir)?;
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            let victim = target_dir
                .join(rel.parent().unwrap_or(Path::new("")))
                .join(hidden);
            remove_path(&victim)?;
            continue;
        }
        if entry_type == tar::EntryType::Char
            && entry.header().device_major()?.unwrap_or(0) == 0
            && entry.header().device_minor()?.unwrap_or(0) == 0
        {
            remove_path(&target_dir.join(&rel))?;
            continue;
        }

        let dest = target_dir.join(&rel);
        if let Ok(existing) = dest.symlink_metadata() {
            if existing.is_dir() != entry_type.is_dir() || entry_type == tar::EntryType::Link {
                remove_path(&dest)?;
            }
        }

        let is_device = matches!(entry_type, tar::EntryType::Char | tar::EntryType::Block);
        match entry.unpack_in(target_dir) {
            Ok(_) => {}
            Err(e) if is_device && e.kind() == io::ErrorKind::PermissionDenied => {
                warn!("skipping device node {}: {e}", rel.display());
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Strip `./` and leading `/`; reject anything that could escape the target.
fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                warn!("skipping unsafe archive path {}", path.display());
                return None;
            }
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn remove_path(path: &Path) -> Result<(), StoreError> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("whiteout target {} already absent", path.display());
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<(), StoreError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

fn collect_paths(root: &Path, current: &Path, out: &mut Vec<String>) -> Result<(), StoreError> {
    if !current.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(current)? {
        let full = entry?.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| StoreError::Io(io::Error::other(format!("path strip: {e}"))))?
            .to_string_lossy()
            .into_owned();
        let is_dir = full.symlink_metadata()?.is_dir();
        out.push(rel);
        if is_dir {
            collect_paths(root, &full, out)?;
        }
    }
    Ok(())
}

fn make_header(meta: &fs::Metadata, entry_type: tar::EntryType) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mtime(0);
    header.set_uid(u64::from(meta.uid()));
    header.set_gid(u64::from(meta.gid()));
    header.set_mode(meta.permissions().mode() & 0o7777);
    header.set_size(0);
    header
}

fn append_entry<W: Write>(
    ar: &mut tar::Builder<W>,
    rel_path: &str,
    full_path: &Path,
    links: &mut HashMap<(u64, u64), String>,
) -> Result<(), StoreError> {
    let meta = full_path.symlink_metadata()?;
    let ft = meta.file_type();

    if ft.is_file() && meta.nlink() > 1 {
        let key = (meta.dev(), meta.ino());
        if let Some(first) = links.get(&key) {
            let mut header = make_header(&meta, tar::EntryType::Link);
            ar.append_link(&mut header, rel_path, first)?;
            return Ok(());
        }
        links.insert(key, rel_path.to_owned());
    }

    if ft.is_file() {
        let mut header = make_header(&meta, tar::EntryType::Regular);
        header.set_size(meta.len());
        header.set_cksum();
        ar.append_data(&mut header, rel_path, File::open(full_path)?)?;
    } else if ft.is_dir() {
        let mut header = make_header(&meta, tar::EntryType::Directory);
        header.set_cksum();
        ar.append_data(&mut header, format!("{rel_path}/"), io::empty())?;
    } else if ft.is_symlink() {
        let target = fs::read_link(full_path)?;
        let mut header = make_header(&meta, tar::EntryType::Symlink);
        ar.append_link(&mut header, rel_path, &target)?;
    } else if ft.is_char_device() || ft.is_block_device() {
        let kind = if ft.is_char_device() {
            tar::EntryType::Char
        } else {
            tar::EntryType::Block
        };
        let mut header = make_header(&meta, kind);
        header.set_device_major(libc::major(meta.rdev()))?;
        header.set_device_minor(libc::minor(meta.rdev()))?;
        header.set_cksum();
        ar.append_data(&mut header, rel_path, io::empty())?;
    } else if ft.is_fifo() {
        let mut header = make_header(&meta, tar::EntryType::Fifo);
        header.set_cksum();
        ar.append_data(&mut header, rel_path, io::empty())?;
    } else {
        warn!("skipping unsupported file type: {rel_path}");
    }
    Ok(())
}
