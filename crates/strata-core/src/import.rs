use crate::run::RUN_SCRIPT;
use crate::CoreError;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use strata_store::fingerprint::content_digest;
use strata_store::{copy_tree, FingerprintManifest, StateLayout};
use tracing::{debug, info};

/// A layer's synchronised import directory and its content fingerprint.
#[derive(Debug, Clone)]
pub struct ImportResult {
    pub dir: PathBuf,
    /// Digest over names, modes and contents; feeds the layer identity.
    pub fingerprint: String,
}

pub trait Importer {
    /// Bring `sources` into the layer's import directory. Local sources must
    /// already be absolute; `http://` and `https://` sources are downloaded.
    fn import(&self, layer: &str, sources: &[String]) -> Result<ImportResult, CoreError>;
}

/// Copies local files and directories into `<state>/imports/<layer>/`,
/// leaving unchanged entries alone so repeated imports are cheap.
pub struct LocalImporter {
    state: StateLayout,
    agent: ureq::Agent,
}

impl LocalImporter {
    pub fn new(state: StateLayout) -> Self {
        Self {
            state,
            agent: ureq::Agent::new_with_defaults(),
        }
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), CoreError> {
        if dest.exists() {
            debug!("{url} already downloaded");
            return Ok(());
        }
        info!("downloading {url}");
        let resp = match self.agent.get(url).call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(code)) => {
                return Err(CoreError::Import(format!("HTTP {code} for {url}")));
            }
            Err(e) => return Err(CoreError::Import(format!("{url}: {e}"))),
        };
        let dir = dest
            .parent()
            .ok_or_else(|| CoreError::Import(format!("bad download target for {url}")))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        io::copy(&mut resp.into_body().into_reader(), tmp.as_file_mut())?;
        tmp.persist(dest).map_err(|e| CoreError::Io(e.error))?;
        Ok(())
    }
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn entry_name(source: &str) -> Result<String, CoreError> {
    let trimmed = source.trim_end_matches('/');
    let name = if is_remote(trimmed) {
        trimmed.rsplit('/').next().unwrap_or_default()
    } else {
        Path::new(trimmed)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    };
    if name.is_empty() || name == RUN_SCRIPT || name == "." || name == ".." {
        return Err(CoreError::Import(format!(
            "cannot derive an import name from '{source}'"
        )));
    }
    Ok(name.to_owned())
}

fn remove_any(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy `src` to `dest` unless `dest` already holds the same content.
fn sync_entry(src: &Path, dest: &Path) -> Result<bool, CoreError> {
    let meta = fs::metadata(src)
        .map_err(|e| CoreError::Import(format!("{}: {e}", src.display())))?;

    if meta.is_dir() {
        if dest.is_dir() {
            let have = FingerprintManifest::walk(dest)?.content_digest();
            let want = FingerprintManifest::walk(src)?.content_digest();
            if have == want {
                return Ok(false);
            }
        }
        if fs::symlink_metadata(dest).is_ok() {
            remove_any(dest)?;
        }
        copy_tree(src, dest)?;
        return Ok(true);
    }

    if let Ok(existing) = fs::symlink_metadata(dest) {
        if existing.is_file()
            && existing.len() == meta.len()
            && existing.permissions() == meta.permissions()
            && content_digest(dest)? == content_digest(src)?
        {
            return Ok(false);
        }
        remove_any(dest)?;
    }
    let mut from = File::open(src)?;
    let mut to = File::create(dest)?;
    io::copy(&mut from, &mut to)?;
    to.set_permissions(meta.permissions())?;
    Ok(true)
}

impl Importer for LocalImporter {
    fn import(&self, layer: &str, sources: &[String]) -> Result<ImportResult, CoreError> {
        let dir = self.state.import_dir(layer);
        fs::create_dir_all(&dir)?;

        let mut names = BTreeSet::new();
        for source in sources {
            let name = entry_name(source)?;
            if !names.insert(name.clone()) {
                return Err(CoreError::Import(format!(
                    "two imports of layer '{layer}' are both named '{name}'"
                )));
            }
            let dest = dir.join(&name);
            if is_remote(source) {
                self.download(source, &dest)?;
            } else if sync_entry(Path::new(source), &dest)? {
                debug!("{layer}: imported {source}");
            } else {
                debug!("{layer}: {name} unchanged");
            }
        }

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != RUN_SCRIPT && !names.contains(&name) {
                debug!("{layer}: removing stale import {name}");
                remove_any(&entry.path())?;
            }
        }

        let fingerprint = FingerprintManifest::walk_filtered(&dir, |p| p == RUN_SCRIPT)?
            .content_digest();
        Ok(ImportResult { dir, fingerprint })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, LocalImporter) {
        let state = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let importer = LocalImporter::new(StateLayout::new(state.path()));
        (state, src, importer)
    }

    fn abs(dir: &Path, name: &str) -> String {
        dir.join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn imports_files_and_directories() {
        let (_state, src, importer) = setup();
        fs::write(src.path().join("app.conf"), "port=80").unwrap();
        fs::create_dir_all(src.path().join("assets/css")).unwrap();
        fs::write(src.path().join("assets/css/site.css"), "body{}").unwrap();

        let result = importer
            .import("web", &[abs(src.path(), "app.conf"), abs(src.path(), "assets")])
            .unwrap();
        assert_eq!(
            fs::read_to_string(result.dir.join("app.conf")).unwrap(),
            "port=80"
        );
        assert!(result.dir.join("assets/css/site.css").exists());
    }

    #[test]
    fn unchanged_sources_are_not_copied_again() {
        let (_state, src, importer) = setup();
        fs::write(src.path().join("a"), "1").unwrap();
        let sources = [abs(src.path(), "a")];

        let first = importer.import("l", &sources).unwrap();
        let ino = fs::metadata(first.dir.join("a")).unwrap().ino();
        let second = importer.import("l", &sources).unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(fs::metadata(second.dir.join("a")).unwrap().ino(), ino);
    }

    #[test]
    fn changed_content_changes_fingerprint() {
        let (_state, src, importer) = setup();
        fs::write(src.path().join("a"), "1").unwrap();
        let sources = [abs(src.path(), "a")];
        let before = importer.import("l", &sources).unwrap().fingerprint;
        fs::write(src.path().join("a"), "2").unwrap();
        let after = importer.import("l", &sources).unwrap();
        assert_ne!(before, after.fingerprint);
        assert_eq!(fs::read_to_string(after.dir.join("a")).unwrap(), "2");
    }

    #[test]
    fn stale_entries_are_removed_but_script_is_kept() {
        let (_state, src, importer) = setup();
        fs::write(src.path().join("a"), "1").unwrap();
        fs::write(src.path().join("b"), "2").unwrap();
        let dir = importer
            .import("l", &[abs(src.path(), "a"), abs(src.path(), "b")])
            .unwrap()
            .dir;
        fs::write(dir.join(RUN_SCRIPT), "#!/bin/sh\n").unwrap();

        let result = importer.import("l", &[abs(src.path(), "a")]).unwrap();
        assert!(result.dir.join("a").exists());
        assert!(!result.dir.join("b").exists());
        assert!(result.dir.join(RUN_SCRIPT).exists());
    }

    #[test]
    fn run_script_does_not_affect_fingerprint() {
        let (_state, src, importer) = setup();
        fs::write(src.path().join("a"), "1").unwrap();
        let sources = [abs(src.path(), "a")];
        let first = importer.import("l", &sources).unwrap();
        fs::write(first.dir.join(RUN_SCRIPT), "echo changed\n").unwrap();
        let second = importer.import("l", &sources).unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (_state, src, importer) = setup();
        fs::create_dir_all(src.path().join("x")).unwrap();
        fs::write(src.path().join("a"), "1").unwrap();
        fs::write(src.path().join("x/a"), "2").unwrap();
        let err = importer
            .import("l", &[abs(src.path(), "a"), abs(src.path(), "x/a")])
            .unwrap_err();
        assert!(matches!(err, CoreError::Import(_)));
    }

    #[test]
    fn missing_source_is_an_import_error() {
        let (_state, src, importer) = setup();
        let err = importer.import("l", &[abs(src.path(), "nope")]).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn names_from_urls() {
        assert_eq!(
            entry_name("https://example.com/dl/tool.tar.gz").unwrap(),
            "tool.tar.gz"
        );
        assert_eq!(entry_name("/src/dir/").unwrap(), "dir");
        assert!(entry_name("https://example.com/").is_err());
    }
}
