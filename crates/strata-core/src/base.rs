//! Starting filesystems for layers: identity of each kind of base and how
//! it is laid down in the working bundle.

use crate::cache::BuildCache;
use crate::CoreError;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use strata_schema::{BaseRef, RecipeFile};
use strata_store::fingerprint::content_digest;
use strata_store::{
    unpack_layer, BundleMeta, Descriptor, FingerprintManifest, ImageLayout, ImageStore,
    SnapshotStore, MEDIA_TYPE_LAYER_TAR,
};
use tracing::{debug, info};

/// Ephemeral bundle every rebuilt layer is assembled in.
pub const WORKING_SNAPSHOT: &str = ".working";

/// Exclusive handle on the working bundle.
///
/// Only [`WorkingBundle::acquire`] makes one, after clearing whatever an
/// earlier layer left behind. Each pipeline phase takes the handle by value
/// and hands it on, and [`WorkingBundle::release`] consumes it, so two
/// layers can never hold the bundle at once.
#[derive(Debug)]
pub struct WorkingBundle {
    dir: PathBuf,
    rootfs: PathBuf,
}

impl WorkingBundle {
    pub fn acquire(snapshots: &dyn SnapshotStore) -> Result<Self, CoreError> {
        Self::discard_stale(snapshots)?;
        Ok(Self {
            dir: snapshots.path(WORKING_SNAPSHOT),
            rootfs: snapshots.rootfs(WORKING_SNAPSHOT),
        })
    }

    /// Delete a working bundle left by a failed or unladen build.
    pub fn discard_stale(snapshots: &dyn SnapshotStore) -> Result<(), CoreError> {
        if snapshots.exists(WORKING_SNAPSHOT) {
            snapshots.delete(WORKING_SNAPSHOT)?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Replace the persistent snapshot `layer` with a copy of this bundle.
    pub fn snapshot_as(
        self,
        snapshots: &dyn SnapshotStore,
        layer: &str,
    ) -> Result<Self, CoreError> {
        snapshots.snapshot(WORKING_SNAPSHOT, layer)?;
        Ok(self)
    }

    /// Delete the bundle, or leave it on disk for inspection when `keep`.
    pub fn release(self, snapshots: &dyn SnapshotStore, keep: bool) -> Result<(), CoreError> {
        if keep {
            info!("working bundle left at {}", self.dir.display());
            return Ok(());
        }
        snapshots.delete(WORKING_SNAPSHOT)?;
        Ok(())
    }
}

/// The working bundle after its base is in place.
#[derive(Debug, Clone)]
pub struct BaseState {
    /// Image the rootfs corresponds to, carried into the new manifest.
    pub from: Option<Descriptor>,
    /// Last committed state of the rootfs, the left side of the diff.
    pub fingerprint: FingerprintManifest,
}

fn open_source_layout(file: &RecipeFile, layout: &str) -> Result<ImageLayout, CoreError> {
    let path = file.resolve_path(layout);
    ImageLayout::open_existing(&path)
        .map_err(|e| CoreError::Config(format!("base image layout {}: {e}", path.display())))
}

fn resolve_source(
    file: &RecipeFile,
    layout: &str,
    tag: &str,
) -> Result<(ImageLayout, Descriptor), CoreError> {
    let source = open_source_layout(file, layout)?;
    let descriptor = source.resolve_reference(tag)?.ok_or_else(|| {
        CoreError::Config(format!("base image '{tag}' not found in {layout}"))
    })?;
    Ok((source, descriptor))
}

/// Identity string of a base, folded into the layer identity.
///
/// Built bases chain on the upstream layer's identity; external bases are
/// keyed by their content.
pub fn base_identity(
    base: &BaseRef,
    file: &RecipeFile,
    cache: &BuildCache,
    snapshots: &dyn SnapshotStore,
) -> Result<String, CoreError> {
    match base {
        BaseRef::Scratch => Ok("scratch".to_owned()),
        BaseRef::Tar { path } => {
            let path = file.resolve_path(path);
            let digest = content_digest(&path)
                .map_err(|e| CoreError::Config(format!("base tarball {}: {e}", path.display())))?;
            Ok(format!("tar:{digest}"))
        }
        BaseRef::Oci { layout, tag } => {
            let (_, descriptor) = resolve_source(file, layout, tag)?;
            Ok(format!("oci:{}", descriptor.digest))
        }
        BaseRef::Built { tag } => {
            if let Some(identity) = cache.identity_of(tag)? {
                return Ok(format!("built:{identity}"));
            }
            // built by an earlier invocation whose cache record is gone
            if snapshots.exists(tag) {
                let meta = BundleMeta::load(&snapshots.path(tag))?;
                return Ok(format!("snapshot:{}", meta.fingerprint.content_digest()));
            }
            Err(CoreError::Config(format!(
                "base layer '{tag}' is not defined by any recipe and has no snapshot"
            )))
        }
    }
}

/// Copy an image's manifest, config and layers into `dest`.
fn copy_image(
    source: &ImageLayout,
    descriptor: &Descriptor,
    dest: &dyn ImageStore,
) -> Result<(), CoreError> {
    let manifest = source.read_manifest(descriptor)?;
    let mut blobs = vec![descriptor.clone()];
    blobs.extend(manifest.config.iter().cloned());
    blobs.extend(manifest.layers.iter().cloned());

    for blob in blobs {
        if dest.has_blob(&blob.digest) {
            continue;
        }
        debug!("copying blob {}", blob.digest.short());
        let mut reader = source.blobs().open(&blob.digest)?;
        let copied = dest.add_blob(&blob.media_type, &mut reader)?;
        if copied.digest != blob.digest {
            return Err(CoreError::Store(strata_store::StoreError::IntegrityFailure {
                name: blob.digest.to_string(),
                expected: blob.digest.to_string(),
                actual: copied.digest.to_string(),
            }));
        }
    }
    Ok(())
}

/// Lay down `base` as the working bundle's rootfs.
///
/// Built bases are restored from their snapshot; external ones are
/// extracted into a fresh bundle whose metadata is written before returning.
pub fn materialize(
    working: WorkingBundle,
    base: &BaseRef,
    file: &RecipeFile,
    snapshots: &dyn SnapshotStore,
    images: &dyn ImageStore,
) -> Result<(WorkingBundle, BaseState), CoreError> {
    if let BaseRef::Built { tag } = base {
        debug!("restoring snapshot {tag}");
        snapshots.restore(tag, WORKING_SNAPSHOT)?;
        let meta = BundleMeta::load(working.dir())?;
        let state = BaseState {
            from: meta.from,
            fingerprint: meta.fingerprint,
        };
        return Ok((working, state));
    }

    snapshots.create(WORKING_SNAPSHOT)?;
    let rootfs = working.rootfs();

    let from = match base {
        BaseRef::Scratch | BaseRef::Built { .. } => None,
        BaseRef::Tar { path } => {
            let path = file.resolve_path(path);
            info!("unpacking base tarball {}", path.display());
            unpack_layer(BufReader::new(File::open(&path)?), rootfs)?;

            let layer = images.add_blob(MEDIA_TYPE_LAYER_TAR, &mut File::open(&path)?)?;
            let mut mutation = images.begin_mutation(None)?;
            mutation.add_layer(layer);
            Some(images.commit_mutation(mutation)?)
        }
        BaseRef::Oci { layout, tag } => {
            let (source, descriptor) = resolve_source(file, layout, tag)?;
            copy_image(&source, &descriptor, images)?;
            let manifest = images.read_manifest(&descriptor)?;
            info!(
                "unpacking {} layer(s) of {tag} from {layout}",
                manifest.layers.len()
            );
            for layer in &manifest.layers {
                if layer.media_type != MEDIA_TYPE_LAYER_TAR {
                    return Err(CoreError::Config(format!(
                        "base image '{tag}' has a {} layer; only tar layers can be unpacked",
                        layer.media_type
                    )));
                }
                let blob = source.blobs().open(&layer.digest)?;
                unpack_layer(BufReader::new(blob), rootfs)?;
            }
            Some(descriptor)
        }
    };

    let fingerprint = FingerprintManifest::walk(rootfs)?;
    BundleMeta::new(from.clone(), fingerprint.clone()).save(working.dir())?;
    Ok((working, BaseState { from, fingerprint }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use strata_schema::{parse_recipe_str, Substitutions};
    use strata_store::{pack_layer, DirSnapshotStore};

    struct Env {
        dir: tempfile::TempDir,
        snapshots: DirSnapshotStore,
        images: ImageLayout,
        cache: BuildCache,
    }

    fn env() -> Env {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = DirSnapshotStore::new(dir.path().join("roots"));
        let images = ImageLayout::open(dir.path().join("oci")).unwrap();
        let cache = BuildCache::new(dir.path().join("cache"));
        Env {
            dir,
            snapshots,
            images,
            cache,
        }
    }

    fn recipe_file(dir: &Path, text: &str) -> RecipeFile {
        let path = dir.join("recipe.toml");
        fs::write(&path, text).unwrap();
        strata_schema::parse_recipe_file(&path, &Substitutions::new()).unwrap()
    }

    fn lay_down(e: &Env, base: &BaseRef, file: &RecipeFile) -> (WorkingBundle, BaseState) {
        let working = WorkingBundle::acquire(&e.snapshots).unwrap();
        materialize(working, base, file, &e.snapshots, &e.images).unwrap()
    }

    fn base_of(text: &str) -> BaseRef {
        let (_, layers) = parse_recipe_str(text, &Substitutions::new()).unwrap();
        layers.into_values().next().unwrap().from
    }

    fn base_tarball(dir: &Path) {
        let src = dir.join("src");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::write(src.join("etc/os-release"), "ID=test\n").unwrap();
        fs::write(dir.join("base.tar"), pack_layer(&src).unwrap()).unwrap();
    }

    const TAR: &str = "[a]\nfrom = { type = \"tar\", path = \"base.tar\" }\n";

    #[test]
    fn scratch_gives_empty_bundle() {
        let e = env();
        let file = recipe_file(e.dir.path(), "[a]\nfrom = { type = \"scratch\" }\n");
        let (working, state) = lay_down(&e, &BaseRef::Scratch, &file);
        assert!(state.from.is_none());
        assert!(state.fingerprint.is_empty());
        assert!(working.rootfs().is_dir());
        assert_eq!(
            base_identity(&BaseRef::Scratch, &file, &e.cache, &e.snapshots).unwrap(),
            "scratch"
        );
    }

    #[test]
    fn tarball_is_unpacked_and_recorded_as_first_layer() {
        let e = env();
        base_tarball(e.dir.path());
        let file = recipe_file(e.dir.path(), TAR);
        let base = base_of(TAR);

        let (working, state) = lay_down(&e, &base, &file);
        assert_eq!(
            fs::read_to_string(working.rootfs().join("etc/os-release")).unwrap(),
            "ID=test\n"
        );
        assert!(state.fingerprint.contains("etc/os-release"));

        let manifest = e.images.read_manifest(state.from.as_ref().unwrap()).unwrap();
        assert_eq!(manifest.layers.len(), 1);
        let meta = BundleMeta::load(working.dir()).unwrap();
        assert_eq!(meta.fingerprint, state.fingerprint);
    }

    #[test]
    fn tarball_identity_follows_content() {
        let e = env();
        base_tarball(e.dir.path());
        let file = recipe_file(e.dir.path(), TAR);
        let base = base_of(TAR);
        let first = base_identity(&base, &file, &e.cache, &e.snapshots).unwrap();
        assert!(first.starts_with("tar:"));
        fs::write(e.dir.path().join("src/etc/os-release"), "ID=other\n").unwrap();
        fs::write(
            e.dir.path().join("base.tar"),
            pack_layer(&e.dir.path().join("src")).unwrap(),
        )
        .unwrap();
        assert_ne!(
            first,
            base_identity(&base, &file, &e.cache, &e.snapshots).unwrap()
        );
    }

    #[test]
    fn oci_base_layers_are_applied_in_order() {
        let e = env();
        let source = ImageLayout::open(e.dir.path().join("upstream")).unwrap();
        let one = e.dir.path().join("one");
        fs::create_dir_all(&one).unwrap();
        fs::write(one.join("a"), "1").unwrap();
        fs::write(one.join("b"), "1").unwrap();
        let two = e.dir.path().join("two");
        fs::create_dir_all(&two).unwrap();
        fs::write(two.join("b"), "2").unwrap();

        let mut mutation = source.begin_mutation(None).unwrap();
        for dir in [&one, &two] {
            let data = pack_layer(dir).unwrap();
            let layer = source
                .add_blob(MEDIA_TYPE_LAYER_TAR, &mut data.as_slice())
                .unwrap();
            mutation.add_layer(layer);
        }
        let image = source.commit_mutation(mutation).unwrap();
        source.update_reference("distro", &image).unwrap();

        let text = "[a]\nfrom = { type = \"oci\", layout = \"upstream\", tag = \"distro\" }\n";
        let file = recipe_file(e.dir.path(), text);
        let base = base_of(text);
        let (working, state) = lay_down(&e, &base, &file);

        let rootfs = working.rootfs();
        assert_eq!(fs::read_to_string(rootfs.join("a")).unwrap(), "1");
        assert_eq!(fs::read_to_string(rootfs.join("b")).unwrap(), "2");
        assert_eq!(state.from.as_ref(), Some(&image));
        assert!(e.images.has_blob(&image.digest));
        assert_eq!(
            base_identity(&base, &file, &e.cache, &e.snapshots).unwrap(),
            format!("oci:{}", image.digest)
        );
    }

    #[test]
    fn missing_oci_tag_is_a_config_error() {
        let e = env();
        ImageLayout::open(e.dir.path().join("upstream")).unwrap();
        let text = "[a]\nfrom = { type = \"oci\", layout = \"upstream\", tag = \"nope\" }\n";
        let file = recipe_file(e.dir.path(), text);
        let err = base_identity(&base_of(text), &file, &e.cache, &e.snapshots).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn built_base_restores_snapshot_and_metadata() {
        let e = env();
        e.snapshots.create("lower").unwrap();
        fs::write(e.snapshots.rootfs("lower").join("f"), "x").unwrap();
        let fp = FingerprintManifest::walk(&e.snapshots.rootfs("lower")).unwrap();
        BundleMeta::new(None, fp.clone())
            .save(&e.snapshots.path("lower"))
            .unwrap();

        let text = "[a]\nfrom = { type = \"built\", tag = \"lower\" }\n";
        let file = recipe_file(e.dir.path(), text);
        let (working, state) = lay_down(&e, &base_of(text), &file);
        assert_eq!(state.fingerprint, fp);
        assert!(working.rootfs().join("f").exists());

        let id = base_identity(&base_of(text), &file, &e.cache, &e.snapshots).unwrap();
        assert!(id.starts_with("snapshot:"));
    }

    #[test]
    fn unknown_built_base_is_a_config_error() {
        let e = env();
        let text = "[a]\nfrom = { type = \"built\", tag = \"ghost\" }\n";
        let file = recipe_file(e.dir.path(), text);
        let err = base_identity(&base_of(text), &file, &e.cache, &e.snapshots).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn acquire_clears_stale_bundle_and_release_removes_it() {
        let e = env();
        e.snapshots.create(WORKING_SNAPSHOT).unwrap();
        fs::write(e.snapshots.rootfs(WORKING_SNAPSHOT).join("junk"), "x").unwrap();

        let file = recipe_file(e.dir.path(), "[a]\nfrom = { type = \"scratch\" }\n");
        let (working, _) = lay_down(&e, &BaseRef::Scratch, &file);
        assert!(!working.rootfs().join("junk").exists());

        let working = working.snapshot_as(&e.snapshots, "a").unwrap();
        working.release(&e.snapshots, false).unwrap();
        assert!(!e.snapshots.exists(WORKING_SNAPSHOT));
        assert!(e.snapshots.exists("a"));
    }
}
