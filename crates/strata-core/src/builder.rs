//! The per-layer build pipeline and the multi-file driver around it.

use crate::base::{base_identity, materialize, BaseState, WorkingBundle};
use crate::cache::BuildCache;
use crate::concurrency::shutdown_requested;
use crate::config::StrataConfig;
use crate::diff::{diff_and_package, DiffKind, DiffOptions, DiffOutcome};
use crate::graph::{layer_order, RecipeGraph};
use crate::import::{Importer, LocalImporter};
use crate::lifecycle::{validate_transition, LayerState};
use crate::package::LayerType;
use crate::run::{select_runner, OnRunFailure, RunRequest, Runner, RUN_SCRIPT};
use crate::CoreError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use strata_schema::{
    compute_layer_identity, parse_recipe_file, IdentityInputs, LayerIdentity, Recipe, RecipeFile,
    Substitutions,
};
use strata_store::{
    BundleMeta, CacheEntry, Descriptor, DirSnapshotStore, History, ImageLayout, ImageStore,
    Mutation, SnapshotStore, StateLayout,
};
use tracing::{debug, info, warn};

pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
pub const ANNOTATION_GIT_VERSION: &str = "io.strata.git_version";
pub const ANNOTATION_RECIPE: &str = "io.strata.recipe_contents";
const CREATED_BY: &str = "strata build";

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Forget every cache record and synchronised import before building.
    pub no_cache: bool,
    pub layer_type: LayerType,
    pub consider_timestamps: bool,
    pub on_run_failure: OnRunFailure,
    /// Resolve and report the build order without building anything.
    pub order_only: bool,
    /// Keep the working bundle of the last rebuilt layer for inspection.
    pub leave_unladen: bool,
    pub substitutions: Substitutions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerOutcome {
    /// Reused from the cache without running anything.
    Cached,
    /// Rebuilt and committed to the image store.
    Built,
    /// Rebuilt and kept only as a snapshot.
    BuildOnly,
}

impl std::fmt::Display for LayerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LayerOutcome::Cached => "cached",
            LayerOutcome::Built => "built",
            LayerOutcome::BuildOnly => "build_only",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerReport {
    pub layer: String,
    pub identity: LayerIdentity,
    pub outcome: LayerOutcome,
    /// Committed manifest; `None` for build-only layers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Descriptor>,
    /// The layer blob added by this build, when it was rebuilt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<Descriptor>,
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
}

impl LayerReport {
    fn new(layer: &str, identity: &LayerIdentity, outcome: LayerOutcome) -> Self {
        Self {
            layer: layer.to_owned(),
            identity: identity.clone(),
            outcome,
            manifest: None,
            blob: None,
            added: 0,
            modified: 0,
            removed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub prerequisites: Vec<PathBuf>,
    pub layers: Vec<LayerReport>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub files: Vec<FileReport>,
}

impl BuildReport {
    pub fn layers(&self) -> impl Iterator<Item = &LayerReport> {
        self.files.iter().flat_map(|f| f.layers.iter())
    }

    pub fn layer(&self, name: &str) -> Option<&LayerReport> {
        self.layers().find(|l| l.layer == name)
    }

    pub fn count(&self, outcome: LayerOutcome) -> usize {
        self.layers().filter(|l| l.outcome == outcome).count()
    }
}

/// Moves one layer through [`LayerState`], rejecting illegal steps.
struct Progress<'a> {
    layer: &'a str,
    state: LayerState,
}

impl<'a> Progress<'a> {
    fn new(layer: &'a str) -> Self {
        Self {
            layer,
            state: LayerState::Pending,
        }
    }

    fn advance(&mut self, to: LayerState) -> Result<(), CoreError> {
        validate_transition(self.state, to)?;
        debug!("{}: {} -> {to}", self.layer, self.state);
        self.state = to;
        Ok(())
    }

    fn fail(&mut self) {
        if !self.state.is_terminal() {
            debug!("{}: {} -> {}", self.layer, self.state, LayerState::Failed);
            self.state = LayerState::Failed;
        }
    }
}

/// Builds recipe files into snapshots and images.
pub struct Builder {
    state: StateLayout,
    snapshots: Box<dyn SnapshotStore>,
    images: Box<dyn ImageStore>,
    importer: Box<dyn Importer>,
    runner: Box<dyn Runner>,
    cache: BuildCache,
    options: BuildOptions,
}

impl Builder {
    /// A builder over the on-disk stores named by `config`.
    pub fn new(config: &StrataConfig, options: BuildOptions) -> Result<Self, CoreError> {
        let state = StateLayout::new(&config.state_dir);
        state.initialize()?;
        fs::create_dir_all(&config.rootfs_dir)?;
        let images = ImageLayout::open(&config.oci_dir)?;
        Ok(Self::with_parts(
            state.clone(),
            Box::new(DirSnapshotStore::new(&config.rootfs_dir)),
            Box::new(images),
            Box::new(LocalImporter::new(state)),
            select_runner(config.runner),
            options,
        ))
    }

    pub fn with_parts(
        state: StateLayout,
        snapshots: Box<dyn SnapshotStore>,
        images: Box<dyn ImageStore>,
        importer: Box<dyn Importer>,
        runner: Box<dyn Runner>,
        options: BuildOptions,
    ) -> Self {
        let cache = BuildCache::new(state.cache_dir());
        Self {
            state,
            snapshots,
            images,
            importer,
            runner,
            cache,
            options,
        }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn images(&self) -> &dyn ImageStore {
        self.images.as_ref()
    }

    pub fn snapshots(&self) -> &dyn SnapshotStore {
        self.snapshots.as_ref()
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    /// Parse, order and build every file in `paths`.
    pub fn build_multiple(&mut self, paths: &[PathBuf]) -> Result<BuildReport, CoreError> {
        let files = paths
            .iter()
            .map(|p| parse_recipe_file(p, &self.options.substitutions))
            .collect::<Result<Vec<_>, _>>()?;
        let graph = RecipeGraph::new(&files)?;
        let order = graph.sort()?;
        let by_path: BTreeMap<&Path, &RecipeFile> =
            files.iter().map(|f| (f.path(), f)).collect();

        info!("build order:");
        for (i, path) in order.iter().enumerate() {
            let prereqs = graph.prerequisites(path);
            if prereqs.is_empty() {
                info!("{} build {}", i + 1, path.display());
            } else {
                let names: Vec<String> = prereqs.iter().map(|p| p.display().to_string()).collect();
                info!(
                    "{} build {} (requires {})",
                    i + 1,
                    path.display(),
                    names.join(", ")
                );
            }
        }

        let mut report = BuildReport::default();
        if self.options.order_only {
            for path in order {
                report.files.push(FileReport {
                    prerequisites: graph.prerequisites(&path),
                    path,
                    layers: Vec::new(),
                });
            }
            return Ok(report);
        }

        if self.options.no_cache {
            self.reset_state()?;
        }

        for path in &order {
            let Some(file) = by_path.get(path.as_path()) else {
                continue;
            };
            let mut file_report = self.build_file(file)?;
            file_report.prerequisites = graph.prerequisites(path);
            report.files.push(file_report);
        }
        Ok(report)
    }

    fn reset_state(&mut self) -> Result<(), CoreError> {
        let removed = self.cache.clear()?;
        let imports = self.state.imports_dir();
        if imports.exists() {
            fs::remove_dir_all(&imports)?;
        }
        self.state.initialize()?;
        info!("cache disabled: dropped {removed} record(s)");
        Ok(())
    }

    /// Build every layer of one recipe file in dependency order, then
    /// collect garbage in the image store.
    pub fn build_file(&mut self, file: &RecipeFile) -> Result<FileReport, CoreError> {
        let order = layer_order(file)?;
        let mut report = FileReport {
            path: file.path().to_path_buf(),
            prerequisites: Vec::new(),
            layers: Vec::new(),
        };

        for name in &order {
            if shutdown_requested() {
                return Err(CoreError::Interrupted);
            }
            let Some(recipe) = file.get(name) else {
                continue;
            };
            let layer = self
                .build_layer(file, name, recipe)
                .map_err(|e| CoreError::Layer {
                    layer: name.clone(),
                    file: file.path().display().to_string(),
                    source: Box::new(e),
                })?;
            report.layers.push(layer);
        }

        self.collect_garbage();
        Ok(report)
    }

    fn build_layer(
        &mut self,
        file: &RecipeFile,
        name: &str,
        recipe: &Recipe,
    ) -> Result<LayerReport, CoreError> {
        let mut progress = Progress::new(name);
        let mut restore_reference: Option<Option<Descriptor>> = None;

        let result = self.run_pipeline(file, name, recipe, &mut progress, &mut restore_reference);
        match result {
            Ok(report) => {
                progress.advance(LayerState::Done)?;
                Ok(report)
            }
            Err(e) => {
                progress.fail();
                if let Some(previous) = restore_reference {
                    self.restore_reference(name, previous.as_ref());
                }
                if let Err(cleanup) = WorkingBundle::discard_stale(self.snapshots.as_ref()) {
                    warn!("failed to remove working snapshot: {cleanup}");
                }
                Err(e)
            }
        }
    }

    fn restore_reference(&self, name: &str, previous: Option<&Descriptor>) {
        let restored = match previous {
            Some(desc) => self.images.update_reference(name, desc),
            None => self.images.remove_reference(name),
        };
        if let Err(e) = restored {
            warn!("failed to restore reference {name}: {e}");
        }
    }

    fn run_pipeline(
        &mut self,
        file: &RecipeFile,
        name: &str,
        recipe: &Recipe,
        progress: &mut Progress<'_>,
        restore_reference: &mut Option<Option<Descriptor>>,
    ) -> Result<LayerReport, CoreError> {
        let sources: Vec<String> = recipe
            .import
            .iter()
            .map(|s| {
                if s.starts_with("http://") || s.starts_with("https://") {
                    s.clone()
                } else {
                    file.resolve_path(s).to_string_lossy().into_owned()
                }
            })
            .collect();
        let imports = self.importer.import(name, &sources)?;

        let base_id = base_identity(&recipe.from, file, &self.cache, self.snapshots.as_ref())?;
        let identity = compute_layer_identity(&IdentityInputs {
            layer: name,
            recipe,
            base: &base_id,
            imports: &imports.fingerprint,
            layer_type: self.options.layer_type.name(),
            consider_timestamps: self.options.consider_timestamps,
        })?;
        progress.advance(LayerState::CacheChecked)?;

        if let Some(report) = self.try_cached(name, &identity)? {
            info!("{name}: cached ({})", identity.short());
            return Ok(report);
        }
        info!("{name}: building ({})", identity.short());

        let working = WorkingBundle::acquire(self.snapshots.as_ref())?;
        let (working, base) = materialize(
            working,
            &recipe.from,
            file,
            self.snapshots.as_ref(),
            self.images.as_ref(),
        )?;
        progress.advance(LayerState::BaseMaterialized)?;

        let script = imports.dir.join(RUN_SCRIPT);
        fs::write(&script, render_script(&recipe.run))?;
        progress.advance(LayerState::ImportsApplied)?;

        if recipe.run.is_empty() {
            debug!("{name}: no commands");
        } else {
            let binds: Vec<(PathBuf, String)> = recipe
                .bind_mounts()
                .into_iter()
                .map(|(src, dest)| (file.resolve_path(&src), dest))
                .collect();
            self.runner.run(&RunRequest {
                rootfs: working.rootfs(),
                import_dir: &imports.dir,
                script: &script,
                on_failure: self.options.on_run_failure,
                extra_binds: &binds,
            })?;
        }
        progress.advance(LayerState::CommandsRun)?;

        if shutdown_requested() {
            return Err(CoreError::Interrupted);
        }

        let (working, report) = if recipe.build_only {
            let working = working.snapshot_as(self.snapshots.as_ref(), name)?;
            progress.advance(LayerState::Snapshotted)?;
            self.cache.put(
                name,
                &identity,
                CacheEntry::BuildOnly {
                    snapshot: name.to_owned(),
                },
            )?;
            info!("{name}: build-only layer snapshotted");
            let report = LayerReport::new(name, &identity, LayerOutcome::BuildOnly);
            (working, report)
        } else {
            self.commit_layer(
                working,
                file,
                name,
                recipe,
                &identity,
                &base,
                progress,
                restore_reference,
            )?
        };

        working.release(self.snapshots.as_ref(), self.options.leave_unladen)?;
        Ok(report)
    }

    /// Reuse a cache entry if it is still backed by what it points at.
    fn try_cached(
        &mut self,
        name: &str,
        identity: &LayerIdentity,
    ) -> Result<Option<LayerReport>, CoreError> {
        let Some(entry) = self.cache.lookup(name, identity)? else {
            return Ok(None);
        };
        match entry {
            CacheEntry::BuildOnly { snapshot } if self.snapshots.exists(&snapshot) => {
                self.cache.note_identity(name, identity.clone());
                Ok(Some(LayerReport::new(name, identity, LayerOutcome::Cached)))
            }
            CacheEntry::Packaged(manifest)
                if self.images.has_blob(&manifest.digest) && self.snapshots.exists(name) =>
            {
                self.images.update_reference(name, &manifest)?;
                self.cache.note_identity(name, identity.clone());
                let mut report = LayerReport::new(name, identity, LayerOutcome::Cached);
                report.manifest = Some(manifest);
                Ok(Some(report))
            }
            CacheEntry::BuildOnly { .. } => {
                info!("{name}: cached snapshot is gone, rebuilding");
                Ok(None)
            }
            CacheEntry::Packaged(manifest) => {
                warn!(
                    "{name}: cached image {} or its snapshot is gone, rebuilding",
                    manifest.digest.short()
                );
                Ok(None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_layer(
        &mut self,
        working: WorkingBundle,
        file: &RecipeFile,
        name: &str,
        recipe: &Recipe,
        identity: &LayerIdentity,
        base: &BaseState,
        progress: &mut Progress<'_>,
        restore_reference: &mut Option<Option<Descriptor>>,
    ) -> Result<(WorkingBundle, LayerReport), CoreError> {
        let outcome = diff_and_package(
            working.rootfs(),
            &base.fingerprint,
            &DiffOptions {
                layer_type: self.options.layer_type,
                consider_timestamps: self.options.consider_timestamps,
            },
            &self.state.staging_dir(),
            self.images.as_ref(),
        )?;
        progress.advance(LayerState::Diffed)?;

        let mut mutation = self.images.begin_mutation(base.from.as_ref())?;
        if !outcome.is_empty() {
            mutation.add_layer(outcome.layer.clone());
        }
        apply_config(&mut mutation, recipe, file, outcome.is_empty());
        let manifest = self.images.commit_mutation(mutation)?;

        *restore_reference = Some(self.images.resolve_reference(name)?);
        self.images.update_reference(name, &manifest)?;
        progress.advance(LayerState::MetadataCommitted)?;

        BundleMeta::new(Some(manifest.clone()), outcome.fingerprint.clone())
            .save(working.dir())?;
        let working = working.snapshot_as(self.snapshots.as_ref(), name)?;
        progress.advance(LayerState::Snapshotted)?;

        self.cache
            .put(name, identity, CacheEntry::Packaged(manifest.clone()))?;
        info!(
            "{name}: committed {} ({} paths, {} whiteouts)",
            manifest.digest.short(),
            outcome.included.len(),
            outcome.whiteouts.len()
        );
        Ok((working, built_report(name, identity, manifest, &outcome)))
    }

    /// Image store GC after a file is built. Failures are only logged.
    fn collect_garbage(&self) {
        let roots = match gc_roots(self.snapshots.as_ref(), &self.cache) {
            Ok(roots) => roots,
            Err(e) => {
                warn!("gc skipped: {e}");
                return;
            }
        };
        match self.images.gc(&roots) {
            Ok(report) => debug!(
                "gc: removed {} blob(s), {} staging leftover(s)",
                report.removed_blobs, report.removed_staging
            ),
            Err(e) => warn!("image store gc failed: {e}"),
        }
    }
}

/// Images that must survive GC besides the named references: the image
/// every snapshot was built from and every cached manifest.
pub fn gc_roots(
    snapshots: &dyn SnapshotStore,
    cache: &BuildCache,
) -> Result<Vec<Descriptor>, CoreError> {
    let mut roots = Vec::new();
    for name in snapshots.list()? {
        match BundleMeta::load(&snapshots.path(&name)) {
            Ok(meta) => roots.extend(meta.from),
            Err(e) => warn!("unreadable bundle metadata for {name}: {e}"),
        }
    }
    for record in cache.list()? {
        if let CacheEntry::Packaged(desc) = record.entry {
            roots.push(desc);
        }
    }
    Ok(roots)
}

fn built_report(
    name: &str,
    identity: &LayerIdentity,
    manifest: Descriptor,
    outcome: &DiffOutcome,
) -> LayerReport {
    let mut report = LayerReport::new(name, identity, LayerOutcome::Built);
    report.manifest = Some(manifest);
    report.blob = (!outcome.is_empty()).then(|| outcome.layer.clone());
    report.added = outcome.count(DiffKind::Added);
    report.modified = outcome.count(DiffKind::Modified);
    report.removed = outcome.whiteouts.len();
    report
}

fn render_script(commands: &[String]) -> String {
    let mut script = String::from("#!/bin/sh -xe\n");
    for command in commands {
        script.push_str(command);
        script.push('\n');
    }
    script
}

/// Fold the recipe's image settings into the config being built.
fn apply_config(mutation: &mut Mutation, recipe: &Recipe, file: &RecipeFile, empty_layer: bool) {
    let now = chrono::Utc::now().to_rfc3339();
    let author = author();
    let image = &mut mutation.config;

    for (key, value) in &recipe.environment {
        image.config.set_env(key, value);
    }
    if !image.config.has_env("PATH") {
        image.config.set_env("PATH", DEFAULT_PATH);
    }
    if let Some(cmd) = &recipe.cmd {
        image.config.cmd = Some(cmd.to_argv());
    }
    if let Some(entrypoint) = &recipe.entrypoint {
        image.config.entrypoint = Some(entrypoint.to_argv());
    }
    if let Some(full) = &recipe.full_command {
        image.config.entrypoint = Some(full.to_argv());
        image.config.cmd = None;
    }
    image.config.volumes.extend(recipe.volumes.iter().cloned());
    image
        .config
        .labels
        .extend(recipe.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(dir) = &recipe.working_dir {
        image.config.working_dir = Some(dir.clone());
    }

    image.created = Some(now.clone());
    image.author = Some(author.clone());
    image.architecture = oci_architecture().to_owned();
    image.os = std::env::consts::OS.to_owned();
    image.history.push(History {
        created: Some(now),
        created_by: Some(CREATED_BY.to_owned()),
        author: Some(author),
        empty_layer,
    });

    match git_version(file.reference_dir()) {
        Some(version) => mutation.set_annotation(ANNOTATION_GIT_VERSION, version),
        None => mutation.set_annotation(ANNOTATION_RECIPE, file.after_substitutions()),
    }
}

fn oci_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// `user@host`, preferring the user who invoked sudo.
fn author() -> String {
    let user = std::env::var("SUDO_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_owned());
    let host = fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|h| h.trim().to_owned())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned());
    format!("{user}@{host}")
}

fn git_version(dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let version = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    (!version.is_empty()).then_some(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_schema::parse_recipe_str;

    fn recipe(text: &str) -> Recipe {
        let (_, mut layers) = parse_recipe_str(text, &Substitutions::new()).unwrap();
        layers.remove("a").unwrap()
    }

    fn recipe_file(dir: &Path, text: &str) -> RecipeFile {
        let path = dir.join("strata.recipe.toml");
        fs::write(&path, text).unwrap();
        parse_recipe_file(&path, &Substitutions::new()).unwrap()
    }

    fn empty_mutation() -> Mutation {
        Mutation {
            base: None,
            manifest: strata_store::ImageManifest::default(),
            config: strata_store::ImageConfig::default(),
        }
    }

    #[test]
    fn script_runs_commands_in_order() {
        let script = render_script(&["echo 1 > a".to_owned(), "rm b".to_owned()]);
        assert_eq!(script, "#!/bin/sh -xe\necho 1 > a\nrm b\n");
    }

    #[test]
    fn config_gets_default_path_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let text = "[a]\nfrom = { type = \"scratch\" }\nenvironment = { LANG = \"C\" }\n";
        let file = recipe_file(dir.path(), text);
        let mut m = empty_mutation();
        apply_config(&mut m, &recipe(text), &file, true);

        assert!(m.config.config.env.contains(&"LANG=C".to_owned()));
        assert!(m.config.config.env.contains(&format!("PATH={DEFAULT_PATH}")));
        assert_eq!(m.config.history.len(), 1);
        assert!(m.config.history[0].empty_layer);
        assert_eq!(m.config.history[0].created_by.as_deref(), Some(CREATED_BY));
        assert!(m.config.author.as_deref().unwrap().contains('@'));
        assert_eq!(m.config.os, "linux");
        assert!(
            m.manifest.annotations.contains_key(ANNOTATION_RECIPE)
                || m.manifest.annotations.contains_key(ANNOTATION_GIT_VERSION)
        );
    }

    #[test]
    fn explicit_path_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let text = "[a]\nfrom = { type = \"scratch\" }\nenvironment = { PATH = \"/opt/bin\" }\n";
        let file = recipe_file(dir.path(), text);
        let mut m = empty_mutation();
        apply_config(&mut m, &recipe(text), &file, false);
        assert_eq!(m.config.config.env, vec!["PATH=/opt/bin".to_owned()]);
    }

    #[test]
    fn full_command_clears_cmd() {
        let dir = tempfile::tempdir().unwrap();
        let text = "[a]\nfrom = { type = \"scratch\" }\nfull_command = \"/bin/app --serve\"\n";
        let file = recipe_file(dir.path(), text);
        let mut m = empty_mutation();
        m.config.config.cmd = Some(vec!["inherited".to_owned()]);
        apply_config(&mut m, &recipe(text), &file, false);
        assert_eq!(
            m.config.config.entrypoint,
            Some(vec!["/bin/app".to_owned(), "--serve".to_owned()])
        );
        assert_eq!(m.config.config.cmd, None);
    }

    #[test]
    fn image_settings_are_carried() {
        let dir = tempfile::tempdir().unwrap();
        let text = concat!(
            "[a]\nfrom = { type = \"scratch\" }\n",
            "cmd = [\"--port\", \"80\"]\nentrypoint = \"/srv/app\"\n",
            "volumes = [\"/data\"]\nlabels = { team = \"infra\" }\nworking_dir = \"/srv\"\n"
        );
        let file = recipe_file(dir.path(), text);
        let mut m = empty_mutation();
        apply_config(&mut m, &recipe(text), &file, false);
        let c = &m.config.config;
        assert_eq!(c.cmd, Some(vec!["--port".to_owned(), "80".to_owned()]));
        assert_eq!(c.entrypoint, Some(vec!["/srv/app".to_owned()]));
        assert!(c.volumes.contains("/data"));
        assert_eq!(c.labels["team"], "infra");
        assert_eq!(c.working_dir.as_deref(), Some("/srv"));
    }

    #[test]
    fn progress_rejects_skipped_states() {
        let mut p = Progress::new("a");
        p.advance(LayerState::CacheChecked).unwrap();
        assert!(p.advance(LayerState::Diffed).is_err());
        p.fail();
        assert_eq!(p.state, LayerState::Failed);
    }
}
