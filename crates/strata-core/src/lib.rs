//! Build orchestration for Strata.
//!
//! This crate orders recipe files by their base-layer references
//! ([`RecipeGraph`]), decides which layers can be reused ([`BuildCache`]),
//! computes and packages the change-set of each rebuilt layer
//! ([`diff_and_package`]), and drives the per-layer pipeline through the
//! [`Builder`]. Collaborators (snapshots, image storage, imports, command
//! execution) sit behind traits so the pipeline can run against any of them.

pub mod base;
pub mod builder;
pub mod cache;
pub mod concurrency;
pub mod config;
pub mod diff;
pub mod graph;
pub mod import;
pub mod lifecycle;
pub mod package;
pub mod run;

pub use builder::{
    gc_roots, BuildOptions, BuildReport, Builder, FileReport, LayerOutcome, LayerReport,
};
pub use base::{BaseState, WorkingBundle, WORKING_SNAPSHOT};
pub use cache::BuildCache;
pub use concurrency::{install_signal_handler, shutdown_requested, StateLock};
pub use config::{StrataConfig, CONFIG_FILE};
pub use diff::{compare, diff_and_package, DiffKind, DiffOptions, DiffOutcome, DiffRecord};
pub use graph::{layer_order, RecipeGraph};
pub use import::{ImportResult, Importer, LocalImporter};
pub use lifecycle::{validate_transition, LayerState};
pub use package::{ExcludePaths, LayerType};
pub use run::{select_runner, ChrootRunner, HostRunner, OnRunFailure, RunRequest, Runner, RunnerKind};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("recipe error: {0}")]
    Recipe(#[from] strata_schema::RecipeError),
    #[error("store error: {0}")]
    Store(#[from] strata_store::StoreError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("dependency cycle between: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("diff error: {0}")]
    Diff(String),
    #[error("couldn't create whiteout for {path}: {source}")]
    Whiteout {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command error: {0}")]
    Command(String),
    #[error("import error: {0}")]
    Import(String),
    #[error("invalid layer state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("build interrupted")]
    Interrupted,
    #[error("layer '{layer}' ({file}): {source}")]
    Layer {
        layer: String,
        file: String,
        #[source]
        source: Box<CoreError>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// The innermost error, looking through layer context.
    pub fn root(&self) -> &CoreError {
        match self {
            CoreError::Layer { source, .. } => source.root(),
            other => other,
        }
    }

    /// Errors caused by the recipe or configuration rather than the build.
    pub fn is_config(&self) -> bool {
        matches!(
            self.root(),
            CoreError::Recipe(_) | CoreError::Config(_) | CoreError::Cycle(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_error_names_layer_and_file() {
        let e = CoreError::Layer {
            layer: "app".to_owned(),
            file: "/src/strata.toml".to_owned(),
            source: Box::new(CoreError::Command("exit status 1".to_owned())),
        };
        let msg = e.to_string();
        assert!(msg.contains("app"));
        assert!(msg.contains("/src/strata.toml"));
        assert!(msg.contains("exit status 1"));
        assert!(matches!(e.root(), CoreError::Command(_)));
    }

    #[test]
    fn cycle_error_lists_members() {
        let e = CoreError::Cycle(vec!["a.toml".to_owned(), "b.toml".to_owned()]);
        assert!(e.to_string().contains("a.toml, b.toml"));
        assert!(e.is_config());
    }
}
