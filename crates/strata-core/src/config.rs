use crate::package::LayerType;
use crate::run::RunnerKind;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the optional per-project configuration file.
pub const CONFIG_FILE: &str = "strata.toml";

/// Project-level defaults. Every field can be overridden on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StrataConfig {
    /// Cache records, synchronised imports and the state lock.
    pub state_dir: PathBuf,
    /// Where layer snapshots (bundles) live.
    pub rootfs_dir: PathBuf,
    /// Image layout that receives manifests, configs and layer blobs.
    pub oci_dir: PathBuf,
    pub layer_type: LayerType,
    pub runner: RunnerKind,
    pub consider_timestamps: bool,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".strata"),
            rootfs_dir: PathBuf::from("roots"),
            oci_dir: PathBuf::from("oci"),
            layer_type: LayerType::default(),
            runner: RunnerKind::default(),
            consider_timestamps: false,
        }
    }
}

impl StrataConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("invalid {}: {e}", path.display())))
    }

    /// Load `strata.toml` from `dir` if present, else the defaults.
    pub fn discover(dir: &Path) -> Result<Self, CoreError> {
        let path = dir.join(CONFIG_FILE);
        if path.is_file() {
            tracing::debug!("loading configuration from {}", path.display());
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve relative directories against `base`.
    #[must_use]
    pub fn anchored(mut self, base: &Path) -> Self {
        for dir in [&mut self.state_dir, &mut self.rootfs_dir, &mut self.oci_dir] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        self
    }
}
