use crate::substitute::Substitutions;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("failed to read recipe file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse recipe: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid layer name '{0}': must be 1-128 characters of [a-zA-Z0-9_.-]")]
    InvalidLayerName(String),
    #[error("layer '{layer}': {reason}")]
    InvalidRecipe { layer: String, reason: String },
    #[error("recipe file {0} defines no layers")]
    Empty(String),
    #[error("unresolved variable '{0}': no substitution given and no default")]
    UnresolvedVariable(String),
    #[error("unterminated variable reference near '{0}'")]
    UnterminatedVariable(String),
    #[error("invalid substitution '{0}', expected KEY=VALUE")]
    InvalidSubstitution(String),
}

/// Where a layer's filesystem starts from.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BaseRef {
    /// An empty root filesystem.
    Scratch,
    /// An external root filesystem tarball.
    Tar { path: String },
    /// An external image stored in a local image layout directory.
    Oci { layout: String, tag: String },
    /// Another layer built by this tool.
    Built { tag: String },
}

impl BaseRef {
    /// The layer name this base depends on, if it is another built layer.
    pub fn built_tag(&self) -> Option<&str> {
        match self {
            BaseRef::Built { tag } => Some(tag.as_str()),
            _ => None,
        }
    }
}

/// A command given either as a single string or as an argv list.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandSpec {
    /// Split into argv. String commands are split on whitespace.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            CommandSpec::Shell(s) => s.split_whitespace().map(str::to_owned).collect(),
            CommandSpec::Exec(v) => v.clone(),
        }
    }
}

/// One named build target.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub from: BaseRef,
    #[serde(default)]
    pub import: Vec<String>,
    #[serde(default)]
    pub run: Vec<String>,
    #[serde(default)]
    pub build_only: bool,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub cmd: Option<CommandSpec>,
    #[serde(default)]
    pub entrypoint: Option<CommandSpec>,
    #[serde(default)]
    pub full_command: Option<CommandSpec>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Host paths mounted into the rootfs while commands run, as
    /// `SRC` or `SRC:DEST`.
    #[serde(default)]
    pub binds: Vec<String>,
}

impl Recipe {
    /// Stable JSON used as an input to layer identity hashing.
    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// `(source, destination)` pairs; a bind without `:` mounts at the same path.
    pub fn bind_mounts(&self) -> Vec<(String, String)> {
        self.binds
            .iter()
            .map(|b| match b.split_once(':') {
                Some((src, dest)) => (src.trim().to_owned(), dest.trim().to_owned()),
                None => (b.trim().to_owned(), b.trim().to_owned()),
            })
            .collect()
    }

    fn validate(&self, layer: &str) -> Result<(), RecipeError> {
        let invalid = |reason: &str| RecipeError::InvalidRecipe {
            layer: layer.to_owned(),
            reason: reason.to_owned(),
        };

        match &self.from {
            BaseRef::Scratch => {}
            BaseRef::Tar { path } if path.trim().is_empty() => {
                return Err(invalid("from.path must not be empty"));
            }
            BaseRef::Oci { layout, tag } if layout.trim().is_empty() || tag.trim().is_empty() => {
                return Err(invalid("from.layout and from.tag must not be empty"));
            }
            BaseRef::Built { tag } => {
                validate_layer_name(tag)?;
                if tag == layer {
                    return Err(invalid("layer cannot be built from itself"));
                }
            }
            BaseRef::Tar { .. } | BaseRef::Oci { .. } => {}
        }

        if self.full_command.is_some() && (self.cmd.is_some() || self.entrypoint.is_some()) {
            return Err(invalid(
                "full_command cannot be combined with cmd or entrypoint",
            ));
        }

        if self.import.iter().any(|i| i.trim().is_empty()) {
            return Err(invalid("import entries must not be empty"));
        }

        for (_, dest) in self.bind_mounts() {
            if !dest.starts_with('/') {
                return Err(invalid("bind destinations must be absolute paths"));
            }
        }

        Ok(())
    }
}

pub fn validate_layer_name(name: &str) -> Result<(), RecipeError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(RecipeError::InvalidLayerName(name.to_owned()))
    }
}

/// A parsed recipe file: every layer it defines, after variable substitution.
#[derive(Debug, Clone)]
pub struct RecipeFile {
    path: PathBuf,
    reference_dir: PathBuf,
    after_substitutions: String,
    layers: BTreeMap<String, Recipe>,
}

impl RecipeFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory relative import and tarball paths are resolved against.
    pub fn reference_dir(&self) -> &Path {
        &self.reference_dir
    }

    /// The recipe text after variable substitution.
    pub fn after_substitutions(&self) -> &str {
        &self.after_substitutions
    }

    pub fn get(&self, layer: &str) -> Option<&Recipe> {
        self.layers.get(layer)
    }

    pub fn contains(&self, layer: &str) -> bool {
        self.layers.contains_key(layer)
    }

    pub fn layers(&self) -> impl Iterator<Item = (&str, &Recipe)> {
        self.layers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.keys().map(String::as_str)
    }

    /// Tags of built layers this file's recipes start from.
    pub fn built_bases(&self) -> BTreeSet<&str> {
        self.layers
            .values()
            .filter_map(|r| r.from.built_tag())
            .collect()
    }

    pub fn resolve_path(&self, p: &str) -> PathBuf {
        let path = Path::new(p);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.reference_dir.join(path)
        }
    }
}

/// Parse recipe text into its layers. Substitution is applied first.
pub fn parse_recipe_str(
    input: &str,
    subs: &Substitutions,
) -> Result<(String, BTreeMap<String, Recipe>), RecipeError> {
    let substituted = subs.apply(input)?;
    let layers: BTreeMap<String, Recipe> = toml::from_str(&substituted)?;
    for (name, recipe) in &layers {
        validate_layer_name(name)?;
        recipe.validate(name)?;
    }
    Ok((substituted, layers))
}

pub fn parse_recipe_file(
    path: impl AsRef<Path>,
    subs: &Substitutions,
) -> Result<RecipeFile, RecipeError> {
    let path = fs::canonicalize(path.as_ref())?;
    let content = fs::read_to_string(&path)?;
    let (after_substitutions, layers) = parse_recipe_str(&content, subs)?;
    if layers.is_empty() {
        return Err(RecipeError::Empty(path.display().to_string()));
    }
    let reference_dir = path
        .parent()
        .map_or_else(|| PathBuf::from("/"), Path::to_path_buf);

    Ok(RecipeFile {
        path,
        reference_dir,
        after_substitutions,
        layers,
    })
}
