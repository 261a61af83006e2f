//! Recipe parsing, variable substitution, and layer identity for Strata.
//!
//! This crate defines the schema layer: TOML recipe files mapping layer names
//! to [`Recipe`]s, `${{VAR}}` substitution applied before parsing, and the
//! deterministic [`LayerIdentity`] that keys the build cache.

pub mod identity;
pub mod recipe;
pub mod substitute;
pub mod types;

pub use identity::{compute_layer_identity, IdentityInputs};
pub use recipe::{
    parse_recipe_file, parse_recipe_str, validate_layer_name, BaseRef, CommandSpec, Recipe,
    RecipeError, RecipeFile,
};
pub use substitute::Substitutions;
pub use types::{BlobDigest, LayerIdentity};
