use crate::recipe::Recipe;
use crate::types::LayerIdentity;

/// Everything that decides what a layer's filesystem will contain.
///
/// Two builds with equal inputs must produce equivalent content, so every
/// field that can change the output of a build belongs here.
#[derive(Debug, Clone, Copy)]
pub struct IdentityInputs<'a> {
    pub layer: &'a str,
    pub recipe: &'a Recipe,
    /// Resolved identity of the base: upstream layer identity for built
    /// bases, content digest for external ones.
    pub base: &'a str,
    /// Content fingerprint of the layer's synchronised import directory.
    pub imports: &'a str,
    /// Packaging backend name; different backends produce different blobs.
    pub layer_type: &'a str,
    /// Whether mtime-only changes were packaged.
    pub consider_timestamps: bool,
}

/// Feed one tagged field into the hash, length-prefixed so that no two
/// distinct field sequences share a byte stream.
fn write_field(hasher: &mut blake3::Hasher, tag: &str, value: &[u8]) {
    hasher.update(tag.as_bytes());
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value);
}

pub fn compute_layer_identity(
    inputs: &IdentityInputs<'_>,
) -> Result<LayerIdentity, serde_json::Error> {
    let mut hasher = blake3::Hasher::new();

    write_field(&mut hasher, "layer", inputs.layer.as_bytes());
    write_field(&mut hasher, "recipe", inputs.recipe.canonical_json()?.as_bytes());
    write_field(&mut hasher, "base", inputs.base.as_bytes());
    write_field(&mut hasher, "imports", inputs.imports.as_bytes());
    write_field(&mut hasher, "layer_type", inputs.layer_type.as_bytes());
    write_field(
        &mut hasher,
        "timestamps",
        &[u8::from(inputs.consider_timestamps)],
    );

    Ok(LayerIdentity::new(hasher.finalize().to_hex().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::parse_recipe_str;
    use crate::substitute::Substitutions;

    fn recipe(input: &str) -> Recipe {
        let (_, mut layers) = parse_recipe_str(input, &Substitutions::new()).unwrap();
        layers.remove("a").unwrap()
    }

    fn identity(recipe: &Recipe, base: &str, imports: &str) -> LayerIdentity {
        compute_layer_identity(&IdentityInputs {
            layer: "a",
            recipe,
            base,
            imports,
            layer_type: "tar",
            consider_timestamps: false,
        })
        .unwrap()
    }

    const SIMPLE: &str = "[a]\nfrom = { type = \"scratch\" }\nrun = [\"touch /x\"]\n";

    #[test]
    fn stable_for_identical_inputs() {
        let r = recipe(SIMPLE);
        assert_eq!(identity(&r, "b1", "i1"), identity(&r, "b1", "i1"));
        assert_eq!(identity(&r, "b1", "i1").len(), 64);
    }

    #[test]
    fn base_change_changes_identity() {
        let r = recipe(SIMPLE);
        assert_ne!(identity(&r, "b1", "i1"), identity(&r, "b2", "i1"));
    }

    #[test]
    fn import_change_changes_identity() {
        let r = recipe(SIMPLE);
        assert_ne!(identity(&r, "b1", "i1"), identity(&r, "b1", "i2"));
    }

    #[test]
    fn command_change_changes_identity() {
        let a = recipe(SIMPLE);
        let b = recipe("[a]\nfrom = { type = \"scratch\" }\nrun = [\"touch /y\"]\n");
        assert_ne!(identity(&a, "b", "i"), identity(&b, "b", "i"));
    }

    #[test]
    fn layer_type_changes_identity() {
        let r = recipe(SIMPLE);
        let tar = identity(&r, "b", "i");
        let squash = compute_layer_identity(&IdentityInputs {
            layer: "a",
            recipe: &r,
            base: "b",
            imports: "i",
            layer_type: "squashfs",
            consider_timestamps: false,
        })
        .unwrap();
        assert_ne!(tar, squash);
    }

    #[test]
    fn timestamp_mode_changes_identity() {
        let r = recipe(SIMPLE);
        let inputs = IdentityInputs {
            layer: "a",
            recipe: &r,
            base: "b",
            imports: "i",
            layer_type: "tar",
            consider_timestamps: false,
        };
        let with_times = IdentityInputs {
            consider_timestamps: true,
            ..inputs
        };
        assert_ne!(
            compute_layer_identity(&inputs).unwrap(),
            compute_layer_identity(&with_times).unwrap()
        );
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let r = recipe(SIMPLE);
        assert_ne!(identity(&r, "b1", "i"), identity(&r, "b", "1i"));
        assert_ne!(identity(&r, "", "bi"), identity(&r, "bi", ""));
    }
}
