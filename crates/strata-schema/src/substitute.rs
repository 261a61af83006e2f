//! `${{NAME}}` / `${{NAME:default}}` variable substitution applied to recipe text
//! before it is parsed.

use crate::recipe::RecipeError;
use std::collections::BTreeMap;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// Ordered set of `KEY=VALUE` substitutions supplied for one build invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions {
    vars: BTreeMap<String, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `KEY=VALUE` arguments. Later duplicates override earlier ones.
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self, RecipeError> {
        let mut subs = Self::new();
        for arg in args {
            let arg = arg.as_ref();
            let Some((key, value)) = arg.split_once('=') else {
                return Err(RecipeError::InvalidSubstitution(arg.to_owned()));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(RecipeError::InvalidSubstitution(arg.to_owned()));
            }
            subs.insert(key, value);
        }
        Ok(subs)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Replace every `${{NAME}}` and `${{NAME:default}}` occurrence in `text`.
    ///
    /// A variable with neither a substitution nor a default is an error, so a
    /// typo never silently produces an empty string in a build script.
    pub fn apply(&self, text: &str) -> Result<String, RecipeError> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find(OPEN) {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + OPEN.len()..];
            let Some(end) = after_open.find(CLOSE) else {
                return Err(RecipeError::UnterminatedVariable(
                    rest[start..].chars().take(32).collect(),
                ));
            };

            let inner = after_open[..end].trim();
            let (name, default) = match inner.split_once(':') {
                Some((name, default)) => (name.trim(), Some(default)),
                None => (inner, None),
            };

            match (self.get(name), default) {
                (Some(value), _) => out.push_str(value),
                (None, Some(default)) => out.push_str(default),
                (None, None) => return Err(RecipeError::UnresolvedVariable(name.to_owned())),
            }

            rest = &after_open[end + CLOSE.len()..];
        }

        out.push_str(rest);
        Ok(out)
    }
}
