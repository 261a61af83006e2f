//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }

            /// First 12 characters, used in progress output.
            pub fn short(&self) -> &str {
                self.0.get(..12).unwrap_or(&self.0)
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Blake3 hex digest of a blob in the image store.
    BlobDigest
);

string_newtype!(
    /// Blake3 hex digest over everything that determines a layer's filesystem content.
    LayerIdentity
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_display_and_as_ref() {
        let d = BlobDigest::new("abc123");
        assert_eq!(d.to_string(), "abc123");
        assert_eq!(d.as_str(), "abc123");
        assert_eq!(AsRef::<str>::as_ref(&d), "abc123");
    }

    #[test]
    fn digest_serializes_as_plain_string() {
        let d = BlobDigest::new("deadbeef");
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: BlobDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn short_truncates_long_values_only() {
        let id = LayerIdentity::new("0123456789abcdef");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(LayerIdentity::new("abc").short(), "abc");
    }

    #[test]
    fn identity_equality() {
        assert_eq!(LayerIdentity::new("same"), LayerIdentity::new("same"));
        assert_ne!(LayerIdentity::new("same"), LayerIdentity::new("diff"));
    }
}
