//! Identifier newtypes.
//!
//! Tile, site and stratum ids all end up in artifact paths and product
//! metadata, so each gets its own type instead of a bare string or integer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generates a string identifier whose values pass through `$normalize`.
macro_rules! string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $normalize:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                let normalize: fn(String) -> String = $normalize;
                Self(normalize(value.into()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Grid cell identifier (e.g., "31TCJ" for Sentinel-2, "196030" for Landsat).
    ///
    /// Stored upper-cased so ids taken from file names, reference polygon
    /// attributes and the command line compare equal. Every per-tile
    /// artifact path is namespaced by this value.
    TileId,
    |s| s.trim().to_uppercase()
);

string_id!(
    /// Site identifier stamped on the final product.
    SiteId,
    |s| s
);

/// Numeric stratum identifier, as found in the `ID` attribute of the
/// strata geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StratumId(u32);

impl StratumId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for StratumId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for StratumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
