//! Validated identifiers for projects and maps.
//!
//! Identifiers become directory names in the storage layout, so they are
//! restricted to a filesystem-safe alphabet:
//! - Non-empty and at most 128 characters
//! - ASCII letters, digits, `-`, `_` and `.`
//! - Never `.` or `..`
//!
//! # Example
//!
//! ```rust
//! use tilevault_core::id::{MapId, ProjectId};
//!
//! let project = ProjectId::new("survey-2024").unwrap();
//! let map = MapId::new("42").unwrap();
//! assert_eq!(project.as_str(), "survey-2024");
//! assert_eq!(map.to_string(), "42");
//! assert!(ProjectId::new("../escape").is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const MAX_ID_LEN: usize = 128;

fn validate(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidId {
            message: format!("{kind} ID cannot be empty"),
        });
    }

    if id.len() > MAX_ID_LEN {
        return Err(Error::InvalidId {
            message: format!("{kind} ID '{id}' is too long (maximum {MAX_ID_LEN} characters)"),
        });
    }

    if id == "." || id == ".." {
        return Err(Error::InvalidId {
            message: format!("{kind} ID '{id}' is a reserved path component"),
        });
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::InvalidId {
            message: format!(
                "{kind} ID '{id}' contains invalid characters (only letters, digits, '-', '_' and '.' allowed)"
            ),
        });
    }

    Ok(())
}

macro_rules! path_safe_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier after validating the format.
            ///
            /// # Errors
            ///
            /// Returns [`Error::InvalidId`] if the identifier is not path-safe.
            pub fn new(id: impl Into<String>) -> Result<Self> {
                let id = id.into();
                validate($kind, &id)?;
                Ok(Self(id))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
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

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

path_safe_id!(
    /// Identifier of a project (a tenant-level storage unit).
    ProjectId,
    "project"
);

path_safe_id!(
    /// Identifier of a map nested inside a project.
    MapId,
    "map"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        assert!(ProjectId::new("acme").is_ok());
        assert!(ProjectId::new("Project_1.v2").is_ok());
        assert!(MapId::new("1").is_ok());
        assert!(MapId::new("base-map").is_ok());
    }

    #[test]
    fn invalid_ids() {
        assert!(ProjectId::new("").is_err());
        assert!(ProjectId::new(".").is_err());
        assert!(ProjectId::new("..").is_err());
        assert!(ProjectId::new("a/b").is_err());
        assert!(ProjectId::new("a\\b").is_err());
        assert!(MapId::new("has space").is_err());
        assert!(MapId::new("x".repeat(129)).is_err());
    }

    #[test]
    fn serde_rejects_invalid_ids() {
        let ok: ProjectId = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(ok.as_str(), "acme");
        assert!(serde_json::from_str::<MapId>("\"../x\"").is_err());
    }
}
