//! Entity identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The identifier value of an entity instance.
///
/// Equality and hashing follow the identifier type's own semantics, so two
/// `Long(5)` identifiers are always the same identity.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identifier {
    /// Numeric identifier.
    Long(i64),
    /// Natural key or string identifier.
    Text(String),
    /// UUID identifier.
    Uuid(Uuid),
}

impl Identifier {
    /// Generates a new random UUID identifier.
    #[must_use]
    pub fn generate() -> Self {
        Identifier::Uuid(Uuid::new_v4())
    }

    /// Returns the numeric value of a `Long` identifier.
    #[must_use]
    pub const fn as_long(&self) -> Option<i64> {
        match self {
            Identifier::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({self})")
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Long(v) => write!(f, "{v}"),
            Identifier::Text(s) => write!(f, "{s}"),
            Identifier::Uuid(u) => write!(f, "{u}"),
        }
    }
}

impl From<i64> for Identifier {
    fn from(v: i64) -> Self {
        Identifier::Long(v)
    }
}

impl From<i32> for Identifier {
    fn from(v: i32) -> Self {
        Identifier::Long(i64::from(v))
    }
}

impl From<&str> for Identifier {
    fn from(v: &str) -> Self {
        Identifier::Text(v.to_string())
    }
}

impl From<String> for Identifier {
    fn from(v: String) -> Self {
        Identifier::Text(v)
    }
}

impl From<Uuid> for Identifier {
    fn from(v: Uuid) -> Self {
        Identifier::Uuid(v)
    }
}
