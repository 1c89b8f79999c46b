//! Error types for Hibernia core.

use crate::types::EntityKey;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in unit-of-work operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Statement execution failed.
    #[error("storage error: {0}")]
    Storage(#[from] hibernia_storage::StorageError),

    /// Second-level cache failure.
    #[error("cache error: {0}")]
    Cache(#[from] hibernia_cache::CacheError),

    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] hibernia_codec::CodecError),

    /// A different instance is already associated with the key.
    #[error("a different object with the same identifier is already associated with the session: {key}")]
    NonUniqueObject {
        /// The contested key.
        key: EntityKey,
    },

    /// Pending inserts reference each other through non-nullable foreign keys.
    #[error("non-nullable foreign keys form a cycle: {}", entities.join(" -> "))]
    DependencyCycle {
        /// The entities on the cycle.
        entities: Vec<String>,
    },

    /// An operation reached an instance that is not associated with the session.
    #[error("transient object: {message}")]
    TransientObject {
        /// Description of the offending reference.
        message: String,
    },

    /// A proxy or collection could not be initialized.
    #[error("lazy initialization failed: {message}")]
    LazyInitialization {
        /// Description of the failure.
        message: String,
    },

    /// The row was updated or deleted by another transaction.
    #[error("row was updated or deleted by another transaction: {key}")]
    StaleObjectState {
        /// Key of the stale entity.
        key: EntityKey,
    },

    /// The version of a versioned entity cannot be incremented further.
    #[error("version of {key} cannot be incremented past its maximum")]
    VersionOverflow {
        /// Key of the entity.
        key: EntityKey,
    },

    /// No row exists for the key.
    #[error("no row with the given identifier exists: {key}")]
    ObjectNotFound {
        /// The missing key.
        key: EntityKey,
    },

    /// The entity name is not mapped.
    #[error("unknown entity: {name}")]
    UnknownEntity {
        /// The unmapped name.
        name: String,
    },

    /// The property is not mapped on the entity.
    #[error("unknown property {entity_name}.{property}")]
    UnknownProperty {
        /// Entity name.
        entity_name: String,
        /// Property name.
        property: String,
    },

    /// A value does not fit the property mapping.
    #[error("illegal value for {entity_name}.{property}: {message}")]
    PropertyValue {
        /// Entity name.
        entity_name: String,
        /// Property name.
        property: String,
        /// Description of the mismatch.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("assertion failure: {message}")]
    AssertionFailure {
        /// Description of the violation.
        message: String,
    },

    /// The session is closed.
    #[error("session is closed")]
    SessionClosed,

    /// A previous flush failed; the session must be rolled back.
    #[error("session is unusable after a failed flush; roll back first")]
    SessionUnusable,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a transient object error.
    pub fn transient_object(message: impl Into<String>) -> Self {
        Self::TransientObject {
            message: message.into(),
        }
    }

    /// Creates a lazy initialization error.
    pub fn lazy_initialization(message: impl Into<String>) -> Self {
        Self::LazyInitialization {
            message: message.into(),
        }
    }

    /// Creates an assertion failure.
    pub fn assertion_failure(message: impl Into<String>) -> Self {
        Self::AssertionFailure {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an unknown property error.
    pub fn unknown_property(entity_name: impl Into<String>, property: impl Into<String>) -> Self {
        Self::UnknownProperty {
            entity_name: entity_name.into(),
            property: property.into(),
        }
    }

    /// Creates a property value error.
    pub fn property_value(
        entity_name: impl Into<String>,
        property: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::PropertyValue {
            entity_name: entity_name.into(),
            property: property.into(),
            message: message.into(),
        }
    }

    /// Returns true for optimistic locking failures.
    #[must_use]
    pub const fn is_stale_state(&self) -> bool {
        matches!(self, Self::StaleObjectState { .. })
    }
}
