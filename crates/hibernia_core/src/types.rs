//! Core type definitions for Hibernia.

use hibernia_cache::CacheKey;
use hibernia_codec::Identifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Arena index of an entity instance inside one session.
///
/// Identity-based bookkeeping (entries, cascade visited sets, merge copy
/// caches) is keyed by this index, never by value equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub(crate) usize);

impl InstanceId {
    /// Returns the raw index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance:{}", self.0)
    }
}

/// Arena index of a proxy inside one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProxyId(pub(crate) usize);

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy:{}", self.0)
    }
}

/// Arena index of a persistent collection inside one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectionId(pub(crate) usize);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collection:{}", self.0)
    }
}

/// Identifier of a session, unique within its factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// Identity of a managed entity: entity name, identifier and tenant.
///
/// Equal names and equal identifiers hash and compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    entity_name: String,
    id: Identifier,
    tenant: Option<String>,
}

impl EntityKey {
    /// Creates a key.
    pub fn new(entity_name: impl Into<String>, id: Identifier, tenant: Option<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            id,
            tenant,
        }
    }

    /// Returns the entity name.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Returns the identifier.
    #[must_use]
    pub const fn id(&self) -> &Identifier {
        &self.id
    }

    /// Returns the tenant.
    #[must_use]
    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Returns the second-level cache key for this entity.
    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.entity_name.clone(), self.id.clone(), self.tenant.clone())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}#{}]", self.entity_name, self.id)
    }
}

/// Identity of a persistent collection: role and owner identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectionKey {
    role: String,
    owner: Identifier,
}

impl CollectionKey {
    /// Creates a key.
    pub fn new(role: impl Into<String>, owner: Identifier) -> Self {
        Self {
            role: role.into(),
            owner,
        }
    }

    /// Returns the collection role.
    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Returns the owner identifier.
    #[must_use]
    pub const fn owner(&self) -> &Identifier {
        &self.owner
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}#{}]", self.role, self.owner)
    }
}

/// Lock modes, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockMode {
    /// No lock; the entity was not read in this transaction.
    #[default]
    None,
    /// Read from the database in this transaction.
    Read,
    /// Version verified at the end of the transaction.
    Optimistic,
    /// Version incremented at once.
    OptimisticForceIncrement,
    /// Written in this transaction.
    Write,
    /// Shared database lock.
    PessimisticRead,
    /// Exclusive database lock.
    PessimisticWrite,
    /// Exclusive database lock with an immediate version increment.
    PessimisticForceIncrement,
}

impl LockMode {
    /// Returns true for modes that take a database lock.
    #[must_use]
    pub const fn is_pessimistic(self) -> bool {
        matches!(
            self,
            Self::PessimisticRead | Self::PessimisticWrite | Self::PessimisticForceIncrement
        )
    }

    /// Returns true for modes that increment the version.
    #[must_use]
    pub const fn is_force_increment(self) -> bool {
        matches!(
            self,
            Self::OptimisticForceIncrement | Self::PessimisticForceIncrement
        )
    }
}

/// Lifecycle status of an entity entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Loaded or inserted; changes are flushed.
    Managed,
    /// Managed, but never dirty-checked.
    ReadOnly,
    /// Scheduled for deletion.
    Deleted,
    /// Deleted in the database.
    Gone,
    /// Scheduled for insertion.
    Saving,
}

impl Status {
    /// Returns whether the transition to `next` is legal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Saving, Self::Managed)
                | (Self::Managed, Self::ReadOnly)
                | (Self::ReadOnly, Self::Managed)
                | (Self::Managed | Self::ReadOnly | Self::Saving, Self::Deleted)
                | (Self::Deleted, Self::Managed)
                | (Self::Deleted, Self::Gone)
        )
    }

    /// Returns true for `Deleted` and `Gone`.
    #[must_use]
    pub const fn is_deleted_or_gone(self) -> bool {
        matches!(self, Self::Deleted | Self::Gone)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Managed => "MANAGED",
            Self::ReadOnly => "READ_ONLY",
            Self::Deleted => "DELETED",
            Self::Gone => "GONE",
            Self::Saving => "SAVING",
        };
        f.write_str(s)
    }
}
