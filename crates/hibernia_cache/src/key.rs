//! Cache keys and entries.

use crate::error::CacheResult;
use hibernia_codec::{from_cbor, to_canonical_cbor, Identifier, Value};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Region-scoped key of a cached entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    entity_name: String,
    id: Identifier,
    tenant: Option<String>,
}

impl CacheKey {
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
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tenant {
            Some(t) => write!(f, "{}#{}@{t}", self.entity_name, self.id),
            None => write!(f, "{}#{}", self.entity_name, self.id),
        }
    }
}

/// A disassembled entity snapshot stored in a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    disassembled: Vec<u8>,
    version: Option<Value>,
}

impl CacheEntry {
    /// Disassembles a state into a cache entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be encoded.
    pub fn disassemble<T: Serialize + ?Sized>(state: &T, version: Option<Value>) -> CacheResult<Self> {
        Ok(Self {
            disassembled: to_canonical_cbor(state)?,
            version,
        })
    }

    /// Reassembles the state.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not describe a `T`.
    pub fn assemble<T: DeserializeOwned>(&self) -> CacheResult<T> {
        Ok(from_cbor(&self.disassembled)?)
    }

    /// Returns the entity version the entry was built from.
    #[must_use]
    pub const fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    pub(crate) fn encode(&self) -> CacheResult<Vec<u8>> {
        Ok(to_canonical_cbor(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> CacheResult<Self> {
        Ok(from_cbor(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_reassembles_state() {
        let state = vec![Value::from("Ada"), Value::Integer(36)];
        let entry = CacheEntry::disassemble(&state, Some(Value::Integer(2))).unwrap();
        let back: Vec<Value> = entry.assemble().unwrap();
        assert_eq!(back, state);
        assert_eq!(entry.version(), Some(&Value::Integer(2)));

        let decoded = CacheEntry::decode(&entry.encode().unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn key_display() {
        let key = CacheKey::new("Person", Identifier::from(3), None);
        assert_eq!(key.to_string(), "Person#3");
        let tenant = CacheKey::new("Person", Identifier::from(3), Some("acme".into()));
        assert_eq!(tenant.to_string(), "Person#3@acme");
        assert_ne!(key, tenant);
    }
}
