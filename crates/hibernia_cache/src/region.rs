//! Cache provider contract.

use crate::key::CacheKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A named key/value region supplied by a cache provider.
///
/// Values are opaque bytes. Implementations must be safe to use from many
/// sessions at once; the access strategies add the consistency protocol on
/// top.
pub trait CacheRegion: Send + Sync + fmt::Debug {
    /// Returns the region name.
    fn name(&self) -> &str;

    /// Returns the value stored under `key`.
    fn get(&self, key: &CacheKey) -> Option<Vec<u8>>;

    /// Stores a value, replacing any previous one.
    fn put(&self, key: &CacheKey, value: Vec<u8>);

    /// Removes a value.
    fn remove(&self, key: &CacheKey);

    /// Removes every value.
    fn clear(&self);

    /// Returns the number of stored values.
    fn len(&self) -> usize;

    /// Returns true if a value is stored under `key`.
    fn contains(&self, key: &CacheKey) -> bool {
        self.get(key).is_some()
    }

    /// Returns true if the region holds no values.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds regions by name.
pub trait RegionFactory: Send + Sync + fmt::Debug {
    /// Returns the region called `name`, creating it if needed.
    fn build_region(&self, name: &str) -> Arc<dyn CacheRegion>;
}

/// A region backed by a hash map.
#[derive(Debug)]
pub struct InMemoryRegion {
    name: String,
    entries: RwLock<HashMap<CacheKey, Vec<u8>>>,
}

impl InMemoryRegion {
    /// Creates an empty region.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl CacheRegion for InMemoryRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: &CacheKey, value: Vec<u8>) {
        self.entries.write().insert(key.clone(), value);
    }

    fn remove(&self, key: &CacheKey) {
        self.entries.write().remove(key);
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }
}

/// Hands out [`InMemoryRegion`]s; the same name always yields the same
/// region.
#[derive(Debug, Default)]
pub struct InMemoryRegionFactory {
    regions: RwLock<HashMap<String, Arc<InMemoryRegion>>>,
}

impl InMemoryRegionFactory {
    /// Creates a factory with no regions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegionFactory for InMemoryRegionFactory {
    fn build_region(&self, name: &str) -> Arc<dyn CacheRegion> {
        let mut regions = self.regions.write();
        let region = regions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryRegion::new(name)));
        Arc::clone(region) as Arc<dyn CacheRegion>
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hibernia_codec::Identifier;

    #[test]
    fn region_basic_operations() {
        let region = InMemoryRegion::new("people");
        let key = CacheKey::new("Person", Identifier::from(1), None);
        assert!(region.is_empty());

        region.put(&key, vec![1]);
        assert!(region.contains(&key));
        assert_eq!(region.get(&key), Some(vec![1]));

        region.remove(&key);
        assert!(!region.contains(&key));

        region.put(&key, vec![2]);
        region.clear();
        assert_eq!(region.len(), 0);
    }

    #[test]
    fn factory_shares_regions_by_name() {
        let factory = InMemoryRegionFactory::new();
        let a = factory.build_region("people");
        let b = factory.build_region("people");
        let key = CacheKey::new("Person", Identifier::from(1), None);
        a.put(&key, vec![9]);
        assert_eq!(b.get(&key), Some(vec![9]));
        assert!(factory.build_region("other").is_empty());
    }
}
