//! Transactional access: writes happen after commit.

use super::{AccessCore, AccessType, EntityAccessStrategy};
use crate::error::CacheResult;
use crate::key::{CacheEntry, CacheKey};
use crate::region::CacheRegion;
use crate::soft_lock::SoftLock;
use crate::stats::CacheStatistics;
use crate::validator::{LoadOwner, PutFromLoadValidator};
use hibernia_codec::Value;
use std::sync::Arc;
use tracing::trace;

/// Defers every region write to the commit notification.
///
/// `insert` and `update` only invalidate in-flight loads and report that
/// nothing was written; `after_insert` and `after_update` perform the write.
/// No soft locks are needed because nothing stale is ever written before
/// commit.
#[derive(Debug)]
pub struct TransactionalAccess {
    core: AccessCore,
}

impl TransactionalAccess {
    pub(crate) fn new(core: AccessCore) -> Self {
        Self { core }
    }
}

impl EntityAccessStrategy for TransactionalAccess {
    fn access_type(&self) -> AccessType {
        AccessType::Transactional
    }

    fn region(&self) -> &Arc<dyn CacheRegion> {
        &self.core.region
    }

    fn statistics(&self) -> &CacheStatistics {
        &self.core.stats
    }

    fn validator(&self) -> &PutFromLoadValidator {
        &self.core.validator
    }

    fn get(&self, key: &CacheKey, _tx_timestamp: u64) -> CacheResult<Option<CacheEntry>> {
        self.core.read_entry(key)
    }

    fn put_from_load(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        _tx_timestamp: u64,
        owner: LoadOwner,
        minimal_put: bool,
    ) -> CacheResult<bool> {
        self.core.put_plain_from_load(key, &entry, owner, minimal_put)
    }

    fn lock_item(&self, _key: &CacheKey, _version: Option<&Value>) -> CacheResult<Option<SoftLock>> {
        Ok(None)
    }

    fn unlock_item(&self, _key: &CacheKey, _lock: Option<SoftLock>) -> CacheResult<()> {
        Ok(())
    }

    fn insert(&self, key: &CacheKey, _entry: &CacheEntry) -> CacheResult<bool> {
        self.core.validator.invalidate_key(key);
        Ok(false)
    }

    fn after_insert(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<bool> {
        self.core.write_entry(key, &entry)?;
        Ok(true)
    }

    fn update(
        &self,
        key: &CacheKey,
        _entry: &CacheEntry,
        _previous_version: Option<&Value>,
    ) -> CacheResult<bool> {
        self.core.validator.invalidate_key(key);
        Ok(false)
    }

    fn after_update(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        _previous_version: Option<&Value>,
        _lock: Option<SoftLock>,
    ) -> CacheResult<bool> {
        self.core.write_entry(key, &entry)?;
        Ok(true)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        trace!(%key, "transactional remove");
        self.core.evict_entry(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{entry, key, name_of, Fixture};
    use super::*;

    #[test]
    fn insert_is_deferred_until_commit() {
        let f = Fixture::new(AccessType::Transactional);
        let e = entry("Ada", Some(0));
        assert!(!f.strategy.insert(&key(1), &e).unwrap());
        assert!(f.strategy.get(&key(1), f.tx()).unwrap().is_none());

        assert!(f.strategy.after_insert(&key(1), e).unwrap());
        let cached = f.strategy.get(&key(1), f.tx()).unwrap().unwrap();
        assert_eq!(name_of(&cached), "Ada");
    }

    #[test]
    fn update_invalidates_in_flight_loads() {
        let f = Fixture::new(AccessType::Transactional);
        let owner = LoadOwner(7);
        f.strategy.register_pending_put(&key(1), owner);

        f.strategy
            .update(&key(1), &entry("Grace", Some(1)), Some(&Value::Integer(0)))
            .unwrap();

        let stale = f
            .strategy
            .put_from_load(&key(1), entry("Ada", Some(0)), f.tx(), owner, false)
            .unwrap();
        assert!(!stale);
        assert_eq!(f.strategy.statistics().rejected_puts(), 1);
    }

    #[test]
    fn minimal_put_skips_cached_keys() {
        let f = Fixture::new(AccessType::Transactional);
        f.strategy.after_insert(&key(1), entry("Ada", Some(0))).unwrap();
        f.strategy.register_pending_put(&key(1), LoadOwner(1));
        let put = f
            .strategy
            .put_from_load(&key(1), entry("Ada", Some(0)), f.tx(), LoadOwner(1), true)
            .unwrap();
        assert!(!put);
    }

    #[test]
    fn newer_version_replaces_cached_entry() {
        let f = Fixture::new(AccessType::Transactional);
        f.strategy.after_insert(&key(1), entry("Ada", Some(0))).unwrap();
        f.strategy.register_pending_put(&key(1), LoadOwner(1));
        assert!(f
            .strategy
            .put_from_load(&key(1), entry("Grace", Some(3)), f.tx(), LoadOwner(1), false)
            .unwrap());
        let cached = f.strategy.get(&key(1), f.tx()).unwrap().unwrap();
        assert_eq!(name_of(&cached), "Grace");
    }

    #[test]
    fn remove_evicts() {
        let f = Fixture::new(AccessType::Transactional);
        f.strategy.after_insert(&key(1), entry("Ada", None)).unwrap();
        f.strategy.remove(&key(1)).unwrap();
        assert!(f.strategy.get(&key(1), f.tx()).unwrap().is_none());
    }

    #[test]
    fn remove_ignores_versions_and_refuses_in_flight_loads() {
        let f = Fixture::new(AccessType::Transactional);
        f.strategy.after_insert(&key(1), entry("Grace", Some(9))).unwrap();
        f.strategy.register_pending_put(&key(1), LoadOwner(3));

        f.strategy.remove(&key(1)).unwrap();
        assert!(f.strategy.get(&key(1), f.tx()).unwrap().is_none());

        let put = f
            .strategy
            .put_from_load(&key(1), entry("Ada", Some(0)), f.tx(), LoadOwner(3), false)
            .unwrap();
        assert!(!put);
        assert_eq!(f.strategy.statistics().rejected_puts(), 1);
    }
}
