//! Nonstrict read-write access: writes evict.

use super::{AccessCore, AccessType, EntityAccessStrategy};
use crate::error::CacheResult;
use crate::key::{CacheEntry, CacheKey};
use crate::region::CacheRegion;
use crate::soft_lock::SoftLock;
use crate::stats::CacheStatistics;
use crate::validator::{LoadOwner, PutFromLoadValidator};
use hibernia_codec::Value;
use std::sync::Arc;

/// Never writes modified state; evicts it instead and lets the next load
/// repopulate the entry.
#[derive(Debug)]
pub struct NonstrictReadWriteAccess {
    core: AccessCore,
}

impl NonstrictReadWriteAccess {
    pub(crate) fn new(core: AccessCore) -> Self {
        Self { core }
    }
}

impl EntityAccessStrategy for NonstrictReadWriteAccess {
    fn access_type(&self) -> AccessType {
        AccessType::NonstrictReadWrite
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

    fn unlock_item(&self, key: &CacheKey, _lock: Option<SoftLock>) -> CacheResult<()> {
        self.core.evict_entry(key);
        Ok(())
    }

    fn insert(&self, _key: &CacheKey, _entry: &CacheEntry) -> CacheResult<bool> {
        Ok(false)
    }

    fn after_insert(&self, _key: &CacheKey, _entry: CacheEntry) -> CacheResult<bool> {
        Ok(false)
    }

    fn update(
        &self,
        key: &CacheKey,
        _entry: &CacheEntry,
        _previous_version: Option<&Value>,
    ) -> CacheResult<bool> {
        self.core.evict_entry(key);
        Ok(false)
    }

    fn after_update(
        &self,
        key: &CacheKey,
        _entry: CacheEntry,
        _previous_version: Option<&Value>,
        lock: Option<SoftLock>,
    ) -> CacheResult<bool> {
        self.unlock_item(key, lock)?;
        Ok(false)
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        self.core.evict_entry(key);
        Ok(())
    }
}
