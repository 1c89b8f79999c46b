//! Entity region access strategies.
//!
//! A session talks to a cache region only through an
//! [`EntityAccessStrategy`]. The call sequence for each unit-of-work event
//! is the same for every strategy:
//!
//! - load miss: `register_pending_put`, database load, `put_from_load`
//! - insert: `insert` during flush, `after_insert` on successful commit
//! - update: `lock_item` and `update` during flush, then `after_update` on
//!   successful commit or `unlock_item` on rollback
//! - delete: `lock_item` and `remove` during flush, `unlock_item` on
//!   completion
//!
//! What each call does to the region is the strategy's choice.

mod nonstrict;
mod read_write;
mod transactional;

pub use nonstrict::NonstrictReadWriteAccess;
pub use read_write::ReadWriteAccess;
pub use transactional::TransactionalAccess;

use crate::clock::Timestamper;
use crate::error::CacheResult;
use crate::key::{CacheEntry, CacheKey};
use crate::region::CacheRegion;
use crate::settings::CacheSettings;
use crate::soft_lock::SoftLock;
use crate::stats::CacheStatistics;
use crate::validator::{LoadOwner, PutFromLoadValidator};
use hibernia_codec::Value;
use std::fmt;
use std::sync::Arc;

/// The concurrency strategy of an entity region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// Writes are applied after commit; no soft locks.
    Transactional,
    /// Soft-locked writes; readers miss while an entry is locked.
    ReadWrite,
    /// Writes evict; no locking.
    NonstrictReadWrite,
}

impl AccessType {
    /// Builds the strategy for a region.
    pub fn build_strategy(
        self,
        region: Arc<dyn CacheRegion>,
        timestamper: Arc<Timestamper>,
        settings: &CacheSettings,
    ) -> Arc<dyn EntityAccessStrategy> {
        let core = AccessCore::new(region, timestamper, settings);
        match self {
            AccessType::Transactional => Arc::new(TransactionalAccess::new(core)),
            AccessType::ReadWrite => Arc::new(ReadWriteAccess::new(core, settings)),
            AccessType::NonstrictReadWrite => Arc::new(NonstrictReadWriteAccess::new(core)),
        }
    }
}

/// Coordinates one entity region with the units of work using it.
pub trait EntityAccessStrategy: Send + Sync + fmt::Debug {
    /// Returns the strategy's access type.
    fn access_type(&self) -> AccessType;

    /// Returns the underlying region.
    fn region(&self) -> &Arc<dyn CacheRegion>;

    /// Returns the region statistics.
    fn statistics(&self) -> &CacheStatistics;

    /// Returns the put-from-load validator of the region.
    fn validator(&self) -> &PutFromLoadValidator;

    /// Returns the cached entry if it is visible to a transaction that
    /// started at `tx_timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cached bytes cannot be decoded.
    fn get(&self, key: &CacheKey, tx_timestamp: u64) -> CacheResult<Option<CacheEntry>>;

    /// Records that `owner` is about to load `key` from the database.
    fn register_pending_put(&self, key: &CacheKey, owner: LoadOwner) {
        self.validator().register_pending_put(key, owner);
    }

    /// Caches freshly loaded state.
    ///
    /// Returns `Ok(false)` when the put was skipped: the validator refused
    /// it, `minimal_put` is set and the key is already cached, or the
    /// cached entry must not be replaced.
    ///
    /// # Errors
    ///
    /// Returns an error on encoding or version consistency failures.
    fn put_from_load(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        tx_timestamp: u64,
        owner: LoadOwner,
        minimal_put: bool,
    ) -> CacheResult<bool>;

    /// Marks `key` as being written.
    ///
    /// # Errors
    ///
    /// Returns an error if the region content cannot be decoded.
    fn lock_item(&self, key: &CacheKey, version: Option<&Value>) -> CacheResult<Option<SoftLock>>;

    /// Releases a soft lock after a failed or completed write.
    ///
    /// # Errors
    ///
    /// Returns an error if the region content cannot be decoded.
    fn unlock_item(&self, key: &CacheKey, lock: Option<SoftLock>) -> CacheResult<()>;

    /// Called when an insert executes. Returns whether the region was
    /// written.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be encoded.
    fn insert(&self, key: &CacheKey, entry: &CacheEntry) -> CacheResult<bool>;

    /// Called after the inserting transaction committed. Returns whether the
    /// region was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be encoded.
    fn after_insert(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<bool>;

    /// Called when an update executes. Returns whether the region was
    /// written.
    ///
    /// # Errors
    ///
    /// Returns an error if the region content cannot be decoded.
    fn update(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        previous_version: Option<&Value>,
    ) -> CacheResult<bool>;

    /// Called after the updating transaction committed. Returns whether the
    /// region was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be encoded.
    fn after_update(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        previous_version: Option<&Value>,
        lock: Option<SoftLock>,
    ) -> CacheResult<bool>;

    /// Called when a delete executes.
    ///
    /// # Errors
    ///
    /// Returns an error if the region content cannot be decoded.
    fn remove(&self, key: &CacheKey) -> CacheResult<()>;

    /// Removes `key` immediately, outside any transaction.
    fn evict(&self, key: &CacheKey) {
        self.validator().invalidate_key(key);
        self.region().remove(key);
        self.statistics().record_eviction();
    }

    /// Removes every entry immediately, outside any transaction.
    fn evict_all(&self) {
        self.validator().invalidate_region();
        self.region().clear();
        self.statistics().record_eviction();
    }
}

/// State shared by all strategies.
#[derive(Debug)]
pub(crate) struct AccessCore {
    pub(crate) region: Arc<dyn CacheRegion>,
    pub(crate) validator: PutFromLoadValidator,
    pub(crate) timestamper: Arc<Timestamper>,
    pub(crate) stats: CacheStatistics,
}

impl AccessCore {
    pub(crate) fn new(
        region: Arc<dyn CacheRegion>,
        timestamper: Arc<Timestamper>,
        settings: &CacheSettings,
    ) -> Self {
        let validator = PutFromLoadValidator::new(Arc::clone(timestamper.clock()), settings);
        Self {
            region,
            validator,
            timestamper,
            stats: CacheStatistics::default(),
        }
    }

    /// Reads a plain entry, recording a hit or a miss.
    pub(crate) fn read_entry(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        match self.region.get(key) {
            Some(bytes) => {
                self.stats.record_hit();
                Ok(Some(CacheEntry::decode(&bytes)?))
            }
            None => {
                self.stats.record_miss();
                Ok(None)
            }
        }
    }

    pub(crate) fn write_entry(&self, key: &CacheKey, entry: &CacheEntry) -> CacheResult<()> {
        self.region.put(key, entry.encode()?);
        self.stats.record_put();
        Ok(())
    }

    /// Put-from-load for regions holding plain entries.
    pub(crate) fn put_plain_from_load(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        owner: LoadOwner,
        minimal_put: bool,
    ) -> CacheResult<bool> {
        if minimal_put && self.region.contains(key) {
            return Ok(false);
        }
        let Some(_lock) = self.validator.acquire_put_from_load_lock(key, owner) else {
            self.stats.record_rejected_put();
            return Ok(false);
        };
        if let Some(bytes) = self.region.get(key) {
            let existing = CacheEntry::decode(&bytes)?;
            if !crate::version::may_replace(existing.version(), entry.version())? {
                self.stats.record_rejected_put();
                return Ok(false);
            }
        }
        self.write_entry(key, entry)?;
        Ok(true)
    }

    pub(crate) fn evict_entry(&self, key: &CacheKey) {
        self.validator.invalidate_key(key);
        self.region.remove(key);
        self.stats.record_eviction();
    }
}
