//! Read-write access: soft-locked writes.

use super::{AccessCore, AccessType, EntityAccessStrategy};
use crate::clock::Timestamper;
use crate::error::CacheResult;
use crate::key::{CacheEntry, CacheKey};
use crate::region::CacheRegion;
use crate::settings::CacheSettings;
use crate::soft_lock::SoftLock;
use crate::stats::CacheStatistics;
use crate::validator::{LoadOwner, PutFromLoadValidator};
use crate::version::may_replace;
use hibernia_codec::{from_cbor, to_canonical_cbor, Value};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// What the region holds under a key.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Lockable {
    Item(Item),
    Lock(Lock),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Item {
    entry: CacheEntry,
    timestamp: u64,
}

impl Item {
    fn is_readable(&self, tx_timestamp: u64) -> bool {
        tx_timestamp > self.timestamp
    }

    fn is_writeable(&self, new_version: Option<&Value>) -> CacheResult<bool> {
        may_replace(self.entry.version(), new_version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lock {
    source: Uuid,
    id: u64,
    timeout: u64,
    version: Option<Value>,
    multiplicity: u32,
    concurrent: bool,
    unlock_timestamp: u64,
}

impl Lock {
    fn new(source: Uuid, id: u64, timeout: u64, version: Option<Value>) -> Self {
        Self {
            source,
            id,
            timeout,
            version,
            multiplicity: 1,
            concurrent: false,
            unlock_timestamp: 0,
        }
    }

    fn is_writeable(&self, tx_timestamp: u64, new_version: Option<&Value>) -> CacheResult<bool> {
        if tx_timestamp > self.timeout {
            return Ok(true);
        }
        if self.multiplicity > 0 {
            return Ok(false);
        }
        match &self.version {
            None => Ok(tx_timestamp > self.unlock_timestamp),
            Some(v) => may_replace(Some(v), new_version),
        }
    }

    fn is_unlockable(&self, lock: &SoftLock) -> bool {
        self.source == lock.source() && self.id == lock.id()
    }

    fn relock(&mut self, timeout: u64) {
        self.concurrent = true;
        self.multiplicity += 1;
        self.timeout = timeout;
    }

    fn unlock(&mut self, timestamp: u64) {
        self.multiplicity = self.multiplicity.saturating_sub(1);
        if self.multiplicity == 0 {
            self.unlock_timestamp = timestamp;
        }
    }

    fn soft_lock(&self) -> SoftLock {
        SoftLock::new(self.source, self.id)
    }
}

/// Replaces an entry with a soft lock while it is being written.
///
/// Readers miss while the lock is held. After commit the new state is
/// written only if nobody else locked the entry in the meantime; otherwise
/// the entry stays locked until every writer released it, and the next
/// load repopulates it.
#[derive(Debug)]
pub struct ReadWriteAccess {
    core: AccessCore,
    write_lock: Mutex<()>,
    source: Uuid,
    next_lock_id: AtomicU64,
    lock_timeout: u64,
}

impl ReadWriteAccess {
    pub(crate) fn new(core: AccessCore, settings: &CacheSettings) -> Self {
        Self {
            core,
            write_lock: Mutex::new(()),
            source: Uuid::new_v4(),
            next_lock_id: AtomicU64::new(1),
            lock_timeout: Timestamper::span(settings.lock_timeout),
        }
    }

    fn read(&self, key: &CacheKey) -> CacheResult<Option<Lockable>> {
        self.core
            .region
            .get(key)
            .map(|bytes| from_cbor(&bytes))
            .transpose()
            .map_err(Into::into)
    }

    fn write(&self, key: &CacheKey, value: &Lockable) -> CacheResult<()> {
        self.core.region.put(key, to_canonical_cbor(value)?);
        Ok(())
    }

    fn write_item(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<()> {
        let item = Item {
            entry,
            timestamp: self.core.timestamper.next(),
        };
        self.write(key, &Lockable::Item(item))?;
        self.core.stats.record_put();
        Ok(())
    }

    fn next_timeout(&self) -> u64 {
        self.core.timestamper.next() + self.lock_timeout
    }

    fn handle_lock_expiry(&self, key: &CacheKey, found: Option<&Lockable>) -> CacheResult<()> {
        warn!(
            region = self.core.region.name(),
            %key,
            ?found,
            "soft-locked cache entry expired; consider a longer lock timeout"
        );
        let timeout = self.next_timeout();
        let mut lock = Lock::new(
            self.source,
            self.next_lock_id.fetch_add(1, Ordering::Relaxed),
            timeout,
            None,
        );
        lock.unlock(timeout);
        self.write(key, &Lockable::Lock(lock))
    }
}

impl EntityAccessStrategy for ReadWriteAccess {
    fn access_type(&self) -> AccessType {
        AccessType::ReadWrite
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

    fn get(&self, key: &CacheKey, tx_timestamp: u64) -> CacheResult<Option<CacheEntry>> {
        match self.read(key)? {
            Some(Lockable::Item(item)) if item.is_readable(tx_timestamp) => {
                self.core.stats.record_hit();
                Ok(Some(item.entry))
            }
            _ => {
                self.core.stats.record_miss();
                Ok(None)
            }
        }
    }

    fn put_from_load(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        tx_timestamp: u64,
        owner: LoadOwner,
        minimal_put: bool,
    ) -> CacheResult<bool> {
        let _guard = self.write_lock.lock();
        let existing = self.read(key)?;
        let writeable = match &existing {
            None => true,
            Some(Lockable::Item(_)) if minimal_put => false,
            Some(Lockable::Item(item)) => item.is_writeable(entry.version())?,
            Some(Lockable::Lock(lock)) => lock.is_writeable(tx_timestamp, entry.version())?,
        };
        if !writeable {
            self.core.stats.record_rejected_put();
            return Ok(false);
        }
        let Some(_put) = self.core.validator.acquire_put_from_load_lock(key, owner) else {
            self.core.stats.record_rejected_put();
            return Ok(false);
        };
        self.write_item(key, entry)?;
        Ok(true)
    }

    fn lock_item(&self, key: &CacheKey, version: Option<&Value>) -> CacheResult<Option<SoftLock>> {
        let _guard = self.write_lock.lock();
        self.core.validator.invalidate_key(key);
        let timeout = self.next_timeout();
        let lock = match self.read(key)? {
            Some(Lockable::Lock(mut lock)) => {
                lock.relock(timeout);
                lock
            }
            Some(Lockable::Item(item)) => Lock::new(
                self.source,
                self.next_lock_id.fetch_add(1, Ordering::Relaxed),
                timeout,
                item.entry.version().cloned(),
            ),
            None => Lock::new(
                self.source,
                self.next_lock_id.fetch_add(1, Ordering::Relaxed),
                timeout,
                version.cloned(),
            ),
        };
        let soft_lock = lock.soft_lock();
        self.write(key, &Lockable::Lock(lock))?;
        Ok(Some(soft_lock))
    }

    fn unlock_item(&self, key: &CacheKey, lock: Option<SoftLock>) -> CacheResult<()> {
        let _guard = self.write_lock.lock();
        match (self.read(key)?, lock) {
            (Some(Lockable::Lock(mut held)), Some(soft)) if held.is_unlockable(&soft) => {
                held.unlock(self.core.timestamper.next());
                self.write(key, &Lockable::Lock(held))
            }
            (found, _) => self.handle_lock_expiry(key, found.as_ref()),
        }
    }

    fn insert(&self, _key: &CacheKey, _entry: &CacheEntry) -> CacheResult<bool> {
        Ok(false)
    }

    fn after_insert(&self, key: &CacheKey, entry: CacheEntry) -> CacheResult<bool> {
        let _guard = self.write_lock.lock();
        if self.read(key)?.is_some() {
            return Ok(false);
        }
        self.write_item(key, entry)?;
        Ok(true)
    }

    fn update(
        &self,
        _key: &CacheKey,
        _entry: &CacheEntry,
        _previous_version: Option<&Value>,
    ) -> CacheResult<bool> {
        Ok(false)
    }

    fn after_update(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        _previous_version: Option<&Value>,
        lock: Option<SoftLock>,
    ) -> CacheResult<bool> {
        let _guard = self.write_lock.lock();
        match (self.read(key)?, lock) {
            (Some(Lockable::Lock(mut held)), Some(soft)) if held.is_unlockable(&soft) => {
                if held.concurrent {
                    held.unlock(self.core.timestamper.next());
                    self.write(key, &Lockable::Lock(held))?;
                    Ok(false)
                } else {
                    self.write_item(key, entry)?;
                    Ok(true)
                }
            }
            (found, _) => {
                self.handle_lock_expiry(key, found.as_ref())?;
                Ok(false)
            }
        }
    }

    fn remove(&self, _key: &CacheKey) -> CacheResult<()> {
        Ok(())
    }
}
