//! Put-from-load race protection.
//!
//! A session that misses the cache loads the row from the database and then
//! puts it into the region. If another transaction invalidated the key while
//! that load was in flight, the loaded data may already be stale and must
//! not reach the cache. The validator closes this race:
//!
//! 1. Before loading, the session calls [`register_pending_put`].
//! 2. Writers call [`invalidate_key`] (or [`invalidate_region`]), which
//!    marks every pending put for the key as completed.
//! 3. After loading, the session calls [`acquire_put_from_load_lock`]; it
//!    only gets a lock if its own pending put is still live.
//!
//! A put without a prior registration (a "naked put") is accepted unless the
//! key or region was invalidated within the naked-put invalidation period.
//!
//! [`register_pending_put`]: PutFromLoadValidator::register_pending_put
//! [`invalidate_key`]: PutFromLoadValidator::invalidate_key
//! [`invalidate_region`]: PutFromLoadValidator::invalidate_region
//! [`acquire_put_from_load_lock`]: PutFromLoadValidator::acquire_put_from_load_lock

use crate::clock::{duration_millis, Clock};
use crate::key::CacheKey;
use crate::settings::CacheSettings;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// Identifies the unit of work a load belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadOwner(pub u64);

#[derive(Debug, Clone, Copy)]
struct PendingPut {
    registered_at: u64,
    completed: bool,
}

#[derive(Debug, Default)]
struct PendingPutMap {
    puts: HashMap<LoadOwner, PendingPut>,
    locked: bool,
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<CacheKey, PendingPutMap>,
    recent_removals: HashMap<CacheKey, u64>,
    invalidation_timestamp: u64,
    next_sweep: u64,
}

impl State {
    fn sweep(&mut self, now: u64, max_delay: u64) {
        for map in self.pending.values_mut() {
            map.puts
                .retain(|_, p| now.saturating_sub(p.registered_at) <= max_delay);
        }
        self.pending.retain(|_, m| m.locked || !m.puts.is_empty());
        self.recent_removals.retain(|_, expiry| *expiry >= now);
    }
}

/// Tracks in-flight loads per key and refuses stale puts.
pub struct PutFromLoadValidator {
    state: Mutex<State>,
    released: Condvar,
    clock: Arc<dyn Clock>,
    naked_put_invalidation_period: u64,
    pending_put_overage: u64,
    max_pending_put_delay: u64,
    put_lock_timeout: std::time::Duration,
}

impl PutFromLoadValidator {
    /// Creates a validator.
    pub fn new(clock: Arc<dyn Clock>, settings: &CacheSettings) -> Self {
        Self {
            state: Mutex::new(State::default()),
            released: Condvar::new(),
            clock,
            naked_put_invalidation_period: duration_millis(settings.naked_put_invalidation_period),
            pending_put_overage: duration_millis(settings.pending_put_overage),
            max_pending_put_delay: duration_millis(settings.max_pending_put_delay),
            put_lock_timeout: settings.put_lock_timeout,
        }
    }

    /// Records that `owner` is about to load `key` from the database.
    pub fn register_pending_put(&self, key: &CacheKey, owner: LoadOwner) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        state.pending.entry(key.clone()).or_default().puts.insert(
            owner,
            PendingPut {
                registered_at: now,
                completed: false,
            },
        );
        if now >= state.next_sweep {
            state.sweep(now, self.max_pending_put_delay);
            state.next_sweep = now + self.pending_put_overage;
        }
    }

    /// Acquires the right to put `owner`'s freshly loaded value for `key`.
    ///
    /// Returns `None` when the put must be skipped: the key or region was
    /// invalidated after the load was registered, a naked put falls inside
    /// the invalidation period, or a concurrent put holds the key for longer
    /// than the put lock timeout. The returned guard releases the key when
    /// dropped.
    pub fn acquire_put_from_load_lock(
        &self,
        key: &CacheKey,
        owner: LoadOwner,
    ) -> Option<PutFromLoadLock<'_>> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if now < state.invalidation_timestamp {
            trace!(%key, "put refused: region invalidated recently");
            return None;
        }

        if !state.pending.contains_key(key) {
            if state
                .recent_removals
                .get(key)
                .is_some_and(|expiry| now <= *expiry)
            {
                trace!(%key, "naked put refused: key invalidated recently");
                return None;
            }
            state.pending.entry(key.clone()).or_default().puts.insert(
                owner,
                PendingPut {
                    registered_at: now,
                    completed: false,
                },
            );
        }

        if !self.wait_unlocked(&mut state, key) {
            return None;
        }

        let map = state.pending.get_mut(key)?;
        let valid = map.puts.remove(&owner).is_some_and(|p| !p.completed);
        if !valid {
            if map.puts.is_empty() {
                state.pending.remove(key);
            }
            trace!(%key, owner = owner.0, "put refused: invalidated during load");
            return None;
        }
        map.locked = true;
        Some(PutFromLoadLock {
            validator: self,
            key: key.clone(),
        })
    }

    /// Invalidates pending loads of `key` and refuses naked puts for the
    /// invalidation period.
    ///
    /// Returns `false` if a concurrent put held the key for longer than the
    /// put lock timeout.
    pub fn invalidate_key(&self, key: &CacheKey) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        if !self.wait_unlocked(&mut state, key) {
            return false;
        }
        if let Some(map) = state.pending.get_mut(key) {
            for put in map.puts.values_mut() {
                put.completed = true;
            }
        }
        state
            .recent_removals
            .insert(key.clone(), now + self.naked_put_invalidation_period);
        trace!(%key, "invalidated key");
        true
    }

    /// Invalidates every pending load of the region.
    pub fn invalidate_region(&self) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        state.invalidation_timestamp = now + self.naked_put_invalidation_period;
        for map in state.pending.values_mut() {
            for put in map.puts.values_mut() {
                put.completed = true;
            }
        }
        state.recent_removals.clear();
        true
    }

    /// Returns the number of keys with pending loads.
    pub fn pending_put_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn wait_unlocked(&self, state: &mut MutexGuard<'_, State>, key: &CacheKey) -> bool {
        let deadline = Instant::now() + self.put_lock_timeout;
        while state.pending.get(key).is_some_and(|m| m.locked) {
            if self.released.wait_until(state, deadline).timed_out() {
                return !state.pending.get(key).is_some_and(|m| m.locked);
            }
        }
        true
    }

    fn release(&self, key: &CacheKey) {
        let mut state = self.state.lock();
        if let Some(map) = state.pending.get_mut(key) {
            map.locked = false;
            if map.puts.is_empty() {
                state.pending.remove(key);
            }
        }
        self.released.notify_all();
    }
}

impl fmt::Debug for PutFromLoadValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutFromLoadValidator")
            .field("naked_put_invalidation_period", &self.naked_put_invalidation_period)
            .field("pending_keys", &self.pending_put_count())
            .finish_non_exhaustive()
    }
}

/// Exclusive right to put one key's loaded value; released on drop.
#[derive(Debug)]
pub struct PutFromLoadLock<'a> {
    validator: &'a PutFromLoadValidator,
    key: CacheKey,
}

impl Drop for PutFromLoadLock<'_> {
    fn drop(&mut self) {
        self.validator.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use hibernia_codec::Identifier;
    use std::time::Duration;

    fn validator() -> (Arc<ManualClock>, PutFromLoadValidator) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let v = PutFromLoadValidator::new(clock.clone(), &CacheSettings::default());
        (clock, v)
    }

    fn key(id: i64) -> CacheKey {
        CacheKey::new("Person", Identifier::from(id), None)
    }

    #[test]
    fn registered_load_may_put() {
        let (_, v) = validator();
        v.register_pending_put(&key(1), LoadOwner(1));
        assert!(v.acquire_put_from_load_lock(&key(1), LoadOwner(1)).is_some());
        assert_eq!(v.pending_put_count(), 0);
    }

    #[test]
    fn invalidation_during_load_refuses_put() {
        let (_, v) = validator();
        v.register_pending_put(&key(1), LoadOwner(1));
        assert!(v.invalidate_key(&key(1)));
        assert!(v.acquire_put_from_load_lock(&key(1), LoadOwner(1)).is_none());
    }

    #[test]
    fn load_registered_after_invalidation_may_put() {
        let (_, v) = validator();
        v.invalidate_key(&key(1));
        v.register_pending_put(&key(1), LoadOwner(2));
        assert!(v.acquire_put_from_load_lock(&key(1), LoadOwner(2)).is_some());
    }

    #[test]
    fn naked_put_refused_within_invalidation_period() {
        let (clock, v) = validator();
        v.invalidate_key(&key(1));
        assert!(v.acquire_put_from_load_lock(&key(1), LoadOwner(3)).is_none());

        clock.advance(CacheSettings::NAKED_PUT_INVALIDATION_PERIOD + Duration::from_millis(1));
        assert!(v.acquire_put_from_load_lock(&key(1), LoadOwner(3)).is_some());
    }

    #[test]
    fn naked_put_on_untouched_key_is_accepted() {
        let (_, v) = validator();
        assert!(v.acquire_put_from_load_lock(&key(9), LoadOwner(1)).is_some());
    }

    #[test]
    fn region_invalidation_refuses_everything_for_a_period() {
        let (clock, v) = validator();
        v.register_pending_put(&key(1), LoadOwner(1));
        v.invalidate_region();
        assert!(v.acquire_put_from_load_lock(&key(1), LoadOwner(1)).is_none());
        assert!(v.acquire_put_from_load_lock(&key(2), LoadOwner(1)).is_none());

        clock.advance(Duration::from_secs(21));
        v.register_pending_put(&key(1), LoadOwner(4));
        assert!(v.acquire_put_from_load_lock(&key(1), LoadOwner(4)).is_some());
    }

    #[test]
    fn other_owners_are_unaffected_by_a_completed_put() {
        let (_, v) = validator();
        v.register_pending_put(&key(1), LoadOwner(1));
        v.register_pending_put(&key(1), LoadOwner(2));
        drop(v.acquire_put_from_load_lock(&key(1), LoadOwner(1)));
        assert!(v.acquire_put_from_load_lock(&key(1), LoadOwner(2)).is_some());
    }

    #[test]
    fn held_lock_blocks_invalidation_until_released() {
        let (_, v) = validator();
        v.register_pending_put(&key(1), LoadOwner(1));
        let guard = v.acquire_put_from_load_lock(&key(1), LoadOwner(1));
        assert!(guard.is_some());
        assert!(!v.invalidate_key(&key(1)));
        drop(guard);
        assert!(v.invalidate_key(&key(1)));
    }

    #[test]
    fn abandoned_pending_puts_are_swept() {
        let (clock, v) = validator();
        v.register_pending_put(&key(1), LoadOwner(1));
        clock.advance(CacheSettings::MAX_PENDING_PUT_DELAY + Duration::from_secs(10));
        v.register_pending_put(&key(2), LoadOwner(2));
        assert_eq!(v.pending_put_count(), 1);
    }
}
