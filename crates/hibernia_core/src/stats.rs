//! Session factory statistics.
//!
//! Counters are shared by every session of a factory and can be read while
//! sessions are running.
//!
//! # Usage
//!
//! ```rust,ignore
//! let factory = SessionFactory::builder(metamodel, backend).build()?;
//! // Run sessions...
//! let stats = factory.statistics().snapshot();
//! println!("Inserts: {}", stats.entity_inserts);
//! println!("Cache hits: {}", stats.cache_hits);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Unit-of-work statistics.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct Statistics {
    // Session counters
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    flushes: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,

    // Entity counters
    entity_loads: AtomicU64,
    entity_inserts: AtomicU64,
    entity_updates: AtomicU64,
    entity_deletes: AtomicU64,
    proxy_fetches: AtomicU64,
    optimistic_failures: AtomicU64,

    // Collection counters
    collection_loads: AtomicU64,
    collection_recreates: AtomicU64,
    collection_updates: AtomicU64,
    collection_removes: AtomicU64,

    // Statement counters
    statements: AtomicU64,
    batches: AtomicU64,

    // Second-level cache counters
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_puts: AtomicU64,
}

impl Statistics {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    // === Increment methods (internal use) ===

    pub(crate) fn record_session_open(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_close(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_entity_load(&self) {
        self.entity_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_entity_insert(&self) {
        self.entity_inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_entity_update(&self) {
        self.entity_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_entity_delete(&self) {
        self.entity_deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_proxy_fetch(&self) {
        self.proxy_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_optimistic_failure(&self) {
        self.optimistic_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collection_load(&self) {
        self.collection_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collection_recreate(&self) {
        self.collection_recreates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collection_update(&self) {
        self.collection_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_collection_remove(&self) {
        self.collection_removes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one round trip carrying `statements` statements.
    pub(crate) fn record_round_trip(&self, statements: usize) {
        self.statements
            .fetch_add(statements as u64, Ordering::Relaxed);
        if statements > 1 {
            self.batches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_put(&self) {
        self.cache_puts.fetch_add(1, Ordering::Relaxed);
    }

    // === Getter methods (public API) ===

    /// Returns the number of sessions opened.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    /// Returns the number of sessions closed.
    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed.load(Ordering::Relaxed)
    }

    /// Returns the number of completed flushes.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Returns the number of entities loaded from the database.
    ///
    /// Entities assembled from the second-level cache are not counted.
    pub fn entity_loads(&self) -> u64 {
        self.entity_loads.load(Ordering::Relaxed)
    }

    /// Returns the number of entity inserts executed.
    pub fn entity_inserts(&self) -> u64 {
        self.entity_inserts.load(Ordering::Relaxed)
    }

    /// Returns the number of entity updates executed.
    pub fn entity_updates(&self) -> u64 {
        self.entity_updates.load(Ordering::Relaxed)
    }

    /// Returns the number of entity deletes executed.
    pub fn entity_deletes(&self) -> u64 {
        self.entity_deletes.load(Ordering::Relaxed)
    }

    /// Returns the number of proxies initialized.
    pub fn proxy_fetches(&self) -> u64 {
        self.proxy_fetches.load(Ordering::Relaxed)
    }

    /// Returns the number of stale-state failures.
    pub fn optimistic_failures(&self) -> u64 {
        self.optimistic_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of statement batches of more than one statement.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Returns the number of second-level cache hits.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            sessions_opened: self.sessions_opened(),
            sessions_closed: self.sessions_closed(),
            flushes: self.flushes(),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.transactions_rolled_back.load(Ordering::Relaxed),
            entity_loads: self.entity_loads(),
            entity_inserts: self.entity_inserts(),
            entity_updates: self.entity_updates(),
            entity_deletes: self.entity_deletes(),
            proxy_fetches: self.proxy_fetches(),
            optimistic_failures: self.optimistic_failures(),
            collection_loads: self.collection_loads.load(Ordering::Relaxed),
            collection_recreates: self.collection_recreates.load(Ordering::Relaxed),
            collection_updates: self.collection_updates.load(Ordering::Relaxed),
            collection_removes: self.collection_removes.load(Ordering::Relaxed),
            statements: self.statements.load(Ordering::Relaxed),
            batches: self.batches(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_puts: self.cache_puts.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    /// Sessions opened.
    pub sessions_opened: u64,
    /// Sessions closed.
    pub sessions_closed: u64,
    /// Completed flushes.
    pub flushes: u64,
    /// Committed transactions.
    pub transactions_committed: u64,
    /// Rolled back transactions.
    pub transactions_rolled_back: u64,
    /// Entities loaded from the database.
    pub entity_loads: u64,
    /// Entity inserts executed.
    pub entity_inserts: u64,
    /// Entity updates executed.
    pub entity_updates: u64,
    /// Entity deletes executed.
    pub entity_deletes: u64,
    /// Proxies initialized.
    pub proxy_fetches: u64,
    /// Stale-state failures.
    pub optimistic_failures: u64,
    /// Collections loaded.
    pub collection_loads: u64,
    /// Collections recreated.
    pub collection_recreates: u64,
    /// Collections updated.
    pub collection_updates: u64,
    /// Collections removed.
    pub collection_removes: u64,
    /// Statements executed.
    pub statements: u64,
    /// Multi-statement batches.
    pub batches: u64,
    /// Second-level cache hits.
    pub cache_hits: u64,
    /// Second-level cache misses.
    pub cache_misses: u64,
    /// Second-level cache puts.
    pub cache_puts: u64,
}
