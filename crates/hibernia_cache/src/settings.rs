//! Cache configuration.

use std::time::Duration;

/// Tunables shared by every region of a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// How long a soft lock blocks an entry before it is considered expired.
    pub lock_timeout: Duration,
    /// How long after an invalidation a put without a registered load is
    /// refused.
    pub naked_put_invalidation_period: Duration,
    /// Grace period before sweeping abandoned pending puts.
    pub pending_put_overage: Duration,
    /// Age after which a registered pending put is abandoned.
    pub max_pending_put_delay: Duration,
    /// How long a put-from-load waits for a concurrent put on the same key.
    pub put_lock_timeout: Duration,
}

impl CacheSettings {
    /// Default naked-put invalidation period.
    pub const NAKED_PUT_INVALIDATION_PERIOD: Duration = Duration::from_secs(20);
    /// Default pending-put overage.
    pub const PENDING_PUT_OVERAGE: Duration = Duration::from_secs(5);
    /// Default maximum pending-put delay.
    pub const MAX_PENDING_PUT_DELAY: Duration = Duration::from_secs(120);

    /// Sets the soft-lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, value: Duration) -> Self {
        self.lock_timeout = value;
        self
    }

    /// Sets the naked-put invalidation period.
    #[must_use]
    pub const fn naked_put_invalidation_period(mut self, value: Duration) -> Self {
        self.naked_put_invalidation_period = value;
        self
    }

    /// Sets the maximum pending-put delay.
    #[must_use]
    pub const fn max_pending_put_delay(mut self, value: Duration) -> Self {
        self.max_pending_put_delay = value;
        self
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(60),
            naked_put_invalidation_period: Self::NAKED_PUT_INVALIDATION_PERIOD,
            pending_put_overage: Self::PENDING_PUT_OVERAGE,
            max_pending_put_delay: Self::MAX_PENDING_PUT_DELAY,
            put_lock_timeout: Duration::from_millis(100),
        }
    }
}
