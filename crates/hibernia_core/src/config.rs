//! Session factory configuration.

use hibernia_cache::CacheSettings;

/// Configuration for building a session factory.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether inserts are grouped by entity name to improve batching.
    pub order_inserts: bool,

    /// Whether updates are ordered by entity key to reduce lock contention.
    pub order_updates: bool,

    /// Maximum number of statements per batch round trip.
    pub batch_size: usize,

    /// Whether newly loaded entities start out read-only.
    pub default_read_only: bool,

    /// Whether the second-level cache is consulted and written.
    pub second_level_cache: bool,

    /// Whether loads skip the cache put when the key is already cached.
    pub minimal_puts: bool,

    /// Whether detached proxies may open a temporary session to load.
    pub lazy_load_outside_transaction: bool,

    /// Tenant identifier stamped on every entity and cache key.
    pub tenant: Option<String>,

    /// Cache lock timeout and validator periods.
    pub cache: CacheSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            order_inserts: false,
            order_updates: false,
            batch_size: 25,
            default_read_only: false,
            second_level_cache: true,
            minimal_puts: false,
            lazy_load_outside_transaction: false,
            tenant: None,
            cache: CacheSettings::default(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether inserts are grouped by entity name.
    #[must_use]
    pub const fn order_inserts(mut self, value: bool) -> Self {
        self.order_inserts = value;
        self
    }

    /// Sets whether updates are ordered by entity key.
    #[must_use]
    pub const fn order_updates(mut self, value: bool) -> Self {
        self.order_updates = value;
        self
    }

    /// Sets the batch size. Zero disables batching.
    #[must_use]
    pub const fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets whether loaded entities start out read-only.
    #[must_use]
    pub const fn default_read_only(mut self, value: bool) -> Self {
        self.default_read_only = value;
        self
    }

    /// Enables or disables the second-level cache.
    #[must_use]
    pub const fn second_level_cache(mut self, value: bool) -> Self {
        self.second_level_cache = value;
        self
    }

    /// Sets whether loads use minimal puts.
    #[must_use]
    pub const fn minimal_puts(mut self, value: bool) -> Self {
        self.minimal_puts = value;
        self
    }

    /// Sets whether detached proxies may load outside a session.
    #[must_use]
    pub const fn lazy_load_outside_transaction(mut self, value: bool) -> Self {
        self.lazy_load_outside_transaction = value;
        self
    }

    /// Sets the tenant identifier.
    #[must_use]
    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Sets the cache settings.
    #[must_use]
    pub const fn cache(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    /// Returns the effective batch size (at least one statement).
    #[must_use]
    pub const fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            1
        } else {
            self.batch_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(!config.order_inserts);
        assert!(!config.order_updates);
        assert_eq!(config.batch_size, 25);
        assert!(config.second_level_cache);
        assert!(!config.lazy_load_outside_transaction);
        assert!(config.tenant.is_none());
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .order_inserts(true)
            .batch_size(0)
            .tenant("acme")
            .cache(CacheSettings::default().lock_timeout(Duration::from_secs(5)));

        assert!(config.order_inserts);
        assert_eq!(config.effective_batch_size(), 1);
        assert_eq!(config.tenant.as_deref(), Some("acme"));
        assert_eq!(config.cache.lock_timeout, Duration::from_secs(5));
    }
}
