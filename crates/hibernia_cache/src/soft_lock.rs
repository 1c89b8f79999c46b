//! Soft lock handles.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Proof of a soft lock taken on a cache entry.
///
/// Returned by `lock_item` and handed back to `unlock_item` or
/// `after_update`. A lock can only be released by the strategy instance
/// that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoftLock {
    source: Uuid,
    id: u64,
}

impl SoftLock {
    pub(crate) const fn new(source: Uuid, id: u64) -> Self {
        Self { source, id }
    }

    /// Returns the issuing strategy's id.
    #[must_use]
    pub const fn source(&self) -> Uuid {
        self.source
    }

    /// Returns the lock id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}
