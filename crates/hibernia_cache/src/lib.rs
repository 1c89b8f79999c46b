//! # Hibernia Cache
//!
//! Second-level cache coordination for Hibernia.
//!
//! A cache region is shared by every session of a session factory (and by
//! other factories built on the same [`RegionFactory`]). This crate keeps
//! such a region consistent with committed database state while sessions
//! read and write it concurrently:
//!
//! - [`SoftLock`]s mark an entry as being written so readers see a miss
//! - [`PutFromLoadValidator`] refuses a put of freshly loaded data when an
//!   invalidation happened after the load began
//! - [`DataVersion`] policies decide whether a cached entry may be replaced
//!
//! Three access strategies are provided, selected with [`AccessType`]:
//! transactional, read-write and nonstrict read-write.
//!
//! Regions store opaque bytes, so any provider implementing
//! [`CacheRegion`] can be plugged in.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod access;
mod clock;
mod error;
mod key;
mod region;
mod settings;
mod soft_lock;
mod stats;
mod validator;
mod version;

pub use access::{
    AccessType, EntityAccessStrategy, NonstrictReadWriteAccess, ReadWriteAccess,
    TransactionalAccess,
};
pub use clock::{Clock, ManualClock, SystemClock, Timestamper};
pub use error::{CacheError, CacheResult};
pub use key::{CacheEntry, CacheKey};
pub use region::{CacheRegion, InMemoryRegion, InMemoryRegionFactory, RegionFactory};
pub use settings::CacheSettings;
pub use soft_lock::SoftLock;
pub use stats::{CacheStatistics, CacheStatsSnapshot};
pub use validator::{LoadOwner, PutFromLoadLock, PutFromLoadValidator};
pub use version::{
    data_version_for, may_replace, CircumventChecksDataVersion, DataVersion,
    NonLockingDataVersion, ValueDataVersion, WriteKind,
};
