//! Data version policies.
//!
//! Every [`DataVersion`] makes one explicit choice for
//! [`newer_than`](DataVersion::newer_than):
//!
//! | policy | behaviour |
//! |--------|-----------|
//! | [`ValueDataVersion`] | real comparison of entity versions |
//! | [`CircumventChecksDataVersion`] | fails fast; comparing it is a bug |
//! | [`NonLockingDataVersion`] | never newer; disables conflict detection |

use crate::error::{CacheError, CacheResult};
use hibernia_codec::Value;
use std::cmp::Ordering;
use std::fmt;

/// A version attached to a cache write.
pub trait DataVersion: fmt::Debug + Send + Sync {
    /// Returns whether this version is newer than `other`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Consistency` if the policy forbids comparison or
    /// the versions are not comparable.
    fn newer_than(&self, other: &dyn DataVersion) -> CacheResult<bool>;

    /// Returns the entity version value, for versions that carry one.
    fn value(&self) -> Option<&Value> {
        None
    }
}

/// A real entity version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDataVersion(Value);

impl ValueDataVersion {
    /// Wraps a version value.
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self(value)
    }
}

impl DataVersion for ValueDataVersion {
    fn newer_than(&self, other: &dyn DataVersion) -> CacheResult<bool> {
        // A version-less counterpart is an entry written without version
        // information; anything versioned supersedes it.
        let Some(theirs) = other.value() else {
            return Ok(true);
        };
        match (&self.0, theirs) {
            (Value::Integer(a), Value::Integer(b)) => Ok(a > b),
            (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b) == Ordering::Greater),
            (Value::Bytes(a), Value::Bytes(b)) => Ok(a > b),
            (a, b) => Err(CacheError::Consistency(format!(
                "cannot compare {} version with {} version",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn value(&self) -> Option<&Value> {
        Some(&self.0)
    }
}

/// Used by removal paths, where no meaningful comparison exists.
///
/// Any comparison is a consistency violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CircumventChecksDataVersion;

impl DataVersion for CircumventChecksDataVersion {
    fn newer_than(&self, _other: &dyn DataVersion) -> CacheResult<bool> {
        Err(CacheError::Consistency(
            "optimistic lock check must not be performed on a removal".into(),
        ))
    }
}

/// Used for unversioned entities: never reports itself newer.
///
/// This turns off optimistic conflict detection for regions that use it.
/// A cached entry written under this policy is never replaced by a
/// put-from-load; it must be evicted or invalidated first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NonLockingDataVersion;

impl DataVersion for NonLockingDataVersion {
    fn newer_than(&self, _other: &dyn DataVersion) -> CacheResult<bool> {
        Ok(false)
    }
}

/// The kind of cache write a version is needed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Put of loaded or written state.
    Put,
    /// Removal of an entry.
    Removal,
}

/// Picks the policy for a write.
#[must_use]
pub fn data_version_for(kind: WriteKind, version: Option<&Value>) -> Box<dyn DataVersion> {
    match (kind, version) {
        (WriteKind::Removal, _) => Box::new(CircumventChecksDataVersion),
        (WriteKind::Put, Some(v)) => Box::new(ValueDataVersion::new(v.clone())),
        (WriteKind::Put, None) => Box::new(NonLockingDataVersion),
    }
}

/// Decides whether a put carrying `incoming` may replace a cached entry
/// whose version is `existing`.
///
/// An entry cached without a version is never replaced.
///
/// # Errors
///
/// Propagates comparison errors of the incoming policy.
pub fn may_replace(existing: Option<&Value>, incoming: Option<&Value>) -> CacheResult<bool> {
    let incoming = data_version_for(WriteKind::Put, incoming);
    match existing {
        Some(old) => incoming.newer_than(&ValueDataVersion::new(old.clone())),
        None => NonLockingDataVersion.newer_than(incoming.as_ref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(n: i64) -> ValueDataVersion {
        ValueDataVersion::new(Value::Integer(n))
    }

    #[test]
    fn value_versions_compare() {
        assert!(v(2).newer_than(&v(1)).unwrap());
        assert!(!v(1).newer_than(&v(1)).unwrap());
        assert!(!v(1).newer_than(&v(2)).unwrap());
    }

    #[test]
    fn incomparable_versions_fail() {
        let text = ValueDataVersion::new(Value::from("a"));
        assert!(matches!(
            text.newer_than(&v(1)),
            Err(CacheError::Consistency(_))
        ));
    }

    #[test]
    fn circumvent_checks_always_fails() {
        let version = CircumventChecksDataVersion;
        assert!(version.newer_than(&v(1)).is_err());
        assert!(version.newer_than(&NonLockingDataVersion).is_err());
    }

    #[test]
    fn non_locking_never_newer() {
        assert!(!NonLockingDataVersion.newer_than(&v(1)).unwrap());
        assert!(!NonLockingDataVersion
            .newer_than(&NonLockingDataVersion)
            .unwrap());
    }

    #[test]
    fn removal_uses_circumvent_checks() {
        let version = data_version_for(WriteKind::Removal, Some(&Value::Integer(3)));
        assert!(version.newer_than(&v(1)).is_err());
    }

    #[test]
    fn may_replace_rules() {
        assert!(!may_replace(None, None).unwrap());
        assert!(!may_replace(None, Some(&Value::Integer(2))).unwrap());
        assert!(may_replace(Some(&Value::Integer(1)), Some(&Value::Integer(2))).unwrap());
        assert!(!may_replace(Some(&Value::Integer(2)), Some(&Value::Integer(2))).unwrap());
        assert!(!may_replace(Some(&Value::Integer(2)), None).unwrap());
    }

    proptest! {
        #[test]
        fn at_most_one_side_is_newer(a in any::<i64>(), b in any::<i64>()) {
            let forward = v(a).newer_than(&v(b)).unwrap();
            let backward = v(b).newer_than(&v(a)).unwrap();
            prop_assert!(!(forward && backward));
            prop_assert_eq!(forward, a > b);
            prop_assert_eq!(
                may_replace(Some(&Value::Integer(b)), Some(&Value::Integer(a))).unwrap(),
                a > b
            );
        }
    }
}
