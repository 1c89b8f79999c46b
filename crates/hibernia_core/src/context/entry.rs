//! Entity entries.

use crate::error::{CoreError, CoreResult};
use crate::instance::PropertyValue;
use crate::metadata::EntityDescriptor;
use crate::types::{EntityKey, LockMode, Status};
use hibernia_codec::{Identifier, Value};
use std::sync::Arc;

/// Bookkeeping for one managed instance.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    status: Status,
    loaded_state: Vec<PropertyValue>,
    deleted_state: Option<Vec<PropertyValue>>,
    key: EntityKey,
    version: Option<Value>,
    lock_mode: LockMode,
    exists_in_database: bool,
    descriptor: Arc<EntityDescriptor>,
}

impl EntityEntry {
    /// Creates an entry.
    pub fn new(
        status: Status,
        loaded_state: Vec<PropertyValue>,
        key: EntityKey,
        version: Option<Value>,
        lock_mode: LockMode,
        exists_in_database: bool,
        descriptor: Arc<EntityDescriptor>,
    ) -> Self {
        Self {
            status,
            loaded_state,
            deleted_state: None,
            key,
            version,
            lock_mode,
            exists_in_database,
            descriptor,
        }
    }

    /// Returns the status.
    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Moves the entry to `next`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::AssertionFailure` for an illegal transition.
    pub fn set_status(&mut self, next: Status) -> CoreResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(CoreError::assertion_failure(format!(
                "illegal status transition {} -> {next} for {}",
                self.status, self.key
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Returns the snapshot taken at load or last flush.
    #[must_use]
    pub fn loaded_state(&self) -> &[PropertyValue] {
        &self.loaded_state
    }

    /// Replaces the snapshot.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::AssertionFailure` for deleted or gone entries.
    pub fn set_loaded_state(&mut self, state: Vec<PropertyValue>) -> CoreResult<()> {
        if self.status.is_deleted_or_gone() {
            return Err(CoreError::assertion_failure(format!(
                "snapshot of {} entry {} must not change",
                self.status, self.key
            )));
        }
        self.loaded_state = state;
        Ok(())
    }

    /// Returns the state captured when deletion was scheduled.
    #[must_use]
    pub fn deleted_state(&self) -> Option<&[PropertyValue]> {
        self.deleted_state.as_deref()
    }

    pub(crate) fn set_deleted_state(&mut self, state: Option<Vec<PropertyValue>>) {
        self.deleted_state = state;
    }

    /// Returns the entity key.
    #[must_use]
    pub const fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Returns the identifier.
    #[must_use]
    pub const fn id(&self) -> &Identifier {
        self.key.id()
    }

    /// Returns the entity name.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        self.key.entity_name()
    }

    /// Returns the version as last read or written.
    #[must_use]
    pub const fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    pub(crate) fn set_version(&mut self, version: Option<Value>) {
        self.version = version;
    }

    /// Returns the lock mode held in this transaction.
    #[must_use]
    pub const fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub(crate) fn set_lock_mode(&mut self, mode: LockMode) {
        self.lock_mode = mode;
    }

    /// Returns whether the row exists in the database.
    #[must_use]
    pub const fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    /// Returns the entity mapping.
    #[must_use]
    pub const fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    /// Returns true for read-only entries.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.status == Status::ReadOnly
    }

    /// Records that the insert executed.
    pub(crate) fn post_insert(&mut self) -> CoreResult<()> {
        self.exists_in_database = true;
        if self.status == Status::Saving {
            self.set_status(Status::Managed)?;
        }
        Ok(())
    }

    /// Records that the delete executed.
    pub(crate) fn post_delete(&mut self) -> CoreResult<()> {
        self.set_status(Status::Gone)?;
        self.exists_in_database = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: Status) -> EntityEntry {
        EntityEntry::new(
            status,
            vec![PropertyValue::from("a")],
            EntityKey::new("B", Identifier::from(1), None),
            Some(Value::Integer(0)),
            LockMode::Write,
            status != Status::Saving,
            Arc::new(EntityDescriptor::builder("B").basic("name").build()),
        )
    }

    #[test]
    fn illegal_transitions_fail_immediately() {
        let mut e = entry(Status::Managed);
        let err = e.set_status(Status::Saving).unwrap_err();
        assert!(matches!(err, CoreError::AssertionFailure { .. }));
        assert_eq!(e.status(), Status::Managed);
    }

    #[test]
    fn deleted_snapshot_is_frozen() {
        let mut e = entry(Status::Managed);
        e.set_status(Status::Deleted).unwrap();
        assert!(e.set_loaded_state(vec![PropertyValue::from("b")]).is_err());
        e.post_delete().unwrap();
        assert_eq!(e.status(), Status::Gone);
        assert!(e.set_loaded_state(vec![]).is_err());
        assert!(!e.exists_in_database());
    }

    #[test]
    fn insert_moves_saving_to_managed() {
        let mut e = entry(Status::Saving);
        assert!(!e.exists_in_database());
        e.post_insert().unwrap();
        assert_eq!(e.status(), Status::Managed);
        assert!(e.exists_in_database());
    }

    #[test]
    fn same_status_is_a_no_op() {
        let mut e = entry(Status::Gone);
        e.set_status(Status::Gone).unwrap();
    }
}
