//! The persistence context: what a session currently manages.
//!
//! The context owns one [`EntityEntry`] per managed instance and one
//! [`CollectionEntry`] per persistent collection. It guarantees that at most
//! one instance is managed per [`EntityKey`].

mod collection;
mod dirty;
mod entry;

pub use collection::CollectionEntry;
pub use dirty::{find_dirty, requires_update, ReferenceIdentity};
pub use entry::EntityEntry;

use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionId, CollectionKey, EntityKey, InstanceId, LockMode, ProxyId, Status};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Session-scoped registry of managed entities and collections.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entries: IndexMap<InstanceId, EntityEntry>,
    entities_by_key: HashMap<EntityKey, InstanceId>,
    proxies_by_key: HashMap<EntityKey, ProxyId>,
    collection_entries: IndexMap<CollectionId, CollectionEntry>,
    collections_by_key: HashMap<CollectionKey, CollectionId>,
    default_read_only: bool,
    flushing: bool,
}

impl PersistenceContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new(default_read_only: bool) -> Self {
        Self {
            default_read_only,
            ..Self::default()
        }
    }

    // === Entities ===

    /// Associates `instance` with `key`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NonUniqueObject` if a different instance is
    /// already associated with the key.
    pub fn add_entity(&mut self, key: EntityKey, instance: InstanceId) -> CoreResult<()> {
        self.check_uniqueness(&key, instance)?;
        self.entities_by_key.insert(key, instance);
        Ok(())
    }

    /// Fails if a different instance occupies `key`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NonUniqueObject` on conflict.
    pub fn check_uniqueness(&self, key: &EntityKey, instance: InstanceId) -> CoreResult<()> {
        match self.entities_by_key.get(key) {
            Some(existing) if *existing != instance => {
                Err(CoreError::NonUniqueObject { key: key.clone() })
            }
            _ => Ok(()),
        }
    }

    /// Returns the instance managed under `key`.
    #[must_use]
    pub fn get_entity(&self, key: &EntityKey) -> Option<InstanceId> {
        self.entities_by_key.get(key).copied()
    }

    /// Returns whether an instance is managed under `key`.
    #[must_use]
    pub fn contains_entity(&self, key: &EntityKey) -> bool {
        self.entities_by_key.contains_key(key)
    }

    /// Dissociates `key`.
    pub fn remove_entity(&mut self, key: &EntityKey) -> Option<InstanceId> {
        self.entities_by_key.remove(key)
    }

    /// Adds the entry of `instance`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::AssertionFailure` if the instance already has one.
    pub fn add_entry(&mut self, instance: InstanceId, entry: EntityEntry) -> CoreResult<()> {
        if self.entries.contains_key(&instance) {
            return Err(CoreError::assertion_failure(format!(
                "{instance} already has an entry"
            )));
        }
        self.entries.insert(instance, entry);
        Ok(())
    }

    /// Returns the entry of `instance`.
    #[must_use]
    pub fn get_entry(&self, instance: InstanceId) -> Option<&EntityEntry> {
        self.entries.get(&instance)
    }

    pub(crate) fn get_entry_mut(&mut self, instance: InstanceId) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&instance)
    }

    pub(crate) fn entry_mut(&mut self, instance: InstanceId) -> CoreResult<&mut EntityEntry> {
        self.entries
            .get_mut(&instance)
            .ok_or_else(|| CoreError::transient_object(format!("{instance} is not managed")))
    }

    /// Removes the entry of `instance`, preserving the order of the others.
    pub fn remove_entry(&mut self, instance: InstanceId) -> Option<EntityEntry> {
        self.entries.shift_remove(&instance)
    }

    /// Moves the entry of `instance` to `status`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::TransientObject` if the instance has no entry and
    /// `CoreError::AssertionFailure` for an illegal transition.
    pub fn set_entry_status(&mut self, instance: InstanceId, status: Status) -> CoreResult<()> {
        self.entry_mut(instance)?.set_status(status)
    }

    /// Iterates over entries in the order they were added.
    pub fn entries(&self) -> impl Iterator<Item = (InstanceId, &EntityEntry)> {
        self.entries.iter().map(|(id, e)| (*id, e))
    }

    /// Returns the managed instances in entry order.
    #[must_use]
    pub fn instances(&self) -> Vec<InstanceId> {
        self.entries.keys().copied().collect()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    // === Read-only mode ===

    /// Returns whether newly loaded entities start out read-only.
    #[must_use]
    pub const fn is_default_read_only(&self) -> bool {
        self.default_read_only
    }

    /// Sets whether newly loaded entities start out read-only.
    pub fn set_default_read_only(&mut self, value: bool) {
        self.default_read_only = value;
    }

    /// Returns whether `instance` is read-only.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::TransientObject` if the instance has no entry.
    pub fn is_read_only(&self, instance: InstanceId) -> CoreResult<bool> {
        self.entries
            .get(&instance)
            .map(EntityEntry::is_read_only)
            .ok_or_else(|| {
                CoreError::transient_object(format!(
                    "cannot read the read-only flag of unmanaged {instance}"
                ))
            })
    }

    /// Switches `instance` between `Managed` and `ReadOnly`.
    ///
    /// Entries that are deleted or not yet inserted keep their status.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::TransientObject` if the instance has no entry.
    pub fn set_read_only(&mut self, instance: InstanceId, read_only: bool) -> CoreResult<()> {
        let entry = self.entries.get_mut(&instance).ok_or_else(|| {
            CoreError::transient_object(format!(
                "cannot set the read-only flag of unmanaged {instance}"
            ))
        })?;
        match (entry.status(), read_only) {
            (Status::Managed, true) => entry.set_status(Status::ReadOnly),
            (Status::ReadOnly, false) => entry.set_status(Status::Managed),
            _ => Ok(()),
        }
    }

    // === Proxies ===

    /// Registers `proxy` for `key` unless one is registered already.
    ///
    /// Returns the proxy that ends up registered: the first one wins.
    pub fn add_proxy(&mut self, key: EntityKey, proxy: ProxyId) -> ProxyId {
        *self.proxies_by_key.entry(key).or_insert(proxy)
    }

    /// Returns the proxy registered for `key`.
    #[must_use]
    pub fn get_proxy(&self, key: &EntityKey) -> Option<ProxyId> {
        self.proxies_by_key.get(key).copied()
    }

    /// Unregisters the proxy of `key`.
    pub fn remove_proxy(&mut self, key: &EntityKey) -> Option<ProxyId> {
        self.proxies_by_key.remove(key)
    }

    /// Returns every registered proxy.
    #[must_use]
    pub fn proxies(&self) -> Vec<ProxyId> {
        self.proxies_by_key.values().copied().collect()
    }

    // === Collections ===

    /// Adds the entry of `collection`, indexing it by its loaded key.
    pub fn add_collection(&mut self, collection: CollectionId, entry: CollectionEntry) {
        if let Some(key) = entry.loaded_key() {
            self.collections_by_key.insert(key.clone(), collection);
        }
        self.collection_entries.insert(collection, entry);
    }

    /// Returns the entry of `collection`.
    #[must_use]
    pub fn get_collection_entry(&self, collection: CollectionId) -> Option<&CollectionEntry> {
        self.collection_entries.get(&collection)
    }

    pub(crate) fn collection_entry_mut(
        &mut self,
        collection: CollectionId,
    ) -> Option<&mut CollectionEntry> {
        self.collection_entries.get_mut(&collection)
    }

    /// Returns the collection stored under `key`.
    #[must_use]
    pub fn get_collection(&self, key: &CollectionKey) -> Option<CollectionId> {
        self.collections_by_key.get(key).copied()
    }

    /// Re-indexes `collection` after its rows moved to `key`.
    pub(crate) fn index_collection(&mut self, key: Option<&CollectionKey>, collection: CollectionId) {
        if let Some(key) = key {
            self.collections_by_key.insert(key.clone(), collection);
        }
    }

    /// Removes the entry of `collection`.
    pub fn remove_collection(&mut self, collection: CollectionId) -> Option<CollectionEntry> {
        let entry = self.collection_entries.shift_remove(&collection)?;
        if let Some(key) = entry.loaded_key() {
            if self.collections_by_key.get(key) == Some(&collection) {
                self.collections_by_key.remove(key);
            }
        }
        Some(entry)
    }

    /// Returns every collection with an entry, in entry order.
    #[must_use]
    pub fn collections(&self) -> Vec<CollectionId> {
        self.collection_entries.keys().copied().collect()
    }

    // === Lifecycle ===

    /// Returns whether a flush is in progress.
    #[must_use]
    pub const fn is_flushing(&self) -> bool {
        self.flushing
    }

    pub(crate) fn set_flushing(&mut self, flushing: bool) {
        self.flushing = flushing;
    }

    /// Releases every lock: lock modes drop to `None`.
    pub fn after_transaction_completion(&mut self) {
        for entry in self.entries.values_mut() {
            entry.set_lock_mode(LockMode::None);
        }
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.entities_by_key.clear();
        self.proxies_by_key.clear();
        self.collection_entries.clear();
        self.collections_by_key.clear();
        self.flushing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::PropertyValue;
    use crate::metadata::EntityDescriptor;
    use hibernia_codec::Identifier;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn key(id: i64) -> EntityKey {
        EntityKey::new("B", Identifier::from(id), None)
    }

    fn entry(id: i64, status: Status) -> EntityEntry {
        EntityEntry::new(
            status,
            vec![PropertyValue::from("x")],
            key(id),
            None,
            LockMode::Read,
            true,
            Arc::new(EntityDescriptor::builder("B").basic("name").build()),
        )
    }

    fn managed(ctx: &mut PersistenceContext, id: i64, instance: usize) {
        ctx.add_entity(key(id), InstanceId(instance)).unwrap();
        ctx.add_entry(InstanceId(instance), entry(id, Status::Managed))
            .unwrap();
    }

    #[test]
    fn second_instance_for_a_key_is_rejected() {
        let mut ctx = PersistenceContext::new(false);
        managed(&mut ctx, 1, 0);
        ctx.add_entity(key(1), InstanceId(0)).unwrap();
        let err = ctx.add_entity(key(1), InstanceId(1)).unwrap_err();
        assert!(matches!(err, CoreError::NonUniqueObject { .. }));
        assert_eq!(ctx.get_entity(&key(1)), Some(InstanceId(0)));
    }

    #[test]
    fn entries_iterate_in_insertion_order() {
        let mut ctx = PersistenceContext::new(false);
        managed(&mut ctx, 3, 5);
        managed(&mut ctx, 1, 2);
        managed(&mut ctx, 2, 9);
        ctx.remove_entry(InstanceId(2));
        assert_eq!(ctx.instances(), vec![InstanceId(5), InstanceId(9)]);
    }

    #[test]
    fn status_changes_are_validated() {
        let mut ctx = PersistenceContext::new(false);
        managed(&mut ctx, 1, 0);
        ctx.set_entry_status(InstanceId(0), Status::Deleted).unwrap();
        assert!(ctx.set_entry_status(InstanceId(0), Status::Saving).is_err());
        assert!(matches!(
            ctx.set_entry_status(InstanceId(4), Status::Managed),
            Err(CoreError::TransientObject { .. })
        ));
    }

    #[test]
    fn read_only_requires_an_entry() {
        let mut ctx = PersistenceContext::new(true);
        assert!(ctx.is_default_read_only());
        managed(&mut ctx, 1, 0);
        ctx.set_read_only(InstanceId(0), true).unwrap();
        assert!(ctx.is_read_only(InstanceId(0)).unwrap());
        ctx.set_read_only(InstanceId(0), false).unwrap();
        assert!(!ctx.is_read_only(InstanceId(0)).unwrap());
        assert!(matches!(
            ctx.is_read_only(InstanceId(1)),
            Err(CoreError::TransientObject { .. })
        ));
    }

    #[test]
    fn first_proxy_wins() {
        let mut ctx = PersistenceContext::new(false);
        assert_eq!(ctx.add_proxy(key(1), ProxyId(0)), ProxyId(0));
        assert_eq!(ctx.add_proxy(key(1), ProxyId(1)), ProxyId(0));
        assert_eq!(ctx.remove_proxy(&key(1)), Some(ProxyId(0)));
        assert!(ctx.get_proxy(&key(1)).is_none());
    }

    #[test]
    fn completion_downgrades_locks() {
        let mut ctx = PersistenceContext::new(false);
        managed(&mut ctx, 1, 0);
        ctx.after_transaction_completion();
        assert_eq!(ctx.get_entry(InstanceId(0)).unwrap().lock_mode(), LockMode::None);
        ctx.clear();
        assert_eq!(ctx.entry_count(), 0);
        assert!(!ctx.contains_entity(&key(1)));
    }

    #[test]
    fn collections_are_indexed_by_loaded_key() {
        let mut ctx = PersistenceContext::new(false);
        let ck = CollectionKey::new("B.tags", Identifier::from(1));
        ctx.add_collection(CollectionId(0), CollectionEntry::loaded(ck.clone()));
        ctx.add_collection(CollectionId(1), CollectionEntry::fresh("B.tags"));
        assert_eq!(ctx.get_collection(&ck), Some(CollectionId(0)));
        assert_eq!(ctx.collections(), vec![CollectionId(0), CollectionId(1)]);
        ctx.remove_collection(CollectionId(0));
        assert!(ctx.get_collection(&ck).is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add { id: i64, instance: usize },
        Remove { id: i64 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..6, 0usize..8).prop_map(|(id, instance)| Op::Add { id, instance }),
            (0i64..6).prop_map(|id| Op::Remove { id }),
        ]
    }

    proptest! {
        #[test]
        fn at_most_one_instance_per_key(ops in proptest::collection::vec(op(), 0..64)) {
            let mut ctx = PersistenceContext::new(false);
            let mut model: HashMap<i64, usize> = HashMap::new();
            for op in ops {
                match op {
                    Op::Add { id, instance } => {
                        let result = ctx.add_entity(key(id), InstanceId(instance));
                        match model.get(&id) {
                            Some(existing) if *existing != instance => prop_assert!(result.is_err()),
                            _ => {
                                prop_assert!(result.is_ok());
                                model.insert(id, instance);
                            }
                        }
                    }
                    Op::Remove { id } => {
                        prop_assert_eq!(ctx.remove_entity(&key(id)).map(|i| i.0), model.remove(&id));
                    }
                }
                for (id, instance) in &model {
                    prop_assert_eq!(ctx.get_entity(&key(*id)), Some(InstanceId(*instance)));
                }
            }
        }
    }
}
