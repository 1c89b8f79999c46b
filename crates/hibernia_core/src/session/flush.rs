//! Flushing: dirty checking, scheduling and statement execution.
//!
//! A flush runs in two halves. Scheduling walks the persistence context,
//! cascades persist, compares every modifiable entity with its snapshot and
//! diffs every reachable collection, queueing actions as it goes. Execution
//! then drains the [`ActionQueue`](crate::ActionQueue) in a fixed order:
//! inserts, updates, collection removals, collection updates, collection
//! recreates, deletes. Consecutive statements with the same shape are sent
//! as one batch.

use super::{next_version, Session, SessionState};
use crate::action::{
    Action, ActionKind, CollectionRecreateAction, CollectionRemoveAction, CollectionUpdateAction,
    EntityDeleteAction, EntityInsertAction, EntityUpdateAction, QueuedActions,
};
use crate::context::{find_dirty, requires_update, CollectionEntry, ReferenceIdentity};
use crate::error::{CoreError, CoreResult};
use crate::instance::{Element, PropertyValue, Reference};
use crate::metadata::{CascadeOp, EntityDescriptor, Property, PropertyKind};
use crate::types::{CollectionId, CollectionKey, EntityKey, InstanceId, Status};
use hibernia_cache::CacheEntry;
use hibernia_codec::Identifier;
use hibernia_storage::{ColumnValue, Statement};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// One action executed by a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedAction {
    /// What was done.
    pub kind: ActionKind,
    /// Entity name, or collection role for collection actions.
    pub target: String,
    /// Entity identifier, or owner identifier for collection actions.
    pub id: Identifier,
    /// Properties written; empty for deletes and collection actions.
    pub properties: Vec<String>,
}

/// What a flush executed, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Executed actions.
    pub executed: Vec<ExecutedAction>,
}

impl FlushSummary {
    /// Returns the number of executed actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.executed.len()
    }

    /// Returns true if the flush wrote nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executed.is_empty()
    }

    /// Returns the number of executed actions of one kind.
    #[must_use]
    pub fn count(&self, kind: ActionKind) -> usize {
        self.executed.iter().filter(|a| a.kind == kind).count()
    }

    /// Returns the entity names of the inserts, in execution order.
    #[must_use]
    pub fn insert_order(&self) -> Vec<&str> {
        self.executed
            .iter()
            .filter(|a| a.kind == ActionKind::EntityInsert)
            .map(|a| a.target.as_str())
            .collect()
    }

    fn push(&mut self, kind: ActionKind, target: &str, id: &Identifier, properties: Vec<String>) {
        self.executed.push(ExecutedAction {
            kind,
            target: target.to_string(),
            id: id.clone(),
            properties,
        });
    }
}

impl Session {
    /// Writes every pending change to the database without committing.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::DependencyCycle` if pending inserts cannot be
    /// ordered, `CoreError::TransientObject` if a flushed entity references
    /// an unsaved instance, `CoreError::StaleObjectState` if an update or
    /// delete matched no row, or a storage error. After any error the
    /// session must be rolled back.
    pub fn flush(&mut self) -> CoreResult<FlushSummary> {
        self.ensure_usable()?;
        self.context.set_flushing(true);
        let result = self.flush_everything();
        self.context.set_flushing(false);
        match result {
            Ok(summary) => {
                self.factory.statistics().record_flush();
                debug!(
                    session = %self.id,
                    inserts = summary.count(ActionKind::EntityInsert),
                    updates = summary.count(ActionKind::EntityUpdate),
                    deletes = summary.count(ActionKind::EntityDelete),
                    "flushed"
                );
                Ok(summary)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                debug!(session = %self.id, error = %e, "flush failed");
                Err(e)
            }
        }
    }

    fn flush_everything(&mut self) -> CoreResult<FlushSummary> {
        self.cascade_on_flush()?;
        self.schedule_entity_updates()?;
        self.schedule_collection_actions()?;
        self.check_references()?;
        let order_inserts = self.factory.config().order_inserts;
        let order_updates = self.factory.config().order_updates;
        self.actions.prepare_actions(order_inserts, order_updates)?;
        let queued = self.actions.take();
        self.execute(queued)
    }

    // === Scheduling ===

    fn cascade_on_flush(&mut self) -> CoreResult<()> {
        let roots: Vec<InstanceId> = self
            .context
            .entries()
            .filter(|(_, e)| matches!(e.status(), Status::Managed | Status::Saving))
            .map(|(i, _)| i)
            .collect();
        for root in roots {
            for child in self.cascade_children(root, CascadeOp::Persist)? {
                self.persist(child)?;
            }
        }
        Ok(())
    }

    fn schedule_entity_updates(&mut self) -> CoreResult<()> {
        let candidates: Vec<InstanceId> = self
            .context
            .entries()
            .filter(|(_, e)| {
                matches!(e.status(), Status::Managed | Status::Saving) && e.descriptor().is_mutable()
            })
            .map(|(i, _)| i)
            .collect();

        for instance in candidates {
            let Some(entry) = self.context.get_entry(instance) else {
                continue;
            };
            let status = entry.status();
            let key = entry.key().clone();
            let version = entry.version().cloned();
            let descriptor = Arc::clone(entry.descriptor());
            let loaded = entry.loaded_state().to_vec();
            let current = self.instance_ref(instance)?.values().to_vec();
            let dirty = find_dirty(&descriptor, &loaded, &current, |r| self.reference_identity(r));
            if dirty.is_empty() {
                continue;
            }

            if status == Status::Saving {
                if let Some(insert) = self.actions.insertion_mut(instance) {
                    insert.state = current.clone();
                }
                self.register_collections(instance, &current);
                self.context.entry_mut(instance)?.set_loaded_state(current)?;
                continue;
            }
            if !requires_update(&descriptor, &dirty) {
                self.context.entry_mut(instance)?.set_loaded_state(current)?;
                continue;
            }
            let next = descriptor
                .is_versioned()
                .then(|| next_version(&key, version.as_ref()))
                .transpose()?;
            trace!(%key, ?dirty, "update scheduled");
            self.actions.add_action(Action::EntityUpdate(EntityUpdateAction {
                instance,
                key,
                state: current,
                previous_state: loaded,
                dirty,
                previous_version: version,
                next_version: next,
                descriptor,
            }));
        }
        Ok(())
    }

    fn reference_identity(&self, reference: Reference) -> ReferenceIdentity {
        let unknown = ReferenceIdentity::Transient(InstanceId(usize::MAX));
        match reference {
            Reference::Instance(i) => match self.instances.get(i.0) {
                Some(inst) => match inst.id() {
                    Some(id) => ReferenceIdentity::Key(inst.entity_name().to_string(), id.clone()),
                    None => ReferenceIdentity::Transient(i),
                },
                None => unknown,
            },
            Reference::Proxy(p) => self.proxies.get(p.0).map_or(unknown, |proxy| {
                ReferenceIdentity::Key(proxy.entity_name().to_string(), proxy.identifier().clone())
            }),
        }
    }

    fn schedule_collection_actions(&mut self) -> CoreResult<()> {
        for collection in self.context.collections() {
            if let Some(entry) = self.context.collection_entry_mut(collection) {
                entry.set_reached(false);
            }
        }

        let owners: Vec<(InstanceId, Status)> = self
            .context
            .entries()
            .map(|(i, e)| (i, e.status()))
            .collect();
        for (owner, status) in owners {
            let inst = self.instance_ref(owner)?;
            let owner_id = inst.id().cloned().ok_or_else(|| {
                CoreError::assertion_failure(format!("managed {owner} has no identifier"))
            })?;
            let handles: Vec<CollectionId> = inst
                .values()
                .iter()
                .filter_map(PropertyValue::as_collection)
                .collect();
            for collection in handles {
                if self.context.get_collection_entry(collection).is_none() {
                    let role = self.collection(collection)?.role().to_string();
                    self.collection_mut(collection)?.set_owner(owner);
                    self.context
                        .add_collection(collection, CollectionEntry::fresh(role));
                }
                if let Some(entry) = self.context.collection_entry_mut(collection) {
                    entry.set_reached(true);
                }
                if status.is_deleted_or_gone() {
                    self.schedule_collection_removal(collection);
                } else {
                    self.schedule_collection_changes(collection, &owner_id)?;
                }
            }
        }

        let unreached: Vec<CollectionId> = self
            .context
            .collections()
            .into_iter()
            .filter(|c| {
                self.context
                    .get_collection_entry(*c)
                    .is_some_and(|e| !e.is_reached())
            })
            .collect();
        for collection in unreached {
            let dereferenced = self
                .context
                .get_collection_entry(collection)
                .is_some_and(|e| e.loaded_key().is_some());
            if dereferenced {
                self.schedule_collection_removal(collection);
            } else {
                self.context.remove_collection(collection);
            }
        }
        Ok(())
    }

    fn schedule_collection_removal(&mut self, collection: CollectionId) {
        let Some(key) = self
            .context
            .get_collection_entry(collection)
            .and_then(CollectionEntry::loaded_key)
            .cloned()
        else {
            return;
        };
        trace!(%key, "collection removal scheduled");
        self.actions
            .add_action(Action::CollectionRemove(CollectionRemoveAction {
                collection: Some(collection),
                key,
            }));
    }

    fn schedule_collection_changes(&mut self, collection: CollectionId, owner_id: &Identifier) -> CoreResult<()> {
        let Some(entry) = self.context.get_collection_entry(collection) else {
            return Ok(());
        };
        let c = self.collection(collection)?;
        let action = match entry.loaded_key() {
            None => Action::CollectionRecreate(CollectionRecreateAction {
                collection,
                key: CollectionKey::new(c.role(), owner_id.clone()),
                elements: c.elements().to_vec(),
            }),
            Some(key) if c.is_initialized() => {
                let (added, removed) = entry.diff(c.elements());
                if added.is_empty() && removed.is_empty() {
                    return Ok(());
                }
                Action::CollectionUpdate(CollectionUpdateAction {
                    collection,
                    key: key.clone(),
                    added,
                    removed,
                })
            }
            Some(_) => return Ok(()),
        };
        self.actions.add_action(action);
        Ok(())
    }

    /// Rejects writes that would bind a transient instance or a null to a
    /// non-nullable foreign key.
    fn check_references(&self) -> CoreResult<()> {
        for insert in self.actions.insertions() {
            self.check_state(&insert.descriptor, &insert.state)?;
        }
        for update in self.actions.updates() {
            self.check_state(&update.descriptor, &update.state)?;
        }
        let created = self
            .actions
            .collection_creations()
            .iter()
            .map(|a| (&a.key, &a.elements));
        let updated = self
            .actions
            .collection_updates()
            .iter()
            .map(|a| (&a.key, &a.added));
        for (key, elements) in created.chain(updated) {
            for element in elements {
                if let Element::Entity(Reference::Instance(i)) = element {
                    self.check_associated(*i, || format!("collection {key}"))?;
                }
            }
        }
        Ok(())
    }

    fn check_state(&self, descriptor: &EntityDescriptor, state: &[PropertyValue]) -> CoreResult<()> {
        for (property, value) in descriptor.properties().iter().zip(state) {
            let Some((target, nullable)) = property.reference_target() else {
                continue;
            };
            match value {
                PropertyValue::Reference(None) if !nullable => {
                    return Err(CoreError::property_value(
                        descriptor.name(),
                        property.name(),
                        format!("not-null property references a null {target}"),
                    ));
                }
                PropertyValue::Reference(Some(Reference::Instance(i))) => {
                    self.check_associated(*i, || {
                        format!("{}.{}", descriptor.name(), property.name())
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_associated(&self, instance: InstanceId, holder: impl FnOnce() -> String) -> CoreResult<()> {
        if self.context.get_entry(instance).is_some()
            || self
                .instances
                .get(instance.0)
                .is_some_and(|i| i.was_associated() && i.id().is_some())
        {
            return Ok(());
        }
        let entity = self
            .instances
            .get(instance.0)
            .map_or("?", |i| i.entity_name());
        Err(CoreError::transient_object(format!(
            "{} references an unsaved transient instance of {entity}; persist it before flushing",
            holder()
        )))
    }

    // === Execution ===

    fn execute(&mut self, queued: QueuedActions) -> CoreResult<FlushSummary> {
        let mut summary = FlushSummary::default();
        self.execute_insertions(&queued.insertions, &mut summary)?;
        self.execute_updates(&queued.updates, &mut summary)?;
        self.execute_collection_removals(&queued.collection_removals, &mut summary)?;
        self.execute_collection_updates(&queued.collection_updates, &mut summary)?;
        self.execute_collection_creations(&queued.collection_creations, &mut summary)?;
        self.execute_deletions(&queued.deletions, &mut summary)?;
        Ok(summary)
    }

    fn execute_insertions(&mut self, actions: &[EntityInsertAction], summary: &mut FlushSummary) -> CoreResult<()> {
        if actions.is_empty() {
            return Ok(());
        }
        let position: HashMap<InstanceId, usize> = actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.instance, i))
            .collect();

        let mut statements = Vec::with_capacity(actions.len());
        let mut deferred = Vec::new();
        for (index, action) in actions.iter().enumerate() {
            let mut columns = Vec::new();
            let mut postponed = Vec::new();
            for (property, value) in action.descriptor.properties().iter().zip(&action.state) {
                let Some(column) = self.bind_column(&action.descriptor, property, value)? else {
                    continue;
                };
                let nullable = property.reference_target().is_some_and(|(_, n)| n);
                let not_yet_inserted = match value {
                    PropertyValue::Reference(Some(Reference::Instance(t))) => {
                        position.get(t).is_some_and(|&p| p >= index)
                    }
                    _ => false,
                };
                if nullable && not_yet_inserted {
                    if let ColumnValue::Reference { table, .. } = &column {
                        columns.push((
                            property.name().to_string(),
                            ColumnValue::Reference {
                                table: table.clone(),
                                id: None,
                            },
                        ));
                    }
                    postponed.push((property.name().to_string(), column));
                } else {
                    columns.push((property.name().to_string(), column));
                }
            }
            summary.push(
                ActionKind::EntityInsert,
                action.key.entity_name(),
                action.key.id(),
                columns.iter().map(|(n, _)| n.clone()).collect(),
            );
            statements.push(Statement::Insert {
                table: action.key.entity_name().to_string(),
                id: action.key.id().clone(),
                version: action.version.clone(),
                columns,
            });
            if !postponed.is_empty() {
                deferred.push((action.key.clone(), postponed));
            }
        }
        self.execute_statements(&statements, &vec![None; statements.len()])?;

        for action in actions {
            self.context.entry_mut(action.instance)?.post_insert()?;
            self.factory.statistics().record_entity_insert();
            self.cache_insert(action)?;
        }

        if !deferred.is_empty() {
            let mut updates = Vec::with_capacity(deferred.len());
            let mut expected = Vec::with_capacity(deferred.len());
            for (key, columns) in deferred {
                trace!(%key, "foreign keys to later inserts bound by update");
                summary.push(
                    ActionKind::EntityUpdate,
                    key.entity_name(),
                    key.id(),
                    columns.iter().map(|(n, _)| n.clone()).collect(),
                );
                updates.push(Statement::Update {
                    table: key.entity_name().to_string(),
                    id: key.id().clone(),
                    expected_version: None,
                    version: None,
                    columns,
                });
                expected.push(Some(key));
            }
            self.execute_statements(&updates, &expected)?;
        }
        Ok(())
    }

    fn cache_insert(&mut self, action: &EntityInsertAction) -> CoreResult<()> {
        let Some(access) = self.cache_access(action.key.entity_name()) else {
            return Ok(());
        };
        let key = action.key.cache_key();
        let entry = CacheEntry::disassemble(
            &self.bind_all(&action.descriptor, &action.state)?,
            action.version.clone(),
        )?;
        access.insert(&key, &entry)?;
        self.completions.register(
            format!("after-insert {}", action.key),
            Box::new(move |successful| {
                if successful {
                    access.after_insert(&key, entry)?;
                }
                Ok(())
            }),
        );
        Ok(())
    }

    fn execute_updates(&mut self, actions: &[EntityUpdateAction], summary: &mut FlushSummary) -> CoreResult<()> {
        if actions.is_empty() {
            return Ok(());
        }
        let mut statements = Vec::with_capacity(actions.len());
        let mut expected = Vec::with_capacity(actions.len());
        let mut entries = Vec::with_capacity(actions.len());
        for action in actions {
            let mut columns = Vec::with_capacity(action.dirty.len());
            for &index in &action.dirty {
                let (Some(property), Some(value)) =
                    (action.descriptor.property(index), action.state.get(index))
                else {
                    continue;
                };
                if let Some(column) = self.bind_column(&action.descriptor, property, value)? {
                    columns.push((property.name().to_string(), column));
                }
            }
            entries.push(self.lock_for_update(action)?);
            summary.push(
                ActionKind::EntityUpdate,
                action.key.entity_name(),
                action.key.id(),
                columns.iter().map(|(n, _)| n.clone()).collect(),
            );
            statements.push(Statement::Update {
                table: action.key.entity_name().to_string(),
                id: action.key.id().clone(),
                expected_version: action.previous_version.clone(),
                version: action.next_version.clone(),
                columns,
            });
            expected.push(Some(action.key.clone()));
        }
        self.execute_statements(&statements, &expected)?;

        for (action, entry) in actions.iter().zip(entries) {
            if let (Some(access), Some(entry)) = (self.cache_access(action.key.entity_name()), entry) {
                access.update(&action.key.cache_key(), &entry, action.previous_version.as_ref())?;
            }
            if action.next_version.is_some() {
                self.instance_mut(action.instance)?
                    .set_version(action.next_version.clone());
            }
            let entry = self.context.entry_mut(action.instance)?;
            entry.set_loaded_state(action.state.clone())?;
            if action.next_version.is_some() {
                entry.set_version(action.next_version.clone());
            }
            self.factory.statistics().record_entity_update();
        }
        Ok(())
    }

    /// Soft-locks the cached entity and registers the completion that
    /// writes or releases it. Returns the entry to cache, if cached.
    fn lock_for_update(&mut self, action: &EntityUpdateAction) -> CoreResult<Option<CacheEntry>> {
        let Some(access) = self.cache_access(action.key.entity_name()) else {
            return Ok(None);
        };
        let key = action.key.cache_key();
        let entry = CacheEntry::disassemble(
            &self.bind_all(&action.descriptor, &action.state)?,
            action.next_version.clone(),
        )?;
        let lock = access.lock_item(&key, action.previous_version.as_ref())?;
        let previous = action.previous_version.clone();
        let cached = entry.clone();
        self.completions.register(
            format!("after-update {}", action.key),
            Box::new(move |successful| {
                if successful {
                    access.after_update(&key, cached, previous.as_ref(), lock)?;
                    Ok(())
                } else {
                    access.unlock_item(&key, lock)
                }
            }),
        );
        Ok(Some(entry))
    }

    fn execute_collection_removals(
        &mut self,
        actions: &[CollectionRemoveAction],
        summary: &mut FlushSummary,
    ) -> CoreResult<()> {
        let statements: Vec<Statement> = actions
            .iter()
            .map(|a| Statement::DeleteCollection {
                role: a.key.role().to_string(),
                owner: a.key.owner().clone(),
            })
            .collect();
        self.execute_statements(&statements, &vec![None; statements.len()])?;
        for action in actions {
            summary.push(ActionKind::CollectionRemove, action.key.role(), action.key.owner(), Vec::new());
            if let Some(collection) = action.collection {
                self.context.remove_collection(collection);
            }
            self.factory.statistics().record_collection_remove();
        }
        Ok(())
    }

    fn execute_collection_updates(
        &mut self,
        actions: &[CollectionUpdateAction],
        summary: &mut FlushSummary,
    ) -> CoreResult<()> {
        let mut statements = Vec::new();
        for action in actions {
            if !action.removed.is_empty() {
                statements.push(Statement::DeleteElements {
                    role: action.key.role().to_string(),
                    owner: action.key.owner().clone(),
                    elements: self.bind_elements(&action.removed)?,
                });
            }
            if !action.added.is_empty() {
                statements.push(Statement::InsertElements {
                    role: action.key.role().to_string(),
                    owner: action.key.owner().clone(),
                    elements: self.bind_elements(&action.added)?,
                });
            }
        }
        self.execute_statements(&statements, &vec![None; statements.len()])?;
        for action in actions {
            summary.push(ActionKind::CollectionUpdate, action.key.role(), action.key.owner(), Vec::new());
            let elements = self.collection(action.collection)?.elements().to_vec();
            if let Some(entry) = self.context.collection_entry_mut(action.collection) {
                entry.post_flush(Some(action.key.clone()), elements);
            }
            self.factory.statistics().record_collection_update();
        }
        Ok(())
    }

    fn execute_collection_creations(
        &mut self,
        actions: &[CollectionRecreateAction],
        summary: &mut FlushSummary,
    ) -> CoreResult<()> {
        let mut statements = Vec::new();
        for action in actions.iter().filter(|a| !a.elements.is_empty()) {
            statements.push(Statement::InsertElements {
                role: action.key.role().to_string(),
                owner: action.key.owner().clone(),
                elements: self.bind_elements(&action.elements)?,
            });
        }
        self.execute_statements(&statements, &vec![None; statements.len()])?;
        for action in actions {
            if !action.elements.is_empty() {
                summary.push(ActionKind::CollectionRecreate, action.key.role(), action.key.owner(), Vec::new());
                self.factory.statistics().record_collection_recreate();
            }
            if let Some(entry) = self.context.collection_entry_mut(action.collection) {
                entry.post_flush(Some(action.key.clone()), action.elements.clone());
            }
            self.context
                .index_collection(Some(&action.key), action.collection);
        }
        Ok(())
    }

    fn execute_deletions(&mut self, actions: &[EntityDeleteAction], summary: &mut FlushSummary) -> CoreResult<()> {
        if actions.is_empty() {
            return Ok(());
        }
        let deleted: HashSet<InstanceId> = actions.iter().map(|a| a.instance).collect();

        // Rows deleted together may reference each other through nullable
        // foreign keys; those are cleared first.
        let mut nulling = Vec::new();
        let mut nulling_expected = Vec::new();
        for action in actions {
            let mut columns = Vec::new();
            for (property, value) in action.descriptor.properties().iter().zip(&action.state) {
                let (Some((target, true)), PropertyValue::Reference(Some(r))) =
                    (property.reference_target(), value)
                else {
                    continue;
                };
                let points_to_deleted = match r {
                    Reference::Instance(t) => deleted.contains(t),
                    Reference::Proxy(p) => self
                        .proxies
                        .get(p.0)
                        .and_then(|p| p.attached_instance())
                        .is_some_and(|t| deleted.contains(&t)),
                };
                if points_to_deleted {
                    columns.push((
                        property.name().to_string(),
                        ColumnValue::Reference {
                            table: target.to_string(),
                            id: None,
                        },
                    ));
                }
            }
            if !columns.is_empty() {
                nulling.push(Statement::Update {
                    table: action.key.entity_name().to_string(),
                    id: action.key.id().clone(),
                    expected_version: action.version.clone(),
                    version: None,
                    columns,
                });
                nulling_expected.push(Some(action.key.clone()));
            }
        }

        let mut statements = Vec::with_capacity(actions.len());
        let mut expected = Vec::with_capacity(actions.len());
        for action in actions {
            if let Some(access) = self.cache_access(action.key.entity_name()) {
                let key = action.key.cache_key();
                let lock = access.lock_item(&key, action.version.as_ref())?;
                self.completions.register(
                    format!("after-delete {}", action.key),
                    Box::new(move |_| access.unlock_item(&key, lock)),
                );
            }
            statements.push(Statement::Delete {
                table: action.key.entity_name().to_string(),
                id: action.key.id().clone(),
                expected_version: action.version.clone(),
            });
            expected.push(Some(action.key.clone()));
        }
        self.execute_statements(&nulling, &nulling_expected)?;
        self.execute_statements(&statements, &expected)?;

        for action in actions {
            summary.push(ActionKind::EntityDelete, action.key.entity_name(), action.key.id(), Vec::new());
            if let Some(access) = self.cache_access(action.key.entity_name()) {
                access.remove(&action.key.cache_key())?;
            }
            if let Some(mut entry) = self.context.remove_entry(action.instance) {
                entry.post_delete()?;
                trace!(key = %entry.key(), status = %entry.status(), "deleted");
            }
            self.context.remove_entity(&action.key);
            self.context.remove_proxy(&action.key);
            self.factory.statistics().record_entity_delete();
        }
        Ok(())
    }

    /// Sends statements, batching consecutive statements with the same
    /// shape. A statement with an expected key must affect a row.
    pub(super) fn execute_statements(
        &mut self,
        statements: &[Statement],
        expected: &[Option<EntityKey>],
    ) -> CoreResult<()> {
        let batch_size = self.factory.config().effective_batch_size();
        let mut start = 0;
        while start < statements.len() {
            let sql = statements[start].sql();
            let mut end = start + 1;
            while end < statements.len() && end - start < batch_size && statements[end].sql() == sql {
                end += 1;
            }
            let chunk = &statements[start..end];
            let counts = if chunk.len() == 1 {
                vec![self.connection.execute(&chunk[0])?]
            } else {
                self.connection.execute_batch(chunk)?
            };
            self.factory.statistics().record_round_trip(chunk.len());
            trace!(%sql, statements = chunk.len(), "executed");

            for (count, key) in counts.iter().zip(&expected[start..end]) {
                if let (0, Some(key)) = (count, key) {
                    self.factory.statistics().record_optimistic_failure();
                    return Err(CoreError::StaleObjectState { key: key.clone() });
                }
            }
            start = end;
        }
        Ok(())
    }

    // === Binding ===

    fn bind_column(
        &self,
        descriptor: &EntityDescriptor,
        property: &Property,
        value: &PropertyValue,
    ) -> CoreResult<Option<ColumnValue>> {
        match (property.kind(), value) {
            (PropertyKind::Collection { .. }, _) => Ok(None),
            (PropertyKind::Basic, PropertyValue::Basic(v)) => Ok(Some(ColumnValue::Basic(v.clone()))),
            (PropertyKind::ManyToOne { target, .. }, PropertyValue::Reference(r)) => {
                let id = match r {
                    Some(r) => Some(self.reference_id(*r)?),
                    None => None,
                };
                Ok(Some(ColumnValue::Reference {
                    table: target.clone(),
                    id,
                }))
            }
            (kind, value) => Err(CoreError::property_value(
                descriptor.name(),
                property.name(),
                format!("{value:?} does not fit a {kind:?} mapping"),
            )),
        }
    }

    /// Binds every non-collection property.
    pub(super) fn bind_all(
        &self,
        descriptor: &EntityDescriptor,
        state: &[PropertyValue],
    ) -> CoreResult<Vec<(String, ColumnValue)>> {
        let mut columns = Vec::with_capacity(state.len());
        for (property, value) in descriptor.properties().iter().zip(state) {
            if let Some(column) = self.bind_column(descriptor, property, value)? {
                columns.push((property.name().to_string(), column));
            }
        }
        Ok(columns)
    }

    fn bind_elements(&self, elements: &[Element]) -> CoreResult<Vec<ColumnValue>> {
        elements
            .iter()
            .map(|e| match e {
                Element::Basic(v) => Ok(ColumnValue::Basic(v.clone())),
                Element::Entity(r) => Ok(ColumnValue::reference(
                    self.referenced_entity(*r)?,
                    self.reference_id(*r)?,
                )),
            })
            .collect()
    }

    fn reference_id(&self, reference: Reference) -> CoreResult<Identifier> {
        match reference {
            Reference::Instance(i) => self.instance_ref(i)?.id().cloned().ok_or_else(|| {
                CoreError::transient_object(format!("{i} has no identifier; persist it first"))
            }),
            Reference::Proxy(p) => Ok(self.proxy(p)?.identifier().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{CascadeStyle, Metamodel};
    use crate::{Config, SessionFactory};
    use hibernia_cache::AccessType;
    use hibernia_codec::Value;
    use hibernia_storage::InMemoryBackend;

    fn factory(backend: InMemoryBackend, config: Config) -> SessionFactory {
        let metamodel = Metamodel::builder()
            .entity(
                EntityDescriptor::builder("Parent")
                    .basic("name")
                    .many_to_one("favourite", "Child", true, CascadeStyle::NONE)
                    .one_to_many("children", "Child", CascadeStyle::ALL)
                    .element_collection("tags")
                    .versioned()
                    .cached(AccessType::ReadWrite)
                    .build(),
            )
            .entity(
                EntityDescriptor::builder("Child")
                    .basic("name")
                    .many_to_one("parent", "Parent", false, CascadeStyle::NONE)
                    .build(),
            )
            .build()
            .unwrap();
        SessionFactory::builder(metamodel, backend)
            .config(config)
            .build()
            .unwrap()
    }

    fn family(session: &mut Session) -> (InstanceId, InstanceId) {
        let parent = session.new_instance("Parent").unwrap();
        session.set_identifier(parent, 1).unwrap();
        session.set(parent, "name", "Tenar").unwrap();
        let child = session.new_instance("Child").unwrap();
        session.set_identifier(child, 2).unwrap();
        session.set(child, "name", "Therru").unwrap();
        session.set(child, "parent", parent).unwrap();
        session.set(parent, "favourite", child).unwrap();
        let children = session.get(parent, "children").unwrap().as_collection().unwrap();
        session.add_element(children, child).unwrap();
        (parent, child)
    }

    #[test]
    fn inserts_follow_foreign_keys_and_defer_nullable_ones() {
        let backend = InMemoryBackend::new();
        let factory = factory(backend.clone(), Config::default());
        let mut session = factory.open_session().unwrap();
        let (parent, _) = family(&mut session);
        session.persist(parent).unwrap();
        let summary = session.commit().unwrap();

        assert_eq!(summary.insert_order(), vec!["Parent", "Child"]);
        assert_eq!(summary.count(ActionKind::EntityUpdate), 1);
        assert_eq!(summary.count(ActionKind::CollectionRecreate), 1);
        let row = backend.row("Parent", &Identifier::from(1)).unwrap();
        assert_eq!(
            row.column("favourite"),
            Some(&ColumnValue::reference("Child", Identifier::from(2)))
        );
        assert_eq!(backend.collection("Parent.children", &Identifier::from(1)).len(), 1);
    }

    #[test]
    fn unchanged_entities_are_not_updated() {
        let factory = factory(InMemoryBackend::new(), Config::default());
        let mut session = factory.open_session().unwrap();
        let (parent, _) = family(&mut session);
        session.persist(parent).unwrap();
        session.commit().unwrap();
        assert!(session.flush().unwrap().is_empty());

        session.set(parent, "name", "Goha").unwrap();
        let summary = session.flush().unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary.executed[0].properties, vec!["name".to_string()]);
        assert_eq!(session.instance(parent).unwrap().version(), Some(&Value::Integer(1)));
    }

    #[test]
    fn collection_changes_are_diffed() {
        let backend = InMemoryBackend::new();
        let factory = factory(backend.clone(), Config::default());
        let mut session = factory.open_session().unwrap();
        let (parent, _) = family(&mut session);
        let tags = session.get(parent, "tags").unwrap().as_collection().unwrap();
        session.add_element(tags, "a").unwrap();
        session.add_element(tags, "b").unwrap();
        session.persist(parent).unwrap();
        session.commit().unwrap();

        session.remove_element(tags, "a").unwrap();
        session.add_element(tags, "c").unwrap();
        let summary = session.commit().unwrap();
        assert_eq!(summary.count(ActionKind::CollectionUpdate), 1);
        assert_eq!(
            backend.collection("Parent.tags", &Identifier::from(1)),
            vec![
                ColumnValue::Basic(Value::from("b")),
                ColumnValue::Basic(Value::from("c"))
            ]
        );
    }

    #[test]
    fn replacing_a_collection_removes_the_old_rows() {
        let backend = InMemoryBackend::new();
        let factory = factory(backend.clone(), Config::default());
        let mut session = factory.open_session().unwrap();
        let (parent, _) = family(&mut session);
        let tags = session.get(parent, "tags").unwrap().as_collection().unwrap();
        session.add_element(tags, "old").unwrap();
        session.persist(parent).unwrap();
        session.commit().unwrap();

        let fresh = session.new_collection(parent, "tags").unwrap();
        session.add_element(fresh, "new").unwrap();
        session.set(parent, "tags", PropertyValue::Collection(Some(fresh))).unwrap();
        let summary = session.commit().unwrap();
        assert_eq!(summary.count(ActionKind::CollectionRemove), 1);
        assert_eq!(summary.count(ActionKind::CollectionRecreate), 1);
        assert_eq!(
            backend.collection("Parent.tags", &Identifier::from(1)),
            vec![ColumnValue::Basic(Value::from("new"))]
        );
    }

    #[test]
    fn deletes_clear_mutual_references() {
        let backend = InMemoryBackend::new();
        let factory = factory(backend.clone(), Config::default());
        let mut session = factory.open_session().unwrap();
        let (parent, child) = family(&mut session);
        session.persist(parent).unwrap();
        session.commit().unwrap();

        session.remove(parent).unwrap();
        assert!(!session.contains(child));
        let summary = session.commit().unwrap();
        assert_eq!(summary.count(ActionKind::EntityDelete), 2);
        assert_eq!(backend.row_count("Parent"), 0);
        assert_eq!(backend.row_count("Child"), 0);
        assert!(session.entry(parent).is_none());
    }

    #[test]
    fn transient_references_fail_the_flush() {
        let factory = factory(InMemoryBackend::new(), Config::default());
        let mut session = factory.open_session().unwrap();
        let parent = session.new_instance("Parent").unwrap();
        let child = session.new_instance("Child").unwrap();
        session.set(child, "parent", parent).unwrap();
        session.persist(child).unwrap();
        assert!(matches!(
            session.flush(),
            Err(CoreError::TransientObject { .. })
        ));
        assert!(matches!(session.flush(), Err(CoreError::SessionUnusable)));
        session.rollback().unwrap();
        assert!(session.flush().unwrap().is_empty());
    }

    #[test]
    fn null_required_references_fail_the_flush() {
        let factory = factory(InMemoryBackend::new(), Config::default());
        let mut session = factory.open_session().unwrap();
        let child = session.new_instance("Child").unwrap();
        session.persist(child).unwrap();
        assert!(matches!(
            session.flush(),
            Err(CoreError::PropertyValue { .. })
        ));
    }

    #[test]
    fn stale_versions_are_detected() {
        let backend = InMemoryBackend::new();
        let factory = factory(backend.clone(), Config::default());
        let mut session = factory.open_session().unwrap();
        let (parent, _) = family(&mut session);
        session.persist(parent).unwrap();
        session.commit().unwrap();

        backend
            .apply_committed(&Statement::Update {
                table: "Parent".into(),
                id: Identifier::from(1),
                expected_version: Some(Value::Integer(0)),
                version: Some(Value::Integer(1)),
                columns: Vec::new(),
            })
            .unwrap();
        session.set(parent, "name", "Arha").unwrap();
        let err = session.commit().unwrap_err();
        assert!(err.is_stale_state());
        assert_eq!(factory.statistics().optimistic_failures(), 1);
    }

    #[test]
    fn batching_groups_identical_statements() {
        let backend = InMemoryBackend::new();
        let factory = factory(backend.clone(), Config::default().batch_size(2));
        let mut session = factory.open_session().unwrap();
        for id in 0..3 {
            let parent = session.new_instance("Parent").unwrap();
            session.set_identifier(parent, id).unwrap();
            session.persist(parent).unwrap();
        }
        session.flush().unwrap();
        assert_eq!(factory.statistics().batches(), 1);
        assert_eq!(backend.stats().round_trips(), 2);
    }
}
