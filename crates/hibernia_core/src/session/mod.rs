//! Sessions: the single-threaded unit of work.
//!
//! A [`Session`] owns an arena of instances, proxies and collections, the
//! [`PersistenceContext`] tracking which of them are managed, and the
//! [`ActionQueue`] of writes waiting for the next flush. Handles into the
//! arena ([`InstanceId`], [`ProxyId`](crate::ProxyId), [`CollectionId`]) are only meaningful
//! for the session that issued them.

mod factory;
mod flush;
mod load;

pub use factory::{SessionFactory, SessionFactoryBuilder, SessionFactoryRegistry};
pub use flush::{ExecutedAction, FlushSummary};

use crate::action::{
    Action, ActionQueue, AfterCompletionQueue, EntityDeleteAction, EntityInsertAction,
};
use crate::cascade::{cascade_targets, CascadeWalk};
use crate::context::{CollectionEntry, EntityEntry, PersistenceContext};
use crate::error::{CoreError, CoreResult};
use crate::instance::{Element, EntityInstance, PersistentCollection, PropertyValue, Reference};
use crate::metadata::{CascadeOp, EntityDescriptor, Property, PropertyKind};
use crate::proxy::{LazyInitializer, ProxyTarget};
use crate::types::{CollectionId, EntityKey, InstanceId, LockMode, ProxyId, SessionId, Status};
use hibernia_cache::LoadOwner;
use hibernia_codec::{Identifier, Value};
use hibernia_storage::{Connection, Statement};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    /// A flush failed; only rollback and close are allowed.
    Failed,
    Closed,
}

/// A unit of work against one connection.
///
/// Sessions are not thread-safe; use one per thread. Dropping a session
/// closes it, rolling back any uncommitted work.
pub struct Session {
    id: SessionId,
    factory: SessionFactory,
    connection: Box<dyn Connection>,
    instances: Vec<EntityInstance>,
    proxies: Vec<LazyInitializer>,
    collections: Vec<PersistentCollection>,
    context: PersistenceContext,
    actions: ActionQueue,
    completions: AfterCompletionQueue,
    state: SessionState,
    tx_timestamp: u64,
    load_owner: LoadOwner,
}

impl Session {
    pub(crate) fn open(factory: SessionFactory) -> CoreResult<Self> {
        let connection = factory.backend().connect()?;
        let id = factory.next_session_id();
        let tx_timestamp = factory.timestamper().next();
        let context = PersistenceContext::new(factory.config().default_read_only);
        factory.statistics().record_session_open();
        debug!(session = %id, factory = factory.name(), "session opened");
        Ok(Self {
            id,
            factory,
            connection,
            instances: Vec::new(),
            proxies: Vec::new(),
            collections: Vec::new(),
            context,
            actions: ActionQueue::new(),
            completions: AfterCompletionQueue::new(),
            state: SessionState::Open,
            tx_timestamp,
            load_owner: LoadOwner(id.0),
        })
    }

    /// Returns the session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the factory the session was opened from.
    #[must_use]
    pub const fn factory(&self) -> &SessionFactory {
        &self.factory
    }

    /// Returns whether the session is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state != SessionState::Closed
    }

    /// Returns the persistence context.
    #[must_use]
    pub const fn persistence_context(&self) -> &PersistenceContext {
        &self.context
    }

    /// Returns the writes waiting for the next flush.
    #[must_use]
    pub const fn action_queue(&self) -> &ActionQueue {
        &self.actions
    }

    /// Returns the cache timestamp of the current transaction.
    #[must_use]
    pub const fn transaction_timestamp(&self) -> u64 {
        self.tx_timestamp
    }

    fn ensure_open(&self) -> CoreResult<()> {
        match self.state {
            SessionState::Closed => Err(CoreError::SessionClosed),
            _ => Ok(()),
        }
    }

    fn ensure_usable(&self) -> CoreResult<()> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Failed => Err(CoreError::SessionUnusable),
            SessionState::Closed => Err(CoreError::SessionClosed),
        }
    }

    fn tenant(&self) -> Option<String> {
        self.factory.config().tenant.clone()
    }

    fn descriptor(&self, entity_name: &str) -> CoreResult<Arc<EntityDescriptor>> {
        self.factory.metamodel().descriptor(entity_name).map(Arc::clone)
    }

    fn instance_ref(&self, instance: InstanceId) -> CoreResult<&EntityInstance> {
        self.instances
            .get(instance.0)
            .ok_or_else(|| CoreError::invalid_operation(format!("{instance} is not an instance of this session")))
    }

    fn instance_mut(&mut self, instance: InstanceId) -> CoreResult<&mut EntityInstance> {
        self.instances
            .get_mut(instance.0)
            .ok_or_else(|| CoreError::invalid_operation(format!("{instance} is not an instance of this session")))
    }

    fn collection_mut(&mut self, collection: CollectionId) -> CoreResult<&mut PersistentCollection> {
        self.collections
            .get_mut(collection.0)
            .ok_or_else(|| CoreError::invalid_operation(format!("{collection} is not a collection of this session")))
    }

    /// Returns the entity name a reference points to.
    fn referenced_entity(&self, reference: Reference) -> CoreResult<&str> {
        match reference {
            Reference::Instance(i) => Ok(self.instance_ref(i)?.entity_name()),
            Reference::Proxy(p) => Ok(self.proxy(p)?.entity_name()),
        }
    }

    // === Instances ===

    /// Instantiates a transient entity with every property null and every
    /// collection empty.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnknownEntity` if the name is not mapped.
    pub fn new_instance(&mut self, entity_name: &str) -> CoreResult<InstanceId> {
        self.ensure_open()?;
        let descriptor = self.descriptor(entity_name)?;
        let instance = InstanceId(self.instances.len());
        let mut values = Vec::with_capacity(descriptor.properties().len());
        for property in descriptor.properties() {
            values.push(match property.kind() {
                PropertyKind::Basic => PropertyValue::Basic(Value::Null),
                PropertyKind::ManyToOne { .. } => PropertyValue::Reference(None),
                PropertyKind::Collection { role, .. } => {
                    let collection = CollectionId(self.collections.len());
                    self.collections
                        .push(PersistentCollection::new(role.clone(), instance));
                    PropertyValue::Collection(Some(collection))
                }
            });
        }
        self.instances
            .push(EntityInstance::new(descriptor.name(), values));
        Ok(instance)
    }

    /// Returns an instance.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidOperation` for a handle of another session.
    pub fn instance(&self, instance: InstanceId) -> CoreResult<&EntityInstance> {
        self.instance_ref(instance)
    }

    /// Returns the identifier of an instance, if assigned.
    #[must_use]
    pub fn identifier(&self, instance: InstanceId) -> Option<&Identifier> {
        self.instances.get(instance.0).and_then(EntityInstance::id)
    }

    /// Assigns the identifier of a transient instance.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidOperation` if the instance is managed.
    pub fn set_identifier(&mut self, instance: InstanceId, id: impl Into<Identifier>) -> CoreResult<()> {
        self.ensure_usable()?;
        if self.context.get_entry(instance).is_some() {
            return Err(CoreError::invalid_operation(format!(
                "identifier of managed instance {instance} cannot change"
            )));
        }
        self.instance_mut(instance)?.set_id(Some(id.into()));
        Ok(())
    }

    /// Sets a property.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnknownProperty` for an unmapped property and
    /// `CoreError::PropertyValue` if the value does not fit the mapping.
    pub fn set(
        &mut self,
        instance: InstanceId,
        property: &str,
        value: impl Into<PropertyValue>,
    ) -> CoreResult<()> {
        self.ensure_usable()?;
        let value = value.into();
        let descriptor = self.descriptor(self.instance_ref(instance)?.entity_name())?;
        let index = descriptor.property_index(property)?;
        if let Some(property) = descriptor.property(index) {
            self.check_value(&descriptor, property, &value)?;
        }
        if self
            .context
            .get_entry(instance)
            .is_some_and(|e| e.status().is_deleted_or_gone())
        {
            return Err(CoreError::invalid_operation(format!(
                "cannot modify deleted instance {instance}"
            )));
        }
        if let PropertyValue::Collection(Some(c)) = value {
            self.collection_mut(c)?.set_owner(instance);
        }
        self.instance_mut(instance)?.values_mut()[index] = value;
        Ok(())
    }

    fn check_value(
        &self,
        descriptor: &EntityDescriptor,
        property: &Property,
        value: &PropertyValue,
    ) -> CoreResult<()> {
        let mismatch = |message: String| {
            Err(CoreError::property_value(descriptor.name(), property.name(), message))
        };
        match (property.kind(), value) {
            (PropertyKind::Basic, PropertyValue::Basic(_))
            | (PropertyKind::ManyToOne { .. }, PropertyValue::Reference(None))
            | (PropertyKind::Collection { .. }, PropertyValue::Collection(None)) => Ok(()),
            (PropertyKind::ManyToOne { target, .. }, PropertyValue::Reference(Some(r))) => {
                let actual = self.referenced_entity(*r)?;
                if actual == target {
                    Ok(())
                } else {
                    mismatch(format!("expected a reference to {target}, got {actual}"))
                }
            }
            (PropertyKind::Collection { role, .. }, PropertyValue::Collection(Some(c))) => {
                let actual = self.collection(*c)?.role();
                if actual == role {
                    Ok(())
                } else {
                    mismatch(format!("expected a collection of role {role}, got {actual}"))
                }
            }
            (kind, value) => mismatch(format!("{value:?} does not fit a {kind:?} mapping")),
        }
    }

    /// Returns a property value. Never loads.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnknownProperty` for an unmapped property.
    pub fn get(&self, instance: InstanceId, property: &str) -> CoreResult<&PropertyValue> {
        let inst = self.instance_ref(instance)?;
        let descriptor = self.factory.metamodel().descriptor(inst.entity_name())?;
        let index = descriptor.property_index(property)?;
        inst.values()
            .get(index)
            .ok_or_else(|| CoreError::unknown_property(inst.entity_name(), property))
    }

    /// Returns the target of a many-to-one property.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnknownProperty` for an unmapped property.
    pub fn reference(&self, instance: InstanceId, property: &str) -> CoreResult<Option<Reference>> {
        Ok(self.get(instance, property)?.as_reference())
    }

    /// Creates an empty collection for a collection property of `owner`.
    /// The property is not changed until the handle is [`set`](Self::set).
    ///
    /// # Errors
    ///
    /// Returns `CoreError::PropertyValue` if the property is no collection.
    pub fn new_collection(&mut self, owner: InstanceId, property: &str) -> CoreResult<CollectionId> {
        self.ensure_usable()?;
        let descriptor = self.descriptor(self.instance_ref(owner)?.entity_name())?;
        let index = descriptor.property_index(property)?;
        match descriptor.property(index).map(Property::kind) {
            Some(PropertyKind::Collection { role, .. }) => {
                let collection = CollectionId(self.collections.len());
                self.collections
                    .push(PersistentCollection::new(role.clone(), owner));
                Ok(collection)
            }
            _ => Err(CoreError::property_value(
                descriptor.name(),
                property,
                "not a collection property",
            )),
        }
    }

    /// Adds an element, loading the collection first.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be initialized.
    pub fn add_element(&mut self, collection: CollectionId, element: impl Into<Element>) -> CoreResult<()> {
        self.ensure_usable()?;
        self.initialize_collection(collection)?;
        let element = element.into();
        if let Element::Entity(r) = element {
            self.referenced_entity(r)?;
        }
        self.collection_mut(collection)?.push(element);
        Ok(())
    }

    /// Removes the first equal element, loading the collection first.
    /// Returns whether an element was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be initialized.
    pub fn remove_element(&mut self, collection: CollectionId, element: impl Into<Element>) -> CoreResult<bool> {
        self.ensure_usable()?;
        self.initialize_collection(collection)?;
        let element = element.into();
        Ok(self.collection_mut(collection)?.remove(&element))
    }

    // === Entity operations ===

    /// Makes a transient instance persistent, cascading along associations
    /// mapped with persist.
    ///
    /// A generated identifier is assigned if none is set. Persisting an
    /// instance scheduled for deletion cancels the deletion.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NonUniqueObject` if another instance holds the
    /// same key.
    pub fn persist(&mut self, instance: InstanceId) -> CoreResult<()> {
        self.ensure_usable()?;
        self.instance_ref(instance)?;
        let mut walk = CascadeWalk::new(instance);
        while let Some(next) = walk.next_instance() {
            self.persist_one(next)?;
            walk.push_children(self.cascade_children(next, CascadeOp::Persist)?);
        }
        Ok(())
    }

    fn persist_one(&mut self, instance: InstanceId) -> CoreResult<()> {
        match self.context.get_entry(instance).map(EntityEntry::status) {
            None => self.schedule_insert(instance),
            Some(Status::Deleted) => {
                self.actions.unschedule_deletion(instance);
                let entry = self.context.entry_mut(instance)?;
                entry.set_status(Status::Managed)?;
                entry.set_deleted_state(None);
                trace!(%instance, "deletion unscheduled by persist");
                Ok(())
            }
            Some(Status::Gone) => Err(CoreError::invalid_operation(format!(
                "deleted instance {instance} passed to persist"
            ))),
            Some(_) => Ok(()),
        }
    }

    fn schedule_insert(&mut self, instance: InstanceId) -> CoreResult<()> {
        let (entity_name, assigned) = {
            let inst = self.instance_ref(instance)?;
            (inst.entity_name().to_string(), inst.id().cloned())
        };
        let descriptor = self.descriptor(&entity_name)?;
        let id = assigned.unwrap_or_else(Identifier::generate);
        let key = EntityKey::new(&entity_name, id.clone(), self.tenant());
        self.context.check_uniqueness(&key, instance)?;

        let version = descriptor.is_versioned().then_some(Value::Integer(0));
        let inst = self.instance_mut(instance)?;
        inst.set_id(Some(id));
        inst.set_version(version.clone());
        inst.mark_associated();
        let state = inst.values().to_vec();

        self.register_collections(instance, &state);
        self.context.add_entity(key.clone(), instance)?;
        self.context.add_entry(
            instance,
            EntityEntry::new(
                Status::Saving,
                state.clone(),
                key.clone(),
                version.clone(),
                LockMode::Write,
                false,
                Arc::clone(&descriptor),
            ),
        )?;
        if let Some(proxy) = self.context.get_proxy(&key) {
            if let Some(p) = self.proxies.get_mut(proxy.0) {
                p.initialize(ProxyTarget::Attached(instance))?;
            }
        }
        trace!(%key, "insert scheduled");
        self.actions.add_action(Action::EntityInsert(EntityInsertAction {
            instance,
            key,
            version,
            state,
            descriptor,
        }));
        Ok(())
    }

    /// Gives every collection in `state` without an entry a fresh one.
    fn register_collections(&mut self, owner: InstanceId, state: &[PropertyValue]) {
        for collection in state.iter().filter_map(PropertyValue::as_collection) {
            if self.context.get_collection_entry(collection).is_some() {
                continue;
            }
            if let Some(c) = self.collections.get_mut(collection.0) {
                c.set_owner(owner);
                self.context
                    .add_collection(collection, CollectionEntry::fresh(c.role()));
            }
        }
    }

    fn cascade_children(&self, instance: InstanceId, op: CascadeOp) -> CoreResult<Vec<InstanceId>> {
        let inst = self.instance_ref(instance)?;
        let descriptor = self.factory.metamodel().descriptor(inst.entity_name())?;
        Ok(cascade_targets(
            descriptor,
            inst.values(),
            op,
            &self.proxies,
            &self.collections,
        ))
    }

    /// Copies the state of a detached or transient instance onto a managed
    /// one and returns the managed instance.
    ///
    /// Associations mapped with merge are merged too; each source instance
    /// is copied once even if reached several times.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::StaleObjectState` if the source carries an older
    /// version than the managed copy.
    pub fn merge(&mut self, instance: InstanceId) -> CoreResult<InstanceId> {
        self.ensure_usable()?;
        let mut copies = HashMap::new();
        self.merge_one(instance, &mut copies)
    }

    fn merge_one(
        &mut self,
        source: InstanceId,
        copies: &mut HashMap<InstanceId, InstanceId>,
    ) -> CoreResult<InstanceId> {
        if let Some(&target) = copies.get(&source) {
            return Ok(target);
        }
        if self.context.get_entry(source).is_some() {
            copies.insert(source, source);
            for child in self.cascade_children(source, CascadeOp::Merge)? {
                self.merge_one(child, copies)?;
            }
            return Ok(source);
        }

        let (entity_name, id, version) = {
            let inst = self.instance_ref(source)?;
            (
                inst.entity_name().to_string(),
                inst.id().cloned(),
                inst.version().cloned(),
            )
        };
        let descriptor = self.descriptor(&entity_name)?;
        let target = match id {
            None => self.new_instance(&entity_name)?,
            Some(id) => {
                let key = EntityKey::new(&entity_name, id.clone(), self.tenant());
                if let Some(existing) = self.context.get_entity(&key) {
                    if self
                        .context
                        .get_entry(existing)
                        .is_some_and(|e| e.status().is_deleted_or_gone())
                    {
                        return Err(CoreError::invalid_operation(format!(
                            "deleted instance {key} passed to merge"
                        )));
                    }
                }
                match self.find(&entity_name, id.clone())? {
                    Some(managed) => {
                        let current = self.instance_ref(managed)?.version();
                        if descriptor.is_versioned() && version.is_some() && current != version.as_ref() {
                            self.factory.statistics().record_optimistic_failure();
                            return Err(CoreError::StaleObjectState { key });
                        }
                        managed
                    }
                    None => {
                        let fresh = self.new_instance(&entity_name)?;
                        self.instance_mut(fresh)?.set_id(Some(id));
                        fresh
                    }
                }
            }
        };
        copies.insert(source, target);
        self.copy_state(source, target, &descriptor, copies)?;
        if self.context.get_entry(target).is_none() {
            self.schedule_insert(target)?;
        }
        trace!(%source, %target, "merged");
        Ok(target)
    }

    fn copy_state(
        &mut self,
        source: InstanceId,
        target: InstanceId,
        descriptor: &EntityDescriptor,
        copies: &mut HashMap<InstanceId, InstanceId>,
    ) -> CoreResult<()> {
        let values = self.instance_ref(source)?.values().to_vec();
        for (index, (property, value)) in descriptor.properties().iter().zip(values).enumerate() {
            let copied = match (property.kind(), value) {
                (PropertyKind::ManyToOne { cascade, .. }, PropertyValue::Reference(Some(r))) => {
                    PropertyValue::Reference(Some(self.merge_reference(r, cascade.merge, copies)?))
                }
                (PropertyKind::Collection { cascade, role, .. }, PropertyValue::Collection(Some(c))) => {
                    let source_collection = self.collection(c)?;
                    if !source_collection.is_initialized() {
                        continue;
                    }
                    let elements = source_collection.elements().to_vec();
                    let mut merged = Vec::with_capacity(elements.len());
                    for element in elements {
                        merged.push(match element {
                            Element::Entity(r) => {
                                Element::Entity(self.merge_reference(r, cascade.merge, copies)?)
                            }
                            basic @ Element::Basic(_) => basic,
                        });
                    }
                    let existing = self.instance_ref(target)?.values()[index].as_collection();
                    let handle = match existing {
                        Some(handle) => {
                            self.initialize_collection(handle)?;
                            handle
                        }
                        None => {
                            let handle = CollectionId(self.collections.len());
                            self.collections
                                .push(PersistentCollection::new(role.clone(), target));
                            handle
                        }
                    };
                    self.collection_mut(handle)?.initialize(merged);
                    PropertyValue::Collection(Some(handle))
                }
                (_, value) => value,
            };
            self.instance_mut(target)?.values_mut()[index] = copied;
        }
        Ok(())
    }

    fn merge_reference(
        &mut self,
        reference: Reference,
        cascade: bool,
        copies: &mut HashMap<InstanceId, InstanceId>,
    ) -> CoreResult<Reference> {
        let Reference::Instance(instance) = reference else {
            return Ok(reference);
        };
        if cascade {
            return self.merge_one(instance, copies).map(Reference::Instance);
        }
        if self.context.get_entry(instance).is_some() {
            return Ok(reference);
        }
        if let Some(&copy) = copies.get(&instance) {
            return Ok(Reference::Instance(copy));
        }
        let inst = self.instance_ref(instance)?;
        match inst.id().cloned() {
            Some(id) => {
                let entity_name = inst.entity_name().to_string();
                self.get_reference(&entity_name, id)
            }
            None => Ok(reference),
        }
    }

    /// Schedules the deletion of a managed instance, cascading along
    /// associations mapped with remove.
    ///
    /// Removing an instance whose insert is still pending cancels the
    /// insert instead.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::TransientObject` if the instance is not managed.
    pub fn remove(&mut self, instance: InstanceId) -> CoreResult<()> {
        self.ensure_usable()?;
        if self.context.get_entry(instance).is_none() {
            return Err(CoreError::transient_object(format!(
                "cannot remove unmanaged instance {instance}"
            )));
        }
        let mut walk = CascadeWalk::new(instance);
        while let Some(next) = walk.next_instance() {
            let children = self.cascade_children(next, CascadeOp::Remove)?;
            self.remove_one(next)?;
            walk.push_children(children);
        }
        Ok(())
    }

    fn remove_one(&mut self, instance: InstanceId) -> CoreResult<()> {
        let Some(status) = self.context.get_entry(instance).map(EntityEntry::status) else {
            return Ok(());
        };
        match status {
            Status::Deleted | Status::Gone => Ok(()),
            Status::Saving => {
                self.actions.remove_insertion(instance);
                if let Some(entry) = self.context.remove_entry(instance) {
                    self.context.remove_entity(entry.key());
                    trace!(key = %entry.key(), "pending insert cancelled");
                }
                let state = self.instance_ref(instance)?.values().to_vec();
                for collection in state.iter().filter_map(PropertyValue::as_collection) {
                    self.context.remove_collection(collection);
                }
                Ok(())
            }
            Status::Managed | Status::ReadOnly => {
                let state = self.instance_ref(instance)?.values().to_vec();
                let entry = self.context.entry_mut(instance)?;
                entry.set_status(Status::Deleted)?;
                entry.set_deleted_state(Some(state.clone()));
                let action = EntityDeleteAction {
                    instance,
                    key: entry.key().clone(),
                    version: entry.version().cloned(),
                    state,
                    descriptor: Arc::clone(entry.descriptor()),
                };
                trace!(key = %action.key, "delete scheduled");
                self.actions.add_action(Action::EntityDelete(action));
                Ok(())
            }
        }
    }

    /// Reloads a managed instance from the database, cascading along
    /// associations mapped with refresh. The second-level cache is bypassed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ObjectNotFound` if the row is gone.
    pub fn refresh(&mut self, instance: InstanceId) -> CoreResult<()> {
        self.ensure_usable()?;
        if self.context.get_entry(instance).is_none() {
            return Err(CoreError::transient_object(format!(
                "cannot refresh unmanaged instance {instance}"
            )));
        }
        let mut walk = CascadeWalk::new(instance);
        while let Some(next) = walk.next_instance() {
            if self.context.get_entry(next).is_some() {
                self.refresh_one(next)?;
            }
            walk.push_children(self.cascade_children(next, CascadeOp::Refresh)?);
        }
        Ok(())
    }

    fn refresh_one(&mut self, instance: InstanceId) -> CoreResult<()> {
        let entry = self.context.entry_mut(instance)?;
        match entry.status() {
            Status::Saving => {
                return Err(CoreError::invalid_operation(format!(
                    "cannot refresh {} before it is inserted",
                    entry.key()
                )))
            }
            Status::Deleted | Status::Gone => {
                return Err(CoreError::invalid_operation(format!(
                    "cannot refresh deleted {}",
                    entry.key()
                )))
            }
            Status::Managed | Status::ReadOnly => {}
        }
        let key = entry.key().clone();
        let descriptor = Arc::clone(entry.descriptor());
        let row = self
            .connection
            .load(key.entity_name(), key.id())?
            .ok_or_else(|| CoreError::ObjectNotFound { key: key.clone() })?;
        self.factory.statistics().record_entity_load();

        let stale: Vec<CollectionId> = self
            .instance_ref(instance)?
            .values()
            .iter()
            .filter_map(PropertyValue::as_collection)
            .collect();
        for collection in stale {
            self.context.remove_collection(collection);
        }
        let values = self.hydrate(&descriptor, instance, &row)?;
        let inst = self.instance_mut(instance)?;
        *inst.values_mut() = values.clone();
        inst.set_version(row.version.clone());
        let entry = self.context.entry_mut(instance)?;
        entry.set_loaded_state(values)?;
        entry.set_version(row.version);
        debug!(%key, "refreshed");
        Ok(())
    }

    /// Acquires a lock on a managed instance, cascading along associations
    /// mapped with lock.
    ///
    /// `Read` and `Optimistic` verify the version; pessimistic modes lock
    /// the row; force-increment modes bump the version at once.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::StaleObjectState` if the row changed since it was
    /// read, and `CoreError::InvalidOperation` for force-increment on an
    /// unversioned entity.
    pub fn lock(&mut self, instance: InstanceId, mode: LockMode) -> CoreResult<()> {
        self.ensure_usable()?;
        if self.context.get_entry(instance).is_none() {
            return Err(CoreError::transient_object(format!(
                "cannot lock unmanaged instance {instance}"
            )));
        }
        let mut walk = CascadeWalk::new(instance);
        while let Some(next) = walk.next_instance() {
            if self.context.get_entry(next).is_some() {
                self.lock_one(next, mode)?;
            }
            walk.push_children(self.cascade_children(next, CascadeOp::Lock)?);
        }
        Ok(())
    }

    fn lock_one(&mut self, instance: InstanceId, mode: LockMode) -> CoreResult<()> {
        let entry = self.context.entry_mut(instance)?;
        if !matches!(entry.status(), Status::Managed | Status::ReadOnly) {
            return Err(CoreError::invalid_operation(format!(
                "cannot lock {} entity {}",
                entry.status(),
                entry.key()
            )));
        }
        if mode == LockMode::None || entry.lock_mode() >= mode {
            return Ok(());
        }
        let key = entry.key().clone();
        let version = entry.version().cloned();
        let versioned = entry.descriptor().is_versioned();
        if mode.is_force_increment() && !versioned {
            return Err(CoreError::invalid_operation(format!(
                "{key} is not versioned and cannot be locked with {mode:?}"
            )));
        }

        if mode.is_force_increment() {
            let next = next_version(&key, version.as_ref())?;
            let lock = match self.cache_access(key.entity_name()) {
                Some(access) => {
                    let cache_key = key.cache_key();
                    let lock = access.lock_item(&cache_key, version.as_ref())?;
                    self.completions.register(
                        format!("unlock {key}"),
                        Box::new(move |_| access.unlock_item(&cache_key, lock)),
                    );
                    lock
                }
                None => None,
            };
            trace!(%key, ?lock, "version force-incremented");
            let statement = Statement::Update {
                table: key.entity_name().to_string(),
                id: key.id().clone(),
                expected_version: version,
                version: Some(next.clone()),
                columns: Vec::new(),
            };
            self.execute_statements(&[statement], &[Some(key.clone())])?;
            self.instance_mut(instance)?.set_version(Some(next.clone()));
            self.context.entry_mut(instance)?.set_version(Some(next));
        } else if mode.is_pessimistic() {
            let statement = Statement::Lock {
                table: key.entity_name().to_string(),
                id: key.id().clone(),
                expected_version: version,
            };
            self.execute_statements(&[statement], &[Some(key.clone())])?;
        } else if versioned {
            let current = self
                .connection
                .load(key.entity_name(), key.id())?
                .ok_or_else(|| CoreError::ObjectNotFound { key: key.clone() })?;
            if current.version != version {
                self.factory.statistics().record_optimistic_failure();
                return Err(CoreError::StaleObjectState { key });
            }
        }
        self.context.entry_mut(instance)?.set_lock_mode(mode);
        Ok(())
    }

    /// Detaches an instance: it is no longer managed and none of its
    /// pending writes will execute.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::SessionClosed` if the session is closed.
    pub fn evict(&mut self, instance: InstanceId) -> CoreResult<()> {
        self.ensure_open()?;
        let Some(entry) = self.context.remove_entry(instance) else {
            return Ok(());
        };
        self.context.remove_entity(entry.key());
        self.context.remove_proxy(entry.key());
        if let Some(inst) = self.instances.get(instance.0) {
            for collection in inst.values().iter().filter_map(PropertyValue::as_collection) {
                self.context.remove_collection(collection);
            }
        }
        self.actions.remove_insertion(instance);
        self.actions.unschedule_deletion(instance);
        trace!(key = %entry.key(), "evicted");
        Ok(())
    }

    /// Detaches every instance and discards every pending write.
    pub fn clear(&mut self) {
        self.context.clear();
        self.actions.clear();
    }

    /// Returns whether the instance is managed and not scheduled for
    /// deletion.
    #[must_use]
    pub fn contains(&self, instance: InstanceId) -> bool {
        self.context
            .get_entry(instance)
            .is_some_and(|e| !e.status().is_deleted_or_gone())
    }

    /// Returns the entry of a managed instance.
    #[must_use]
    pub fn entry(&self, instance: InstanceId) -> Option<&EntityEntry> {
        self.context.get_entry(instance)
    }

    /// Makes a managed instance read-only or modifiable.
    ///
    /// Changes made while read-only are never flushed, including after the
    /// instance becomes modifiable again.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::TransientObject` if the instance is not managed.
    pub fn set_read_only(&mut self, instance: InstanceId, read_only: bool) -> CoreResult<()> {
        self.ensure_usable()?;
        let was_read_only = self.context.is_read_only(instance)?;
        self.context.set_read_only(instance, read_only)?;
        if was_read_only && !read_only {
            let current = self.instance_ref(instance)?.values().to_vec();
            self.context.entry_mut(instance)?.set_loaded_state(current)?;
        }
        Ok(())
    }

    /// Returns whether a managed instance is read-only.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::TransientObject` if the instance is not managed.
    pub fn is_read_only(&self, instance: InstanceId) -> CoreResult<bool> {
        self.context.is_read_only(instance)
    }

    /// Sets whether instances loaded from now on start out read-only.
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.context.set_default_read_only(read_only);
    }

    /// Returns whether loaded instances start out read-only.
    #[must_use]
    pub const fn is_default_read_only(&self) -> bool {
        self.context.is_default_read_only()
    }

    // === Transactions ===

    /// Flushes and commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns the flush error, or a storage error if the commit fails. In
    /// both cases the session must be rolled back before further use.
    pub fn commit(&mut self) -> CoreResult<FlushSummary> {
        self.ensure_usable()?;
        let summary = self.flush()?;
        if let Err(e) = self.connection.commit() {
            self.state = SessionState::Failed;
            self.after_transaction_completion(false, false);
            return Err(e.into());
        }
        self.factory.statistics().record_commit();
        self.after_transaction_completion(true, false);
        self.tx_timestamp = self.factory.timestamper().next();
        debug!(session = %self.id, executed = summary.len(), "committed");
        Ok(summary)
    }

    /// Rolls the transaction back.
    ///
    /// Every instance is detached and pending writes are discarded. Proxies
    /// stay with the session but load again on next access. A session that
    /// failed to flush becomes usable again.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the connection fails to roll back.
    pub fn rollback(&mut self) -> CoreResult<()> {
        self.ensure_open()?;
        let result = self.connection.rollback();
        self.after_transaction_completion(false, false);
        self.context.clear();
        self.actions.clear();
        self.reset_proxies(Some(self.id));
        self.state = SessionState::Open;
        self.tx_timestamp = self.factory.timestamper().next();
        self.factory.statistics().record_rollback();
        debug!(session = %self.id, "rolled back");
        result.map_err(CoreError::from)
    }

    /// Runs the continuations registered during the transaction.
    ///
    /// With `delayed` set, only the continuations run; lock modes held by
    /// the persistence context are kept until a later, non-delayed call.
    pub fn after_transaction_completion(&mut self, successful: bool, delayed: bool) {
        let ran = self.completions.len();
        let failures = self.completions.run(successful);
        if !delayed {
            self.context.after_transaction_completion();
        }
        if ran > 0 {
            debug!(session = %self.id, successful, ran, failures, "after-completion actions ran");
        }
    }

    /// Closes the session, rolling back uncommitted work.
    ///
    /// Proxies issued by the session are detached; initializing one
    /// afterwards fails. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the rollback fails; the session is closed
    /// regardless.
    pub fn close(&mut self) -> CoreResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.release().map_err(CoreError::from)
    }

    fn release(&mut self) -> Result<(), hibernia_storage::StorageError> {
        if !self.completions.is_empty() {
            self.completions.run(false);
        }
        let result = self.connection.rollback();
        self.context.clear();
        self.actions.clear();
        self.reset_proxies(None);
        self.state = SessionState::Closed;
        self.factory.statistics().record_session_close();
        debug!(session = %self.id, "session closed");
        result
    }

    /// Drops the instances proxies delegate to after the context was
    /// cleared. Proxies kept by an open session are registered again, first
    /// handle per key winning.
    fn reset_proxies(&mut self, session: Option<SessionId>) {
        let tenant = self.tenant();
        for (index, proxy) in self.proxies.iter_mut().enumerate() {
            proxy.reset();
            proxy.set_session(session);
            if session.is_some() {
                self.context.add_proxy(proxy.entity_key(tenant.clone()), ProxyId(index));
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            if let Err(e) = self.release() {
                warn!(session = %self.id, error = %e, "rollback on drop failed");
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("factory", &self.factory.name())
            .field("state", &self.state)
            .field("instances", &self.instances.len())
            .field("proxies", &self.proxies.len())
            .field("managed", &self.context.entry_count())
            .field("queued", &self.actions.len())
            .finish_non_exhaustive()
    }
}

/// Returns the version following `current`. Unversioned rows start at 0.
fn next_version(key: &EntityKey, current: Option<&Value>) -> CoreResult<Value> {
    match current.and_then(Value::as_integer) {
        Some(v) => v
            .checked_add(1)
            .map(Value::Integer)
            .ok_or_else(|| CoreError::VersionOverflow { key: key.clone() }),
        None => Ok(Value::Integer(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{CascadeStyle, Metamodel};
    use hibernia_cache::AccessType;
    use hibernia_storage::InMemoryBackend;

    fn factory(backend: InMemoryBackend) -> SessionFactory {
        let metamodel = Metamodel::builder()
            .entity(
                EntityDescriptor::builder("Author")
                    .basic("name")
                    .versioned()
                    .cached(AccessType::ReadWrite)
                    .build(),
            )
            .entity(
                EntityDescriptor::builder("Book")
                    .basic("title")
                    .many_to_one("author", "Author", false, CascadeStyle::ALL)
                    .element_collection("tags")
                    .build(),
            )
            .build()
            .unwrap();
        SessionFactory::builder(metamodel, backend).build().unwrap()
    }

    fn book(session: &mut Session, id: i64, title: &str) -> (InstanceId, InstanceId) {
        let author = session.new_instance("Author").unwrap();
        session.set_identifier(author, id).unwrap();
        session.set(author, "name", "Le Guin").unwrap();
        let book = session.new_instance("Book").unwrap();
        session.set_identifier(book, id).unwrap();
        session.set(book, "title", title).unwrap();
        session.set(book, "author", author).unwrap();
        (book, author)
    }

    #[test]
    fn new_instances_start_empty() {
        let factory = factory(InMemoryBackend::new());
        let mut session = factory.open_session().unwrap();
        let b = session.new_instance("Book").unwrap();
        assert_eq!(session.get(b, "title").unwrap(), &PropertyValue::Basic(Value::Null));
        assert_eq!(session.reference(b, "author").unwrap(), None);
        let tags = session.get(b, "tags").unwrap().as_collection().unwrap();
        assert!(session.collection(tags).unwrap().is_initialized());
        assert!(session.identifier(b).is_none());
        assert!(!session.contains(b));
    }

    #[test]
    fn set_validates_the_mapping() {
        let factory = factory(InMemoryBackend::new());
        let mut session = factory.open_session().unwrap();
        let b = session.new_instance("Book").unwrap();
        let other = session.new_instance("Book").unwrap();
        assert!(matches!(
            session.set(b, "author", other),
            Err(CoreError::PropertyValue { .. })
        ));
        assert!(matches!(
            session.set(b, "title", other),
            Err(CoreError::PropertyValue { .. })
        ));
        assert!(matches!(
            session.set(b, "nope", "x"),
            Err(CoreError::UnknownProperty { .. })
        ));
    }

    #[test]
    fn persist_cascades_and_assigns_versions() {
        let factory = factory(InMemoryBackend::new());
        let mut session = factory.open_session().unwrap();
        let (b, a) = book(&mut session, 1, "Earthsea");
        session.persist(b).unwrap();
        assert!(session.contains(a));
        assert_eq!(session.entry(b).unwrap().status(), Status::Saving);
        assert_eq!(session.instance(a).unwrap().version(), Some(&Value::Integer(0)));
        assert_eq!(session.action_queue().insertions().len(), 2);
    }

    #[test]
    fn persist_generates_missing_identifiers() {
        let factory = factory(InMemoryBackend::new());
        let mut session = factory.open_session().unwrap();
        let a = session.new_instance("Author").unwrap();
        session.persist(a).unwrap();
        assert!(session.identifier(a).is_some());
        assert!(matches!(session.set_identifier(a, 9), Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let factory = factory(InMemoryBackend::new());
        let mut session = factory.open_session().unwrap();
        let first = session.new_instance("Author").unwrap();
        session.set_identifier(first, 1).unwrap();
        session.persist(first).unwrap();
        let second = session.new_instance("Author").unwrap();
        session.set_identifier(second, 1).unwrap();
        assert!(matches!(
            session.persist(second),
            Err(CoreError::NonUniqueObject { .. })
        ));
    }

    #[test]
    fn removing_a_pending_insert_cancels_it() {
        let factory = factory(InMemoryBackend::new());
        let mut session = factory.open_session().unwrap();
        let (b, a) = book(&mut session, 1, "Tehanu");
        session.persist(b).unwrap();
        session.remove(b).unwrap();
        assert!(!session.contains(b));
        assert!(!session.contains(a));
        assert!(session.action_queue().is_empty());
    }

    #[test]
    fn persist_after_remove_unschedules_the_delete() {
        let factory = factory(InMemoryBackend::new());
        let mut session = factory.open_session().unwrap();
        let a = session.new_instance("Author").unwrap();
        session.set_identifier(a, 1).unwrap();
        session.persist(a).unwrap();
        session.commit().unwrap();

        session.remove(a).unwrap();
        assert_eq!(session.action_queue().deletions().len(), 1);
        session.persist(a).unwrap();
        assert!(session.action_queue().deletions().is_empty());
        assert_eq!(session.entry(a).unwrap().status(), Status::Managed);
    }

    #[test]
    fn merge_copies_onto_the_managed_instance() {
        let backend = InMemoryBackend::new();
        let factory = factory(backend);
        let mut session = factory.open_session().unwrap();
        let a = session.new_instance("Author").unwrap();
        session.set_identifier(a, 1).unwrap();
        session.set(a, "name", "Ursula").unwrap();
        session.persist(a).unwrap();
        session.commit().unwrap();

        let detached = session.new_instance("Author").unwrap();
        session.set_identifier(detached, 1).unwrap();
        session.set(detached, "name", "U. K. Le Guin").unwrap();
        session.instance_mut(detached).unwrap().set_version(Some(Value::Integer(0)));
        let merged = session.merge(detached).unwrap();
        assert_eq!(merged, a);
        assert_eq!(
            session.get(a, "name").unwrap(),
            &PropertyValue::from("U. K. Le Guin")
        );

        session.instance_mut(detached).unwrap().set_version(Some(Value::Integer(7)));
        assert!(matches!(
            session.merge(detached),
            Err(CoreError::StaleObjectState { .. })
        ));
    }

    #[test]
    fn merging_a_transient_graph_persists_a_copy() {
        let factory = factory(InMemoryBackend::new());
        let mut session = factory.open_session().unwrap();
        let (b, _) = book(&mut session, 4, "Lavinia");
        let merged = session.merge(b).unwrap();
        assert_ne!(merged, b);
        assert!(session.contains(merged));
        assert!(!session.contains(b));
        let author = session.reference(merged, "author").unwrap();
        assert!(matches!(author, Some(Reference::Instance(i)) if session.contains(i)));
    }

    #[test]
    fn closed_sessions_reject_work() {
        let factory = factory(InMemoryBackend::new());
        let mut session = factory.open_session().unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert!(!session.is_open());
        assert!(matches!(session.new_instance("Author"), Err(CoreError::SessionClosed)));
        assert_eq!(factory.statistics().sessions_closed(), 1);
    }

    #[test]
    fn next_version_increments_integers() {
        let key = EntityKey::new("Author", Identifier::from(1), None);
        assert_eq!(next_version(&key, Some(&Value::Integer(3))).unwrap(), Value::Integer(4));
        assert_eq!(next_version(&key, None).unwrap(), Value::Integer(0));
        assert!(matches!(
            next_version(&key, Some(&Value::Integer(i64::MAX))),
            Err(CoreError::VersionOverflow { .. })
        ));
    }

    #[test]
    fn exhausted_versions_fail_the_flush() {
        let backend = InMemoryBackend::new();
        backend
            .apply_committed(&Statement::Insert {
                table: "Author".into(),
                id: Identifier::from(1),
                version: Some(Value::Integer(i64::MAX)),
                columns: vec![(
                    "name".into(),
                    hibernia_storage::ColumnValue::Basic(Value::from("Le Guin")),
                )],
            })
            .unwrap();
        let factory = factory(backend.clone());
        let mut session = factory.open_session().unwrap();
        let author = session.load("Author", 1).unwrap();
        session.set(author, "name", "Ursula").unwrap();

        let err = session.commit().unwrap_err();
        assert_eq!(
            err.to_string(),
            "version of [Author#1] cannot be incremented past its maximum"
        );
        assert!(matches!(session.flush(), Err(CoreError::SessionUnusable)));
        session.rollback().unwrap();
        let row = backend.row("Author", &Identifier::from(1)).unwrap();
        assert_eq!(row.version, Some(Value::Integer(i64::MAX)));
    }
}
