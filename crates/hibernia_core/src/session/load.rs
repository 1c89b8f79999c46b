//! Loading entities, proxies and collections.

use super::{Session, SessionState};
use crate::context::{CollectionEntry, EntityEntry};
use crate::error::{CoreError, CoreResult};
use crate::instance::{Element, EntityInstance, PersistentCollection, PropertyValue, Reference};
use crate::metadata::{EntityDescriptor, PropertyKind};
use crate::proxy::{EntitySnapshot, LazyInitializer, ProxyTarget};
use crate::types::{CollectionId, CollectionKey, EntityKey, InstanceId, LockMode, ProxyId, Status};
use hibernia_cache::{CacheEntry, EntityAccessStrategy};
use hibernia_codec::{Identifier, Value};
use hibernia_storage::{ColumnValue, Row};
use std::sync::Arc;
use tracing::trace;

impl Session {
    /// Returns the managed instance with the given identifier, loading it
    /// if needed. Returns `None` if no row exists or the instance is
    /// scheduled for deletion.
    ///
    /// The persistence context is consulted first, then the second-level
    /// cache, then the database.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnknownEntity` for an unmapped name, or a storage
    /// or cache error.
    pub fn find(&mut self, entity_name: &str, id: impl Into<Identifier>) -> CoreResult<Option<InstanceId>> {
        self.ensure_usable()?;
        let descriptor = self.descriptor(entity_name)?;
        let id = id.into();
        let key = EntityKey::new(entity_name, id.clone(), self.tenant());
        if let Some(instance) = self.context.get_entity(&key) {
            let deleted = self
                .context
                .get_entry(instance)
                .is_some_and(|e| e.status().is_deleted_or_gone());
            return Ok((!deleted).then_some(instance));
        }
        self.load_entity(&descriptor, id)
    }

    /// Like [`find`](Self::find), but a missing row is an error.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ObjectNotFound` if no row exists.
    pub fn load(&mut self, entity_name: &str, id: impl Into<Identifier>) -> CoreResult<InstanceId> {
        let id = id.into();
        let key = EntityKey::new(entity_name, id.clone(), self.tenant());
        self.find(entity_name, id)?
            .ok_or(CoreError::ObjectNotFound { key })
    }

    /// Returns a reference to an entity without loading it.
    ///
    /// A managed instance is returned as is; otherwise the session's proxy
    /// for the key is returned, created on first request.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::UnknownEntity` for an unmapped name.
    pub fn get_reference(&mut self, entity_name: &str, id: impl Into<Identifier>) -> CoreResult<Reference> {
        self.ensure_usable()?;
        let descriptor = self.descriptor(entity_name)?;
        let id = id.into();
        let key = EntityKey::new(entity_name, id.clone(), self.tenant());
        if let Some(instance) = self.context.get_entity(&key) {
            return Ok(Reference::Instance(instance));
        }
        if let Some(proxy) = self.context.get_proxy(&key) {
            return Ok(Reference::Proxy(proxy));
        }
        Ok(Reference::Proxy(self.create_proxy(&descriptor, id)))
    }

    fn create_proxy(&mut self, descriptor: &EntityDescriptor, id: Identifier) -> ProxyId {
        let mut proxy = LazyInitializer::new(
            descriptor.name(),
            descriptor.identifier_name(),
            id,
            self.id,
            self.factory.uuid(),
            self.factory.name(),
            self.factory.config().lazy_load_outside_transaction,
        );
        proxy.set_read_only(self.context.is_default_read_only());
        let key = proxy.entity_key(self.tenant());
        let handle = ProxyId(self.proxies.len());
        self.proxies.push(proxy);
        trace!(%key, "proxy created");
        self.context.add_proxy(key, handle)
    }

    /// Returns a proxy.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidOperation` for a handle of another session.
    pub fn proxy(&self, proxy: ProxyId) -> CoreResult<&LazyInitializer> {
        self.proxies
            .get(proxy.0)
            .ok_or_else(|| CoreError::invalid_operation(format!("{proxy} is not a proxy of this session")))
    }

    /// Initializes a proxy and returns the instance it delegates to.
    /// Initializing twice returns the same instance without loading.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LazyInitialization` if the session is closed and
    /// `CoreError::ObjectNotFound` if the row is gone.
    pub fn initialize_proxy(&mut self, proxy: ProxyId) -> CoreResult<InstanceId> {
        let initializer = self.proxy(proxy)?;
        if let Some(instance) = initializer.attached_instance() {
            return Ok(instance);
        }
        if self.state == SessionState::Closed || initializer.session() != Some(self.id) {
            return Err(CoreError::lazy_initialization(format!(
                "could not initialize proxy {} - no session",
                initializer.entity_key(None)
            )));
        }
        self.ensure_usable()?;
        let entity_name = initializer.entity_name().to_string();
        let id = initializer.identifier().clone();
        let key = EntityKey::new(&entity_name, id.clone(), self.tenant());
        let instance = match self.context.get_entity(&key) {
            Some(instance) => instance,
            None => {
                let descriptor = self.descriptor(&entity_name)?;
                let instance = self
                    .load_entity(&descriptor, id)?
                    .ok_or_else(|| CoreError::ObjectNotFound { key: key.clone() })?;
                self.factory.statistics().record_proxy_fetch();
                instance
            }
        };
        if let Some(p) = self.proxies.get_mut(proxy.0) {
            p.initialize(ProxyTarget::Attached(instance))?;
        }
        trace!(%key, %instance, "proxy initialized");
        Ok(instance)
    }

    /// Reads a property through a proxy. The identifier property never
    /// initializes the proxy; every other property does.
    ///
    /// # Errors
    ///
    /// Returns the initialization error, or `CoreError::UnknownProperty`.
    pub fn proxy_property(&mut self, proxy: ProxyId, property: &str) -> CoreResult<PropertyValue> {
        let initializer = self.proxy(proxy)?;
        if property == initializer.identifier_name() {
            return Ok(PropertyValue::Basic(Value::from(initializer.identifier().clone())));
        }
        let instance = self.initialize_proxy(proxy)?;
        self.get(instance, property).cloned()
    }

    /// Returns the instance behind a reference, initializing a proxy if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns the initialization error.
    pub fn unproxy(&mut self, reference: Reference) -> CoreResult<InstanceId> {
        match reference {
            Reference::Instance(instance) => Ok(instance),
            Reference::Proxy(proxy) => self.initialize_proxy(proxy),
        }
    }

    /// Returns a copy of a proxy unbound from this session.
    ///
    /// An initialized proxy carries the column state of its instance; an
    /// uninitialized one can only load later if the factory allows loading
    /// outside a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidOperation` for a handle of another session.
    pub fn detach_proxy(&self, proxy: ProxyId) -> CoreResult<LazyInitializer> {
        let initializer = self.proxy(proxy)?;
        let snapshot = match initializer.attached_instance() {
            Some(instance) => Some(self.snapshot(instance)?),
            None => None,
        };
        Ok(initializer.detached_copy(snapshot))
    }

    /// Binds a detached proxy to this session and returns its handle. If
    /// the session already has a proxy for the key, that one is returned.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidOperation` if the proxy is still bound to
    /// a session or was created by another factory.
    pub fn reassociate_proxy(&mut self, detached: &LazyInitializer) -> CoreResult<ProxyId> {
        self.ensure_usable()?;
        let key = detached.entity_key(self.tenant());
        if detached.session().is_some() {
            return Err(CoreError::invalid_operation(format!(
                "proxy {key} is still bound to a session"
            )));
        }
        if detached.factory_uuid() != self.factory.uuid() {
            return Err(CoreError::invalid_operation(format!(
                "proxy {key} was created by another session factory"
            )));
        }
        if let Some(existing) = self.context.get_proxy(&key) {
            return Ok(existing);
        }
        let descriptor = self.descriptor(detached.entity_name())?;
        let handle = self.create_proxy(&descriptor, detached.identifier().clone());
        if let Some(p) = self.proxies.get_mut(handle.0) {
            p.set_read_only(detached.is_read_only());
        }
        if let Some(instance) = self.context.get_entity(&key) {
            if let Some(p) = self.proxies.get_mut(handle.0) {
                p.initialize(ProxyTarget::Attached(instance))?;
            }
        }
        Ok(handle)
    }

    /// Captures the column state of an instance.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::TransientObject` if the instance has no
    /// identifier or references one without.
    pub fn snapshot(&self, instance: InstanceId) -> CoreResult<EntitySnapshot> {
        let inst = self.instance_ref(instance)?;
        let id = inst.id().cloned().ok_or_else(|| {
            CoreError::transient_object(format!("{instance} has no identifier"))
        })?;
        let descriptor = self.factory.metamodel().descriptor(inst.entity_name())?;
        Ok(EntitySnapshot {
            entity_name: inst.entity_name().to_string(),
            id,
            version: inst.version().cloned(),
            columns: self.bind_all(descriptor, inst.values())?,
        })
    }

    // === Collections ===

    /// Returns a collection. Never loads.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidOperation` for a handle of another session.
    pub fn collection(&self, collection: CollectionId) -> CoreResult<&PersistentCollection> {
        self.collections.get(collection.0).ok_or_else(|| {
            CoreError::invalid_operation(format!("{collection} is not a collection of this session"))
        })
    }

    /// Returns the elements of a collection, loading them on first access.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LazyInitialization` if the collection is not
    /// loaded and the session is closed.
    pub fn elements(&mut self, collection: CollectionId) -> CoreResult<&[Element]> {
        self.initialize_collection(collection)?;
        Ok(self.collection(collection)?.elements())
    }

    pub(super) fn initialize_collection(&mut self, collection: CollectionId) -> CoreResult<()> {
        let c = self.collection(collection)?;
        if c.is_initialized() {
            return Ok(());
        }
        if self.state == SessionState::Closed {
            return Err(CoreError::lazy_initialization(format!(
                "failed to lazily initialize a collection of role {} - no session",
                c.role()
            )));
        }
        self.ensure_usable()?;
        let role = c.role().to_string();
        let owner = self
            .instance_ref(c.owner())?
            .id()
            .cloned()
            .ok_or_else(|| CoreError::transient_object(format!("owner of {role} has no identifier")))?;

        let rows = self.connection.load_collection(&role, &owner)?;
        self.factory.statistics().record_collection_load();
        let mut elements = Vec::with_capacity(rows.len());
        for row in rows {
            match row {
                ColumnValue::Basic(value) => elements.push(Element::Basic(value)),
                ColumnValue::Reference { table, id: Some(id) } => {
                    elements.push(Element::Entity(self.resolve_reference(&table, id)?));
                }
                ColumnValue::Reference { id: None, .. } => {}
            }
        }
        trace!(%role, %owner, elements = elements.len(), "collection loaded");
        if let Some(entry) = self.context.collection_entry_mut(collection) {
            entry.post_initialize(elements.clone());
        }
        if let Some(c) = self.collections.get_mut(collection.0) {
            c.initialize(elements);
        }
        Ok(())
    }

    // === Load path ===

    fn load_entity(&mut self, descriptor: &Arc<EntityDescriptor>, id: Identifier) -> CoreResult<Option<InstanceId>> {
        let key = EntityKey::new(descriptor.name(), id.clone(), self.tenant());
        let cache_key = key.cache_key();
        let access = self.cache_access(descriptor.name());

        if let Some(access) = &access {
            if let Some(entry) = access.get(&cache_key, self.tx_timestamp)? {
                self.factory.statistics().record_cache_hit();
                trace!(%key, "second-level cache hit");
                let row = Row {
                    id,
                    version: entry.version().cloned(),
                    columns: entry.assemble()?,
                };
                return self.assemble(descriptor, &row).map(Some);
            }
            self.factory.statistics().record_cache_miss();
            access.register_pending_put(&cache_key, self.load_owner);
        }

        let Some(row) = self.connection.load(descriptor.name(), &id)? else {
            trace!(%key, "no row");
            return Ok(None);
        };
        self.factory.statistics().record_entity_load();

        if let Some(access) = &access {
            let entry = CacheEntry::disassemble(&row.columns, row.version.clone())?;
            let minimal_put = self.factory.config().minimal_puts;
            if access.put_from_load(&cache_key, entry, self.tx_timestamp, self.load_owner, minimal_put)? {
                self.factory.statistics().record_cache_put();
            }
        }
        self.assemble(descriptor, &row).map(Some)
    }

    pub(super) fn cache_access(&self, entity_name: &str) -> Option<Arc<dyn EntityAccessStrategy>> {
        if !self.factory.config().second_level_cache {
            return None;
        }
        self.factory.access_strategy(entity_name).cloned()
    }

    /// Turns a row into a managed instance.
    ///
    /// The instance is registered before its references are resolved, so
    /// rows referencing each other resolve to the same instances.
    fn assemble(&mut self, descriptor: &Arc<EntityDescriptor>, row: &Row) -> CoreResult<InstanceId> {
        let key = EntityKey::new(descriptor.name(), row.id.clone(), self.tenant());
        let instance = InstanceId(self.instances.len());
        let mut inst = EntityInstance::new(descriptor.name(), Vec::new());
        inst.set_id(Some(row.id.clone()));
        inst.set_version(row.version.clone());
        inst.mark_associated();
        self.instances.push(inst);

        let proxy = self.context.get_proxy(&key);
        let read_only = self.context.is_default_read_only()
            || !descriptor.is_mutable()
            || proxy.is_some_and(|p| self.proxies.get(p.0).is_some_and(LazyInitializer::is_read_only));
        let status = if read_only { Status::ReadOnly } else { Status::Managed };
        self.context.add_entity(key.clone(), instance)?;
        self.context.add_entry(
            instance,
            EntityEntry::new(
                status,
                Vec::new(),
                key.clone(),
                row.version.clone(),
                LockMode::Read,
                true,
                Arc::clone(descriptor),
            ),
        )?;

        let values = self.hydrate(descriptor, instance, row)?;
        *self.instance_mut(instance)?.values_mut() = values.clone();
        self.context.entry_mut(instance)?.set_loaded_state(values)?;
        if let Some(p) = proxy.and_then(|p| self.proxies.get_mut(p.0)) {
            if p.is_uninitialized() {
                p.initialize(ProxyTarget::Attached(instance))?;
            }
        }
        trace!(%key, %instance, ?status, "assembled");
        Ok(instance)
    }

    /// Converts the columns of a row into property values. Collections
    /// become new uninitialized collections owned by `owner`.
    pub(super) fn hydrate(
        &mut self,
        descriptor: &EntityDescriptor,
        owner: InstanceId,
        row: &Row,
    ) -> CoreResult<Vec<PropertyValue>> {
        let mut values = Vec::with_capacity(descriptor.properties().len());
        for property in descriptor.properties() {
            let value = match property.kind() {
                PropertyKind::Basic => PropertyValue::Basic(match row.column(property.name()) {
                    Some(ColumnValue::Basic(value)) => value.clone(),
                    _ => Value::Null,
                }),
                PropertyKind::ManyToOne { target, .. } => {
                    match row.column(property.name()).and_then(ColumnValue::referenced) {
                        Some((_, id)) => {
                            PropertyValue::Reference(Some(self.resolve_reference(target, id.clone())?))
                        }
                        None => PropertyValue::Reference(None),
                    }
                }
                PropertyKind::Collection { role, .. } => {
                    let collection = CollectionId(self.collections.len());
                    self.collections
                        .push(PersistentCollection::uninitialized(role.clone(), owner));
                    self.context.add_collection(
                        collection,
                        CollectionEntry::loaded(CollectionKey::new(role.clone(), row.id.clone())),
                    );
                    PropertyValue::Collection(Some(collection))
                }
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Resolves a foreign key: the managed instance, else the session's
    /// proxy, else a new proxy for lazy entities, else an eager load.
    fn resolve_reference(&mut self, target: &str, id: Identifier) -> CoreResult<Reference> {
        let key = EntityKey::new(target, id.clone(), self.tenant());
        if let Some(instance) = self.context.get_entity(&key) {
            return Ok(Reference::Instance(instance));
        }
        if let Some(proxy) = self.context.get_proxy(&key) {
            return Ok(Reference::Proxy(proxy));
        }
        let descriptor = self.descriptor(target)?;
        if descriptor.is_lazy() {
            return Ok(Reference::Proxy(self.create_proxy(&descriptor, id)));
        }
        match self.load_entity(&descriptor, id)? {
            Some(instance) => Ok(Reference::Instance(instance)),
            None => Err(CoreError::ObjectNotFound { key }),
        }
    }
}
