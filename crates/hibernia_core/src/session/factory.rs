//! Session factories and the factory registry.

use super::Session;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::metadata::Metamodel;
use crate::proxy::EntitySnapshot;
use crate::stats::Statistics;
use crate::types::{EntityKey, SessionId};
use hibernia_cache::{
    Clock, EntityAccessStrategy, InMemoryRegionFactory, RegionFactory, SystemClock, Timestamper,
};
use hibernia_codec::Identifier;
use hibernia_storage::StorageBackend;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use uuid::Uuid;

pub(crate) struct FactoryInner {
    uuid: Uuid,
    name: String,
    metamodel: Metamodel,
    config: Config,
    backend: Arc<dyn StorageBackend>,
    regions: HashMap<String, Arc<dyn EntityAccessStrategy>>,
    timestamper: Arc<Timestamper>,
    stats: Statistics,
    registry: Arc<SessionFactoryRegistry>,
    next_session: AtomicU64,
    closed: AtomicBool,
}

/// The shared, thread-safe side of the unit of work.
///
/// A factory owns the metamodel, the configuration, the storage backend and
/// one second-level cache access strategy per cached entity. Sessions are
/// opened from it and share all of these.
///
/// Cloning a factory yields another handle to the same factory.
///
/// # Example
///
/// ```rust
/// use hibernia_core::{EntityDescriptor, Metamodel, SessionFactory};
/// use hibernia_storage::InMemoryBackend;
///
/// let metamodel = Metamodel::builder()
///     .entity(EntityDescriptor::builder("Person").basic("name").build())
///     .build()
///     .unwrap();
/// let factory = SessionFactory::builder(metamodel, InMemoryBackend::new())
///     .name("people")
///     .build()
///     .unwrap();
///
/// let mut session = factory.open_session().unwrap();
/// let ada = session.new_instance("Person").unwrap();
/// session.set_identifier(ada, 1).unwrap();
/// session.set(ada, "name", "Ada").unwrap();
/// session.persist(ada).unwrap();
/// session.commit().unwrap();
/// assert_eq!(factory.statistics().entity_inserts(), 1);
/// ```
#[derive(Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

impl SessionFactory {
    /// Starts building a factory.
    pub fn builder(
        metamodel: Metamodel,
        backend: impl StorageBackend + 'static,
    ) -> SessionFactoryBuilder {
        SessionFactoryBuilder {
            metamodel,
            backend: Arc::new(backend),
            name: None,
            config: Config::default(),
            clock: Arc::new(SystemClock),
            region_factory: None,
            registry: None,
        }
    }

    /// Returns the factory uuid.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// Returns the factory name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the metamodel.
    #[must_use]
    pub fn metamodel(&self) -> &Metamodel {
        &self.inner.metamodel
    }

    /// Returns the statistics.
    #[must_use]
    pub fn statistics(&self) -> &Statistics {
        &self.inner.stats
    }

    /// Returns the cache access strategy of an entity, if it is cached.
    #[must_use]
    pub fn access_strategy(&self, entity_name: &str) -> Option<&Arc<dyn EntityAccessStrategy>> {
        self.inner.regions.get(entity_name)
    }

    /// Returns the timestamper used for cache transactions.
    #[must_use]
    pub fn timestamper(&self) -> &Arc<Timestamper> {
        &self.inner.timestamper
    }

    /// Returns the registry the factory is registered in.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionFactoryRegistry> {
        &self.inner.registry
    }

    pub(crate) fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.backend
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId(self.inner.next_session.fetch_add(1, Ordering::Relaxed))
    }

    /// Opens a session.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidOperation` if the factory is closed, or a
    /// storage error if no connection can be opened.
    pub fn open_session(&self) -> CoreResult<Session> {
        if self.is_closed() {
            return Err(CoreError::invalid_operation(format!(
                "session factory {} is closed",
                self.inner.name
            )));
        }
        Session::open(self.clone())
    }

    /// Closes the factory and removes it from its registry.
    ///
    /// Open sessions keep working; no new session can be opened.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.registry.deregister(self.inner.uuid);
            info!(name = %self.inner.name, "session factory closed");
        }
    }

    /// Returns whether the factory is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Removes one entity from the second-level cache.
    pub fn evict(&self, entity_name: &str, id: &Identifier) {
        if let Some(access) = self.access_strategy(entity_name) {
            let key = EntityKey::new(entity_name, id.clone(), self.inner.config.tenant.clone());
            access.evict(&key.cache_key());
        }
    }

    /// Removes every entity of a type from the second-level cache.
    pub fn evict_entity_region(&self, entity_name: &str) {
        if let Some(access) = self.access_strategy(entity_name) {
            access.evict_all();
        }
    }

    /// Loads the column state of an entity in a temporary session.
    pub(crate) fn load_snapshot(
        &self,
        entity_name: &str,
        id: &Identifier,
    ) -> CoreResult<Option<EntitySnapshot>> {
        let mut session = Session::open(self.clone())?;
        let snapshot = match session.find(entity_name, id.clone())? {
            Some(instance) => Some(session.snapshot(instance)?),
            None => None,
        };
        session.close()?;
        Ok(snapshot)
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("uuid", &self.inner.uuid)
            .field("name", &self.inner.name)
            .field("entities", &self.inner.metamodel.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Builder for [`SessionFactory`].
pub struct SessionFactoryBuilder {
    metamodel: Metamodel,
    backend: Arc<dyn StorageBackend>,
    name: Option<String>,
    config: Config,
    clock: Arc<dyn Clock>,
    region_factory: Option<Arc<dyn RegionFactory>>,
    registry: Option<Arc<SessionFactoryRegistry>>,
}

impl SessionFactoryBuilder {
    /// Names the factory. Defaults to its uuid.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock used for cache timestamps and validator periods.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the cache region provider. Factories sharing a provider share
    /// regions.
    #[must_use]
    pub fn region_factory(mut self, region_factory: Arc<dyn RegionFactory>) -> Self {
        self.region_factory = Some(region_factory);
        self
    }

    /// Registers the factory in `registry` instead of a private one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<SessionFactoryRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Builds the factory and registers it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidOperation` if the registry already holds a
    /// factory with the same name.
    pub fn build(self) -> CoreResult<SessionFactory> {
        let uuid = Uuid::new_v4();
        let name = self.name.unwrap_or_else(|| uuid.to_string());
        let timestamper = Arc::new(Timestamper::new(Arc::clone(&self.clock)));
        let region_factory: Arc<dyn RegionFactory> = self
            .region_factory
            .unwrap_or_else(|| Arc::new(InMemoryRegionFactory::new()));

        let mut regions = HashMap::new();
        if self.config.second_level_cache {
            for descriptor in self.metamodel.descriptors() {
                if let Some(access) = descriptor.cache_access() {
                    let region = region_factory.build_region(descriptor.name());
                    let strategy =
                        access.build_strategy(region, Arc::clone(&timestamper), &self.config.cache);
                    debug!(entity = descriptor.name(), ?access, "built cache region");
                    regions.insert(descriptor.name().to_string(), strategy);
                }
            }
        }

        let registry = self.registry.unwrap_or_default();
        let inner = Arc::new(FactoryInner {
            uuid,
            name,
            metamodel: self.metamodel,
            config: self.config,
            backend: self.backend,
            regions,
            timestamper,
            stats: Statistics::new(),
            registry: Arc::clone(&registry),
            next_session: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        registry.register(&inner)?;
        info!(name = %inner.name, %uuid, entities = inner.metamodel.len(), "session factory built");
        Ok(SessionFactory { inner })
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    by_uuid: HashMap<Uuid, Weak<FactoryInner>>,
    by_name: HashMap<String, Uuid>,
}

/// Live session factories by uuid and by name.
///
/// Detached and deserialized proxies find their factory here. Entries hold
/// weak references and are removed when a factory closes.
#[derive(Default)]
pub struct SessionFactoryRegistry {
    state: RwLock<RegistryState>,
}

impl SessionFactoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, inner: &Arc<FactoryInner>) -> CoreResult<()> {
        let mut state = self.state.write();
        if let Some(existing) = state.by_name.get(&inner.name) {
            if state
                .by_uuid
                .get(existing)
                .is_some_and(|w| w.strong_count() > 0)
            {
                return Err(CoreError::invalid_operation(format!(
                    "a session factory named {} is already registered",
                    inner.name
                )));
            }
        }
        state.by_uuid.insert(inner.uuid, Arc::downgrade(inner));
        state.by_name.insert(inner.name.clone(), inner.uuid);
        Ok(())
    }

    fn deregister(&self, uuid: Uuid) {
        let mut state = self.state.write();
        state.by_uuid.remove(&uuid);
        state.by_name.retain(|_, u| *u != uuid);
    }

    /// Returns the live factory with `uuid`.
    #[must_use]
    pub fn get(&self, uuid: Uuid) -> Option<SessionFactory> {
        self.state
            .read()
            .by_uuid
            .get(&uuid)
            .and_then(Weak::upgrade)
            .map(|inner| SessionFactory { inner })
    }

    /// Returns the live factory called `name`.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<SessionFactory> {
        let uuid = *self.state.read().by_name.get(name)?;
        self.get(uuid)
    }

    /// Returns the number of live factories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .read()
            .by_uuid
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Returns true if no factory is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SessionFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("SessionFactoryRegistry")
            .field("names", &state.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}
