//! Lazy initializers: stand-ins for not-yet-loaded entities.
//!
//! A proxy starts `Uninitialized` and becomes `Initialized` on the first
//! access to anything but its identifier. It never goes back.
//!
//! Proxies held by a session are initialized through
//! [`Session::initialize_proxy`](crate::Session::initialize_proxy). A proxy
//! detached from its session ([`Session::detach_proxy`], or one rebuilt
//! from a [`SerializedProxy`]) can only load if its factory allowed
//! loading outside a transaction; it then borrows a temporary session from
//! the factory found in a [`SessionFactoryRegistry`].
//!
//! [`Session::detach_proxy`]: crate::Session::detach_proxy

use crate::error::{CoreError, CoreResult};
use crate::session::SessionFactoryRegistry;
use crate::types::{EntityKey, InstanceId, SessionId};
use hibernia_codec::{from_cbor, to_canonical_cbor, Identifier, Value};
use hibernia_storage::ColumnValue;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use tracing::debug;
use uuid::Uuid;

/// Column-level state of an entity, independent of any session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Entity name.
    pub entity_name: String,
    /// Identifier.
    pub id: Identifier,
    /// Version, for versioned entities.
    pub version: Option<Value>,
    /// Non-collection properties in mapping order; references hold the
    /// referenced identifier.
    pub columns: Vec<(String, ColumnValue)>,
}

impl EntitySnapshot {
    /// Returns the value of a named property.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// What an initialized proxy delegates to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyTarget {
    /// A managed instance of the owning session.
    Attached(InstanceId),
    /// State loaded without a session.
    Detached(EntitySnapshot),
}

/// Initialization state of a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyState {
    /// Nothing loaded yet.
    Uninitialized,
    /// Loaded; terminal.
    Initialized(ProxyTarget),
}

/// The state machine behind a proxy.
///
/// Equality and hashing use the entity name and identifier, so an
/// uninitialized proxy compares equal to any other proxy of the same row.
#[derive(Debug, Clone)]
pub struct LazyInitializer {
    entity_name: String,
    identifier_name: String,
    id: Identifier,
    state: ProxyState,
    session: Option<SessionId>,
    read_only: bool,
    factory_uuid: Uuid,
    factory_name: String,
    lazy_load_outside_transaction: bool,
}

impl LazyInitializer {
    pub(crate) fn new(
        entity_name: impl Into<String>,
        identifier_name: impl Into<String>,
        id: Identifier,
        session: SessionId,
        factory_uuid: Uuid,
        factory_name: impl Into<String>,
        lazy_load_outside_transaction: bool,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            identifier_name: identifier_name.into(),
            id,
            state: ProxyState::Uninitialized,
            session: Some(session),
            read_only: false,
            factory_uuid,
            factory_name: factory_name.into(),
            lazy_load_outside_transaction,
        }
    }

    /// Returns the entity name.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Returns the identifier. Never loads.
    #[must_use]
    pub const fn identifier(&self) -> &Identifier {
        &self.id
    }

    /// Returns the name of the identifier property.
    #[must_use]
    pub fn identifier_name(&self) -> &str {
        &self.identifier_name
    }

    /// Returns the key of the proxied entity.
    #[must_use]
    pub fn entity_key(&self, tenant: Option<String>) -> EntityKey {
        EntityKey::new(self.entity_name.clone(), self.id.clone(), tenant)
    }

    /// Returns the state.
    #[must_use]
    pub const fn state(&self) -> &ProxyState {
        &self.state
    }

    /// Returns true until the proxy is initialized.
    #[must_use]
    pub const fn is_uninitialized(&self) -> bool {
        matches!(self.state, ProxyState::Uninitialized)
    }

    /// Returns the attached instance of an initialized proxy.
    #[must_use]
    pub const fn attached_instance(&self) -> Option<InstanceId> {
        match &self.state {
            ProxyState::Initialized(ProxyTarget::Attached(id)) => Some(*id),
            _ => None,
        }
    }

    /// Returns the owning session, if attached.
    #[must_use]
    pub const fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Returns whether the proxied entity is read-only.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the uuid of the factory that created the proxy.
    #[must_use]
    pub const fn factory_uuid(&self) -> Uuid {
        self.factory_uuid
    }

    pub(crate) fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub(crate) fn set_session(&mut self, session: Option<SessionId>) {
        self.session = session;
    }

    /// Forgets an attached target; the next access loads again.
    pub(crate) fn reset(&mut self) {
        if self.attached_instance().is_some() {
            self.state = ProxyState::Uninitialized;
        }
    }

    /// Moves the proxy to `Initialized`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::AssertionFailure` if the proxy is already
    /// initialized with a different instance.
    pub(crate) fn initialize(&mut self, target: ProxyTarget) -> CoreResult<()> {
        match &self.state {
            ProxyState::Initialized(ProxyTarget::Attached(current))
                if target != ProxyTarget::Attached(*current) =>
            {
                Err(CoreError::assertion_failure(format!(
                    "proxy {} already delegates to {current}",
                    self.entity_key(None)
                )))
            }
            _ => {
                self.state = ProxyState::Initialized(target);
                Ok(())
            }
        }
    }

    /// Returns a copy unbound from any session.
    ///
    /// An attached target is replaced by `snapshot`, since the instance it
    /// names only exists inside the session.
    pub(crate) fn detached_copy(&self, snapshot: Option<EntitySnapshot>) -> Self {
        let state = match (&self.state, snapshot) {
            (ProxyState::Initialized(ProxyTarget::Attached(_)), Some(s)) => {
                ProxyState::Initialized(ProxyTarget::Detached(s))
            }
            (ProxyState::Initialized(ProxyTarget::Attached(_)), None) => ProxyState::Uninitialized,
            (other, _) => other.clone(),
        };
        Self {
            state,
            session: None,
            ..self.clone()
        }
    }

    /// Reads a property of a detached proxy, loading it on first use.
    ///
    /// The identifier property never loads.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::LazyInitialization` if the proxy is still bound
    /// to a session, the factory forbids loading outside a transaction, or
    /// the factory is no longer registered; `CoreError::ObjectNotFound` if
    /// the row is gone.
    pub fn detached_property(
        &mut self,
        name: &str,
        registry: &SessionFactoryRegistry,
    ) -> CoreResult<ColumnValue> {
        if name == self.identifier_name {
            return Ok(ColumnValue::Basic(Value::from(self.id.clone())));
        }
        let value = self.initialize_detached(registry)?.get(name).cloned();
        value.ok_or_else(|| CoreError::unknown_property(&self.entity_name, name))
    }

    fn initialize_detached(
        &mut self,
        registry: &SessionFactoryRegistry,
    ) -> CoreResult<&EntitySnapshot> {
        if self.session.is_some() {
            return Err(CoreError::lazy_initialization(format!(
                "proxy {} is bound to a session; initialize it through the session",
                self.entity_key(None)
            )));
        }
        if self.is_uninitialized() {
            if !self.lazy_load_outside_transaction {
                return Err(CoreError::lazy_initialization(format!(
                    "could not initialize proxy {} - no session",
                    self.entity_key(None)
                )));
            }
            let factory = registry.get(self.factory_uuid).ok_or_else(|| {
                CoreError::lazy_initialization(format!(
                    "could not initialize proxy {} - session factory {} is closed",
                    self.entity_key(None),
                    self.factory_name
                ))
            })?;
            debug!(key = %self.entity_key(None), "loading detached proxy in a temporary session");
            let snapshot = factory
                .load_snapshot(&self.entity_name, &self.id)?
                .ok_or_else(|| CoreError::ObjectNotFound {
                    key: self.entity_key(factory.config().tenant.clone()),
                })?;
            self.state = ProxyState::Initialized(ProxyTarget::Detached(snapshot));
        }
        match &self.state {
            ProxyState::Initialized(ProxyTarget::Detached(snapshot)) => Ok(snapshot),
            _ => Err(CoreError::lazy_initialization(format!(
                "proxy {} delegates to an instance of a closed session",
                self.entity_key(None)
            ))),
        }
    }

    /// Captures the proxy for serialization. Never loads.
    #[must_use]
    pub fn serialize(&self) -> SerializedProxy {
        SerializedProxy {
            entity_name: self.entity_name.clone(),
            identifier_name: self.identifier_name.clone(),
            id: self.id.clone(),
            factory_uuid: self.factory_uuid,
            factory_name: self.factory_name.clone(),
            read_only: self.read_only,
            lazy_load_outside_transaction: self.lazy_load_outside_transaction,
        }
    }
}

impl PartialEq for LazyInitializer {
    fn eq(&self, other: &Self) -> bool {
        self.entity_name == other.entity_name && self.id == other.id
    }
}

impl Eq for LazyInitializer {}

impl Hash for LazyInitializer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_name.hash(state);
        self.id.hash(state);
    }
}

/// The serialized form of a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedProxy {
    /// Entity name.
    pub entity_name: String,
    /// Identifier property name.
    pub identifier_name: String,
    /// Identifier.
    pub id: Identifier,
    /// Uuid of the creating session factory.
    pub factory_uuid: Uuid,
    /// Name of the creating session factory.
    pub factory_name: String,
    /// Read-only flag.
    pub read_only: bool,
    /// Whether the factory allows loading outside a transaction.
    pub lazy_load_outside_transaction: bool,
}

impl SerializedProxy {
    /// Encodes the proxy as CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(to_canonical_cbor(self)?)
    }

    /// Decodes a proxy from CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not describe a proxy.
    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        Ok(from_cbor(bytes)?)
    }

    /// Rebuilds an uninitialized proxy bound to no session.
    #[must_use]
    pub fn into_initializer(self) -> LazyInitializer {
        LazyInitializer {
            entity_name: self.entity_name,
            identifier_name: self.identifier_name,
            id: self.id,
            state: ProxyState::Uninitialized,
            session: None,
            read_only: self.read_only,
            factory_uuid: self.factory_uuid,
            factory_name: self.factory_name,
            lazy_load_outside_transaction: self.lazy_load_outside_transaction,
        }
    }
}
