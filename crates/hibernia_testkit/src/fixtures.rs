//! Test fixtures: metamodels, factories and seeded backends.
//!
//! Two models are provided. The scenario model is the six-entity graph
//! `B/C/D/E/F/G` whose inserts need both reordering and deferred foreign
//! keys. The catalog model (`Owner`, `Pet`) is lazy and cached, for proxy
//! and second-level cache tests.

use crate::generators::{level_name, LEVELS};
use hibernia_cache::{AccessType, EntityAccessStrategy};
use hibernia_codec::{Identifier, Value};
use hibernia_core::{
    CascadeStyle, Config, CoreResult, EntityDescriptor, EntityKey, InstanceId, Metamodel, Session,
    SessionFactory,
};
use hibernia_storage::{
    ColumnValue, Connection, InMemoryBackend, Row, Statement, StorageBackend, StorageResult,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Entity names of the scenario model, in cascade order.
pub const SCENARIO_ENTITIES: [&str; 6] = ["B", "C", "D", "E", "F", "G"];

/// Builds the scenario model.
///
/// ```text
/// B -> C (not null), B -> D (not null), B -> G (nullable)
/// C -> B (nullable back-reference, not cascaded)
/// D -> E (not null), D -> F (nullable)
/// F -> G (not null)
/// ```
pub fn scenario_metamodel() -> Metamodel {
    let cascade = CascadeStyle::PERSIST_MERGE;
    Metamodel::builder()
        .entity(
            EntityDescriptor::builder("B")
                .basic("name")
                .many_to_one("c", "C", false, cascade)
                .many_to_one("d", "D", false, cascade)
                .many_to_one("g", "G", true, cascade)
                .build(),
        )
        .entity(
            EntityDescriptor::builder("C")
                .basic("name")
                .many_to_one("b", "B", true, CascadeStyle::NONE)
                .build(),
        )
        .entity(
            EntityDescriptor::builder("D")
                .basic("name")
                .many_to_one("e", "E", false, cascade)
                .many_to_one("f", "F", true, cascade)
                .build(),
        )
        .entity(EntityDescriptor::builder("E").basic("name").build())
        .entity(
            EntityDescriptor::builder("F")
                .basic("name")
                .many_to_one("g", "G", false, cascade)
                .build(),
        )
        .entity(EntityDescriptor::builder("G").basic("name").build())
        .build()
        .expect("scenario metamodel is valid")
}

/// The transient instances of one scenario graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioGraph {
    /// Root.
    pub b: InstanceId,
    /// Referenced by `B`.
    pub c: InstanceId,
    /// Referenced by `B`.
    pub d: InstanceId,
    /// Referenced by `D`.
    pub e: InstanceId,
    /// Referenced by `D`.
    pub f: InstanceId,
    /// Referenced by `B` and `F`.
    pub g: InstanceId,
}

impl ScenarioGraph {
    /// Creates the graph in `session` without persisting it. Every
    /// instance gets identifier `id` and the name of its entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not use the scenario model.
    pub fn build(session: &mut Session, id: i64) -> CoreResult<Self> {
        let mut create = |name: &str| -> CoreResult<InstanceId> {
            let instance = session.new_instance(name)?;
            session.set_identifier(instance, id)?;
            session.set(instance, "name", name.to_lowercase().as_str())?;
            Ok(instance)
        };
        let graph = Self {
            b: create("B")?,
            c: create("C")?,
            d: create("D")?,
            e: create("E")?,
            f: create("F")?,
            g: create("G")?,
        };
        session.set(graph.b, "c", graph.c)?;
        session.set(graph.b, "d", graph.d)?;
        session.set(graph.b, "g", graph.g)?;
        session.set(graph.c, "b", graph.b)?;
        session.set(graph.d, "e", graph.e)?;
        session.set(graph.d, "f", graph.f)?;
        session.set(graph.f, "g", graph.g)?;
        Ok(graph)
    }

    /// Returns the instances in cascade order.
    pub fn instances(&self) -> [InstanceId; 6] {
        [self.b, self.c, self.d, self.e, self.f, self.g]
    }
}

/// Builds the catalog model.
///
/// `Owner` is lazy, versioned and cached read-write, with a `nicknames`
/// element collection and a `pets` association. `Pet` has a nullable
/// reference to its owner.
pub fn catalog_metamodel() -> Metamodel {
    catalog_metamodel_with(AccessType::ReadWrite)
}

/// Builds the catalog model with `Owner` cached under `access`.
pub fn catalog_metamodel_with(access: AccessType) -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityDescriptor::builder("Owner")
                .basic("name")
                .element_collection("nicknames")
                .one_to_many("pets", "Pet", CascadeStyle::ALL)
                .versioned()
                .cached(access)
                .lazy(true)
                .build(),
        )
        .entity(
            EntityDescriptor::builder("Pet")
                .basic("name")
                .many_to_one("owner", "Owner", true, CascadeStyle::NONE)
                .build(),
        )
        .build()
        .expect("catalog metamodel is valid")
}

/// Builds the level chain model: `L0` has a name, and every `Lk` above it
/// has a non-nullable, non-cascaded reference `up` to `L(k-1)`.
pub fn level_metamodel() -> Metamodel {
    let mut builder = Metamodel::builder();
    for level in 0..LEVELS {
        let mut entity = EntityDescriptor::builder(level_name(level)).basic("name");
        if level > 0 {
            entity = entity.many_to_one("up", level_name(level - 1), false, CascadeStyle::NONE);
        }
        builder = builder.entity(entity.build());
    }
    builder.build().expect("level metamodel is valid")
}

/// Builds a factory with the default configuration.
pub fn factory(metamodel: Metamodel, backend: impl StorageBackend + 'static) -> SessionFactory {
    factory_with(metamodel, backend, Config::default())
}

/// Builds a factory with `config`.
pub fn factory_with(
    metamodel: Metamodel,
    backend: impl StorageBackend + 'static,
    config: Config,
) -> SessionFactory {
    SessionFactory::builder(metamodel, backend)
        .config(config)
        .build()
        .expect("failed to build session factory")
}

/// Writes a committed `Owner` row with version 0 and its nicknames.
pub fn seed_owner(backend: &InMemoryBackend, id: i64, name: &str, nicknames: &[&str]) {
    let owner = Identifier::from(id);
    backend
        .apply_committed(&Statement::Insert {
            table: "Owner".into(),
            id: owner.clone(),
            version: Some(Value::Integer(0)),
            columns: vec![("name".into(), ColumnValue::Basic(Value::from(name)))],
        })
        .expect("failed to seed owner");
    if !nicknames.is_empty() {
        backend
            .apply_committed(&Statement::InsertElements {
                role: "Owner.nicknames".into(),
                owner,
                elements: nicknames
                    .iter()
                    .map(|n| ColumnValue::Basic(Value::from(*n)))
                    .collect(),
            })
            .expect("failed to seed nicknames");
    }
}

/// Writes a committed `Pet` row.
pub fn seed_pet(backend: &InMemoryBackend, id: i64, name: &str, owner: Option<i64>) {
    backend
        .apply_committed(&Statement::Insert {
            table: "Pet".into(),
            id: Identifier::from(id),
            version: None,
            columns: vec![
                ("name".into(), ColumnValue::Basic(Value::from(name))),
                (
                    "owner".into(),
                    ColumnValue::Reference {
                        table: "Owner".into(),
                        id: owner.map(Identifier::from),
                    },
                ),
            ],
        })
        .expect("failed to seed pet");
}

/// Changes a committed `Owner` row behind every session's back, bumping
/// its version.
pub fn concurrent_rename(backend: &InMemoryBackend, id: i64, name: &str, from_version: i64) {
    let affected = backend
        .apply_committed(&Statement::Update {
            table: "Owner".into(),
            id: Identifier::from(id),
            expected_version: Some(Value::Integer(from_version)),
            version: Some(Value::Integer(from_version + 1)),
            columns: vec![("name".into(), ColumnValue::Basic(Value::from(name)))],
        })
        .expect("failed to rename owner");
    assert_eq!(affected, 1, "owner {id} is not at version {from_version}");
}

/// Returns the second-level cache access of `entity_name` together with
/// the cache key of `id`.
pub fn cache_handle(
    factory: &SessionFactory,
    entity_name: &str,
    id: i64,
) -> Option<(Arc<dyn EntityAccessStrategy>, hibernia_cache::CacheKey)> {
    let access = factory.access_strategy(entity_name)?;
    let key = EntityKey::new(entity_name, Identifier::from(id), factory.config().tenant.clone());
    Some((Arc::clone(access), key.cache_key()))
}

/// Runs after a row was read and before the session sees it.
pub type LoadHook = Box<dyn FnMut(&str, &Identifier) + Send>;

/// An [`InMemoryBackend`] that runs a hook after every row load.
///
/// The hook runs between the database read and the cache put that
/// follows it, which is where a concurrent invalidation would land.
#[derive(Clone, Default)]
pub struct HookedBackend {
    inner: InMemoryBackend,
    hook: Arc<Mutex<Option<LoadHook>>>,
}

impl HookedBackend {
    /// Wraps `inner`.
    pub fn new(inner: InMemoryBackend) -> Self {
        Self {
            inner,
            hook: Arc::default(),
        }
    }

    /// Returns the wrapped database.
    pub fn inner(&self) -> &InMemoryBackend {
        &self.inner
    }

    /// Installs the load hook.
    pub fn set_hook(&self, hook: impl FnMut(&str, &Identifier) + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// Removes the load hook.
    pub fn clear_hook(&self) {
        *self.hook.lock() = None;
    }
}

impl fmt::Debug for HookedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookedBackend")
            .field("inner", &self.inner)
            .field("hooked", &self.hook.lock().is_some())
            .finish()
    }
}

impl StorageBackend for HookedBackend {
    fn connect(&self) -> StorageResult<Box<dyn Connection>> {
        Ok(Box::new(HookedConnection {
            inner: self.inner.connect()?,
            hook: Arc::clone(&self.hook),
        }))
    }
}

struct HookedConnection {
    inner: Box<dyn Connection>,
    hook: Arc<Mutex<Option<LoadHook>>>,
}

impl Connection for HookedConnection {
    fn execute(&mut self, statement: &Statement) -> StorageResult<u64> {
        self.inner.execute(statement)
    }

    fn execute_batch(&mut self, statements: &[Statement]) -> StorageResult<Vec<u64>> {
        self.inner.execute_batch(statements)
    }

    fn load(&mut self, table: &str, id: &Identifier) -> StorageResult<Option<Row>> {
        let row = self.inner.load(table, id)?;
        if let Some(hook) = self.hook.lock().as_mut() {
            hook(table, id);
        }
        Ok(row)
    }

    fn load_collection(&mut self, role: &str, owner: &Identifier) -> StorageResult<Vec<ColumnValue>> {
        self.inner.load_collection(role, owner)
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> StorageResult<()> {
        self.inner.rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_model_is_valid() {
        let metamodel = scenario_metamodel();
        for name in SCENARIO_ENTITIES {
            assert!(metamodel.descriptor(name).is_ok(), "{name} missing");
        }
    }

    #[test]
    fn seeded_rows_are_committed() {
        let backend = InMemoryBackend::new();
        seed_owner(&backend, 1, "Ged", &["Sparrowhawk"]);
        seed_pet(&backend, 10, "otak", Some(1));
        assert_eq!(backend.row_count("Owner"), 1);
        assert_eq!(backend.row_count("Pet"), 1);
        assert_eq!(
            backend.collection("Owner.nicknames", &Identifier::from(1)).len(),
            1
        );
    }

    #[test]
    fn hook_runs_after_each_load() {
        let backend = HookedBackend::default();
        seed_owner(backend.inner(), 1, "Ged", &[]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        backend.set_hook(move |table, id| log.lock().push(format!("{table}#{id}")));

        let mut connection = backend.connect().unwrap();
        assert!(connection.load("Owner", &Identifier::from(1)).unwrap().is_some());
        assert!(connection.load("Owner", &Identifier::from(2)).unwrap().is_none());
        backend.clear_hook();
        connection.load("Owner", &Identifier::from(1)).unwrap();
        assert_eq!(*seen.lock(), vec!["Owner#1".to_string(), "Owner#2".to_string()]);
    }

    #[test]
    fn graph_is_wired() {
        let factory = factory(scenario_metamodel(), InMemoryBackend::new());
        let mut session = factory.open_session().unwrap();
        let graph = ScenarioGraph::build(&mut session, 1).unwrap();
        assert_eq!(
            session.reference(graph.f, "g").unwrap(),
            Some(graph.g.into())
        );
        assert_eq!(
            session.reference(graph.c, "b").unwrap(),
            Some(graph.b.into())
        );
    }
}
