//! In-memory backend with constraint enforcement.

use crate::backend::{Connection, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::statement::{ColumnValue, Row, Statement};
use hibernia_codec::{Identifier, Value};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Counters for backend activity.
///
/// A round trip is one `execute` or one `execute_batch` call.
#[derive(Debug, Default)]
pub struct BackendStats {
    statements: AtomicU64,
    round_trips: AtomicU64,
    loads: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl BackendStats {
    fn record_round_trip(&self, statements: u64) {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        self.statements.fetch_add(statements, Ordering::Relaxed);
    }

    fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of statements executed.
    pub fn statements(&self) -> u64 {
        self.statements.load(Ordering::Relaxed)
    }

    /// Returns the number of round trips.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Returns the number of row and collection loads.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Returns the number of commits.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Returns the number of rollbacks.
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default, Clone)]
struct Tables {
    rows: HashMap<String, BTreeMap<Identifier, Row>>,
    collections: HashMap<String, BTreeMap<Identifier, Vec<ColumnValue>>>,
}

impl Tables {
    fn row(&self, table: &str, id: &Identifier) -> Option<&Row> {
        self.rows.get(table).and_then(|t| t.get(id))
    }

    fn check_references<'a>(
        &self,
        table: &str,
        values: impl IntoIterator<Item = &'a ColumnValue>,
    ) -> StorageResult<()> {
        for value in values {
            if let Some((target, id)) = value.referenced() {
                if self.row(target, id).is_none() {
                    return Err(StorageError::constraint(
                        format!("fk_{table}_{target}"),
                        format!("{table} references missing {target}#{id}"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn is_referenced(&self, table: &str, id: &Identifier) -> Option<String> {
        let points_here = |v: &ColumnValue| v.referenced() == Some((table, id));
        for (name, rows) in &self.rows {
            for row in rows.values() {
                if name == table && &row.id == id {
                    continue;
                }
                if row.columns.iter().any(|(_, v)| points_here(v)) {
                    return Some(format!("{name}#{}", row.id));
                }
            }
        }
        for (role, owners) in &self.collections {
            for (owner, elements) in owners {
                if elements.iter().any(points_here) {
                    return Some(format!("{role}[{owner}]"));
                }
            }
        }
        None
    }

    fn owns_collection_rows(&self, table: &str, id: &Identifier) -> Option<&str> {
        let prefix = format!("{table}.");
        self.collections
            .iter()
            .filter(|(role, _)| role.starts_with(&prefix))
            .find(|(_, owners)| owners.get(id).is_some_and(|e| !e.is_empty()))
            .map(|(role, _)| role.as_str())
    }

    fn version_matches(row: &Row, expected: Option<&Value>) -> bool {
        expected.map_or(true, |v| row.version.as_ref() == Some(v))
    }

    fn apply(&mut self, statement: &Statement) -> StorageResult<u64> {
        match statement {
            Statement::Insert {
                table,
                id,
                version,
                columns,
            } => {
                if self.row(table, id).is_some() {
                    return Err(StorageError::constraint(
                        format!("pk_{table}"),
                        format!("duplicate key {table}#{id}"),
                    ));
                }
                self.check_references(table, columns.iter().map(|(_, v)| v))?;
                self.rows.entry(table.clone()).or_default().insert(
                    id.clone(),
                    Row {
                        id: id.clone(),
                        version: version.clone(),
                        columns: columns.clone(),
                    },
                );
                Ok(1)
            }
            Statement::Update {
                table,
                id,
                expected_version,
                version,
                columns,
            } => {
                self.check_references(table, columns.iter().map(|(_, v)| v))?;
                let Some(row) = self.rows.get_mut(table).and_then(|t| t.get_mut(id)) else {
                    return Ok(0);
                };
                if !Self::version_matches(row, expected_version.as_ref()) {
                    return Ok(0);
                }
                if version.is_some() {
                    row.version = version.clone();
                }
                for (name, value) in columns {
                    match row.columns.iter_mut().find(|(n, _)| n == name) {
                        Some(slot) => slot.1 = value.clone(),
                        None => row.columns.push((name.clone(), value.clone())),
                    }
                }
                Ok(1)
            }
            Statement::Delete {
                table,
                id,
                expected_version,
            } => {
                match self.row(table, id) {
                    Some(row) if Self::version_matches(row, expected_version.as_ref()) => {}
                    _ => return Ok(0),
                }
                if let Some(referrer) = self.is_referenced(table, id) {
                    return Err(StorageError::constraint(
                        format!("fk_{table}"),
                        format!("{table}#{id} is still referenced by {referrer}"),
                    ));
                }
                if let Some(role) = self.owns_collection_rows(table, id) {
                    return Err(StorageError::constraint(
                        format!("fk_{role}_owner"),
                        format!("{table}#{id} still owns rows of {role}"),
                    ));
                }
                if let Some(t) = self.rows.get_mut(table) {
                    t.remove(id);
                }
                Ok(1)
            }
            Statement::Lock {
                table,
                id,
                expected_version,
            } => Ok(match self.row(table, id) {
                Some(row) if Self::version_matches(row, expected_version.as_ref()) => 1,
                _ => 0,
            }),
            Statement::InsertElements {
                role,
                owner,
                elements,
            } => {
                self.check_references(role, elements)?;
                self.collections
                    .entry(role.clone())
                    .or_default()
                    .entry(owner.clone())
                    .or_default()
                    .extend(elements.iter().cloned());
                Ok(elements.len() as u64)
            }
            Statement::DeleteElements {
                role,
                owner,
                elements,
            } => {
                let Some(rows) = self.collections.get_mut(role).and_then(|c| c.get_mut(owner))
                else {
                    return Ok(0);
                };
                let mut removed = 0;
                for element in elements {
                    if let Some(pos) = rows.iter().position(|e| e == element) {
                        rows.remove(pos);
                        removed += 1;
                    }
                }
                Ok(removed)
            }
            Statement::DeleteCollection { role, owner } => Ok(self
                .collections
                .get_mut(role)
                .and_then(|c| c.remove(owner))
                .map_or(0, |rows| rows.len() as u64)),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    committed: RwLock<Tables>,
    stats: BackendStats,
    offline: AtomicBool,
}

impl Shared {
    fn ensure_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::Acquire) {
            return Err(StorageError::Connectivity("database is offline".into()));
        }
        Ok(())
    }
}

/// An in-memory database.
///
/// Tables are created on first insert. Each connection stages its writes
/// in a private copy and publishes them on commit by replaying its
/// statement log against the latest committed state, so constraint
/// violations caused by concurrent commits are detected at commit time.
///
/// Cloning the backend yields another handle to the same database.
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    shared: Arc<Shared>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the activity counters.
    #[must_use]
    pub fn stats(&self) -> &BackendStats {
        &self.shared.stats
    }

    /// Simulates losing (or regaining) the connection to the database.
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::Release);
    }

    /// Returns the number of committed rows in a table.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.shared
            .committed
            .read()
            .rows
            .get(table)
            .map_or(0, BTreeMap::len)
    }

    /// Returns a committed row.
    #[must_use]
    pub fn row(&self, table: &str, id: &Identifier) -> Option<Row> {
        self.shared.committed.read().row(table, id).cloned()
    }

    /// Returns the committed elements of a collection.
    #[must_use]
    pub fn collection(&self, role: &str, owner: &Identifier) -> Vec<ColumnValue> {
        self.shared
            .committed
            .read()
            .collections
            .get(role)
            .and_then(|c| c.get(owner))
            .cloned()
            .unwrap_or_default()
    }

    /// Applies a statement directly to the committed state.
    ///
    /// Simulates a write made by another application.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement violates a constraint.
    pub fn apply_committed(&self, statement: &Statement) -> StorageResult<u64> {
        self.shared.committed.write().apply(statement)
    }
}

impl StorageBackend for InMemoryBackend {
    fn connect(&self) -> StorageResult<Box<dyn Connection>> {
        self.shared.ensure_online()?;
        Ok(Box::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            working: None,
            log: Vec::new(),
        }))
    }
}

/// A connection to an [`InMemoryBackend`].
#[derive(Debug)]
pub struct InMemoryConnection {
    shared: Arc<Shared>,
    working: Option<Tables>,
    log: Vec<Statement>,
}

impl InMemoryConnection {
    fn apply(&mut self, statement: &Statement) -> StorageResult<u64> {
        let shared = &self.shared;
        let working = self
            .working
            .get_or_insert_with(|| shared.committed.read().clone());
        let affected = working.apply(statement)?;
        trace!(sql = %statement.sql(), affected, "executed statement");
        self.log.push(statement.clone());
        Ok(affected)
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        match &self.working {
            Some(tables) => f(tables),
            None => f(&self.shared.committed.read()),
        }
    }
}

impl Connection for InMemoryConnection {
    fn execute(&mut self, statement: &Statement) -> StorageResult<u64> {
        self.shared.ensure_online()?;
        self.shared.stats.record_round_trip(1);
        self.apply(statement)
    }

    fn execute_batch(&mut self, statements: &[Statement]) -> StorageResult<Vec<u64>> {
        self.shared.ensure_online()?;
        self.shared.stats.record_round_trip(statements.len() as u64);
        statements.iter().map(|s| self.apply(s)).collect()
    }

    fn load(&mut self, table: &str, id: &Identifier) -> StorageResult<Option<Row>> {
        self.shared.ensure_online()?;
        self.shared.stats.record_load();
        Ok(self.read(|t| t.row(table, id).cloned()))
    }

    fn load_collection(
        &mut self,
        role: &str,
        owner: &Identifier,
    ) -> StorageResult<Vec<ColumnValue>> {
        self.shared.ensure_online()?;
        self.shared.stats.record_load();
        Ok(self.read(|t| {
            t.collections
                .get(role)
                .and_then(|c| c.get(owner))
                .cloned()
                .unwrap_or_default()
        }))
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.shared.ensure_online()?;
        self.working = None;
        let log = std::mem::take(&mut self.log);
        if log.is_empty() {
            return Ok(());
        }
        let mut committed = self.shared.committed.write();
        let mut next = committed.clone();
        for statement in &log {
            next.apply(statement)?;
        }
        *committed = next;
        self.shared.stats.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&mut self) -> StorageResult<()> {
        self.working = None;
        self.log.clear();
        self.shared.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn insert(table: &str, id: i64, columns: Vec<(&str, ColumnValue)>) -> Statement {
        Statement::Insert {
            table: table.into(),
            id: Identifier::from(id),
            version: Some(Value::Integer(0)),
            columns: columns
                .into_iter()
                .map(|(n, v)| (n.to_string(), v))
                .collect(),
        }
    }

    fn fk(table: &str, id: i64) -> ColumnValue {
        ColumnValue::reference(table, Identifier::from(id))
    }

    #[test]
    fn insert_and_load_within_transaction() {
        let backend = InMemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        conn.execute(&insert("C", 1, vec![])).unwrap();

        assert!(conn.load("C", &Identifier::from(1)).unwrap().is_some());
        assert_eq!(backend.row_count("C"), 0);

        conn.commit().unwrap();
        assert_eq!(backend.row_count("C"), 1);
    }

    #[test]
    fn rollback_discards_writes() {
        let backend = InMemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        conn.execute(&insert("C", 1, vec![])).unwrap();
        conn.rollback().unwrap();
        conn.commit().unwrap();
        assert_eq!(backend.row_count("C"), 0);
        assert_eq!(backend.stats().rollbacks(), 1);
    }

    #[test]
    fn duplicate_primary_key_is_rejected() {
        let backend = InMemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        conn.execute(&insert("C", 1, vec![])).unwrap();
        let err = conn.execute(&insert("C", 1, vec![])).unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation { .. }));
    }

    #[test]
    fn foreign_key_must_exist_at_insert() {
        let backend = InMemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        let err = conn
            .execute(&insert("B", 1, vec![("c", fk("C", 7))]))
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::ConstraintViolation { ref constraint, .. } if constraint == "fk_B_C"
        ));

        conn.execute(&insert("C", 7, vec![])).unwrap();
        conn.execute(&insert("B", 1, vec![("c", fk("C", 7))])).unwrap();
    }

    #[test]
    fn referenced_row_cannot_be_deleted() {
        let backend = InMemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        conn.execute(&insert("C", 7, vec![])).unwrap();
        conn.execute(&insert("B", 1, vec![("c", fk("C", 7))])).unwrap();

        let delete_c = Statement::Delete {
            table: "C".into(),
            id: Identifier::from(7),
            expected_version: None,
        };
        assert!(conn.execute(&delete_c).is_err());

        let delete_b = Statement::Delete {
            table: "B".into(),
            id: Identifier::from(1),
            expected_version: None,
        };
        assert_eq!(conn.execute(&delete_b).unwrap(), 1);
        assert_eq!(conn.execute(&delete_c).unwrap(), 1);
    }

    #[test]
    fn stale_version_affects_no_rows() {
        let backend = InMemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        conn.execute(&insert("C", 1, vec![])).unwrap();
        let update = Statement::Update {
            table: "C".into(),
            id: Identifier::from(1),
            expected_version: Some(Value::Integer(3)),
            version: Some(Value::Integer(4)),
            columns: vec![],
        };
        assert_eq!(conn.execute(&update).unwrap(), 0);
    }

    #[test]
    fn collection_rows() {
        let backend = InMemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        conn.execute(&insert("C", 1, vec![])).unwrap();
        conn.execute(&insert("C", 2, vec![])).unwrap();
        conn.execute(&insert("P", 9, vec![])).unwrap();
        conn.execute(&Statement::InsertElements {
            role: "P.children".into(),
            owner: Identifier::from(9),
            elements: vec![fk("C", 1), fk("C", 2)],
        })
        .unwrap();

        let owner_delete = Statement::Delete {
            table: "P".into(),
            id: Identifier::from(9),
            expected_version: None,
        };
        assert!(conn.execute(&owner_delete).is_err());

        let removed = conn
            .execute(&Statement::DeleteElements {
                role: "P.children".into(),
                owner: Identifier::from(9),
                elements: vec![fk("C", 1)],
            })
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            conn.load_collection("P.children", &Identifier::from(9)).unwrap(),
            vec![fk("C", 2)]
        );
    }

    #[test]
    fn batch_is_one_round_trip() {
        let backend = InMemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        conn.execute_batch(&[insert("C", 1, vec![]), insert("C", 2, vec![])])
            .unwrap();
        assert_eq!(backend.stats().round_trips(), 1);
        assert_eq!(backend.stats().statements(), 2);
    }

    #[test]
    fn offline_backend_reports_connectivity() {
        let backend = InMemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        backend.set_offline(true);
        let err = conn.execute(&insert("C", 1, vec![])).unwrap_err();
        assert!(matches!(err, StorageError::Connectivity(_)));
        assert!(backend.connect().is_err());
    }

    #[test]
    fn concurrent_commit_conflict_detected() {
        let backend = InMemoryBackend::new();
        let mut a = backend.connect().unwrap();
        let mut b = backend.connect().unwrap();
        a.execute(&insert("C", 1, vec![])).unwrap();
        b.execute(&insert("C", 1, vec![])).unwrap();
        a.commit().unwrap();
        assert!(b.commit().is_err());
        assert_eq!(backend.row_count("C"), 1);
    }

    proptest! {
        #[test]
        fn only_committed_inserts_survive(
            ids in prop::collection::btree_set(0i64..50, 0..20),
            commit in any::<bool>(),
        ) {
            let backend = InMemoryBackend::new();
            let mut conn = backend.connect().unwrap();
            for id in &ids {
                conn.execute(&insert("C", *id, vec![])).unwrap();
            }
            prop_assert_eq!(backend.row_count("C"), 0);
            if commit {
                conn.commit().unwrap();
                prop_assert_eq!(backend.row_count("C"), ids.len());
            } else {
                conn.rollback().unwrap();
                prop_assert_eq!(backend.row_count("C"), 0);
            }
        }
    }
}
