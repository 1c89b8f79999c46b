//! Backend and connection traits.

use crate::error::StorageResult;
use crate::statement::{ColumnValue, Row, Statement};
use hibernia_codec::Identifier;

/// A database that hands out connections.
///
/// A session factory holds one backend and opens one connection per
/// session. Backends must be `Send + Sync`.
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing and ephemeral data
pub trait StorageBackend: Send + Sync {
    /// Opens a new connection with its own transaction.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connectivity` if the database is unreachable.
    fn connect(&self) -> StorageResult<Box<dyn Connection>>;
}

/// A single connection with an implicit, always-open transaction.
///
/// Writes become visible to other connections only after [`commit`].
///
/// [`commit`]: Connection::commit
pub trait Connection: Send {
    /// Executes one statement and returns the affected row count.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A constraint is violated
    /// - The database is unreachable
    fn execute(&mut self, statement: &Statement) -> StorageResult<u64>;

    /// Executes statements in one round trip.
    ///
    /// Execution stops at the first failing statement.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing statement.
    fn execute_batch(&mut self, statements: &[Statement]) -> StorageResult<Vec<u64>> {
        statements.iter().map(|s| self.execute(s)).collect()
    }

    /// Loads a row by primary key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    fn load(&mut self, table: &str, id: &Identifier) -> StorageResult<Option<Row>>;

    /// Loads the elements of a collection owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    fn load_collection(&mut self, role: &str, owner: &Identifier)
        -> StorageResult<Vec<ColumnValue>>;

    /// Commits the current transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the staged writes conflict with committed data
    /// or the database is unreachable. The transaction is rolled back.
    fn commit(&mut self) -> StorageResult<()>;

    /// Discards the current transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    fn rollback(&mut self) -> StorageResult<()>;
}
