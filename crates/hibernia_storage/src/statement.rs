//! Bound statement descriptors.

use hibernia_codec::{Identifier, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A bound column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnValue {
    /// A scalar value.
    Basic(Value),
    /// A foreign key into `table`. `None` binds `NULL`.
    Reference {
        /// Referenced table (entity name).
        table: String,
        /// Referenced identifier.
        id: Option<Identifier>,
    },
}

impl ColumnValue {
    /// Creates a foreign key value.
    pub fn reference(table: impl Into<String>, id: Identifier) -> Self {
        Self::Reference {
            table: table.into(),
            id: Some(id),
        }
    }

    /// Returns the referenced table and identifier of a non-null foreign key.
    #[must_use]
    pub fn referenced(&self) -> Option<(&str, &Identifier)> {
        match self {
            Self::Reference {
                table,
                id: Some(id),
            } => Some((table, id)),
            _ => None,
        }
    }

    /// Returns true for `NULL` scalars and null foreign keys.
    #[must_use]
    pub fn is_null(&self) -> bool {
        match self {
            Self::Basic(v) => v.is_null(),
            Self::Reference { id, .. } => id.is_none(),
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic(v) => write!(f, "{v}"),
            Self::Reference { table, id: Some(id) } => write!(f, "{table}#{id}"),
            Self::Reference { table, id: None } => write!(f, "{table}#null"),
        }
    }
}

/// A stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Primary key.
    pub id: Identifier,
    /// Version column, for versioned tables.
    pub version: Option<Value>,
    /// Named columns in mapping order.
    pub columns: Vec<(String, ColumnValue)>,
}

impl Row {
    /// Returns the value of a named column.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// The kind of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Row insert.
    Insert,
    /// Row update.
    Update,
    /// Row delete.
    Delete,
    /// Row lock.
    Lock,
    /// Collection row inserts.
    InsertElements,
    /// Collection row deletes.
    DeleteElements,
    /// Delete all rows of a collection.
    DeleteCollection,
}

/// A fully bound statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `insert into table (...) values (...)`.
    Insert {
        /// Target table.
        table: String,
        /// Primary key.
        id: Identifier,
        /// Initial version.
        version: Option<Value>,
        /// Column bindings.
        columns: Vec<(String, ColumnValue)>,
    },
    /// `update table set ... where id = ? [and version = ?]`.
    Update {
        /// Target table.
        table: String,
        /// Primary key.
        id: Identifier,
        /// Version the row must currently have.
        expected_version: Option<Value>,
        /// New version.
        version: Option<Value>,
        /// Column bindings.
        columns: Vec<(String, ColumnValue)>,
    },
    /// `delete from table where id = ? [and version = ?]`.
    Delete {
        /// Target table.
        table: String,
        /// Primary key.
        id: Identifier,
        /// Version the row must currently have.
        expected_version: Option<Value>,
    },
    /// `select id from table where id = ? [and version = ?] for update`.
    Lock {
        /// Target table.
        table: String,
        /// Primary key.
        id: Identifier,
        /// Version the row must currently have.
        expected_version: Option<Value>,
    },
    /// Inserts collection rows.
    InsertElements {
        /// Collection role.
        role: String,
        /// Owner identifier.
        owner: Identifier,
        /// Element values.
        elements: Vec<ColumnValue>,
    },
    /// Deletes individual collection rows.
    DeleteElements {
        /// Collection role.
        role: String,
        /// Owner identifier.
        owner: Identifier,
        /// Element values, one row each.
        elements: Vec<ColumnValue>,
    },
    /// Deletes every row of a collection.
    DeleteCollection {
        /// Collection role.
        role: String,
        /// Owner identifier.
        owner: Identifier,
    },
}

impl Statement {
    /// Returns the statement kind.
    #[must_use]
    pub const fn kind(&self) -> StatementKind {
        match self {
            Statement::Insert { .. } => StatementKind::Insert,
            Statement::Update { .. } => StatementKind::Update,
            Statement::Delete { .. } => StatementKind::Delete,
            Statement::Lock { .. } => StatementKind::Lock,
            Statement::InsertElements { .. } => StatementKind::InsertElements,
            Statement::DeleteElements { .. } => StatementKind::DeleteElements,
            Statement::DeleteCollection { .. } => StatementKind::DeleteCollection,
        }
    }

    /// Returns the table or collection role the statement targets.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. }
            | Statement::Lock { table, .. } => table,
            Statement::InsertElements { role, .. }
            | Statement::DeleteElements { role, .. }
            | Statement::DeleteCollection { role, .. } => role,
        }
    }

    /// Renders the parameterised SQL text.
    ///
    /// Two statements with the same text can share one batch.
    #[must_use]
    pub fn sql(&self) -> String {
        match self {
            Statement::Insert {
                table,
                version,
                columns,
                ..
            } => {
                let mut names = vec!["id".to_string()];
                if version.is_some() {
                    names.push("version".into());
                }
                names.extend(columns.iter().map(|(n, _)| n.clone()));
                let params = vec!["?"; names.len()].join(", ");
                format!("insert into {table} ({}) values ({params})", names.join(", "))
            }
            Statement::Update {
                table,
                expected_version,
                version,
                columns,
                ..
            } => {
                let mut sets: Vec<String> = Vec::new();
                if version.is_some() {
                    sets.push("version = ?".into());
                }
                sets.extend(columns.iter().map(|(n, _)| format!("{n} = ?")));
                format!(
                    "update {table} set {} where id = ?{}",
                    sets.join(", "),
                    version_predicate(expected_version.as_ref())
                )
            }
            Statement::Delete {
                table,
                expected_version,
                ..
            } => format!(
                "delete from {table} where id = ?{}",
                version_predicate(expected_version.as_ref())
            ),
            Statement::Lock {
                table,
                expected_version,
                ..
            } => format!(
                "select id from {table} where id = ?{} for update",
                version_predicate(expected_version.as_ref())
            ),
            Statement::InsertElements { role, .. } => {
                format!("insert into {role} (owner, element) values (?, ?)")
            }
            Statement::DeleteElements { role, .. } => {
                format!("delete from {role} where owner = ? and element = ?")
            }
            Statement::DeleteCollection { role, .. } => {
                format!("delete from {role} where owner = ?")
            }
        }
    }
}

fn version_predicate(expected: Option<&Value>) -> &'static str {
    if expected.is_some() {
        " and version = ?"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(table: &str, columns: &[&str]) -> Statement {
        Statement::Insert {
            table: table.into(),
            id: Identifier::from(1),
            version: None,
            columns: columns
                .iter()
                .map(|c| ((*c).to_string(), ColumnValue::Basic(Value::Null)))
                .collect(),
        }
    }

    #[test]
    fn insert_sql() {
        assert_eq!(
            insert("B", &["name", "c"]).sql(),
            "insert into B (id, name, c) values (?, ?, ?)"
        );
    }

    #[test]
    fn versioned_update_sql() {
        let st = Statement::Update {
            table: "B".into(),
            id: Identifier::from(1),
            expected_version: Some(Value::Integer(0)),
            version: Some(Value::Integer(1)),
            columns: vec![("name".into(), ColumnValue::Basic(Value::from("x")))],
        };
        assert_eq!(
            st.sql(),
            "update B set version = ?, name = ? where id = ? and version = ?"
        );
        assert_eq!(st.kind(), StatementKind::Update);
    }

    #[test]
    fn same_shape_same_sql() {
        let a = insert("B", &["name"]);
        let mut b = insert("B", &["name"]);
        if let Statement::Insert { id, .. } = &mut b {
            *id = Identifier::from(2);
        }
        assert_ne!(a, b);
        assert_eq!(a.sql(), b.sql());
        assert_ne!(a.sql(), insert("C", &["name"]).sql());
    }

    #[test]
    fn column_value_helpers() {
        let fk = ColumnValue::reference("C", Identifier::from(3));
        assert_eq!(fk.referenced(), Some(("C", &Identifier::from(3))));
        assert!(!fk.is_null());
        let null_fk = ColumnValue::Reference {
            table: "C".into(),
            id: None,
        };
        assert!(null_fk.is_null());
        assert_eq!(null_fk.to_string(), "C#null");
    }
}
