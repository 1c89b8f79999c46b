//! Bindable scalar values.

use crate::error::{CodecError, CodecResult};
use crate::identifier::Identifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A scalar property value, as bound to a statement or held in a snapshot.
///
/// Floats are intentionally absent: values must be totally ordered and
/// hashable so that snapshots can be compared and used as keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Text string.
    Text(String),
    /// Byte string.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true if this is `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the integer payload, if any.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text payload, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload or a type mismatch error.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::TypeMismatch` for non-integer values.
    pub fn expect_integer(&self) -> CodecResult<i64> {
        self.as_integer().ok_or(CodecError::TypeMismatch {
            expected: "integer",
            found: self.type_name(),
        })
    }

    /// Returns a short name of the value's type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Identifier> for Value {
    fn from(id: Identifier) -> Self {
        match id {
            Identifier::Long(v) => Value::Integer(v),
            Identifier::Text(s) => Value::Text(s),
            Identifier::Uuid(u) => Value::Bytes(u.as_bytes().to_vec()),
        }
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions() {
        assert_eq!(Value::from(3_i64), Value::Integer(3));
        assert_eq!(Value::from("a"), Value::Text("a".into()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Identifier::Long(9)), Value::Integer(9));
    }

    #[test]
    fn expect_integer_reports_type() {
        assert_eq!(Value::Integer(1).expect_integer(), Ok(1));
        assert_eq!(
            Value::from("x").expect_integer(),
            Err(CodecError::TypeMismatch {
                expected: "integer",
                found: "text"
            })
        );
    }

    #[test]
    fn null_sorts_first() {
        let mut values = vec![Value::Integer(1), Value::Null, Value::Bool(false)];
        values.sort();
        assert_eq!(values[0], Value::Null);
    }

    #[test]
    fn display() {
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::from("x").to_string(), "'x'");
        assert_eq!(Value::Bytes(vec![0; 4]).to_string(), "<4 bytes>");
    }
}
