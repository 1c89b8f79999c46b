//! # Hibernia Codec
//!
//! Scalar values, entity identifiers and canonical CBOR disassembly for
//! Hibernia.
//!
//! Everything that leaves a session in serialized form goes through this
//! crate: second-level cache entries, serialized proxies and detached
//! snapshots. Encoding is deterministic, so identical inputs produce
//! identical bytes.
//!
//! ## Usage
//!
//! ```
//! use hibernia_codec::{from_cbor, to_canonical_cbor, Identifier, Value};
//!
//! let state = vec![Value::Integer(42), Value::from("hello")];
//! let bytes = to_canonical_cbor(&state).unwrap();
//! let decoded: Vec<Value> = from_cbor(&bytes).unwrap();
//! assert_eq!(state, decoded);
//!
//! let id = Identifier::from(7);
//! assert_eq!(id.to_string(), "7");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod identifier;
mod value;

pub use error::{CodecError, CodecResult};
pub use identifier::Identifier;
pub use value::Value;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a serializable value to CBOR bytes.
///
/// # Errors
///
/// Returns `CodecError::EncodingFailed` if the value cannot be represented.
pub fn to_canonical_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(value, &mut buffer).map_err(|e| CodecError::EncodingFailed {
        message: format!("{e:?}"),
    })?;
    Ok(buffer)
}

/// Decodes CBOR bytes into a value.
///
/// # Errors
///
/// Returns `CodecError::DecodingFailed` if the bytes are truncated or do not
/// describe a `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    if bytes.is_empty() {
        return Err(CodecError::UnexpectedEof);
    }
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::DecodingFailed {
        message: format!("{e:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn roundtrip_state_vector() {
        let state = vec![
            Value::Null,
            Value::Bool(true),
            Value::Integer(-17),
            Value::Text("text".into()),
            Value::Bytes(vec![1, 2, 3]),
        ];
        let bytes = to_canonical_cbor(&state).unwrap();
        let decoded: Vec<Value> = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = to_canonical_cbor(&(Identifier::from(5), Value::from("x"))).unwrap();
        let b = to_canonical_cbor(&(Identifier::from(5), Value::from("x"))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_input_is_eof() {
        let result: CodecResult<Value> = from_cbor(&[]);
        assert_eq!(result, Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn garbage_fails_to_decode() {
        let result: CodecResult<Identifier> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::DecodingFailed { .. })));
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let _: CodecResult<Vec<Value>> = from_cbor(&bytes);
        }

        #[test]
        fn integer_order_is_preserved(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(Value::Integer(a).cmp(&Value::Integer(b)), a.cmp(&b));
        }
    }
}
