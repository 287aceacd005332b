//! CBOR encoding and decoding.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes any serializable value to CBOR bytes.
///
/// # Errors
///
/// Returns [`CodecError::EncodingFailed`] if serialization fails.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(value, &mut buffer)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}

/// Decodes CBOR bytes into a value of type `T`.
///
/// # Errors
///
/// Returns [`CodecError::DecodingFailed`] if the bytes are not valid CBOR
/// or do not match the shape of `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    if bytes.is_empty() {
        return Err(CodecError::decoding_failed("empty input"));
    }
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}

/// Encodes a [`Value`] deterministically.
///
/// Map keys are always emitted in sorted order, so equal values produce
/// identical bytes regardless of how they were built. These bytes are what
/// content-addressed identifiers are derived from.
///
/// # Errors
///
/// Returns an error if the value contains a non-finite float.
pub fn canonical_bytes(value: &Value) -> CodecResult<Vec<u8>> {
    reject_non_finite(value)?;
    to_cbor(value)
}

fn reject_non_finite(value: &Value) -> CodecResult<()> {
    match value {
        Value::Float(f) if !f.is_finite() => Err(CodecError::encoding_failed(
            "non-finite floats have no canonical form",
        )),
        Value::Array(items) => items.iter().try_for_each(reject_non_finite),
        Value::Map(map) => map.values().try_for_each(reject_non_finite),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn roundtrip_nested_value() {
        let value = Value::map([
            (
                "todos",
                Value::Array(vec![
                    Value::map([("title", Value::from("a")), ("done", Value::from(false))]),
                    Value::map([("title", Value::from("b")), ("rank", Value::from(2.5))]),
                ]),
            ),
            ("count", Value::from(2)),
            ("cursor", Value::Null),
        ]);
        let bytes = to_cbor(&value).unwrap();
        let decoded: Value = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn garbage_is_a_typed_error() {
        let result: CodecResult<Value> = from_cbor(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::DecodingFailed { .. })));
    }

    #[test]
    fn empty_input_is_rejected() {
        let result: CodecResult<Value> = from_cbor(&[]);
        assert!(matches!(result, Err(CodecError::DecodingFailed { .. })));
    }

    #[test]
    fn unsigned_overflow_fails() {
        let bytes = to_cbor(&u64::MAX).unwrap();
        let result: CodecResult<Value> = from_cbor(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn canonical_bytes_reject_nan() {
        let value = Value::map([("x", Value::Float(f64::NAN))]);
        assert!(canonical_bytes(&value).is_err());
    }

    proptest! {
        #[test]
        fn canonical_bytes_ignore_insertion_order(
            entries in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 1..12)
        ) {
            let forward = Value::map(entries.iter().map(|(k, v)| (k.clone(), Value::Integer(*v))));
            let backward =
                Value::map(entries.iter().rev().map(|(k, v)| (k.clone(), Value::Integer(*v))));
            prop_assert_eq!(canonical_bytes(&forward).unwrap(), canonical_bytes(&backward).unwrap());
        }
    }
}
