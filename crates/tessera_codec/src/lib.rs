//! # Tessera Codec
//!
//! Value model and CBOR encoding for Tessera.
//!
//! This crate provides:
//! - [`Value`], the dynamic value used for query shapes and entity attributes
//! - CBOR encoding/decoding for anything `serde` can describe
//! - [`canonical_bytes`], a deterministic encoding suitable for hashing
//!
//! ## Usage
//!
//! ```
//! use tessera_codec::{from_cbor, to_cbor, Value};
//!
//! let value = Value::map([("todos", Value::empty_map())]);
//! let bytes = to_cbor(&value).unwrap();
//! let decoded: Value = from_cbor(&bytes).unwrap();
//! assert_eq!(value, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod value;

pub use cbor::{canonical_bytes, from_cbor, to_cbor};
pub use error::{CodecError, CodecResult};
pub use value::Value;
