//!
//! sqlmarshal-core - Engine-Independent Value Marshalling
//!
//! This crate provides the types shared by every sqlmarshal engine binding:
//!
//! - `Value`, `Null` and `Opaque` for host-side values
//! - `StorageClass`, `Cell` and `CellRef` for the engine-side representation
//! - `encode`/`decode`, the total mapping between the two
//! - The opaque-value envelope that carries serde-serializable host values
//!   through Blob columns
//! - `Error` and `Result`, shared by the codec and the engine bindings
//!

pub mod codec;
pub mod envelope;
pub mod error;
pub mod value;

pub use codec::{decode, encode, encode_text, Cell, CellRef, Text, TextEncoding};
pub use envelope::{Opaque, ENVELOPE_VERSION, MAGIC_PREFIX};
pub use error::{Error, Result};
pub use value::{FromValue, Null, StorageClass, Value};
