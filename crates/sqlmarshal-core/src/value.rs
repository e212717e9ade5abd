///
/// Host Value Representation
///
/// The engine types every cell dynamically with one of five storage
/// classes. On the host side this is mirrored by the closed `Value` enum,
/// plus an `Opaque` variant for host values that have no native mapping
/// and travel through a Blob column inside a serialization envelope.
///
/// Conversions:
/// - i8, i16, i32, i64, u8, u16, u32, bool -> Integer
/// - f32, f64 -> Float
/// - String, &str -> Text
/// - Vec<u8>, &[u8] -> Blob
/// - Null, Option::None -> Null
/// - anything serde can serialize -> Opaque (via `Value::opaque`)
///

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::envelope::Opaque;
use crate::error::{Error, Result};

/// Runtime type tag of an engine cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageClass {
    Null,
    Integer,
    Float,
    Text,
    Blob,
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageClass::Null => "null",
            StorageClass::Integer => "integer",
            StorageClass::Float => "float",
            StorageClass::Text => "text",
            StorageClass::Blob => "blob",
        };
        f.write_str(name)
    }
}

/// Engine NULL, distinct from `Option::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Null;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Opaque(Opaque),
}

impl Value {
    /// Wrap a host value with no native storage class.
    pub fn opaque<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Opaque::new(value).map(Value::Opaque)
    }

    /// Storage class this value is bound as. Opaque values ride in blobs.
    pub fn storage_class(&self) -> StorageClass {
        match self {
            Value::Null => StorageClass::Null,
            Value::Integer(_) => StorageClass::Integer,
            Value::Float(_) => StorageClass::Float,
            Value::Text(_) => StorageClass::Text,
            Value::Blob(_) | Value::Opaque(_) => StorageClass::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Float view; integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<&Opaque> {
        match self {
            Value::Opaque(o) => Some(o),
            _ => None,
        }
    }

    /// Recover the typed host value behind an opaque.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Value::Opaque(o) => o.deserialize(),
            other => Err(Error::TypeMismatch {
                expected: "opaque",
                found: other.storage_class(),
            }),
        }
    }

    /// Typed extraction, see `FromValue`.
    pub fn get<T: FromValue>(&self) -> Result<T> {
        T::from_value(self)
    }
}

impl From<Null> for Value {
    fn from(_: Null) -> Self {
        Value::Null
    }
}

macro_rules! integer_into_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::Integer(i64::from(v))
                }
            }
        )*
    };
}

integer_into_value!(i8, i16, i32, i64, u8, u16, u32, bool);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl From<Opaque> for Value {
    fn from(v: Opaque) -> Self {
        Value::Opaque(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

/// Typed extraction from a decoded value.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch<T>(expected: &'static str, value: &Value) -> Result<T> {
    Err(Error::TypeMismatch {
        expected,
        found: value.storage_class(),
    })
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().map_or_else(|| mismatch("integer", value), Ok)
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| Error::TypeMismatch {
            expected: "32-bit integer",
            found: StorageClass::Integer,
        })
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        i64::from_value(value).map(|i| i != 0)
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().map_or_else(|| mismatch("float", value), Ok)
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => mismatch("text", other),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Blob(b) => Ok(b.clone()),
            other => mismatch("blob", other),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}
