///
/// Value Codec
///
/// Bidirectional mapping between host `Value`s and the engine's raw cell
/// representation:
///
/// - `encode` produces an owned `Cell` ready to hand to a bind or result
///   primitive. Text is laid out in the connection's text width.
/// - `decode` reads a borrowed `CellRef` pointing into engine memory and
///   copies it into an owned `Value` before the engine reclaims the buffer.
///
/// Blobs carrying the envelope marker decode back to `Value::Opaque`.
///

use serde::{Deserialize, Serialize};

use crate::envelope;
use crate::error::Result;
use crate::value::{StorageClass, Value};

/// Text width a connection exchanges with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Utf16,
}

/// Owned text in one of the engine's widths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Text {
    Utf8(String),
    Utf16(Vec<u16>),
}

impl Text {
    /// Length in bytes as the engine counts it.
    pub fn byte_len(&self) -> usize {
        match self {
            Text::Utf8(s) => s.len(),
            Text::Utf16(units) => units.len() * 2,
        }
    }
}

/// Owned engine-side representation of one bound value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Float(f64),
    Text(Text),
    Blob(Vec<u8>),
}

impl Cell {
    pub fn storage_class(&self) -> StorageClass {
        match self {
            Cell::Null => StorageClass::Null,
            Cell::Integer(_) => StorageClass::Integer,
            Cell::Float(_) => StorageClass::Float,
            Cell::Text(_) => StorageClass::Text,
            Cell::Blob(_) => StorageClass::Blob,
        }
    }

    pub fn view(&self) -> CellRef<'_> {
        match self {
            Cell::Null => CellRef::Null,
            Cell::Integer(i) => CellRef::Integer(*i),
            Cell::Float(f) => CellRef::Float(*f),
            Cell::Text(Text::Utf8(s)) => CellRef::Text8(s.as_bytes()),
            Cell::Text(Text::Utf16(units)) => CellRef::Text16(units),
            Cell::Blob(b) => CellRef::Blob(b),
        }
    }
}

/// Borrowed view of a cell owned by the engine.
///
/// Text8 bytes may be invalid UTF-8 if the engine was handed such bytes;
/// decoding is lossy rather than failing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellRef<'a> {
    Null,
    Integer(i64),
    Float(f64),
    Text8(&'a [u8]),
    Text16(&'a [u16]),
    Blob(&'a [u8]),
}

impl CellRef<'_> {
    pub fn storage_class(&self) -> StorageClass {
        match self {
            CellRef::Null => StorageClass::Null,
            CellRef::Integer(_) => StorageClass::Integer,
            CellRef::Float(_) => StorageClass::Float,
            CellRef::Text8(_) | CellRef::Text16(_) => StorageClass::Text,
            CellRef::Blob(_) => StorageClass::Blob,
        }
    }
}

pub fn encode(value: &Value, encoding: TextEncoding) -> Cell {
    match value {
        Value::Null => Cell::Null,
        Value::Integer(i) => Cell::Integer(*i),
        Value::Float(f) => Cell::Float(*f),
        Value::Text(s) => Cell::Text(encode_text(s, encoding)),
        Value::Blob(b) => Cell::Blob(b.clone()),
        Value::Opaque(o) => Cell::Blob(envelope::seal(o)),
    }
}

pub fn encode_text(s: &str, encoding: TextEncoding) -> Text {
    match encoding {
        TextEncoding::Utf8 => Text::Utf8(s.to_string()),
        TextEncoding::Utf16 => Text::Utf16(s.encode_utf16().collect()),
    }
}

pub fn decode(cell: CellRef<'_>) -> Result<Value> {
    let value = match cell {
        CellRef::Null => Value::Null,
        CellRef::Integer(i) => Value::Integer(i),
        CellRef::Float(f) => Value::Float(f),
        CellRef::Text8(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        CellRef::Text16(units) => Value::Text(String::from_utf16_lossy(units)),
        CellRef::Blob(bytes) => match envelope::open(bytes) {
            Some(opened) => Value::Opaque(opened?),
            None => Value::Blob(bytes.to_vec()),
        },
    };
    Ok(value)
}
