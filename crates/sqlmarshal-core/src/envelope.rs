///
/// Opaque Value Envelope
///
/// Host values without a native storage class are serialized to
/// self-describing MessagePack and stored in a Blob column behind a fixed
/// marker:
///
///   MAGIC_PREFIX (18 bytes) | ENVELOPE_VERSION (1 byte) | MessagePack payload
///
/// Structs are written with field names, and floats keep their IEEE bits,
/// so infinities and NaN survive the trip.
///
/// Reading a blob that starts with the full marker must parse as exactly
/// one MessagePack value; anything
/// shorter or only partially matching is handed back as raw bytes. A raw
/// blob that genuinely begins with the marker is misread as an envelope.
///

use std::io::Cursor;

use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAGIC_PREFIX: [u8; 18] = *b"\x7fSQLMARSHAL-OPAQUE";

pub const ENVELOPE_VERSION: u8 = 1;

/// A serialized host value, compared by payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Opaque {
    payload: Vec<u8>,
}

impl Opaque {
    pub fn new<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let payload =
            rmp_serde::to_vec_named(value).map_err(|e| Error::UnsupportedValue(e.to_string()))?;
        Ok(Self { payload })
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        rmp_serde::from_slice(&self.payload).map_err(|e| {
            Error::CorruptEnvelope(format!(
                "cannot decode as {}: {}",
                std::any::type_name::<T>(),
                e
            ))
        })
    }

    /// The generic JSON view of the payload. Non-finite floats show up as
    /// `null`.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        self.deserialize()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

pub fn has_magic_prefix(bytes: &[u8]) -> bool {
    bytes.starts_with(&MAGIC_PREFIX)
}

pub fn seal(opaque: &Opaque) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAGIC_PREFIX.len() + 1 + opaque.payload.len());
    out.extend_from_slice(&MAGIC_PREFIX);
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(&opaque.payload);
    out
}

/// `None` when `bytes` is not an envelope.
pub fn open(bytes: &[u8]) -> Option<Result<Opaque>> {
    let rest = bytes.strip_prefix(&MAGIC_PREFIX[..])?;
    Some(open_body(rest))
}

fn open_body(body: &[u8]) -> Result<Opaque> {
    let (&version, payload) = body
        .split_first()
        .ok_or_else(|| Error::CorruptEnvelope("missing version byte".to_string()))?;
    if version != ENVELOPE_VERSION {
        return Err(Error::CorruptEnvelope(format!(
            "unsupported envelope version {}",
            version
        )));
    }
    validate(payload)?;
    Ok(Opaque {
        payload: payload.to_vec(),
    })
}

/// The payload must hold exactly one well-formed value.
fn validate(payload: &[u8]) -> Result<()> {
    let mut cursor = Cursor::new(payload);
    {
        let mut de = rmp_serde::Deserializer::new(&mut cursor);
        IgnoredAny::deserialize(&mut de).map_err(|e| Error::CorruptEnvelope(e.to_string()))?;
    }
    let consumed = cursor.position() as usize;
    if consumed != payload.len() {
        return Err(Error::CorruptEnvelope(format!(
            "{} trailing bytes after payload",
            payload.len() - consumed
        )));
    }
    Ok(())
}
