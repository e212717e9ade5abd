///
/// Small helpers shared by every module that calls into the SQLite C API.
///
/// Nothing here owns a handle; callers keep their handles alive for the
/// duration of each call.
///

use std::ffi::{c_char, c_int, CStr};

use rusqlite::ffi;
use sqlmarshal_core::{Error, Result};

/// Build an `Engine` error from the connection's last error.
pub(crate) fn engine_error(db: *mut ffi::sqlite3, rc: c_int) -> Error {
    if db.is_null() {
        return Error::Engine {
            code: rc,
            message: errstr(rc),
        };
    }
    let code = unsafe { ffi::sqlite3_extended_errcode(db) };
    let message = unsafe { cstr_to_string(ffi::sqlite3_errmsg(db)) }.unwrap_or_else(|| errstr(rc));
    Error::Engine { code, message }
}

pub(crate) fn check(db: *mut ffi::sqlite3, rc: c_int) -> Result<()> {
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(engine_error(db, rc))
    }
}

/// Generic English text for a result code.
pub(crate) fn errstr(rc: c_int) -> String {
    unsafe { cstr_to_string(ffi::sqlite3_errstr(rc)) }.unwrap_or_else(|| format!("result code {}", rc))
}

/// Copy a NUL-terminated string owned by the engine.
///
/// # Safety
///
/// `ptr` must be null or point at a NUL-terminated string that stays valid
/// for the duration of the call.
pub(crate) unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let s = unsafe { CStr::from_ptr(ptr) };
    Some(s.to_string_lossy().into_owned())
}

/// Length of a buffer as the engine's `int` byte count.
pub(crate) fn byte_len(len: usize) -> Result<c_int> {
    c_int::try_from(len).map_err(|_| Error::TooBig(len))
}

/// Reinterpret engine UTF-16 bytes (native endian) as code units.
///
/// The engine makes no alignment promise for the buffer, so units are
/// reassembled byte-wise.
pub(crate) fn utf16_units(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
        .collect()
}

/// Borrow `len` bytes from an engine pointer, treating null as empty.
///
/// # Safety
///
/// When non-null, `ptr` must be valid for `len` bytes until the returned
/// slice is dropped.
pub(crate) unsafe fn engine_bytes<'a>(ptr: *const u8, len: c_int) -> &'a [u8] {
    if ptr.is_null() || len <= 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(ptr, len as usize) }
    }
}

/// Bytes of `base` consumed before `tail`, clamped to `len`. A null tail
/// means the whole buffer was consumed.
pub(crate) fn offset_in<T>(base: *const T, tail: *const T, len: usize) -> usize {
    if tail.is_null() {
        return len;
    }
    (tail as usize).saturating_sub(base as usize).min(len)
}

/// True when `sql` holds nothing the engine would compile: whitespace,
/// `;`, `-- line` and `/* block */` comments.
pub(crate) fn is_blank_sql(sql: &str) -> bool {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ';');
        if rest.is_empty() {
            return true;
        }
        if let Some(comment) = rest.strip_prefix("--") {
            rest = comment.split_once('\n').map_or("", |(_, after)| after);
        } else if let Some(comment) = rest.strip_prefix("/*") {
            // An unterminated block comment runs to the end of input.
            rest = comment.split_once("*/").map_or("", |(_, after)| after);
        } else {
            return false;
        }
    }
}
