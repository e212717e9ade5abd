///
/// # Prepared Statements
///
/// A `Statement` owns exactly one prepared statement handle, borrowed from
/// its `Connection`. It exposes the engine primitives the binder and the
/// row decoder are built on:
///
/// - placeholder count and names (1-based)
/// - typed bind primitives driven by an encoded `Cell`
/// - step, reset and clear_bindings
/// - column count, names and per-row cell access
///
/// The handle is finalized by `finalize()` or on drop.
///

use std::ffi::{c_char, c_int, c_void};
use std::ptr;

use rusqlite::ffi;
use sqlmarshal_core::{
    decode, encode, Cell, CellRef, Error, Result, StorageClass, Text, TextEncoding, Value,
};
use tracing::{debug, trace, warn};

use crate::connection::Connection;
use crate::params::{self, Params};
use crate::raw;
use crate::rows::{self, QueryResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Row,
    Done,
}

pub struct Statement<'conn> {
    conn: &'conn Connection,
    stmt: *mut ffi::sqlite3_stmt,
}

impl<'conn> Statement<'conn> {
    pub(crate) fn prepare(conn: &'conn Connection, sql: &str) -> Result<Self> {
        let db = conn.handle();
        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        // `rest` is whatever follows the first statement.
        let (rc, rest) = match conn.text_encoding() {
            TextEncoding::Utf8 => {
                let len = raw::byte_len(sql.len())?;
                let base = sql.as_ptr().cast::<c_char>();
                let mut tail: *const c_char = ptr::null();
                let rc = unsafe { ffi::sqlite3_prepare_v2(db, base, len, &mut stmt, &mut tail) };
                let consumed = raw::offset_in(base, tail, sql.len());
                (rc, sql.get(consumed..).unwrap_or_default().to_string())
            }
            TextEncoding::Utf16 => {
                let units: Vec<u16> = sql.encode_utf16().collect();
                let len = raw::byte_len(units.len() * 2)?;
                let base = units.as_ptr().cast::<c_void>();
                let mut tail: *const c_void = ptr::null();
                let rc = unsafe { ffi::sqlite3_prepare16_v2(db, base, len, &mut stmt, &mut tail) };
                let consumed = raw::offset_in(base.cast::<u8>(), tail.cast::<u8>(), units.len() * 2) / 2;
                (rc, String::from_utf16_lossy(&units[consumed..]))
            }
        };
        raw::check(db, rc)?;
        if stmt.is_null() {
            return Err(Error::Engine {
                code: ffi::SQLITE_MISUSE,
                message: format!("no SQL statement in {:?}", sql),
            });
        }
        let statement = Self { conn, stmt };
        if !raw::is_blank_sql(&rest) {
            return Err(Error::Engine {
                code: ffi::SQLITE_MISUSE,
                message: format!(
                    "multiple statements in {:?}; run scripts with execute_batch",
                    sql
                ),
            });
        }
        debug!(
            sql = sql,
            params = statement.parameter_count(),
            columns = statement.column_count(),
            "prepared statement"
        );
        Ok(statement)
    }

    pub fn connection(&self) -> &'conn Connection {
        self.conn
    }

    pub fn parameter_count(&self) -> usize {
        let n = unsafe { ffi::sqlite3_bind_parameter_count(self.stmt) };
        n.max(0) as usize
    }

    /// Engine-reported name of a 1-based placeholder, marker included
    /// (`:a`, `@a`, `$a`, `?3`). `None` for bare `?` placeholders.
    pub fn parameter_name(&self, index: usize) -> Option<String> {
        let index = c_int::try_from(index).ok()?;
        unsafe { raw::cstr_to_string(ffi::sqlite3_bind_parameter_name(self.stmt, index)) }
    }

    pub fn column_count(&self) -> usize {
        let n = unsafe { ffi::sqlite3_column_count(self.stmt) };
        n.max(0) as usize
    }

    pub fn column_name(&self, index: usize) -> String {
        let Ok(index) = c_int::try_from(index) else {
            return String::new();
        };
        unsafe { raw::cstr_to_string(ffi::sqlite3_column_name(self.stmt, index)) }
            .unwrap_or_default()
    }

    pub fn column_names(&self) -> Vec<String> {
        (0..self.column_count()).map(|i| self.column_name(i)).collect()
    }

    /// Bind a whole value source, see `params::bind`.
    pub fn bind<P: Into<Params>>(&mut self, params: P) -> Result<()> {
        params::bind(self, &params.into())
    }

    /// Bind one value to a 1-based placeholder.
    pub fn bind_value(&mut self, index: usize, value: &Value) -> Result<()> {
        let cell = encode(value, self.conn.text_encoding());
        self.bind_cell(index, &cell)
    }

    pub(crate) fn bind_cell(&mut self, index: usize, cell: &Cell) -> Result<()> {
        let db = self.conn.handle();
        let slot = c_int::try_from(index).map_err(|_| Error::ArityMismatch {
            expected: self.parameter_count(),
            found: index,
        })?;
        trace!(index = index, class = %cell.storage_class(), "bind");
        let rc = unsafe {
            match cell {
                Cell::Null => ffi::sqlite3_bind_null(self.stmt, slot),
                Cell::Integer(i) => ffi::sqlite3_bind_int64(self.stmt, slot, *i),
                Cell::Float(f) => ffi::sqlite3_bind_double(self.stmt, slot, *f),
                Cell::Text(Text::Utf8(s)) => ffi::sqlite3_bind_text(
                    self.stmt,
                    slot,
                    s.as_ptr().cast::<c_char>(),
                    raw::byte_len(s.len())?,
                    ffi::SQLITE_TRANSIENT(),
                ),
                Cell::Text(Text::Utf16(units)) => ffi::sqlite3_bind_text16(
                    self.stmt,
                    slot,
                    units.as_ptr().cast::<c_void>(),
                    raw::byte_len(units.len() * 2)?,
                    ffi::SQLITE_TRANSIENT(),
                ),
                Cell::Blob(bytes) if bytes.is_empty() => {
                    ffi::sqlite3_bind_zeroblob(self.stmt, slot, 0)
                }
                Cell::Blob(bytes) => ffi::sqlite3_bind_blob(
                    self.stmt,
                    slot,
                    bytes.as_ptr().cast::<c_void>(),
                    raw::byte_len(bytes.len())?,
                    ffi::SQLITE_TRANSIENT(),
                ),
            }
        };
        raw::check(db, rc)
    }

    pub(crate) fn step(&mut self) -> Result<Step> {
        match unsafe { ffi::sqlite3_step(self.stmt) } {
            ffi::SQLITE_ROW => Ok(Step::Row),
            ffi::SQLITE_DONE => Ok(Step::Done),
            rc => Err(raw::engine_error(self.conn.handle(), rc)),
        }
    }

    /// Storage class of a column in the current row.
    pub(crate) fn column_class(&self, index: c_int) -> StorageClass {
        match unsafe { ffi::sqlite3_column_type(self.stmt, index) } {
            ffi::SQLITE_INTEGER => StorageClass::Integer,
            ffi::SQLITE_FLOAT => StorageClass::Float,
            ffi::SQLITE_TEXT => StorageClass::Text,
            ffi::SQLITE_BLOB => StorageClass::Blob,
            _ => StorageClass::Null,
        }
    }

    /// Decode one column of the current row. The engine's buffers are only
    /// valid until the next step, so the value is copied out here.
    pub(crate) fn column_value(&self, index: usize) -> Result<Value> {
        let col = c_int::try_from(index).map_err(|_| Error::Engine {
            code: ffi::SQLITE_RANGE,
            message: format!("column index {} out of range", index),
        })?;
        let stmt = self.stmt;
        match self.column_class(col) {
            StorageClass::Null => decode(CellRef::Null),
            StorageClass::Integer => {
                decode(CellRef::Integer(unsafe { ffi::sqlite3_column_int64(stmt, col) }))
            }
            StorageClass::Float => {
                decode(CellRef::Float(unsafe { ffi::sqlite3_column_double(stmt, col) }))
            }
            StorageClass::Text => match self.conn.text_encoding() {
                TextEncoding::Utf8 => {
                    let bytes = unsafe {
                        let ptr = ffi::sqlite3_column_text(stmt, col);
                        raw::engine_bytes(ptr, ffi::sqlite3_column_bytes(stmt, col))
                    };
                    decode(CellRef::Text8(bytes))
                }
                TextEncoding::Utf16 => {
                    let units = unsafe {
                        let ptr = ffi::sqlite3_column_text16(stmt, col).cast::<u8>();
                        raw::utf16_units(raw::engine_bytes(
                            ptr,
                            ffi::sqlite3_column_bytes16(stmt, col),
                        ))
                    };
                    decode(CellRef::Text16(&units))
                }
            },
            StorageClass::Blob => {
                let bytes = unsafe {
                    let ptr = ffi::sqlite3_column_blob(stmt, col).cast::<u8>();
                    raw::engine_bytes(ptr, ffi::sqlite3_column_bytes(stmt, col))
                };
                decode(CellRef::Blob(bytes))
            }
        }
    }

    /// Run the statement to completion, see `rows::decode_all`.
    pub fn query(&mut self) -> Result<QueryResult> {
        rows::decode_all(self)
    }

    /// Rewind so the statement can run again. Bindings are kept.
    pub fn reset(&mut self) -> Result<()> {
        let rc = unsafe { ffi::sqlite3_reset(self.stmt) };
        raw::check(self.conn.handle(), rc)
    }

    /// Rewind without surfacing the error of the previous step.
    pub(crate) fn rewind(&mut self) {
        unsafe { ffi::sqlite3_reset(self.stmt) };
    }

    pub fn clear_bindings(&mut self) -> Result<()> {
        let rc = unsafe { ffi::sqlite3_clear_bindings(self.stmt) };
        raw::check(self.conn.handle(), rc)
    }

    pub fn finalize(mut self) -> Result<()> {
        self.finalize_handle()
    }

    fn finalize_handle(&mut self) -> Result<()> {
        if self.stmt.is_null() {
            return Ok(());
        }
        let rc = unsafe { ffi::sqlite3_finalize(self.stmt) };
        self.stmt = ptr::null_mut();
        raw::check(self.conn.handle(), rc)
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finalize_handle() {
            warn!(error = %e, "failed to finalize statement");
        }
    }
}

impl std::fmt::Debug for Statement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sql = unsafe { raw::cstr_to_string(ffi::sqlite3_sql(self.stmt)) };
        f.debug_struct("Statement").field("sql", &sql).finish()
    }
}
