///
/// # Connections
///
/// A `Connection` exclusively owns one SQLite database handle. It is neither
/// `Send` nor `Sync`: the engine serializes access to a handle, so every
/// statement, binding and function call on it runs on the owning thread.
///
/// Statements borrow the connection, so they are always finalized before
/// the handle is closed. Registered functions are owned by the engine and
/// released through their destroy callbacks when the handle closes.
///

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{c_char, CString};
use std::path::Path;
use std::ptr;

use rusqlite::ffi;
use sqlmarshal_core::{Error, Result, TextEncoding};
use tracing::{debug, warn};

use crate::config::Config;
use crate::functions::{FunctionKey, RegisteredFunction};
use crate::params::Params;
use crate::raw;
use crate::rows::QueryResult;
use crate::statement::Statement;

pub struct Connection {
    db: *mut ffi::sqlite3,
    config: Config,
    pub(crate) functions: RefCell<HashMap<FunctionKey, RegisteredFunction>>,
}

impl Connection {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, &Config::default())
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(&Config::default())
    }

    pub fn open_in_memory_with_config(config: &Config) -> Result<Self> {
        Self::open_with_config(":memory:", config)
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let path = path.as_ref();
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| Error::Config(format!("path {} contains a NUL byte", path.display())))?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, config.open_flags(), ptr::null())
        };
        if rc != ffi::SQLITE_OK {
            let err = raw::engine_error(db, rc);
            if !db.is_null() {
                unsafe { ffi::sqlite3_close(db) };
            }
            return Err(err);
        }

        let conn = Self {
            db,
            config: config.clone(),
            functions: RefCell::new(HashMap::new()),
        };
        if let Some(millis) = config.busy_timeout_ms {
            let millis = i32::try_from(millis).unwrap_or(i32::MAX);
            raw::check(db, unsafe { ffi::sqlite3_busy_timeout(db, millis) })?;
        }
        debug!(path = %path.display(), encoding = ?config.text_encoding, "opened connection");
        Ok(conn)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn text_encoding(&self) -> TextEncoding {
        self.config.text_encoding
    }

    pub(crate) fn handle(&self) -> *mut ffi::sqlite3 {
        self.db
    }

    pub fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
        Statement::prepare(self, sql)
    }

    /// Prepare, bind and run one statement.
    ///
    /// Row-producing statements yield `QueryResult::Rows`; statements without
    /// result columns yield the number of rows they changed.
    pub fn query<P: Into<Params>>(&self, sql: &str, params: P) -> Result<QueryResult> {
        let mut stmt = self.prepare(sql)?;
        stmt.bind(params)?;
        let result = stmt.query()?;
        stmt.finalize()?;
        Ok(result)
    }

    /// Run a statement and report how many rows it changed. Any rows it
    /// returns (`INSERT .. RETURNING`) are discarded.
    pub fn execute<P: Into<Params>>(&self, sql: &str, params: P) -> Result<i64> {
        let before = self.total_changes();
        match self.query(sql, params)? {
            QueryResult::Changes(n) => Ok(n),
            QueryResult::Rows(_) => Ok(self.total_changes() - before),
        }
    }

    /// Hand a semicolon-separated script straight to the engine.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let c_sql = CString::new(sql)
            .map_err(|_| Error::Engine {
                code: ffi::SQLITE_MISUSE,
                message: "SQL text contains a NUL byte".to_string(),
            })?;
        let mut errmsg: *mut c_char = ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_exec(self.db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg)
        };
        if rc == ffi::SQLITE_OK {
            return Ok(());
        }
        let message = unsafe { raw::cstr_to_string(errmsg) };
        if !errmsg.is_null() {
            unsafe { ffi::sqlite3_free(errmsg.cast()) };
        }
        match message {
            Some(message) => Err(Error::Engine {
                code: unsafe { ffi::sqlite3_extended_errcode(self.db) },
                message,
            }),
            None => Err(raw::engine_error(self.db, rc)),
        }
    }

    pub fn last_insert_rowid(&self) -> i64 {
        unsafe { ffi::sqlite3_last_insert_rowid(self.db) }
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> i64 {
        unsafe { ffi::sqlite3_changes64(self.db) }
    }

    /// Rows changed since the connection was opened.
    pub fn total_changes(&self) -> i64 {
        unsafe { ffi::sqlite3_total_changes64(self.db) }
    }

    /// `false` while a transaction or savepoint is open.
    pub fn is_autocommit(&self) -> bool {
        unsafe { ffi::sqlite3_get_autocommit(self.db) != 0 }
    }

    /// Functions currently registered through this connection.
    pub fn functions(&self) -> Vec<RegisteredFunction> {
        let mut list: Vec<RegisteredFunction> =
            self.functions.borrow().values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then(a.arity.cmp(&b.arity)));
        list
    }

    pub fn close(mut self) -> Result<()> {
        self.close_handle()
    }

    fn close_handle(&mut self) -> Result<()> {
        if self.db.is_null() {
            return Ok(());
        }
        let rc = unsafe { ffi::sqlite3_close_v2(self.db) };
        if rc != ffi::SQLITE_OK {
            return Err(raw::engine_error(self.db, rc));
        }
        self.db = ptr::null_mut();
        self.functions.borrow_mut().clear();
        debug!("closed connection");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close_handle() {
            warn!(error = %e, "failed to close connection");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("functions", &self.functions.borrow().len())
            .finish()
    }
}
