///
/// # Savepoint Transactions
///
/// `Connection::transaction` runs a closure inside a uniquely named
/// savepoint with `PRAGMA synchronous = OFF`:
///
/// - body returns `Ok`: the savepoint is released
/// - body returns `Err` or panics: the savepoint is rolled back and released
/// - in every case the previous synchronous mode is put back
///
/// Only the outermost call changes the synchronous mode. A nested call
/// opens its own savepoint inside the enclosing one.
///
/// Cleanup lives in `SavepointGuard::drop`, so it also runs while a panic
/// unwinds. Cleanup failures are logged and never replace the body's error.
///

use std::sync::atomic::{AtomicU64, Ordering};

use sqlmarshal_core::{Error, Result};
use tracing::{debug, warn};

use crate::connection::Connection;

static SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_savepoint_name() -> String {
    let seq = SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("sqlmarshal_sp_{}_{}", std::process::id(), seq)
}

impl Connection {
    pub fn transaction<T, E, F>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<Error>,
    {
        let mut guard = SavepointGuard::begin(self)?;
        let value = body(self)?;
        guard.release()?;
        Ok(value)
    }

    /// Current `PRAGMA synchronous` level (0 = OFF .. 3 = EXTRA).
    pub fn synchronous(&self) -> Result<i64> {
        self.query("PRAGMA synchronous", ())?
            .first_value()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::Engine {
                code: rusqlite::ffi::SQLITE_ERROR,
                message: "PRAGMA synchronous returned no value".to_string(),
            })
    }

    pub fn set_synchronous(&self, level: i64) -> Result<()> {
        self.execute_batch(&format!("PRAGMA synchronous = {}", level))
    }
}

struct SavepointGuard<'c> {
    conn: &'c Connection,
    name: String,
    prior_sync: Option<i64>,
    released: bool,
}

impl<'c> SavepointGuard<'c> {
    fn begin(conn: &'c Connection) -> Result<Self> {
        // The engine only allows changing the safety level outside a
        // transaction, so nested savepoints inherit the outer setting.
        let prior_sync = if conn.is_autocommit() {
            let level = conn.synchronous()?;
            conn.set_synchronous(0)?;
            Some(level)
        } else {
            None
        };
        let mut guard = Self {
            conn,
            name: next_savepoint_name(),
            prior_sync,
            released: false,
        };
        if let Err(e) = conn.execute_batch(&format!("SAVEPOINT {}", guard.name)) {
            // Nothing to roll back; only the sync mode needs restoring.
            guard.released = true;
            return Err(e);
        }
        debug!(savepoint = %guard.name, "opened savepoint");
        Ok(guard)
    }

    fn release(&mut self) -> Result<()> {
        self.conn
            .execute_batch(&format!("RELEASE SAVEPOINT {}", self.name))?;
        self.released = true;
        debug!(savepoint = %self.name, "released savepoint");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.conn.execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}",
            name = self.name
        ))
    }
}

impl Drop for SavepointGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            match self.rollback() {
                Ok(()) => debug!(savepoint = %self.name, "rolled back savepoint"),
                Err(e) => warn!(savepoint = %self.name, error = %e, "rollback failed"),
            }
        }
        if let Some(level) = self.prior_sync.take() {
            if let Err(e) = self.conn.set_synchronous(level) {
                warn!(level = level, error = %e, "failed to restore synchronous mode");
            }
        }
    }
}
