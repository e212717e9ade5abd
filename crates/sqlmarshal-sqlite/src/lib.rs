///
/// sqlmarshal SQLite Binding
///
/// Exchanges typed host values with SQLite through its C API (rusqlite's
/// bundled ffi layer, so no system SQLite is needed) and installs host
/// closures as SQL functions.
///
/// Architecture:
/// - `Connection` owns the database handle; `Statement` borrows it and owns
///   one prepared statement handle.
/// - `params` applies positional or named value sources to placeholders,
///   encoding each value with the sqlmarshal-core codec.
/// - `rows` steps a statement to completion and decodes every cell into a
///   columnar `ResultSet`, or reports a change count for DDL/DML.
/// - `functions` registers scalar and aggregate closures behind C
///   trampolines that decode arguments and encode results.
/// - `transaction` runs a closure under a savepoint that is rolled back on
///   any failure.
///
/// ```rust,ignore
/// use sqlmarshal_sqlite::{params, Arity, Connection, Value};
///
/// let conn = Connection::open_in_memory()?;
/// conn.register_scalar("triple", Arity::Exact(1), |args: &[Value]| {
///     Ok(args[0].get::<i64>()? * 3)
/// })?;
/// let result = conn.query("SELECT triple(?)", params![14])?;
/// assert_eq!(result.first_value(), Some(Value::Integer(42)));
/// ```
///

pub mod config;
pub mod connection;
pub mod functions;
pub mod params;
mod raw;
pub mod rows;
pub mod statement;
pub mod transaction;

pub use config::Config;
pub use connection::Connection;
pub use functions::{Aggregate, Arity, FunctionKind, FunctionOptions, RegisteredFunction};
pub use params::{NamedParams, Params};
pub use rows::{Column, QueryResult, ResultSet};
pub use statement::Statement;

pub use sqlmarshal_core::{
    Error, FromValue, Null, Opaque, Result, StorageClass, TextEncoding, Value,
};
