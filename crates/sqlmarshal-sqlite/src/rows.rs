///
/// # Row Decoding
///
/// `decode_all` drives a bound statement to completion and materializes a
/// columnar `ResultSet`, or a change count for statements with no result
/// columns.
///
/// Column containers take their type from the first row. Every later cell
/// is still checked against it: NULLs fill `None` slots, and a cell of a
/// different storage class turns the column into `Column::Mixed` so no
/// value is ever reinterpreted. Opaque values always live in `Mixed`.
///

use sqlmarshal_core::{Result, StorageClass, Value};
use tracing::trace;

use crate::statement::{Statement, Step};

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Rows(ResultSet),
    /// Net rows changed by a statement without result columns.
    Changes(i64),
}

impl QueryResult {
    pub fn rows(&self) -> Option<&ResultSet> {
        match self {
            QueryResult::Rows(rs) => Some(rs),
            QueryResult::Changes(_) => None,
        }
    }

    pub fn into_rows(self) -> Option<ResultSet> {
        match self {
            QueryResult::Rows(rs) => Some(rs),
            QueryResult::Changes(_) => None,
        }
    }

    pub fn changes(&self) -> Option<i64> {
        match self {
            QueryResult::Changes(n) => Some(*n),
            QueryResult::Rows(_) => None,
        }
    }

    /// First column of the first row, for single-value queries.
    pub fn first_value(&self) -> Option<Value> {
        self.rows()?.value(0, 0)
    }
}

/// One column of decoded values.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// Only NULLs so far; holds the count.
    Null(usize),
    Integer(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
    Blob(Vec<Option<Vec<u8>>>),
    Mixed(Vec<Value>),
}

impl Default for Column {
    fn default() -> Self {
        Column::Null(0)
    }
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Null(n) => *n,
            Column::Integer(v) => v.len(),
            Column::Float(v) => v.len(),
            Column::Text(v) => v.len(),
            Column::Blob(v) => v.len(),
            Column::Mixed(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage class shared by every non-NULL value, if there is one.
    pub fn storage_class(&self) -> Option<StorageClass> {
        match self {
            Column::Null(_) => Some(StorageClass::Null),
            Column::Integer(_) => Some(StorageClass::Integer),
            Column::Float(_) => Some(StorageClass::Float),
            Column::Text(_) => Some(StorageClass::Text),
            Column::Blob(_) => Some(StorageClass::Blob),
            Column::Mixed(_) => None,
        }
    }

    pub fn get(&self, row: usize) -> Option<Value> {
        if row >= self.len() {
            return None;
        }
        let value = match self {
            Column::Null(_) => Value::Null,
            Column::Integer(v) => v[row].map_or(Value::Null, Value::Integer),
            Column::Float(v) => v[row].map_or(Value::Null, Value::Float),
            Column::Text(v) => v[row].clone().map_or(Value::Null, Value::Text),
            Column::Blob(v) => v[row].clone().map_or(Value::Null, Value::Blob),
            Column::Mixed(v) => v[row].clone(),
        };
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        (0..self.len()).filter_map(move |row| self.get(row))
    }

    pub fn push(&mut self, value: Value) {
        let Some(value) = self.push_typed(value) else {
            return;
        };
        match *self {
            Column::Null(n) => *self = Column::seeded(n, value.storage_class(), &value),
            _ => *self = Column::Mixed(self.iter().collect()),
        }
        if let Some(value) = self.push_typed(value) {
            if let Column::Mixed(values) = self {
                values.push(value);
            }
        }
    }

    /// Container for `class` with `nulls` leading NULL slots.
    fn seeded(nulls: usize, class: StorageClass, value: &Value) -> Column {
        match (class, value) {
            (_, Value::Opaque(_)) => Column::Mixed(vec![Value::Null; nulls]),
            (StorageClass::Integer, _) => Column::Integer(vec![None; nulls]),
            (StorageClass::Float, _) => Column::Float(vec![None; nulls]),
            (StorageClass::Text, _) => Column::Text(vec![None; nulls]),
            (StorageClass::Blob, _) => Column::Blob(vec![None; nulls]),
            (StorageClass::Null, _) => Column::Null(nulls),
        }
    }

    /// Append when the value fits the container, else hand it back.
    fn push_typed(&mut self, value: Value) -> Option<Value> {
        match (self, value) {
            (Column::Null(n), Value::Null) => *n += 1,
            (Column::Integer(v), Value::Integer(i)) => v.push(Some(i)),
            (Column::Integer(v), Value::Null) => v.push(None),
            (Column::Float(v), Value::Float(f)) => v.push(Some(f)),
            (Column::Float(v), Value::Null) => v.push(None),
            (Column::Text(v), Value::Text(s)) => v.push(Some(s)),
            (Column::Text(v), Value::Null) => v.push(None),
            (Column::Blob(v), Value::Blob(b)) => v.push(Some(b)),
            (Column::Blob(v), Value::Null) => v.push(None),
            (Column::Mixed(v), value) => v.push(value),
            (_, value) => return Some(value),
        }
        None
    }
}

/// Columnar query result. All columns have the same length.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    names: Vec<String>,
    columns: Vec<Column>,
}

impl ResultSet {
    pub fn new(names: Vec<String>) -> Self {
        let columns = names.iter().map(|_| Column::default()).collect();
        Self { names, columns }
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn column_count(&self) -> usize {
        self.names.len()
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        let idx = self.names.iter().position(|n| n == name)?;
        self.columns.get(idx)
    }

    pub fn column_at(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn value(&self, row: usize, column: usize) -> Option<Value> {
        self.columns.get(column)?.get(row)
    }

    pub fn row(&self, row: usize) -> Option<Vec<Value>> {
        if row >= self.row_count() {
            return None;
        }
        self.columns.iter().map(|c| c.get(row)).collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = Vec<Value>> + '_ {
        (0..self.row_count()).filter_map(move |row| self.row(row))
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.push(value);
        }
    }
}

impl PartialEq for ResultSet {
    fn eq(&self, other: &Self) -> bool {
        self.names == other.names
            && self.row_count() == other.row_count()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.iter().eq(b.iter()))
    }
}

pub fn decode_all(stmt: &mut Statement<'_>) -> Result<QueryResult> {
    let result = drive(stmt);
    stmt.rewind();
    result
}

fn drive(stmt: &mut Statement<'_>) -> Result<QueryResult> {
    let conn = stmt.connection();
    let column_count = stmt.column_count();

    if column_count == 0 {
        let before = conn.total_changes();
        while stmt.step()? == Step::Row {}
        let changes = conn.total_changes() - before;
        trace!(changes = changes, "statement finished");
        return Ok(QueryResult::Changes(changes));
    }

    let mut result = ResultSet::new(stmt.column_names());
    while stmt.step()? == Step::Row {
        let row = (0..column_count)
            .map(|i| stmt.column_value(i))
            .collect::<Result<Vec<_>>>()?;
        result.push_row(row);
    }
    trace!(rows = result.row_count(), columns = column_count, "decoded rows");
    Ok(QueryResult::Rows(result))
}
