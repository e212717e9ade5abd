///
/// # Parameter Binding
///
/// A value source is applied to a prepared statement either by position or
/// by name:
///
/// ```rust,ignore
/// use sqlmarshal_sqlite::{named_params, params};
///
/// conn.query("INSERT INTO t VALUES (?, ?)", params![1, "one"])?;
/// conn.query(
///     "INSERT INTO t VALUES (@a, :b, $c)",
///     named_params! { "a" => 0, "b" => "X", "c" => 0 },
/// )?;
/// ```
///
/// All contract checks (count, names) run before the first engine bind
/// call, so a rejected source leaves the statement's bindings untouched.
///
/// A named source must hold exactly one key per distinct placeholder name.
/// The engine keeps `@a` and `:a` as separate placeholders, but both are
/// fed from the single key `a`.
///

use std::collections::HashSet;

use indexmap::IndexMap;
use sqlmarshal_core::{encode, Error, Result, Value};
use tracing::trace;

use crate::statement::Statement;

pub type NamedParams = IndexMap<String, Value>;

/// Name markers the engine accepts in front of a named placeholder.
const NAME_MARKERS: [char; 3] = [':', '@', '$'];

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    #[default]
    None,
    Positional(Vec<Value>),
    Named(NamedParams),
}

impl Params {
    pub fn len(&self) -> usize {
        match self {
            Params::None => 0,
            Params::Positional(values) => values.len(),
            Params::Named(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::None
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl From<NamedParams> for Params {
    fn from(map: NamedParams) -> Self {
        Params::Named(map)
    }
}

impl From<std::collections::HashMap<String, Value>> for Params {
    fn from(map: std::collections::HashMap<String, Value>) -> Self {
        Params::Named(map.into_iter().collect())
    }
}

/// Positional parameters: `params![1, "two", 3.0]`.
#[macro_export]
macro_rules! params {
    () => {
        $crate::Params::None
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Params::Positional(::std::vec![$($crate::Value::from($value)),+])
    };
}

/// Named parameters keyed without their marker: `named_params! { "a" => 1 }`.
#[macro_export]
macro_rules! named_params {
    () => {
        $crate::Params::Named($crate::NamedParams::new())
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut named = $crate::NamedParams::new();
        $(
            named.insert(::std::string::String::from($name), $crate::Value::from($value));
        )+
        $crate::Params::Named(named)
    }};
}

/// Placeholder name without its marker; `None` for positional forms.
pub fn strip_marker(name: &str) -> Option<&str> {
    name.strip_prefix(NAME_MARKERS)
}

pub fn bind(stmt: &mut Statement<'_>, params: &Params) -> Result<()> {
    let expected = match params {
        Params::Named(_) => distinct_names(stmt),
        _ => stmt.parameter_count(),
    };
    if params.len() != expected {
        return Err(Error::ArityMismatch {
            expected,
            found: params.len(),
        });
    }

    let ordered: Vec<&Value> = match params {
        Params::None => Vec::new(),
        Params::Positional(values) => values.iter().collect(),
        Params::Named(map) => resolve_names(stmt, map)?,
    };

    let encoding = stmt.connection().text_encoding();
    for (i, value) in ordered.into_iter().enumerate() {
        stmt.bind_cell(i + 1, &encode(value, encoding))?;
    }
    trace!(count = stmt.parameter_count(), "bound parameters");
    Ok(())
}

/// Number of keys a named source must supply. Placeholders whose names
/// differ only by marker (`@a`, `:a`) share one key; each unnamed
/// placeholder counts on its own.
fn distinct_names(stmt: &Statement<'_>) -> usize {
    let mut seen = HashSet::new();
    (1..=stmt.parameter_count())
        .filter(|&index| match stmt.parameter_name(index) {
            Some(reported) => match strip_marker(&reported) {
                Some(name) => seen.insert(name.to_string()),
                None => true,
            },
            None => true,
        })
        .count()
}

fn resolve_names<'v>(stmt: &Statement<'_>, map: &'v NamedParams) -> Result<Vec<&'v Value>> {
    (1..=stmt.parameter_count())
        .map(|index| {
            let reported = stmt.parameter_name(index);
            let name = reported
                .as_deref()
                .and_then(strip_marker)
                .ok_or(Error::UnnamedPlaceholder { index })?;
            map.get(name).ok_or_else(|| Error::MissingParameter {
                name: name.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_marker() {
        assert_eq!(strip_marker(":a"), Some("a"));
        assert_eq!(strip_marker("@name"), Some("name"));
        assert_eq!(strip_marker("$c"), Some("c"));
        assert_eq!(strip_marker("?3"), None);
        assert_eq!(strip_marker("plain"), None);
    }

    #[test]
    fn test_params_macro() {
        assert_eq!(params![], Params::None);
        let p = params![1, "two", 3.5, Option::<i64>::None];
        assert_eq!(
            p,
            Params::Positional(vec![
                Value::Integer(1),
                Value::Text("two".to_string()),
                Value::Float(3.5),
                Value::Null,
            ])
        );
        assert_eq!(p.len(), 4);
    }

    #[test]
    fn test_named_params_macro() {
        let p = named_params! { "a" => 0, "b" => "X" };
        match p {
            Params::Named(map) => {
                assert_eq!(map.get("a"), Some(&Value::Integer(0)));
                assert_eq!(map.get("b"), Some(&Value::Text("X".to_string())));
                let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                assert_eq!(keys, ["a", "b"]);
            }
            other => panic!("expected named params, got {:?}", other),
        }
        assert!(named_params! {}.is_empty());
    }
}
