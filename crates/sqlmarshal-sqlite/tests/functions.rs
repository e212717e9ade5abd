///
/// # User-Defined Function Integration Tests
///
/// Scalar and aggregate closures called from SQL, error and panic
/// surfacing, registration validation, and the registry listing.
///

use std::cell::Cell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use sqlmarshal_sqlite::{
    params, Aggregate, Arity, Config, Connection, Error, FunctionKind, FunctionOptions,
    RegisteredFunction, TextEncoding, Value,
};

#[derive(Debug, Serialize, Deserialize)]
struct Rect {
    w: i64,
    h: i64,
}

fn engine_message(err: Error) -> String {
    match err {
        Error::Engine { message, .. } => message,
        other => panic!("expected engine error, got {:?}", other),
    }
}

fn numbers(conn: &Connection, values: &[i64]) {
    conn.execute_batch("CREATE TABLE n (g TEXT, v INTEGER)").unwrap();
    for (i, v) in values.iter().enumerate() {
        let group = if i % 2 == 0 { "even" } else { "odd" };
        conn.execute("INSERT INTO n VALUES (?, ?)", params![group, *v])
            .unwrap();
    }
}

fn register_sum(conn: &Connection) {
    conn.register_aggregate(
        "my_sum",
        Arity::Exact(1),
        Aggregate::new(0i64, |acc, args: &[Value]| {
            Ok(acc + args[0].get::<Option<i64>>()?.unwrap_or(0))
        }),
    )
    .unwrap();
}

#[test]
fn test_scalar_triple() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_scalar("triple", Arity::Exact(1), |args: &[Value]| {
        Ok(args[0].get::<i64>()? * 3)
    })
    .unwrap();

    let result = conn.query("SELECT triple(14)", ()).unwrap();
    assert_eq!(result.first_value(), Some(Value::Integer(42)));

    let result = conn.query("SELECT triple(?)", params![-5]).unwrap();
    assert_eq!(result.first_value(), Some(Value::Integer(-15)));
}

#[test]
fn test_variadic_multiply() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_scalar("mult", Arity::Variadic, |args: &[Value]| {
        args.iter()
            .try_fold(1i64, |acc, v| Ok::<_, Error>(acc * v.get::<i64>()?))
    })
    .unwrap();

    let result = conn
        .query("SELECT mult(?, ?), mult(?, ?, 12)", params![2, 3, 2, 3])
        .unwrap();
    assert_eq!(
        result.rows().unwrap().row(0),
        Some(vec![Value::Integer(6), Value::Integer(72)])
    );

    let result = conn.query("SELECT mult()", ()).unwrap();
    assert_eq!(result.first_value(), Some(Value::Integer(1)));
}

#[test]
fn test_scalar_over_table_rows() {
    let conn = Connection::open_in_memory().unwrap();
    numbers(&conn, &[1, 2, 3]);
    conn.register_scalar("double_it", Arity::Exact(1), |args: &[Value]| {
        Ok(args[0].get::<i64>()? * 2)
    })
    .unwrap();

    let result = conn
        .query("SELECT double_it(v) AS d FROM n ORDER BY v", ())
        .unwrap()
        .into_rows()
        .unwrap();
    let doubled: Vec<Value> = result.column("d").unwrap().iter().collect();
    assert_eq!(
        doubled,
        vec![Value::Integer(2), Value::Integer(4), Value::Integer(6)]
    );
}

#[test]
fn test_text_function_in_both_widths() {
    for encoding in [TextEncoding::Utf8, TextEncoding::Utf16] {
        let config = Config::default().with_text_encoding(encoding);
        let conn = Connection::open_in_memory_with_config(&config).unwrap();
        conn.register_scalar("shout", Arity::Exact(1), |args: &[Value]| {
            Ok(format!("{}!", args[0].get::<String>()?.to_uppercase()))
        })
        .unwrap();
        let result = conn.query("SELECT shout(?)", params!["grüße"]).unwrap();
        assert_eq!(result.first_value(), Some(Value::from("GRÜSSE!")));
    }
}

#[test]
fn test_null_and_blob_results() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_scalar("maybe", Arity::Exact(1), |args: &[Value]| {
        let v = args[0].get::<Option<i64>>()?;
        Ok(v.filter(|n| *n > 0))
    })
    .unwrap();
    conn.register_scalar("reverse_bytes", Arity::Exact(1), |args: &[Value]| {
        let mut bytes = args[0].get::<Vec<u8>>()?;
        bytes.reverse();
        Ok(bytes)
    })
    .unwrap();

    let result = conn
        .query(
            "SELECT maybe(?), maybe(?), maybe(NULL), reverse_bytes(?)",
            params![5, -5, vec![1u8, 2, 3]],
        )
        .unwrap();
    assert_eq!(
        result.rows().unwrap().row(0),
        Some(vec![
            Value::Integer(5),
            Value::Null,
            Value::Null,
            Value::Blob(vec![3, 2, 1])
        ])
    );
}

#[test]
fn test_opaque_arguments_and_results() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_scalar("area", Arity::Exact(1), |args: &[Value]| {
        let rect: Rect = args[0].deserialize()?;
        Ok(rect.w * rect.h)
    })
    .unwrap();
    conn.register_scalar("make_rect", Arity::Exact(2), |args: &[Value]| {
        Value::opaque(&Rect {
            w: args[0].get()?,
            h: args[1].get()?,
        })
    })
    .unwrap();

    let rect = Value::opaque(&Rect { w: 3, h: 4 }).unwrap();
    let result = conn.query("SELECT area(?)", params![rect]).unwrap();
    assert_eq!(result.first_value(), Some(Value::Integer(12)));

    let result = conn.query("SELECT area(make_rect(5, 6))", ()).unwrap();
    assert_eq!(result.first_value(), Some(Value::Integer(30)));

    let made = conn
        .query("SELECT make_rect(2, 9)", ())
        .unwrap()
        .first_value()
        .unwrap();
    let rect: Rect = made.deserialize().unwrap();
    assert_eq!((rect.w, rect.h), (2, 9));
}

#[test]
fn test_function_error_surfaces_message() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_scalar("reject", Arity::Exact(1), |args: &[Value]| {
        let n = args[0].get::<i64>()?;
        if n < 0 {
            return Err(Error::function(format!("negative input {}", n)));
        }
        Ok(n)
    })
    .unwrap();

    assert_eq!(
        conn.query("SELECT reject(1)", ()).unwrap().first_value(),
        Some(Value::Integer(1))
    );
    let message = engine_message(conn.query("SELECT reject(-2)", ()).unwrap_err());
    assert!(message.contains("reject"), "{}", message);
    assert!(message.contains("negative input -2"), "{}", message);

    let message = engine_message(conn.query("SELECT reject('x')", ()).unwrap_err());
    assert!(message.contains("Type mismatch"), "{}", message);
}

#[test]
fn test_function_panic_is_contained() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_scalar("explode", Arity::Exact(0), |_args: &[Value]| -> Result<i64, Error> {
        panic!("kaboom")
    })
    .unwrap();

    let message = engine_message(conn.query("SELECT explode()", ()).unwrap_err());
    assert!(message.contains("panicked: kaboom"), "{}", message);

    let result = conn.query("SELECT 1", ()).unwrap();
    assert_eq!(result.first_value(), Some(Value::Integer(1)));
}

#[test]
fn test_wrong_argument_count_rejected_by_engine() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_scalar("one_arg", Arity::Exact(1), |args: &[Value]| {
        Ok(args[0].clone())
    })
    .unwrap();
    let message = engine_message(conn.query("SELECT one_arg(1, 2)", ()).unwrap_err());
    assert!(message.contains("wrong number of arguments"), "{}", message);
}

#[test]
fn test_closure_state_is_kept() {
    let conn = Connection::open_in_memory().unwrap();
    let calls = Rc::new(Cell::new(0));
    let seen = Rc::clone(&calls);
    conn.register_scalar("tick", Arity::Exact(0), move |_args: &[Value]| {
        seen.set(seen.get() + 1);
        Ok(seen.get())
    })
    .unwrap();

    conn.query("SELECT tick()", ()).unwrap();
    let result = conn.query("SELECT tick()", ()).unwrap();
    assert_eq!(result.first_value(), Some(Value::Integer(2)));
    assert_eq!(calls.get(), 2);
}

#[test]
fn test_aggregate_count_and_sum() {
    let conn = Connection::open_in_memory().unwrap();
    numbers(&conn, &[4, 8, 15, 16, 23]);
    conn.register_aggregate(
        "my_count",
        Arity::Exact(1),
        Aggregate::new(0i64, |acc, _args: &[Value]| Ok(acc + 1)),
    )
    .unwrap();
    register_sum(&conn);

    let result = conn.query("SELECT my_count(v), my_sum(v) FROM n", ()).unwrap();
    assert_eq!(
        result.rows().unwrap().row(0),
        Some(vec![Value::Integer(5), Value::Integer(66)])
    );
}

#[test]
fn test_aggregate_per_group() {
    let conn = Connection::open_in_memory().unwrap();
    numbers(&conn, &[1, 10, 2, 20, 3]);
    register_sum(&conn);

    let result = conn
        .query("SELECT g, my_sum(v) FROM n GROUP BY g ORDER BY g", ())
        .unwrap()
        .into_rows()
        .unwrap();
    let rows: Vec<Vec<Value>> = result.rows().collect();
    assert_eq!(
        rows,
        vec![
            vec![Value::from("even"), Value::Integer(6)],
            vec![Value::from("odd"), Value::Integer(30)],
        ]
    );
}

#[test]
fn test_aggregate_over_empty_input() {
    let conn = Connection::open_in_memory().unwrap();
    numbers(&conn, &[]);
    register_sum(&conn);

    let result = conn.query("SELECT my_sum(v) FROM n", ()).unwrap();
    assert_eq!(result.first_value(), Some(Value::Integer(0)));

    let grouped = conn
        .query("SELECT g, my_sum(v) FROM n GROUP BY g", ())
        .unwrap();
    assert_eq!(grouped.rows().unwrap().row_count(), 0);
}

#[test]
fn test_aggregate_with_finalize() {
    let conn = Connection::open_in_memory().unwrap();
    numbers(&conn, &[1, 2, 3, 4]);
    conn.register_aggregate(
        "mean",
        Arity::Exact(1),
        Aggregate::with_finalize(
            (0.0f64, 0i64),
            |(sum, count), args: &[Value]| Ok((sum + args[0].get::<f64>()?, count + 1)),
            |(sum, count)| Ok((count > 0).then(|| sum / count as f64)),
        ),
    )
    .unwrap();

    let result = conn.query("SELECT mean(v) FROM n", ()).unwrap();
    assert_eq!(result.first_value(), Some(Value::Float(2.5)));

    let result = conn.query("SELECT mean(v) FROM n WHERE v > 100", ()).unwrap();
    assert_eq!(result.first_value(), Some(Value::Null));
}

#[test]
fn test_aggregate_step_error() {
    let conn = Connection::open_in_memory().unwrap();
    numbers(&conn, &[1, -1, 2]);
    conn.register_aggregate(
        "positive_sum",
        Arity::Exact(1),
        Aggregate::new(0i64, |acc, args: &[Value]| {
            let v = args[0].get::<i64>()?;
            if v < 0 {
                return Err(Error::function("negative value"));
            }
            Ok(acc + v)
        }),
    )
    .unwrap();

    let message = engine_message(conn.query("SELECT positive_sum(v) FROM n", ()).unwrap_err());
    assert!(message.contains("positive_sum: negative value"), "{}", message);

    let result = conn
        .query("SELECT positive_sum(v) FROM n WHERE v > 0", ())
        .unwrap();
    assert_eq!(result.first_value(), Some(Value::Integer(3)));
}

#[test]
fn test_invalid_arity_rejected() {
    let conn = Connection::open_in_memory().unwrap();
    let max = conn.max_function_args();
    assert!(max > 0);
    let err = conn
        .register_scalar("too_many", Arity::Exact(max + 1), |_args: &[Value]| Ok(0))
        .unwrap_err();
    match err {
        Error::InvalidArity {
            name,
            requested,
            max: reported,
        } => {
            assert_eq!(name, "too_many");
            assert_eq!(requested, max + 1);
            assert_eq!(reported, max);
        }
        other => panic!("expected InvalidArity, got {:?}", other),
    }
    assert!(conn.functions().is_empty());

    conn.register_scalar("at_limit", Arity::Exact(max), |_args: &[Value]| Ok(0))
        .unwrap();
}

#[test]
fn test_invalid_names_rejected() {
    let conn = Connection::open_in_memory().unwrap();
    let long = "f".repeat(256);
    for name in ["", "nul\0inside", long.as_str()] {
        let err = conn
            .register_scalar(name, Arity::Exact(0), |_args: &[Value]| Ok(0))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFunctionName(_)), "{:?}", err);
    }
}

#[test]
fn test_registration_replaces_previous() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_scalar("answer", Arity::Exact(0), |_args: &[Value]| Ok(1))
        .unwrap();
    conn.register_scalar("ANSWER", Arity::Exact(0), |_args: &[Value]| Ok(42))
        .unwrap();

    let result = conn.query("SELECT answer()", ()).unwrap();
    assert_eq!(result.first_value(), Some(Value::Integer(42)));
    assert_eq!(conn.functions().len(), 1);
}

#[test]
fn test_functions_listing() {
    let conn = Connection::open_in_memory().unwrap();
    conn.register_scalar("b_fn", Arity::Exact(1), |args: &[Value]| Ok(args[0].clone()))
        .unwrap();
    conn.register_scalar("a_fn", Arity::Variadic, |_args: &[Value]| Ok(0))
        .unwrap();
    conn.register_scalar("a_fn", Arity::Exact(2), |_args: &[Value]| Ok(0))
        .unwrap();
    register_sum(&conn);

    let listed = conn.functions();
    assert_eq!(
        listed,
        vec![
            RegisteredFunction {
                name: "a_fn".to_string(),
                arity: Arity::Exact(2),
                kind: FunctionKind::Scalar,
            },
            RegisteredFunction {
                name: "a_fn".to_string(),
                arity: Arity::Variadic,
                kind: FunctionKind::Scalar,
            },
            RegisteredFunction {
                name: "b_fn".to_string(),
                arity: Arity::Exact(1),
                kind: FunctionKind::Scalar,
            },
            RegisteredFunction {
                name: "my_sum".to_string(),
                arity: Arity::Exact(1),
                kind: FunctionKind::Aggregate,
            },
        ]
    );
}

#[test]
fn test_deterministic_functions_allowed_in_indexes() {
    let conn = Connection::open_in_memory().unwrap();
    numbers(&conn, &[1, 2]);
    conn.register_scalar_with(
        "pure_neg",
        Arity::Exact(1),
        FunctionOptions {
            deterministic: true,
        },
        |args: &[Value]| Ok(-args[0].get::<i64>()?),
    )
    .unwrap();
    conn.register_scalar("impure_neg", Arity::Exact(1), |args: &[Value]| {
        Ok(-args[0].get::<i64>()?)
    })
    .unwrap();

    conn.execute_batch("CREATE INDEX n_pure ON n (pure_neg(v))")
        .unwrap();
    assert!(
        conn.execute_batch("CREATE INDEX n_impure ON n (impure_neg(v))")
            .is_err()
    );
}

#[test]
fn test_aggregate_with_options() {
    let conn = Connection::open_in_memory().unwrap();
    numbers(&conn, &[3, 4, 5, 6]);
    conn.register_aggregate_with(
        "pure_max",
        Arity::Exact(1),
        FunctionOptions {
            deterministic: true,
        },
        Aggregate::new(i64::MIN, |acc, args: &[Value]| {
            Ok(acc.max(args[0].get::<i64>()?))
        }),
    )
    .unwrap();

    let rows = conn
        .query("SELECT g, pure_max(v) FROM n GROUP BY g ORDER BY g", ())
        .unwrap()
        .into_rows()
        .unwrap();
    assert_eq!(
        rows.row(0),
        Some(vec![Value::from("even"), Value::Integer(5)])
    );
    assert_eq!(
        rows.row(1),
        Some(vec![Value::from("odd"), Value::Integer(6)])
    );
    assert_eq!(
        conn.functions(),
        vec![RegisteredFunction {
            name: "pure_max".to_string(),
            arity: Arity::Exact(1),
            kind: FunctionKind::Aggregate,
        }]
    );
}
