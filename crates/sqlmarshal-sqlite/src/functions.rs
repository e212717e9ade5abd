///
/// # User-Defined Functions
///
/// Host closures are installed as SQL functions through
/// `sqlite3_create_function_v2`. Each registration boxes its closure
/// together with the function's name, arity and the connection's text
/// width, and hands the box to the engine as user data. The engine frees it
/// through `drop_boxed` when the function is replaced or the connection
/// closes.
///
/// The `call_*` trampolines are the only code that touches raw argument
/// cells. They decode arguments with the value codec, run the closure under
/// `catch_unwind`, and encode the result (or report the failure) into the
/// engine's result cell.
///
/// Aggregates keep their accumulator in host memory. The engine's
/// per-group scratch slot holds a single pointer to a boxed accumulator:
/// the first step allocates it from the initial value, each step replaces
/// its contents, and the final call takes the box back and frees it.
///

use std::ffi::{c_int, c_void, CString};
use std::fmt;
use std::mem::size_of;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use rusqlite::ffi;
use smallvec::SmallVec;
use sqlmarshal_core::{decode, encode, Cell, CellRef, Error, Result, Text, TextEncoding, Value};
use tracing::debug;

use crate::connection::Connection;
use crate::raw;

/// SQLite rejects longer function names.
const MAX_NAME_BYTES: usize = 255;

type Args = SmallVec<[Value; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arity {
    Exact(usize),
    Variadic,
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => n == count,
            Arity::Variadic => true,
        }
    }

    fn to_raw(self) -> c_int {
        match self {
            Arity::Exact(n) => c_int::try_from(n).unwrap_or(c_int::MAX),
            Arity::Variadic => -1,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{}", n),
            Arity::Variadic => f.write_str("variadic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Scalar,
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredFunction {
    pub name: String,
    pub arity: Arity,
    pub kind: FunctionKind,
}

/// Case-folded name plus arity, the engine's identity for a function.
pub(crate) type FunctionKey = (String, Arity);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionOptions {
    /// Same arguments always give the same result, letting the planner
    /// factor calls out.
    pub deterministic: bool,
}

type ScalarFn = dyn Fn(&[Value]) -> Result<Value>;
type StepFn<A> = dyn Fn(A, &[Value]) -> Result<A>;
type FinalizeFn<A> = dyn Fn(A) -> Result<Value>;

/// An aggregate: initial accumulator, step and finalize.
pub struct Aggregate<A> {
    initial: A,
    step: Box<StepFn<A>>,
    finalize: Box<FinalizeFn<A>>,
}

impl<A: Clone + 'static> Aggregate<A> {
    /// Aggregate whose result is the final accumulator itself.
    pub fn new<S>(initial: A, step: S) -> Self
    where
        S: Fn(A, &[Value]) -> Result<A> + 'static,
        A: Into<Value>,
    {
        Self {
            initial,
            step: Box::new(step),
            finalize: Box::new(|acc: A| -> Result<Value> { Ok(acc.into()) }),
        }
    }

    pub fn with_finalize<S, F, R>(initial: A, step: S, finalize: F) -> Self
    where
        S: Fn(A, &[Value]) -> Result<A> + 'static,
        F: Fn(A) -> Result<R> + 'static,
        R: Into<Value>,
    {
        Self {
            initial,
            step: Box::new(step),
            finalize: Box::new(move |acc: A| -> Result<Value> { finalize(acc).map(Into::into) }),
        }
    }
}

struct ScalarBundle {
    name: String,
    arity: Arity,
    encoding: TextEncoding,
    func: Box<ScalarFn>,
}

struct AggregateBundle<A> {
    name: String,
    arity: Arity,
    encoding: TextEncoding,
    aggregate: Aggregate<A>,
}

/// Per-group accumulator. `None` only after a failed step consumed it.
type Slot<A> = Option<A>;

impl Connection {
    pub fn register_scalar<F, R>(&self, name: &str, arity: Arity, func: F) -> Result<()>
    where
        F: Fn(&[Value]) -> Result<R> + 'static,
        R: Into<Value>,
    {
        self.register_scalar_with(name, arity, FunctionOptions::default(), func)
    }

    pub fn register_scalar_with<F, R>(
        &self,
        name: &str,
        arity: Arity,
        options: FunctionOptions,
        func: F,
    ) -> Result<()>
    where
        F: Fn(&[Value]) -> Result<R> + 'static,
        R: Into<Value>,
    {
        let c_name = self.validate_registration(name, arity)?;
        let bundle = Box::new(ScalarBundle {
            name: name.to_string(),
            arity,
            encoding: self.text_encoding(),
            func: Box::new(move |args: &[Value]| -> Result<Value> { func(args).map(Into::into) }),
        });
        let db = self.handle();
        // On failure the engine runs the destroy callback itself.
        let rc = unsafe {
            ffi::sqlite3_create_function_v2(
                db,
                c_name.as_ptr(),
                arity.to_raw(),
                self.text_rep(options),
                Box::into_raw(bundle).cast::<c_void>(),
                Some(call_scalar),
                None,
                None,
                Some(drop_boxed::<ScalarBundle>),
            )
        };
        raw::check(db, rc)?;
        self.record_function(name, arity, FunctionKind::Scalar);
        Ok(())
    }

    pub fn register_aggregate<A: Clone + 'static>(
        &self,
        name: &str,
        arity: Arity,
        aggregate: Aggregate<A>,
    ) -> Result<()> {
        self.register_aggregate_with(name, arity, FunctionOptions::default(), aggregate)
    }

    pub fn register_aggregate_with<A: Clone + 'static>(
        &self,
        name: &str,
        arity: Arity,
        options: FunctionOptions,
        aggregate: Aggregate<A>,
    ) -> Result<()> {
        let c_name = self.validate_registration(name, arity)?;
        let bundle = Box::new(AggregateBundle {
            name: name.to_string(),
            arity,
            encoding: self.text_encoding(),
            aggregate,
        });
        let db = self.handle();
        let rc = unsafe {
            ffi::sqlite3_create_function_v2(
                db,
                c_name.as_ptr(),
                arity.to_raw(),
                self.text_rep(options),
                Box::into_raw(bundle).cast::<c_void>(),
                None,
                Some(call_step::<A>),
                Some(call_final::<A>),
                Some(drop_boxed::<AggregateBundle<A>>),
            )
        };
        raw::check(db, rc)?;
        self.record_function(name, arity, FunctionKind::Aggregate);
        Ok(())
    }

    /// Largest fixed arity the engine accepts on this connection.
    pub fn max_function_args(&self) -> usize {
        let limit =
            unsafe { ffi::sqlite3_limit(self.handle(), ffi::SQLITE_LIMIT_FUNCTION_ARG, -1) };
        limit.max(0) as usize
    }

    fn validate_registration(&self, name: &str, arity: Arity) -> Result<CString> {
        if name.is_empty() || name.len() > MAX_NAME_BYTES {
            return Err(Error::InvalidFunctionName(name.to_string()));
        }
        let c_name =
            CString::new(name).map_err(|_| Error::InvalidFunctionName(name.to_string()))?;
        if let Arity::Exact(requested) = arity {
            let max = self.max_function_args();
            if requested > max {
                return Err(Error::InvalidArity {
                    name: name.to_string(),
                    requested,
                    max,
                });
            }
        }
        Ok(c_name)
    }

    fn text_rep(&self, options: FunctionOptions) -> c_int {
        let width = match self.text_encoding() {
            TextEncoding::Utf8 => ffi::SQLITE_UTF8,
            TextEncoding::Utf16 => ffi::SQLITE_UTF16,
        };
        if options.deterministic {
            width | ffi::SQLITE_DETERMINISTIC
        } else {
            width
        }
    }

    fn record_function(&self, name: &str, arity: Arity, kind: FunctionKind) {
        debug!(name = name, arity = %arity, kind = ?kind, "registered function");
        self.functions.borrow_mut().insert(
            (name.to_ascii_lowercase(), arity),
            RegisteredFunction {
                name: name.to_string(),
                arity,
                kind,
            },
        );
    }
}

unsafe extern "C" fn drop_boxed<T>(p: *mut c_void) {
    if !p.is_null() {
        drop(unsafe { Box::from_raw(p.cast::<T>()) });
    }
}

unsafe extern "C" fn call_scalar(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let bundle = unsafe { &*ffi::sqlite3_user_data(ctx).cast::<ScalarBundle>() };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let args = unsafe { read_args(argc, argv, bundle.encoding) }?;
        check_arg_count(bundle.arity, args.len())?;
        (bundle.func)(args.as_slice())
    }));
    unsafe { deliver(ctx, &bundle.name, bundle.encoding, outcome) };
}

unsafe extern "C" fn call_step<A: Clone + 'static>(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let bundle = unsafe { &*ffi::sqlite3_user_data(ctx).cast::<AggregateBundle<A>>() };
    let slot = unsafe { ffi::sqlite3_aggregate_context(ctx, size_of::<*mut Slot<A>>() as c_int) }
        .cast::<*mut Slot<A>>();
    if slot.is_null() {
        unsafe { ffi::sqlite3_result_error_nomem(ctx) };
        return;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let args = unsafe { read_args(argc, argv, bundle.encoding) }?;
        check_arg_count(bundle.arity, args.len())?;
        let acc = unsafe { seed_slot(slot, &bundle.aggregate.initial) };
        let current = acc.take().ok_or_else(accumulator_lost)?;
        *acc = Some((bundle.aggregate.step)(current, args.as_slice())?);
        Ok(())
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => unsafe { report_error(ctx, &bundle.name, &e) },
        Err(payload) => unsafe { report_panic(ctx, &bundle.name, payload) },
    }
}

unsafe extern "C" fn call_final<A: Clone + 'static>(ctx: *mut ffi::sqlite3_context) {
    let bundle = unsafe { &*ffi::sqlite3_user_data(ctx).cast::<AggregateBundle<A>>() };
    let taken = unsafe { take_slot::<A>(ctx) };
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
        let acc = match taken {
            Some(boxed) => (*boxed).ok_or_else(accumulator_lost)?,
            None => bundle.aggregate.initial.clone(),
        };
        (bundle.aggregate.finalize)(acc)
    }));
    unsafe { deliver(ctx, &bundle.name, bundle.encoding, outcome) };
}

/// Point the group's scratch slot at a live accumulator, allocating one on
/// first touch.
///
/// # Safety
///
/// `slot` must be the non-null aggregate context of the current group.
unsafe fn seed_slot<'a, A: Clone>(slot: *mut *mut Slot<A>, initial: &A) -> &'a mut Slot<A> {
    unsafe {
        if (*slot).is_null() {
            *slot = Box::into_raw(Box::new(Some(initial.clone())));
        }
        &mut **slot
    }
}

/// Take ownership of the group's accumulator and clear the slot. `None`
/// when no row reached the step function.
unsafe fn take_slot<A>(ctx: *mut ffi::sqlite3_context) -> Option<Box<Slot<A>>> {
    unsafe {
        let slot = ffi::sqlite3_aggregate_context(ctx, 0).cast::<*mut Slot<A>>();
        if slot.is_null() || (*slot).is_null() {
            return None;
        }
        let boxed = Box::from_raw(*slot);
        *slot = ptr::null_mut();
        Some(boxed)
    }
}

fn accumulator_lost() -> Error {
    Error::function("aggregate accumulator missing after a failed step")
}

fn check_arg_count(arity: Arity, found: usize) -> Result<()> {
    match arity {
        Arity::Exact(expected) if !arity.accepts(found) => {
            Err(Error::ArityMismatch { expected, found })
        }
        _ => Ok(()),
    }
}

unsafe fn read_args(
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
    encoding: TextEncoding,
) -> Result<Args> {
    if argc <= 0 || argv.is_null() {
        return Ok(Args::new());
    }
    let cells = unsafe { std::slice::from_raw_parts(argv, argc as usize) };
    cells
        .iter()
        .map(|&cell| unsafe { read_value(cell, encoding) })
        .collect()
}

/// Decode one argument cell. Engine buffers are copied before returning.
unsafe fn read_value(value: *mut ffi::sqlite3_value, encoding: TextEncoding) -> Result<Value> {
    unsafe {
        match ffi::sqlite3_value_type(value) {
            ffi::SQLITE_INTEGER => decode(CellRef::Integer(ffi::sqlite3_value_int64(value))),
            ffi::SQLITE_FLOAT => decode(CellRef::Float(ffi::sqlite3_value_double(value))),
            ffi::SQLITE_TEXT => match encoding {
                TextEncoding::Utf8 => {
                    let ptr = ffi::sqlite3_value_text(value);
                    let bytes = raw::engine_bytes(ptr, ffi::sqlite3_value_bytes(value));
                    decode(CellRef::Text8(bytes))
                }
                TextEncoding::Utf16 => {
                    let ptr = ffi::sqlite3_value_text16(value).cast::<u8>();
                    let bytes = raw::engine_bytes(ptr, ffi::sqlite3_value_bytes16(value));
                    decode(CellRef::Text16(&raw::utf16_units(bytes)))
                }
            },
            ffi::SQLITE_BLOB => {
                let ptr = ffi::sqlite3_value_blob(value).cast::<u8>();
                let bytes = raw::engine_bytes(ptr, ffi::sqlite3_value_bytes(value));
                decode(CellRef::Blob(bytes))
            }
            _ => decode(CellRef::Null),
        }
    }
}

unsafe fn deliver(
    ctx: *mut ffi::sqlite3_context,
    name: &str,
    encoding: TextEncoding,
    outcome: std::thread::Result<Result<Value>>,
) {
    match outcome {
        Ok(Ok(value)) => {
            let cell = encode(&value, encoding);
            if let Err(e) = unsafe { write_result(ctx, &cell) } {
                unsafe { report_error(ctx, name, &e) };
            }
        }
        Ok(Err(e)) => unsafe { report_error(ctx, name, &e) },
        Err(payload) => unsafe { report_panic(ctx, name, payload) },
    }
}

unsafe fn write_result(ctx: *mut ffi::sqlite3_context, cell: &Cell) -> Result<()> {
    unsafe {
        match cell {
            Cell::Null => ffi::sqlite3_result_null(ctx),
            Cell::Integer(i) => ffi::sqlite3_result_int64(ctx, *i),
            Cell::Float(f) => ffi::sqlite3_result_double(ctx, *f),
            Cell::Text(Text::Utf8(s)) => ffi::sqlite3_result_text(
                ctx,
                s.as_ptr().cast(),
                raw::byte_len(s.len())?,
                ffi::SQLITE_TRANSIENT(),
            ),
            Cell::Text(Text::Utf16(units)) => ffi::sqlite3_result_text16(
                ctx,
                units.as_ptr().cast(),
                raw::byte_len(units.len() * 2)?,
                ffi::SQLITE_TRANSIENT(),
            ),
            Cell::Blob(bytes) if bytes.is_empty() => ffi::sqlite3_result_zeroblob(ctx, 0),
            Cell::Blob(bytes) => ffi::sqlite3_result_blob(
                ctx,
                bytes.as_ptr().cast(),
                raw::byte_len(bytes.len())?,
                ffi::SQLITE_TRANSIENT(),
            ),
        }
    }
    Ok(())
}

unsafe fn report_error(ctx: *mut ffi::sqlite3_context, name: &str, err: &Error) {
    if let Error::TooBig(_) = err {
        unsafe { ffi::sqlite3_result_error_toobig(ctx) };
        return;
    }
    let message = format!("{}: {}", name, err);
    let len = c_int::try_from(message.len()).unwrap_or(c_int::MAX);
    unsafe { ffi::sqlite3_result_error(ctx, message.as_ptr().cast(), len) };
}

unsafe fn report_panic(
    ctx: *mut ffi::sqlite3_context,
    name: &str,
    payload: Box<dyn std::any::Any + Send>,
) {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    let err = Error::function(format!("panicked: {}", detail));
    unsafe { report_error(ctx, name, &err) };
}
