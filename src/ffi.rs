//! C ABI for host-language bindings.
//!
//! Ownership rules:
//!
//! - `gate_new` and the query constructors hand out boxed objects; release
//!   them with `gate_free` and `query_free`. Dropping an engine invalidates
//!   its queries, which then fail with an `EvalError`.
//! - Every fallible call returns a heap [`GateCResult`]. Exactly one of
//!   `result` and `error` is non-null, except that both are null when there
//!   is no value (no message, no inline query). Release the wrapper with
//!   `result_free`, strings with `string_free`.
//! - `error` is a JSON [`ErrorEnvelope`](crate::error::ErrorEnvelope).
//! - String arguments must be NUL-terminated UTF-8; payloads are JSON in the
//!   shapes documented in [`codec`](crate::codec).
//!
//! Panics never cross the boundary: they are reported as `EvalError`s.

// Pointers are checked for null before use; the host guarantees validity.
#![allow(clippy::not_unsafe_ptr_arg_deref)]

use std::any::Any;
use std::ffi::{CStr, CString, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;

use libc::{c_char, c_int};
use serde::de::DeserializeOwned;

use crate::codec::{from_json, to_json};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{BoundaryError, EvalError, GateError, GateResult};
use crate::filter::{ResultEvent, Types};
use crate::kb::Source;
use crate::query::Query;
use crate::term::Term;

pub const GATE_FAILURE: c_int = 0;
pub const GATE_SUCCESS: c_int = 1;

#[repr(C)]
pub struct GateCResult<T> {
    pub result: *mut T,
    pub error: *mut c_char,
}

fn into_c_string(s: String) -> *mut c_char {
    let s = if s.contains('\0') { s.replace('\0', "") } else { s };
    CString::new(s).unwrap_or_default().into_raw()
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `f`, containing panics, and box the outcome for the host.
fn guard<T>(f: impl FnOnce() -> GateResult<*mut T>) -> *mut GateCResult<T> {
    let outcome = catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        Err(EvalError::Internal {
            message: format!("panic: {}", panic_message(panic)),
        }
        .into())
    });
    let result = match outcome {
        Ok(result) => GateCResult {
            result,
            error: ptr::null_mut(),
        },
        Err(e) => {
            tracing::debug!(kind = e.kind(), error = %e, "boundary call failed");
            let json = to_json("error envelope", &e.envelope())
                .unwrap_or_else(|_| format!(r#"{{"kind":"{}","code":"","message":""}}"#, e.kind()));
            GateCResult {
                result: ptr::null_mut(),
                error: into_c_string(json),
            }
        }
    };
    Box::into_raw(Box::new(result))
}

fn unit() -> GateResult<*mut c_void> {
    Ok(ptr::null_mut())
}

fn string_result(s: Option<String>) -> GateResult<*mut c_char> {
    Ok(s.map_or(ptr::null_mut(), into_c_string))
}

fn engine_ref<'a>(engine: *const Engine) -> Result<&'a Engine, BoundaryError> {
    // SAFETY: non-null pointers come from `gate_new` and stay valid until `gate_free`.
    unsafe { engine.as_ref() }.ok_or_else(|| BoundaryError::NullPointer {
        argument: "engine".into(),
    })
}

fn query_mut<'a>(query: *mut Query) -> Result<&'a mut Query, BoundaryError> {
    // SAFETY: non-null pointers come from a query constructor and stay valid until `query_free`.
    unsafe { query.as_mut() }.ok_or_else(|| BoundaryError::NullPointer {
        argument: "query".into(),
    })
}

fn read_str<'a>(s: *const c_char, argument: &str) -> Result<&'a str, BoundaryError> {
    if s.is_null() {
        return Err(BoundaryError::NullPointer {
            argument: argument.into(),
        });
    }
    // SAFETY: checked for null; the host passes a NUL-terminated string.
    unsafe { CStr::from_ptr(s) }
        .to_str()
        .map_err(|_| BoundaryError::InvalidUtf8 {
            argument: argument.into(),
        })
}

fn read_json<T: DeserializeOwned>(s: *const c_char, argument: &str) -> Result<T, GateError> {
    Ok(from_json(argument, read_str(s, argument)?)?)
}

fn boxed<T>(value: T) -> *mut T {
    Box::into_raw(Box::new(value))
}

// ── Engine ────────────────────────────────────────────────────────────

/// New engine configured from defaults and `AKH_GATE_*` variables.
#[unsafe(no_mangle)]
pub extern "C" fn gate_new() -> *mut GateCResult<Engine> {
    guard(|| {
        let config = EngineConfig::default().with_env_overrides()?;
        Ok(boxed(Engine::new(config)?))
    })
}

/// `sources` is a JSON array of `{"src": ..., "filename": ...}`.
#[unsafe(no_mangle)]
pub extern "C" fn gate_load(engine: *const Engine, sources: *const c_char) -> *mut GateCResult<c_void> {
    guard(|| {
        let engine = engine_ref(engine)?;
        let sources: Vec<Source> = read_json(sources, "sources")?;
        engine.load(&sources)?;
        unit()
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gate_clear_rules(engine: *const Engine) -> *mut GateCResult<c_void> {
    guard(|| {
        engine_ref(engine)?.clear_rules();
        unit()
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gate_register_constant(
    engine: *const Engine,
    name: *const c_char,
    value: *const c_char,
) -> *mut GateCResult<c_void> {
    guard(|| {
        let engine = engine_ref(engine)?;
        let name = read_str(name, "name")?;
        let value: Term = read_json(value, "constant value")?;
        engine.register_constant(name, value);
        unit()
    })
}

/// `mro` is a JSON array of class names, nearest first.
#[unsafe(no_mangle)]
pub extern "C" fn gate_register_mro(
    engine: *const Engine,
    name: *const c_char,
    mro: *const c_char,
) -> *mut GateCResult<c_void> {
    guard(|| {
        let engine = engine_ref(engine)?;
        let name = read_str(name, "name")?;
        let mro: Vec<String> = read_json(mro, "mro")?;
        engine.register_mro(name, mro);
        unit()
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gate_next_inline_query(engine: *const Engine, trace: c_int) -> *mut GateCResult<Query> {
    guard(|| {
        let engine = engine_ref(engine)?;
        Ok(engine
            .next_inline_query(trace != 0)
            .map_or(ptr::null_mut(), boxed))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gate_new_query(
    engine: *const Engine,
    src: *const c_char,
    trace: c_int,
) -> *mut GateCResult<Query> {
    guard(|| {
        let engine = engine_ref(engine)?;
        let src = read_str(src, "query")?;
        Ok(boxed(engine.new_query(src, trace != 0)?))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gate_new_query_from_term(
    engine: *const Engine,
    term: *const c_char,
    trace: c_int,
) -> *mut GateCResult<Query> {
    guard(|| {
        let engine = engine_ref(engine)?;
        let term: Term = read_json(term, "query term")?;
        Ok(boxed(engine.new_query_from_term(term, trace != 0)?))
    })
}

/// Oldest load message as JSON, or no value.
#[unsafe(no_mangle)]
pub extern "C" fn gate_next_message(engine: *const Engine) -> *mut GateCResult<c_char> {
    guard(|| {
        let engine = engine_ref(engine)?;
        string_result(match engine.next_message() {
            Some(m) => Some(to_json("message", &m)?),
            None => None,
        })
    })
}

/// Writes the next external instance id to `out`.
#[unsafe(no_mangle)]
pub extern "C" fn gate_get_external_id(engine: *const Engine, out: *mut u64) -> c_int {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let Ok(engine) = engine_ref(engine) else {
            return GATE_FAILURE;
        };
        if out.is_null() {
            return GATE_FAILURE;
        }
        // SAFETY: checked for null; the host owns the slot.
        unsafe { *out = engine.next_external_id() };
        GATE_SUCCESS
    }));
    outcome.unwrap_or(GATE_FAILURE)
}

#[unsafe(no_mangle)]
pub extern "C" fn gate_build_filter_plan(
    engine: *const Engine,
    types: *const c_char,
    results: *const c_char,
    variable: *const c_char,
    class_tag: *const c_char,
) -> *mut GateCResult<c_char> {
    guard(|| {
        let engine = engine_ref(engine)?;
        let types: Types = read_json(types, "types")?;
        let results: Vec<ResultEvent> = read_json(results, "results")?;
        let variable = read_str(variable, "variable")?;
        let class_tag = read_str(class_tag, "class_tag")?;
        let plan = engine.build_filter_plan(&types, &results, variable, class_tag)?;
        string_result(Some(to_json("filter plan", &plan)?))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn gate_build_data_filter(
    engine: *const Engine,
    types: *const c_char,
    results: *const c_char,
    variable: *const c_char,
    class_tag: *const c_char,
) -> *mut GateCResult<c_char> {
    guard(|| {
        let engine = engine_ref(engine)?;
        let types: Types = read_json(types, "types")?;
        let results: Vec<ResultEvent> = read_json(results, "results")?;
        let variable = read_str(variable, "variable")?;
        let class_tag = read_str(class_tag, "class_tag")?;
        let filter = engine.build_data_filter(&types, &results, variable, class_tag)?;
        string_result(Some(to_json("data filter", &filter)?))
    })
}

// ── Queries ───────────────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub extern "C" fn query_next_event(query: *mut Query) -> *mut GateCResult<c_char> {
    guard(|| {
        let event = query_mut(query)?.next_event()?;
        string_result(Some(to_json("event", &event)?))
    })
}

/// A null `value` means the host has no value for the call.
#[unsafe(no_mangle)]
pub extern "C" fn query_call_result(
    query: *mut Query,
    call_id: u64,
    value: *const c_char,
) -> *mut GateCResult<c_void> {
    guard(|| {
        let query = query_mut(query)?;
        let value: Option<Term> = if value.is_null() {
            None
        } else {
            Some(read_json(value, "call result")?)
        };
        query.call_result(call_id, value)?;
        unit()
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn query_question_result(
    query: *mut Query,
    call_id: u64,
    answer: c_int,
) -> *mut GateCResult<c_void> {
    guard(|| {
        query_mut(query)?.question_result(call_id, answer != 0)?;
        unit()
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn query_application_error(
    query: *mut Query,
    message: *const c_char,
) -> *mut GateCResult<c_void> {
    guard(|| {
        let query = query_mut(query)?;
        let message = read_str(message, "message")?;
        query.application_error(message);
        unit()
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn query_bind(
    query: *mut Query,
    name: *const c_char,
    value: *const c_char,
) -> *mut GateCResult<c_void> {
    guard(|| {
        let query = query_mut(query)?;
        let name = read_str(name, "name")?;
        let value: Term = read_json(value, "bound value")?;
        query.bind(name, value)?;
        unit()
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn query_debug_command(query: *mut Query, command: *const c_char) -> *mut GateCResult<c_void> {
    guard(|| {
        let query = query_mut(query)?;
        let command = read_str(command, "debug command")?;
        query.debug_command(command)?;
        unit()
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn query_next_message(query: *mut Query) -> *mut GateCResult<c_char> {
    guard(|| {
        let query = query_mut(query)?;
        string_result(match query.next_message() {
            Some(m) => Some(to_json("message", &m)?),
            None => None,
        })
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn query_source_info(query: *mut Query) -> *mut GateCResult<c_char> {
    guard(|| string_result(Some(query_mut(query)?.source_info())))
}

// ── Release ───────────────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub extern "C" fn gate_free(engine: *mut Engine) -> c_int {
    if engine.is_null() {
        return GATE_FAILURE;
    }
    // SAFETY: the pointer came from `gate_new` and is released once.
    drop(unsafe { Box::from_raw(engine) });
    GATE_SUCCESS
}

#[unsafe(no_mangle)]
pub extern "C" fn query_free(query: *mut Query) -> c_int {
    if query.is_null() {
        return GATE_FAILURE;
    }
    // SAFETY: the pointer came from a query constructor and is released once.
    drop(unsafe { Box::from_raw(query) });
    GATE_SUCCESS
}

#[unsafe(no_mangle)]
pub extern "C" fn string_free(s: *mut c_char) -> c_int {
    if s.is_null() {
        return GATE_FAILURE;
    }
    // SAFETY: every string handed out was made by `CString::into_raw`.
    drop(unsafe { CString::from_raw(s) });
    GATE_SUCCESS
}

/// Frees the wrapper only; `result` and `error` are released separately.
#[unsafe(no_mangle)]
pub extern "C" fn result_free(result: *mut GateCResult<c_void>) -> c_int {
    if result.is_null() {
        return GATE_FAILURE;
    }
    // SAFETY: the pointer came from `guard` and is released once.
    drop(unsafe { Box::from_raw(result) });
    GATE_SUCCESS
}
