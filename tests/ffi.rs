//! Exercises the C ABI the way a host binding would: raw pointers in, JSON
//! strings and result envelopes out, everything released explicitly.

use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr;

use akh_gate::engine::Engine;
use akh_gate::error::ErrorEnvelope;
use akh_gate::ffi::*;
use akh_gate::query::Query;

/// Unwrap an envelope into its payload, or its decoded error.
fn take<T>(result: *mut GateCResult<T>) -> Result<*mut T, ErrorEnvelope> {
    assert!(!result.is_null());
    let (payload, error) = unsafe { ((*result).result, (*result).error) };
    assert_eq!(result_free(result.cast::<GateCResult<c_void>>()), GATE_SUCCESS);
    if error.is_null() {
        return Ok(payload);
    }
    assert!(payload.is_null(), "payload and error are exclusive");
    let json = unsafe { CStr::from_ptr(error) }.to_str().unwrap().to_owned();
    assert_eq!(string_free(error), GATE_SUCCESS);
    Err(serde_json::from_str(&json).unwrap())
}

fn take_string(result: *mut GateCResult<c_char>) -> Result<Option<String>, ErrorEnvelope> {
    let s = take(result)?;
    if s.is_null() {
        return Ok(None);
    }
    let owned = unsafe { CStr::from_ptr(s) }.to_str().unwrap().to_owned();
    assert_eq!(string_free(s), GATE_SUCCESS);
    Ok(Some(owned))
}

fn c(s: &str) -> CString {
    CString::new(s).unwrap()
}

fn new_engine() -> *mut Engine {
    let engine = take(gate_new()).unwrap();
    assert!(!engine.is_null());
    engine
}

fn next_event(query: *mut Query) -> serde_json::Value {
    let json = take_string(query_next_event(query)).unwrap().unwrap();
    serde_json::from_str(&json).unwrap()
}

#[test]
fn load_query_and_answer_an_external_call() {
    let engine = new_engine();
    let sources = c(r#"[{"src": "allow(actor, \"read\", resource) if resource.owner = actor;", "filename": "policy.polar"}]"#);
    take(gate_load(engine, sources.as_ptr())).unwrap();

    let mut id = u64::MAX;
    assert_eq!(gate_get_external_id(engine, &mut id), GATE_SUCCESS);
    assert_eq!(id, 0);

    let query = take(gate_new_query(engine, c(r#"allow("alice", "read", r)"#).as_ptr(), 0)).unwrap();
    let doc = c(r#"{"value":{"ExternalInstance":{"instance_id":0,"class_tag":"Doc"}}}"#);
    take(query_bind(query, c("r").as_ptr(), doc.as_ptr())).unwrap();

    let event = next_event(query);
    let call = &event["ExternalCall"];
    assert_eq!(call["attribute"], "owner");
    let call_id = call["call_id"].as_u64().unwrap();

    let alice = c(r#"{"value":{"String":"alice"}}"#);
    let err = take(query_call_result(query, call_id + 1, alice.as_ptr())).unwrap_err();
    assert_eq!(err.kind, "BridgeMismatchError");
    take(query_call_result(query, call_id, alice.as_ptr())).unwrap();

    assert!(next_event(query).get("Result").is_some());
    assert_eq!(next_event(query), serde_json::json!("Done"));

    assert_eq!(query_free(query), GATE_SUCCESS);
    assert_eq!(gate_free(engine), GATE_SUCCESS);
}

#[test]
fn null_and_malformed_inputs_are_boundary_errors() {
    let engine = new_engine();

    let err = take(gate_load(engine, ptr::null())).unwrap_err();
    assert_eq!(err.kind, "BoundaryError");
    assert_eq!(err.code, "gate::boundary::null_pointer");

    let err = take(gate_load(engine, c("not json").as_ptr())).unwrap_err();
    assert_eq!(err.kind, "BoundaryError");
    assert!(err.message.contains("sources"));

    let bad_utf8 = [b'f', 0xff, 0];
    let err = take(gate_new_query(engine, bad_utf8.as_ptr().cast(), 0)).unwrap_err();
    assert_eq!(err.code, "gate::boundary::invalid_utf8");

    let err = take(query_next_event(ptr::null_mut())).unwrap_err();
    assert_eq!(err.kind, "BoundaryError");
    assert_eq!(gate_get_external_id(ptr::null(), ptr::null_mut()), GATE_FAILURE);

    assert_eq!(gate_free(engine), GATE_SUCCESS);
}

#[test]
fn load_errors_carry_kind_and_code() {
    let engine = new_engine();
    let err = take(gate_load(engine, c(r#"[{"src": "f(1); f("}]"#).as_ptr())).unwrap_err();
    assert_eq!(err.kind, "LoadError");
    assert_eq!(err.code, "gate::load::parse");

    let sources = c(r#"[{"src": "type f(x: Integer); f(\"one\");"}]"#);
    let err = take(gate_load(engine, sources.as_ptr())).unwrap_err();
    assert_eq!(err.kind, "LoadError");
    assert_eq!(err.code, "gate::load::incompatible_rule");
    assert_eq!(gate_free(engine), GATE_SUCCESS);
}

#[test]
fn no_value_is_null_without_error() {
    let engine = new_engine();
    take(gate_load(engine, c(r#"[{"src": "f(1); ?= f(1);"}]"#).as_ptr())).unwrap();

    // Load warnings first, then nothing.
    while take_string(gate_next_message(engine)).unwrap().is_some() {}
    assert_eq!(take_string(gate_next_message(engine)).unwrap(), None);

    let inline = take(gate_next_inline_query(engine, 0)).unwrap();
    assert!(!inline.is_null());
    assert!(take(gate_next_inline_query(engine, 0)).unwrap().is_null());

    let info = take_string(query_source_info(inline)).unwrap().unwrap();
    assert_eq!(info, "no active query");
    assert!(next_event(inline).get("Result").is_some());
    assert_eq!(take_string(query_next_message(inline)).unwrap(), None);

    assert_eq!(query_free(inline), GATE_SUCCESS);
    assert_eq!(gate_free(engine), GATE_SUCCESS);
}

#[test]
fn constants_mro_and_questions() {
    let engine = new_engine();
    take(gate_register_constant(engine, c("limit").as_ptr(), c(r#"{"value":{"Number":{"Integer":3}}}"#).as_ptr()))
        .unwrap();
    take(gate_register_mro(engine, c("Doc").as_ptr(), c(r#"["Resource"]"#).as_ptr())).unwrap();
    take(gate_load(engine, c(r#"[{"src": "ok(d: Resource) if 1 < limit;"}]"#).as_ptr())).unwrap();

    let term = c(r#"{"value":{"Call":{"name":"ok","args":[{"value":{"ExternalInstance":{"instance_id":0,"class_tag":"Doc"}}}]}}}"#);
    let query = take(gate_new_query_from_term(engine, term.as_ptr(), 0)).unwrap();
    assert!(next_event(query).get("Result").is_some());
    assert_eq!(query_free(query), GATE_SUCCESS);

    // An unregistered class is a question for the host.
    let term = c(r#"{"value":{"Call":{"name":"ok","args":[{"value":{"ExternalInstance":{"instance_id":1,"class_tag":"User"}}}]}}}"#);
    let query = take(gate_new_query_from_term(engine, term.as_ptr(), 0)).unwrap();
    let event = next_event(query);
    let call_id = event["Question"]["call_id"].as_u64().unwrap();
    take(query_question_result(query, call_id, 0)).unwrap();
    assert_eq!(next_event(query), serde_json::json!("Done"));
    assert_eq!(query_free(query), GATE_SUCCESS);

    take(gate_clear_rules(engine)).unwrap();
    assert_eq!(gate_free(engine), GATE_SUCCESS);
}

#[test]
fn application_errors_and_debugger_commands() {
    let engine = new_engine();
    take(gate_load(engine, c(r#"[{"src": "f(r) if r.x = 1;"}]"#).as_ptr())).unwrap();

    let query = take(gate_new_query(engine, c("f(r)").as_ptr(), 0)).unwrap();
    let err = take(query_debug_command(query, c("c").as_ptr())).unwrap_err();
    assert_eq!(err.kind, "DebugError");

    let r = c(r#"{"value":{"ExternalInstance":{"instance_id":5}}}"#);
    take(query_bind(query, c("r").as_ptr(), r.as_ptr())).unwrap();
    assert!(next_event(query).get("ExternalCall").is_some());
    take(query_application_error(query, c("lookup failed").as_ptr())).unwrap();
    let err = take(query_next_event(query)).unwrap_err();
    assert_eq!(err.kind, "EvalError");
    assert!(err.message.contains("lookup failed"));

    assert_eq!(query_free(query), GATE_SUCCESS);
    assert_eq!(gate_free(engine), GATE_SUCCESS);
}

#[test]
fn filter_plans_cross_as_json() {
    let engine = new_engine();
    let types = c(r#"{"Doc": {"owner": {"Base": {"class_tag": "String"}}}}"#);
    let results = c(r#"[{"bindings": {"resource": {"value": {"Expression": {"operator": "And", "args": [
        {"value": {"Expression": {"operator": "Unify", "args": [
            {"value": {"Expression": {"operator": "Dot", "args": [
                {"value": {"Variable": "_this"}},
                {"value": {"String": "owner"}}
            ]}}},
            {"value": {"String": "alice"}}
        ]}}}
    ]}}}}}]"#);

    let plan = take_string(gate_build_filter_plan(
        engine,
        types.as_ptr(),
        results.as_ptr(),
        c("resource").as_ptr(),
        c("Doc").as_ptr(),
    ))
    .unwrap()
    .unwrap();
    let plan: serde_json::Value = serde_json::from_str(&plan).unwrap();
    let request = &plan["result_sets"][0]["requests"]["0"];
    assert_eq!(request["class_tag"], "Doc");
    assert_eq!(request["constraints"][0]["field"], "owner");

    let filter = take_string(gate_build_data_filter(
        engine,
        types.as_ptr(),
        results.as_ptr(),
        c("resource").as_ptr(),
        c("Doc").as_ptr(),
    ))
    .unwrap()
    .unwrap();
    assert!(filter.contains("\"root\":\"Doc\""));

    let err = take_string(gate_build_filter_plan(
        engine,
        types.as_ptr(),
        results.as_ptr(),
        c("resource").as_ptr(),
        c("Folder").as_ptr(),
    ))
    .unwrap_err();
    assert_eq!(err.kind, "CompileError");

    assert_eq!(gate_free(engine), GATE_SUCCESS);
}
