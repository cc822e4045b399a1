//! End-to-end tests for the akh-gate engine.
//!
//! These drive the public API the way a host would: load policies, open
//! queries, answer suspensions and compile partial results into filters.

use std::collections::HashMap;

use akh_gate::engine::Engine;
use akh_gate::error::GateError;
use akh_gate::events::{Question, QueryEvent};
use akh_gate::filter::{
    Constraint, ConstraintKind, ConstraintValue, FetchRequest, ResultEvent, Type, Types,
};
use akh_gate::kb::Source;
use akh_gate::message::MessageKind;
use akh_gate::query::Query;
use akh_gate::term::{Symbol, Term};

const ALLOW_OWNER: &str = r#"allow(actor, "read", resource) if resource.owner = actor;"#;

fn doc_types() -> Types {
    let mut types = Types::new();
    types.insert(
        "Doc".into(),
        HashMap::from([(
            "owner".to_string(),
            Type::Base {
                class_tag: "String".into(),
            },
        )]),
    );
    types
}

/// Collect partial results for `variable`, failing on any suspension.
fn partial_results(query: &mut Query) -> Vec<ResultEvent> {
    let mut results = Vec::new();
    loop {
        match query.next_event().unwrap() {
            QueryEvent::Done => return results,
            QueryEvent::Result { bindings } => results.push(ResultEvent { bindings }),
            other => panic!("unexpected event during partial evaluation: {other:?}"),
        }
    }
}

#[test]
fn allow_owner_yields_one_result_then_done() {
    let engine = Engine::default();
    engine.register_constant("actor", Term::string("alice"));
    engine.load_str(ALLOW_OWNER).unwrap();

    let doc = Term::external(engine.next_external_id(), Some("Doc"));
    let mut q = engine.new_query(r#"allow("alice", "read", R)"#, false).unwrap();
    q.bind("R", doc.clone()).unwrap();

    let QueryEvent::ExternalCall {
        call_id,
        instance,
        attribute,
        args,
    } = q.next_event().unwrap()
    else {
        panic!("expected an external call")
    };
    assert_eq!(instance, doc);
    assert_eq!(attribute, Symbol::new("owner"));
    assert!(args.is_none());
    q.call_result(call_id, Some(Term::string("alice"))).unwrap();

    let QueryEvent::Result { bindings } = q.next_event().unwrap() else {
        panic!("expected a result")
    };
    assert_eq!(bindings[&Symbol::new("R")], doc);
    assert!(q.next_event().unwrap().is_done());
}

#[test]
fn loads_accumulate_in_order() {
    let split = Engine::default();
    split.load_str("f(1); g(1);").unwrap();
    split.load(&[Source::named("f(2);", "more.polar")]).unwrap();

    let whole = Engine::default();
    whole.load_str("f(1); g(1); f(2);").unwrap();

    let text = |e: &Engine| e.rules().iter().map(|r| r.to_string()).collect::<Vec<_>>();
    assert_eq!(text(&split), text(&whole));

    let mut q = split.new_query("f(x)", false).unwrap();
    let mut xs = Vec::new();
    while let QueryEvent::Result { bindings } = q.next_event().unwrap() {
        xs.push(bindings[&Symbol::new("x")].to_string());
    }
    assert_eq!(xs, vec!["1", "2"]);
}

#[test]
fn clear_rules_preserves_constants_and_mro() {
    let engine = Engine::default();
    engine.register_constant("limit", Term::int(3));
    engine.register_mro("Doc", vec!["Resource".into()]);
    engine.load_str("small(x) if x < limit;").unwrap();
    engine.clear_rules();
    assert!(engine.rules().is_empty());

    let mut q = engine.new_query("limit = 3", false).unwrap();
    assert!(matches!(q.next_event().unwrap(), QueryEvent::Result { .. }));
    assert!(q.next_event().unwrap().is_done());

    // The hierarchy answers without asking the host.
    let mut q = engine.new_query("d matches Resource", false).unwrap();
    q.bind("d", Term::external(engine.next_external_id(), Some("Doc"))).unwrap();
    assert!(matches!(q.next_event().unwrap(), QueryEvent::Result { .. }));
}

#[test]
fn terminal_states_are_sticky() {
    let engine = Engine::default();
    engine.load_str("f(1);").unwrap();
    let mut q = engine.new_query("f(x)", false).unwrap();
    assert!(matches!(q.next_event().unwrap(), QueryEvent::Result { .. }));
    for _ in 0..3 {
        assert!(q.next_event().unwrap().is_done());
    }

    let mut q = engine.new_query("x = 1 / 0", false).unwrap();
    let first = q.next_event().unwrap_err();
    assert_eq!(first.kind(), "EvalError");
    let again = q.next_event().unwrap_err();
    assert_eq!(again.kind(), "EvalError");
    assert!(again.to_string().contains("already failed"));
}

#[test]
fn self_referential_values_fail_without_crashing() {
    let engine = Engine::default();
    engine.load_str("nest(x) if x = [x];").unwrap();

    let mut q = engine.new_query("x = [x]", true).unwrap();
    loop {
        match q.next_event().unwrap() {
            QueryEvent::Debug { .. } => {}
            QueryEvent::Done => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    let mut q = engine.new_query("nest(y)", false).unwrap();
    assert!(q.next_event().unwrap().is_done());

    let mut q = engine.new_query("z = 1", false).unwrap();
    let err = q.bind("z", Term::list(vec![Term::var("z")])).unwrap_err();
    assert_eq!(err.kind(), "BindError");
}

#[test]
fn call_ids_strictly_increase() {
    let engine = Engine::default();
    engine.load_str("f(r) if r.a = 1 and r.b = 2;").unwrap();
    let mut q = engine.new_query("f(r)", false).unwrap();
    q.bind("r", Term::external(engine.next_external_id(), None)).unwrap();

    let mut ids = Vec::new();
    for answer in [1, 2] {
        let QueryEvent::ExternalCall { call_id, .. } = q.next_event().unwrap() else {
            panic!("expected an external call")
        };
        ids.push(call_id);
        q.call_result(call_id, Some(Term::int(answer))).unwrap();
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert!(matches!(q.next_event().unwrap(), QueryEvent::Result { .. }));
}

#[test]
fn mismatched_answers_leave_the_query_suspended() {
    let engine = Engine::default();
    engine.load_str(ALLOW_OWNER).unwrap();
    let mut q = engine.new_query(r#"allow("alice", "read", r)"#, false).unwrap();
    q.bind("r", Term::external(engine.next_external_id(), None)).unwrap();

    let QueryEvent::ExternalCall { call_id, .. } = q.next_event().unwrap() else {
        panic!("expected an external call")
    };
    let err = q.call_result(call_id + 7, Some(Term::string("alice"))).unwrap_err();
    assert_eq!(err.kind(), "BridgeMismatchError");
    let err = q.question_result(call_id, true).unwrap_err();
    assert_eq!(err.kind(), "BridgeMismatchError");

    // Still waiting on the original call.
    assert_eq!(q.next_event().unwrap_err().kind(), "BridgeMismatchError");
    q.call_result(call_id, Some(Term::string("bob"))).unwrap();
    assert!(q.next_event().unwrap().is_done());
}

#[test]
fn questions_round_trip() {
    let engine = Engine::default();
    engine.load_str("f(x: Resource);").unwrap();
    let mut q = engine.new_query("f(d)", false).unwrap();
    q.bind("d", Term::external(engine.next_external_id(), Some("Doc"))).unwrap();

    let QueryEvent::Question { call_id, question } = q.next_event().unwrap() else {
        panic!("expected a question")
    };
    assert_eq!(
        question,
        Question::Isa {
            instance: Term::external(0, Some("Doc")),
            class_tag: Symbol::new("Resource"),
        }
    );
    q.question_result(call_id, true).unwrap();
    assert!(matches!(q.next_event().unwrap(), QueryEvent::Result { .. }));
}

#[test]
fn application_errors_end_only_that_query() {
    let engine = Engine::default();
    engine.load_str(ALLOW_OWNER).unwrap();
    let mut failing = engine.new_query(r#"allow("alice", "read", r)"#, false).unwrap();
    failing.bind("r", Term::external(engine.next_external_id(), None)).unwrap();
    assert!(matches!(failing.next_event().unwrap(), QueryEvent::ExternalCall { .. }));
    failing.application_error("database unavailable");
    let err = failing.next_event().unwrap_err();
    assert!(matches!(err, GateError::Eval(_)));
    assert!(err.to_string().contains("database unavailable"));

    let mut sibling = engine.new_query(r#"allow("alice", "read", {owner: "alice"})"#, false).unwrap();
    assert!(matches!(sibling.next_event().unwrap(), QueryEvent::Result { .. }));
}

#[test]
fn inline_queries_run_in_declaration_order() {
    let engine = Engine::default();
    engine.load_str("f(1); ?= f(1); ?= f(2);").unwrap();

    let mut first = engine.next_inline_query(false).unwrap();
    assert!(matches!(first.next_event().unwrap(), QueryEvent::Result { .. }));
    let mut second = engine.next_inline_query(false).unwrap();
    assert!(second.next_event().unwrap().is_done());
    assert!(engine.next_inline_query(false).is_none());
}

#[test]
fn query_messages_are_separate_from_load_messages() {
    let engine = Engine::default();
    engine.load_str("f(x) if print(\"checking\", x);").unwrap();
    while engine.next_message().is_some() {}

    let mut q = engine.new_query("f(1)", false).unwrap();
    assert!(matches!(q.next_event().unwrap(), QueryEvent::Result { .. }));
    let message = q.next_message().unwrap();
    assert_eq!(message.kind, MessageKind::Print);
    assert_eq!(message.msg, "\"checking\", 1");
    assert!(q.next_message().is_none());
    assert!(engine.next_message().is_none());
}

#[test]
fn filter_plan_encodes_the_owner_column() {
    let engine = Engine::default();
    engine.register_constant("actor", Term::string("alice"));
    engine.load_str(ALLOW_OWNER).unwrap();

    let mut q = engine.new_query(r#"allow("alice", "read", resource)"#, false).unwrap();
    q.bind("resource", Term::partial_of("Doc")).unwrap();
    let results = partial_results(&mut q);
    assert_eq!(results.len(), 1);

    let plan = engine
        .build_filter_plan(&doc_types(), &results, "resource", "Doc")
        .unwrap();
    assert_eq!(plan.result_sets.len(), 1);
    assert_eq!(
        plan.result_sets[0].requests[&0],
        FetchRequest {
            class_tag: "Doc".into(),
            constraints: vec![Constraint {
                kind: ConstraintKind::Eq,
                field: Some("owner".into()),
                value: ConstraintValue::Term(Term::string("alice")),
            }],
        }
    );

    let legacy = engine
        .build_data_filter(&doc_types(), &results, "resource", "Doc")
        .unwrap();
    assert!(legacy.to_string().contains("Doc.owner = \"alice\""));
}

#[test]
fn irreducible_predicates_are_compile_errors() {
    let engine = Engine::default();
    engine
        .load_str(
            r#"allow(_actor, "read", resource) if is_public(resource);
               allow(_actor, "edit", resource) if resource.editable() = true;"#,
        )
        .unwrap();

    for action in ["read", "edit"] {
        let mut q = engine
            .new_query(&format!(r#"allow("alice", "{action}", resource)"#), false)
            .unwrap();
        q.bind("resource", Term::partial_of("Doc")).unwrap();
        let results = partial_results(&mut q);
        assert_eq!(results.len(), 1, "{action}");
        let err = engine
            .build_filter_plan(&doc_types(), &results, "resource", "Doc")
            .unwrap_err();
        assert_eq!(err.kind(), "CompileError", "{action}");
    }
}
