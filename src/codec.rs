//! JSON at the host boundary.
//!
//! Terms, events, sources, type maps and results all cross as serde's
//! externally tagged JSON, e.g. a string term is
//! `{"value": {"String": "alice"}}` and an integer is
//! `{"value": {"Number": {"Integer": 1}}}`.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::BoundaryError;

/// Decode `json` as a `what` (named in the error).
pub fn from_json<T: DeserializeOwned>(what: &str, json: &str) -> Result<T, BoundaryError> {
    serde_json::from_str(json).map_err(|e| BoundaryError::Serialization {
        what: what.to_string(),
        message: e.to_string(),
    })
}

pub fn to_json<T: Serialize + ?Sized>(what: &str, value: &T) -> Result<String, BoundaryError> {
    serde_json::to_string(value).map_err(|e| BoundaryError::Serialization {
        what: what.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Question, QueryEvent};
    use crate::kb::Source;
    use crate::term::{Operator, Symbol, Term};

    #[test]
    fn terms_use_tagged_values() {
        assert_eq!(
            to_json("term", &Term::string("alice")).unwrap(),
            r#"{"value":{"String":"alice"}}"#
        );
        assert_eq!(
            to_json("term", &Term::int(1)).unwrap(),
            r#"{"value":{"Number":{"Integer":1}}}"#
        );
        let t: Term = from_json("term", r#"{"value":{"ExternalInstance":{"instance_id":3}}}"#).unwrap();
        assert_eq!(t, Term::external(3, None));
    }

    #[test]
    fn events_round_trip_through_json() {
        let event = QueryEvent::Question {
            call_id: 2,
            question: Question::Compare {
                operator: Operator::Lt,
                args: vec![Term::external(1, None), Term::int(4)],
            },
        };
        let json = to_json("event", &event).unwrap();
        assert!(json.starts_with(r#"{"Question":{"call_id":2"#));
        assert_eq!(from_json::<QueryEvent>("event", &json).unwrap(), event);

        let call = QueryEvent::ExternalCall {
            call_id: 1,
            instance: Term::external(0, None),
            attribute: Symbol::new("name"),
            args: None,
        };
        let json = to_json("event", &call).unwrap();
        assert!(json.contains(r#""attribute":"name""#));
        assert!(!json.contains("args"));
        assert_eq!(to_json("event", &QueryEvent::Done).unwrap(), r#""Done""#);
    }

    #[test]
    fn sources_accept_a_missing_filename() {
        let sources: Vec<Source> = from_json("sources", r#"[{"src": "f(1);"}]"#).unwrap();
        assert_eq!(sources, vec![Source::new("f(1);")]);
    }

    #[test]
    fn malformed_json_names_what_was_expected() {
        let err = from_json::<Term>("constant value", "{nope").unwrap_err();
        match err {
            BoundaryError::Serialization { what, .. } => assert_eq!(what, "constant value"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
