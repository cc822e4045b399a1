//! Host side of the event protocol, for the CLI and tests.
//!
//! A [`Host`] answers the suspensions a query reports; [`drive`] runs a
//! query to completion against one. [`FixtureHost`] serves host objects
//! described in JSON:
//!
//! ```json
//! {
//!   "classes":   { "Doc": ["Resource"] },
//!   "instances": {
//!     "alice": { "class": "User", "fields": { "name": "alice" } },
//!     "doc1":  { "class": "Doc",  "fields": { "owner": { "$instance": "alice" } } }
//!   },
//!   "constants": { "max_level": 3 }
//! }
//! ```
//!
//! Every instance is registered as a constant under its own name.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;

use crate::codec::from_json;
use crate::engine::Engine;
use crate::error::{BoundaryError, ConfigError, GateResult};
use crate::events::{Bindings, Question, QueryEvent};
use crate::query::Query;
use crate::term::{Dictionary, ExternalInstance, Numeric, Operator, Symbol, Term, Value};

/// Answers external calls and questions. An `Err` is reported to the query
/// as an application error.
pub trait Host {
    /// `None` when the attribute does not exist.
    fn call(&mut self, instance: &Term, attribute: &Symbol, args: Option<&[Term]>) -> Result<Option<Term>, String>;

    fn question(&mut self, question: &Question) -> Result<bool, String>;
}

/// Run `query` to completion, returning every solution. Trace output is
/// handed to `on_debug`.
pub fn drive(query: &mut Query, host: &mut dyn Host, on_debug: &mut dyn FnMut(&str)) -> GateResult<Vec<Bindings>> {
    let mut solutions = Vec::new();
    loop {
        match query.next_event()? {
            QueryEvent::Done => return Ok(solutions),
            QueryEvent::Result { bindings } => solutions.push(bindings),
            QueryEvent::Debug { message } => on_debug(&message),
            QueryEvent::ExternalCall {
                call_id,
                instance,
                attribute,
                args,
            } => match host.call(&instance, &attribute, args.as_deref()) {
                Ok(value) => query.call_result(call_id, value)?,
                Err(message) => {
                    tracing::warn!(call_id, %attribute, %message, "host call failed");
                    query.application_error(message);
                }
            },
            QueryEvent::Question { call_id, question } => match host.question(&question) {
                Ok(answer) => query.question_result(call_id, answer)?,
                Err(message) => {
                    tracing::warn!(call_id, %message, "host question failed");
                    query.application_error(message);
                }
            },
        }
    }
}

// ── Fixture format ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct Fixture {
    /// Ancestors of each class, nearest first.
    #[serde(default)]
    classes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    instances: BTreeMap<String, FixtureInstance>,
    #[serde(default)]
    constants: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FixtureInstance {
    class: String,
    #[serde(default)]
    fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug)]
struct HostObject {
    class: String,
    fields: BTreeMap<String, Term>,
}

/// Host objects served from a JSON fixture.
#[derive(Debug, Default)]
pub struct FixtureHost {
    objects: HashMap<u64, HostObject>,
    ancestors: HashMap<String, Vec<String>>,
}

impl FixtureHost {
    pub fn load(path: &Path, engine: &Engine) -> GateResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&json, engine)
    }

    /// Parse a fixture and register its instances, constants and class
    /// hierarchy with `engine`.
    pub fn from_json_str(json: &str, engine: &Engine) -> GateResult<Self> {
        let fixture: Fixture = from_json("fixture", json)?;

        // Ids first, so fields can refer to any instance.
        let mut handles = BTreeMap::new();
        for (name, instance) in &fixture.instances {
            let id = engine.next_external_id();
            let handle = Term::new(Value::ExternalInstance(ExternalInstance {
                instance_id: id,
                class_tag: Some(Symbol::new(instance.class.as_str())),
                repr: Some(name.clone()),
            }));
            handles.insert(name.clone(), (id, handle));
        }

        let mut host = FixtureHost::default();
        for (name, instance) in fixture.instances {
            let (id, handle) = &handles[&name];
            let fields = instance
                .fields
                .iter()
                .map(|(field, value)| Ok((field.clone(), to_term(value, &handles)?)))
                .collect::<Result<_, BoundaryError>>()?;
            engine.register_constant(&name, handle.clone());
            host.objects.insert(
                *id,
                HostObject {
                    class: instance.class,
                    fields,
                },
            );
        }
        for (name, value) in &fixture.constants {
            engine.register_constant(name, to_term(value, &handles)?);
        }
        for (class, ancestors) in fixture.classes {
            engine.register_mro(&class, ancestors.clone());
            host.ancestors.insert(class, ancestors);
        }
        tracing::debug!(
            instances = host.objects.len(),
            classes = host.ancestors.len(),
            "fixture loaded"
        );
        Ok(host)
    }

    fn object(&self, term: &Term) -> Result<&HostObject, String> {
        match term.value() {
            Value::ExternalInstance(e) => self
                .objects
                .get(&e.instance_id)
                .ok_or_else(|| format!("no host object with id {}", e.instance_id)),
            other => Err(format!("expected a host object, got {}", other.type_name())),
        }
    }

    fn is_a(&self, class: &str, wanted: &str) -> bool {
        class == wanted
            || self
                .ancestors
                .get(class)
                .is_some_and(|a| a.iter().any(|c| c == wanted))
    }
}

impl Host for FixtureHost {
    fn call(&mut self, instance: &Term, attribute: &Symbol, args: Option<&[Term]>) -> Result<Option<Term>, String> {
        let object = self.object(instance)?;
        if args.is_some_and(|a| !a.is_empty()) {
            return Err(format!("{}.{attribute}: fixture objects have no methods", object.class));
        }
        Ok(object.fields.get(attribute.as_str()).cloned())
    }

    fn question(&mut self, question: &Question) -> Result<bool, String> {
        match question {
            Question::Isa { instance, class_tag } => {
                Ok(self.is_a(&self.object(instance)?.class, class_tag.as_str()))
            }
            Question::Compare { operator, args } => {
                let [left, right] = args.as_slice() else {
                    return Err(format!("comparison needs two operands, got {}", args.len()));
                };
                compare(*operator, left, right)
            }
        }
    }
}

/// Host objects are compared by identity; numbers and strings by value.
fn compare(operator: Operator, left: &Term, right: &Term) -> Result<bool, String> {
    let ordering = match (left.value(), right.value()) {
        (Value::ExternalInstance(a), Value::ExternalInstance(b)) => {
            let same = a.instance_id == b.instance_id;
            return match operator {
                Operator::Eq => Ok(same),
                Operator::Neq => Ok(!same),
                _ => Err(format!("host objects cannot be ordered with {}", operator.symbol())),
            };
        }
        (Value::Number(a), Value::Number(b)) => numeric_order(*a, *b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let Some(ordering) = ordering else {
        return match operator {
            Operator::Eq => Ok(left == right),
            Operator::Neq => Ok(left != right),
            _ => Err(format!("cannot compare {left} {} {right}", operator.symbol())),
        };
    };
    Ok(match operator {
        Operator::Eq => ordering == Ordering::Equal,
        Operator::Neq => ordering != Ordering::Equal,
        Operator::Lt => ordering == Ordering::Less,
        Operator::Leq => ordering != Ordering::Greater,
        Operator::Gt => ordering == Ordering::Greater,
        Operator::Geq => ordering != Ordering::Less,
        other => return Err(format!("{} is not a comparison", other.symbol())),
    })
}

fn numeric_order(a: Numeric, b: Numeric) -> Option<Ordering> {
    match (a, b) {
        (Numeric::Integer(a), Numeric::Integer(b)) => Some(a.cmp(&b)),
        (a, b) => as_f64(a).partial_cmp(&as_f64(b)),
    }
}

fn as_f64(n: Numeric) -> f64 {
    match n {
        Numeric::Integer(i) => i as f64,
        Numeric::Float(f) => f,
    }
}

/// Plain JSON to a term. `{"$instance": name}` refers to a fixture instance.
fn to_term(value: &serde_json::Value, handles: &BTreeMap<String, (u64, Term)>) -> Result<Term, BoundaryError> {
    use serde_json::Value as Json;

    let invalid = |message: String| BoundaryError::Serialization {
        what: "fixture".into(),
        message,
    };
    Ok(match value {
        Json::Null => return Err(invalid("null has no term representation".into())),
        Json::Bool(b) => Term::boolean(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Term::int(i),
            None => Term::float(n.as_f64().ok_or_else(|| invalid(format!("number {n} out of range")))?),
        },
        Json::String(s) => Term::string(s.as_str()),
        Json::Array(items) => Term::list(
            items
                .iter()
                .map(|item| to_term(item, handles))
                .collect::<Result<_, _>>()?,
        ),
        Json::Object(map) => {
            if let Some(reference) = map.get("$instance") {
                let name = reference
                    .as_str()
                    .ok_or_else(|| invalid("$instance must name an instance".into()))?;
                return handles
                    .get(name)
                    .map(|(_, handle)| handle.clone())
                    .ok_or_else(|| invalid(format!("unknown instance {name}")));
            }
            let mut dict = Dictionary::new();
            for (key, item) in map {
                dict.fields.insert(Symbol::new(key.as_str()), to_term(item, handles)?);
            }
            Term::new(Value::Dictionary(dict))
        }
    })
}
