//! Compiling partial query results into filters a host can run against its
//! own data store.
//!
//! Both outputs share one analysis: each partial result is split into
//! conjuncts over paths rooted at `_this`, and every conjunct must be
//! expressible over the registered types. Anything that is not is an error,
//! never silently dropped.

pub mod legacy;
pub mod plan;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CompileError;
use crate::events::Bindings;
use crate::term::{Operator, Pattern, Symbol, THIS, Term, Value};

pub use legacy::Filter;
pub use plan::{Constraint, ConstraintKind, ConstraintValue, FetchRequest, FilterPlan, ResultSet};

/// Shape of one field of a host class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    /// A plain column holding values of `class_tag`.
    Base { class_tag: String },
    /// A link to records of `other_class_tag` where
    /// `self.my_field == other.other_field`.
    Relation {
        kind: String,
        other_class_tag: String,
        my_field: String,
        other_field: String,
    },
}

/// `class -> field -> type`.
pub type Types = HashMap<String, HashMap<String, Type>>;

/// Class hierarchy as registered on the knowledge base.
pub type Mro = HashMap<Symbol, Vec<Symbol>>;

/// One result of a partial query, as the host hands it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    pub bindings: Bindings,
}

// ---------------------------------------------------------------------------
// Shared analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Comparison {
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    In,
    NotIn,
}

impl Comparison {
    /// The comparison with its operands swapped, if there is one.
    pub(crate) fn flipped(self) -> Option<Comparison> {
        Some(match self {
            Comparison::Eq => Comparison::Eq,
            Comparison::Neq => Comparison::Neq,
            Comparison::Lt => Comparison::Gt,
            Comparison::Gt => Comparison::Lt,
            Comparison::Leq => Comparison::Geq,
            Comparison::Geq => Comparison::Leq,
            Comparison::In | Comparison::NotIn => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    /// Field names walked from `_this`; empty is `_this` itself.
    Path(Vec<String>),
    Value(Term),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Conjunct {
    TypeCheck { path: Vec<String>, class_tag: String },
    Compare { comparison: Comparison, left: Operand, right: Operand },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Analysed {
    /// The variable is bound to exactly this value.
    Identity(Term),
    Conjuncts(Vec<Conjunct>),
}

pub(crate) fn binding<'a>(result: &'a ResultEvent, variable: &str) -> Result<&'a Term, CompileError> {
    result
        .bindings
        .get(&Symbol::new(variable))
        .ok_or_else(|| CompileError::MissingBinding {
            variable: variable.to_string(),
        })
}

pub(crate) fn analyse(term: &Term, variable: &str) -> Result<Analysed, CompileError> {
    match term.value() {
        Value::Expression(op) if op.operator == Operator::And => op
            .args
            .iter()
            .filter(|c| c.value() != &Value::Boolean(true))
            .map(conjunct)
            .collect::<Result<Vec<_>, _>>()
            .map(Analysed::Conjuncts),
        Value::Variable(_) | Value::RestVariable(_) => Err(CompileError::MissingBinding {
            variable: variable.to_string(),
        }),
        _ if term.is_ground() => Ok(Analysed::Identity(term.clone())),
        _ => Err(CompileError::Unsupported {
            constraint: term.to_string(),
        }),
    }
}

fn conjunct(c: &Term) -> Result<Conjunct, CompileError> {
    let unsupported = || CompileError::Unsupported {
        constraint: c.to_string(),
    };
    let op = match c.value() {
        Value::Expression(op) => op,
        Value::Call(_) => {
            return Err(CompileError::Irreducible {
                predicate: c.to_string(),
            });
        }
        _ => return Err(unsupported()),
    };
    let comparison = match (op.operator, op.args.len()) {
        (Operator::Isa, 2) => {
            let path = match operand(&op.args[0], c)? {
                Operand::Path(path) => path,
                Operand::Value(_) => return Err(unsupported()),
            };
            return match op.args[1].value() {
                Value::Pattern(Pattern::Instance(lit)) if lit.fields.fields.is_empty() => {
                    Ok(Conjunct::TypeCheck {
                        path,
                        class_tag: lit.tag.to_string(),
                    })
                }
                _ => Err(unsupported()),
            };
        }
        (Operator::Not, 1) => match op.args[0].value() {
            Value::Expression(inner) if inner.operator == Operator::In && inner.args.len() == 2 => {
                return Ok(Conjunct::Compare {
                    comparison: Comparison::NotIn,
                    left: operand(&inner.args[0], c)?,
                    right: operand(&inner.args[1], c)?,
                });
            }
            _ => return Err(unsupported()),
        },
        (Operator::Unify | Operator::Eq, 2) => Comparison::Eq,
        (Operator::Neq, 2) => Comparison::Neq,
        (Operator::Lt, 2) => Comparison::Lt,
        (Operator::Leq, 2) => Comparison::Leq,
        (Operator::Gt, 2) => Comparison::Gt,
        (Operator::Geq, 2) => Comparison::Geq,
        (Operator::In, 2) => Comparison::In,
        _ => return Err(unsupported()),
    };
    Ok(Conjunct::Compare {
        comparison,
        left: operand(&op.args[0], c)?,
        right: operand(&op.args[1], c)?,
    })
}

fn operand(t: &Term, constraint: &Term) -> Result<Operand, CompileError> {
    match t.value() {
        Value::Variable(s) if s.as_str() == THIS => Ok(Operand::Path(Vec::new())),
        Value::Variable(s) | Value::RestVariable(s) => Err(CompileError::ForeignVariable {
            variable: s.to_string(),
            constraint: constraint.to_string(),
        }),
        Value::Expression(op) if op.operator == Operator::Dot && op.args.len() == 2 => {
            let mut path = match operand(&op.args[0], constraint)? {
                Operand::Path(path) => path,
                Operand::Value(_) => {
                    return Err(CompileError::Unsupported {
                        constraint: constraint.to_string(),
                    });
                }
            };
            match op.args[1].value() {
                Value::String(field) => {
                    path.push(field.clone());
                    Ok(Operand::Path(path))
                }
                _ => Err(CompileError::MethodCall {
                    call: t.to_string(),
                }),
            }
        }
        _ => match t.variables().into_iter().next() {
            Some(var) => Err(CompileError::ForeignVariable {
                variable: var.to_string(),
                constraint: constraint.to_string(),
            }),
            None => Ok(Operand::Value(t.clone())),
        },
    }
}

/// Whether instances of `actual` satisfy `matches wanted`.
pub(crate) fn class_matches(mro: &Mro, actual: &str, wanted: &str) -> bool {
    actual == wanted
        || mro
            .get(&Symbol::new(actual))
            .is_some_and(|ancestors| ancestors.iter().any(|a| a.as_str() == wanted))
}

pub(crate) fn field_type<'a>(types: &'a Types, class: &str, field: &str) -> Result<&'a Type, CompileError> {
    types
        .get(class)
        .ok_or_else(|| CompileError::UnknownClass {
            class_tag: class.to_string(),
        })?
        .get(field)
        .ok_or_else(|| CompileError::UnregisteredField {
            class_tag: class.to_string(),
            field: field.to_string(),
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// `Doc{owner: String, folder -> Folder}`, `Folder{name, team -> Team}`, `Team{name}`.
    pub(crate) fn types() -> Types {
        let base = |t: &str| Type::Base {
            class_tag: t.to_string(),
        };
        let relation = |other: &str, mine: &str, theirs: &str| Type::Relation {
            kind: "one".to_string(),
            other_class_tag: other.to_string(),
            my_field: mine.to_string(),
            other_field: theirs.to_string(),
        };
        let mut types = Types::new();
        types.insert(
            "Doc".into(),
            HashMap::from([
                ("owner".to_string(), base("String")),
                ("level".to_string(), base("Integer")),
                ("folder_id".to_string(), base("Integer")),
                ("folder".to_string(), relation("Folder", "folder_id", "id")),
            ]),
        );
        types.insert(
            "Folder".into(),
            HashMap::from([
                ("id".to_string(), base("Integer")),
                ("name".to_string(), base("String")),
                ("team_id".to_string(), base("Integer")),
                ("team".to_string(), relation("Team", "team_id", "id")),
            ]),
        );
        types.insert(
            "Team".into(),
            HashMap::from([
                ("id".to_string(), base("Integer")),
                ("name".to_string(), base("String")),
            ]),
        );
        types
    }

    pub(crate) fn path(this: &str, fields: &[&str]) -> Term {
        fields.iter().fold(Term::var(this), |acc, f| {
            Term::op(Operator::Dot, vec![acc, Term::string(*f)])
        })
    }

    pub(crate) fn result(var: &str, value: Term) -> ResultEvent {
        ResultEvent {
            bindings: Bindings::from([(Symbol::new(var), value)]),
        }
    }

    #[test]
    fn analyses_paths_and_values() {
        let partial = Term::op(
            Operator::And,
            vec![Term::op(
                Operator::Unify,
                vec![path(THIS, &["folder", "name"]), Term::string("x")],
            )],
        );
        let Analysed::Conjuncts(cs) = analyse(&partial, "r").unwrap() else {
            panic!("expected conjuncts")
        };
        assert_eq!(
            cs,
            vec![Conjunct::Compare {
                comparison: Comparison::Eq,
                left: Operand::Path(vec!["folder".into(), "name".into()]),
                right: Operand::Value(Term::string("x")),
            }]
        );
    }

    #[test]
    fn rejects_what_a_filter_cannot_express() {
        let call = Term::op(Operator::And, vec![Term::call("is_public", vec![Term::var(THIS)])]);
        assert!(matches!(analyse(&call, "r"), Err(CompileError::Irreducible { .. })));

        let foreign = Term::op(
            Operator::And,
            vec![Term::op(Operator::Unify, vec![path(THIS, &["owner"]), Term::var("u")])],
        );
        assert!(matches!(
            analyse(&foreign, "r"),
            Err(CompileError::ForeignVariable { .. })
        ));

        let method = Term::op(
            Operator::And,
            vec![Term::op(
                Operator::Unify,
                vec![
                    Term::op(Operator::Dot, vec![Term::var(THIS), Term::call("size", vec![])]),
                    Term::int(1),
                ],
            )],
        );
        assert!(matches!(analyse(&method, "r"), Err(CompileError::MethodCall { .. })));
    }

    #[test]
    fn subclasses_match_through_the_mro() {
        let mro = Mro::from([(Symbol::new("Memo"), vec![Symbol::new("Memo"), Symbol::new("Doc")])]);
        assert!(class_matches(&mro, "Memo", "Doc"));
        assert!(!class_matches(&mro, "Doc", "Memo"));
    }
}
