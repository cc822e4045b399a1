//! The denormalized filter: a root type, the relations to join and the
//! conditions in disjunctive normal form. Kept for data layers that predate
//! [`FilterPlan`](super::FilterPlan); new integrations should use the plan.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{
    Analysed, Comparison, Conjunct, Mro, Operand, ResultEvent, Type, Types, analyse, binding,
    class_matches, field_type,
};
use crate::error::CompileError;
use crate::term::Term;

/// `from_type.field -> to_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation(pub String, pub String, pub String);

/// A type, or one of its columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection(pub String, pub Option<String>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datum {
    Field(Projection),
    Immediate(Term),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compare {
    Eq,
    Neq,
    In,
    Nin,
    Lt,
    Leq,
    Gt,
    Geq,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition(pub Datum, pub Compare, pub Datum);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub root: String,
    pub relations: Vec<Relation>,
    /// Disjunction of conjunctions.
    pub conditions: Vec<Vec<Condition>>,
}

impl Filter {
    pub fn build(
        types: &Types,
        results: &[ResultEvent],
        variable: &str,
        class_tag: &str,
        mro: &Mro,
    ) -> Result<Self, CompileError> {
        if !types.contains_key(class_tag) {
            return Err(CompileError::UnknownClass {
                class_tag: class_tag.to_string(),
            });
        }
        let mut filter = Filter {
            root: class_tag.to_string(),
            relations: Vec::new(),
            conditions: Vec::new(),
        };
        for result in results {
            let term = binding(result, variable)?;
            let mut disjunct = Disjunct {
                types,
                mro,
                root: class_tag,
                relations: Vec::new(),
                conditions: Vec::new(),
            };
            let keep = match analyse(term, variable)? {
                Analysed::Identity(value) => {
                    disjunct.conditions.push(Condition(
                        Datum::Field(Projection(class_tag.to_string(), None)),
                        Compare::Eq,
                        Datum::Immediate(value),
                    ));
                    true
                }
                Analysed::Conjuncts(conjuncts) => disjunct.add_all(conjuncts)?,
            };
            if keep {
                for relation in disjunct.relations {
                    if !filter.relations.contains(&relation) {
                        filter.relations.push(relation);
                    }
                }
                filter.conditions.push(disjunct.conditions);
            }
        }
        if filter.conditions.is_empty() {
            // Nothing is authorized.
            filter.conditions.push(vec![Condition(
                Datum::Immediate(Term::boolean(true)),
                Compare::Eq,
                Datum::Immediate(Term::boolean(false)),
            )]);
        }
        tracing::debug!(filter = %filter, "data filter built");
        Ok(filter)
    }
}

struct Disjunct<'a> {
    types: &'a Types,
    mro: &'a Mro,
    root: &'a str,
    relations: Vec<Relation>,
    conditions: Vec<Condition>,
}

impl Disjunct<'_> {
    fn add_all(&mut self, conjuncts: Vec<Conjunct>) -> Result<bool, CompileError> {
        for conjunct in conjuncts {
            match conjunct {
                Conjunct::TypeCheck { path, class_tag } => {
                    let actual = match self.project(&path)? {
                        Projection(ty, None) => ty,
                        Projection(ty, Some(field)) => match field_type(self.types, &ty, &field)? {
                            Type::Base { class_tag } => class_tag.clone(),
                            Type::Relation { other_class_tag, .. } => other_class_tag.clone(),
                        },
                    };
                    if !class_matches(self.mro, &actual, &class_tag) {
                        return Ok(false);
                    }
                }
                Conjunct::Compare { comparison, left, right } => {
                    let l = self.datum(&left)?;
                    let r = self.datum(&right)?;
                    let op = match comparison {
                        // Membership in a whole record is equality with it.
                        Comparison::In if matches!(r, Datum::Field(Projection(_, None))) => {
                            Compare::Eq
                        }
                        Comparison::Eq => Compare::Eq,
                        Comparison::Neq => Compare::Neq,
                        Comparison::In => Compare::In,
                        Comparison::NotIn => Compare::Nin,
                        Comparison::Lt => Compare::Lt,
                        Comparison::Leq => Compare::Leq,
                        Comparison::Gt => Compare::Gt,
                        Comparison::Geq => Compare::Geq,
                    };
                    let condition = Condition(l, op, r);
                    if !self.conditions.contains(&condition) {
                        self.conditions.push(condition);
                    }
                }
            }
        }
        Ok(true)
    }

    fn datum(&mut self, operand: &Operand) -> Result<Datum, CompileError> {
        Ok(match operand {
            Operand::Path(path) => Datum::Field(self.project(path)?),
            Operand::Value(value) => Datum::Immediate(value.clone()),
        })
    }

    /// Walk `path` from the root type, recording the relations crossed.
    fn project(&mut self, path: &[String]) -> Result<Projection, CompileError> {
        let mut ty = self.root.to_string();
        for (i, field) in path.iter().enumerate() {
            match field_type(self.types, &ty, field)? {
                Type::Relation { other_class_tag, .. } => {
                    let relation = Relation(ty.clone(), field.clone(), other_class_tag.clone());
                    if !self.relations.contains(&relation) {
                        self.relations.push(relation);
                    }
                    ty = other_class_tag.clone();
                }
                Type::Base { .. } if i + 1 == path.len() => {
                    return Ok(Projection(ty, Some(field.clone())));
                }
                Type::Base { .. } => {
                    return Err(CompileError::NotARelation {
                        class_tag: ty,
                        field: field.clone(),
                    });
                }
            }
        }
        Ok(Projection(ty, None))
    }
}

impl fmt::Display for Compare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compare::Eq => "=",
            Compare::Neq => "!=",
            Compare::In => "IN",
            Compare::Nin => "NOT IN",
            Compare::Lt => "<",
            Compare::Leq => "<=",
            Compare::Gt => ">",
            Compare::Geq => ">=",
        })
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Immediate(value) => write!(f, "{value}"),
            Datum::Field(Projection(ty, None)) => write!(f, "{ty}"),
            Datum::Field(Projection(ty, Some(field))) => write!(f, "{ty}.{field}"),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "query {}", self.root)?;
        if !self.relations.is_empty() {
            writeln!(f, "join")?;
            for Relation(from, field, to) in &self.relations {
                writeln!(f, "    {from}.{field} -> {to}")?;
            }
        }
        for (i, conjunction) in self.conditions.iter().enumerate() {
            writeln!(f, "{}", if i == 0 { "where" } else { "  OR" })?;
            let parts: Vec<String> = conjunction
                .iter()
                .map(|Condition(l, op, r)| format!("    {l} {op} {r}"))
                .collect();
            writeln!(f, "{}", parts.join(" AND\n"))?;
        }
        Ok(())
    }
}
