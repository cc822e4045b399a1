//! The structured filter plan: per result, a set of fetch requests joined by
//! references, plus the order to resolve them in.

use std::collections::{BTreeMap, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use super::{
    Analysed, Comparison, Conjunct, Mro, Operand, ResultEvent, Type, Types, analyse, binding,
    class_matches, field_type,
};
use crate::error::CompileError;
use crate::term::Term;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    Eq,
    Neq,
    In,
    Nin,
    /// The field holds a collection containing the value.
    Contains,
    Lt,
    Leq,
    Gt,
    Geq,
}

impl From<Comparison> for ConstraintKind {
    fn from(c: Comparison) -> Self {
        match c {
            Comparison::Eq => ConstraintKind::Eq,
            Comparison::Neq => ConstraintKind::Neq,
            Comparison::Lt => ConstraintKind::Lt,
            Comparison::Leq => ConstraintKind::Leq,
            Comparison::Gt => ConstraintKind::Gt,
            Comparison::Geq => ConstraintKind::Geq,
            Comparison::In => ConstraintKind::In,
            Comparison::NotIn => ConstraintKind::Nin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstraintValue {
    Term(Term),
    /// `field` of every record fetched by request `result_id` (the record
    /// itself when `field` is absent).
    Ref { field: Option<String>, result_id: u64 },
    /// Another field of the same record.
    Field(String),
}

/// `record.field <kind> value`; without a field the record itself is compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub kind: ConstraintKind,
    pub field: Option<String>,
    pub value: ConstraintValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub class_tag: String,
    pub constraints: Vec<Constraint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub requests: BTreeMap<u64, FetchRequest>,
    pub resolve_order: Vec<u64>,
    pub result_id: u64,
}

/// Union of result sets: a record is authorized if any set yields it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterPlan {
    pub result_sets: Vec<ResultSet>,
}

impl FilterPlan {
    /// Compile the bindings of `variable` in each partial result.
    ///
    /// A result whose type checks contradict `class_tag` contributes no set.
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
        let mut result_sets = Vec::with_capacity(results.len());
        for result in results {
            let term = binding(result, variable)?;
            let mut builder = SetBuilder::new(types, mro, class_tag);
            let keep = match analyse(term, variable)? {
                Analysed::Identity(value) => {
                    builder.constrain(
                        ROOT,
                        Constraint {
                            kind: ConstraintKind::Eq,
                            field: None,
                            value: ConstraintValue::Term(value),
                        },
                    );
                    true
                }
                Analysed::Conjuncts(conjuncts) => builder.add_all(conjuncts)?,
            };
            if keep {
                result_sets.push(builder.finish()?);
            } else {
                tracing::debug!(%class_tag, "result dropped: type check cannot hold");
            }
        }
        tracing::debug!(
            %variable,
            %class_tag,
            results = results.len(),
            sets = result_sets.len(),
            "filter plan built"
        );
        Ok(Self { result_sets })
    }
}

const ROOT: u64 = 0;

struct SetBuilder<'a> {
    types: &'a Types,
    mro: &'a Mro,
    requests: BTreeMap<u64, FetchRequest>,
    by_path: HashMap<Vec<String>, u64>,
    parents: HashMap<u64, u64>,
    graph: DiGraph<u64, ()>,
    nodes: HashMap<u64, NodeIndex>,
}

impl<'a> SetBuilder<'a> {
    fn new(types: &'a Types, mro: &'a Mro, class_tag: &str) -> Self {
        let mut builder = Self {
            types,
            mro,
            requests: BTreeMap::new(),
            by_path: HashMap::new(),
            parents: HashMap::new(),
            graph: DiGraph::new(),
            nodes: HashMap::new(),
        };
        builder.requests.insert(
            ROOT,
            FetchRequest {
                class_tag: class_tag.to_string(),
                constraints: Vec::new(),
            },
        );
        builder.node(ROOT);
        builder
    }

    fn node(&mut self, id: u64) -> NodeIndex {
        if let Some(n) = self.nodes.get(&id) {
            return *n;
        }
        let n = self.graph.add_node(id);
        self.nodes.insert(id, n);
        n
    }

    /// `first` must be fetched before `then`.
    fn depends(&mut self, then: u64, first: u64) {
        let (a, b) = (self.node(first), self.node(then));
        self.graph.update_edge(a, b, ());
    }

    fn class_of(&self, id: u64) -> &str {
        self.requests.get(&id).map_or("", |r| r.class_tag.as_str())
    }

    fn constrain(&mut self, id: u64, constraint: Constraint) {
        if let Some(request) = self.requests.get_mut(&id) {
            if !request.constraints.contains(&constraint) {
                request.constraints.push(constraint);
            }
        }
    }

    /// Returns `false` when a type check rules the whole result out.
    fn add_all(&mut self, conjuncts: Vec<Conjunct>) -> Result<bool, CompileError> {
        for conjunct in conjuncts {
            match conjunct {
                Conjunct::TypeCheck { path, class_tag } => {
                    if !self.type_check(&path, &class_tag)? {
                        return Ok(false);
                    }
                }
                Conjunct::Compare { comparison, left, right } => {
                    self.compare(comparison, left, right)?
                }
            }
        }
        Ok(true)
    }

    fn type_check(&mut self, path: &[String], wanted: &str) -> Result<bool, CompileError> {
        let (id, field) = self.resolve(path)?;
        let actual = match field {
            None => self.class_of(id).to_string(),
            Some(field) => match field_type(self.types, self.class_of(id), &field)? {
                Type::Base { class_tag } => class_tag.clone(),
                Type::Relation { other_class_tag, .. } => other_class_tag.clone(),
            },
        };
        Ok(class_matches(self.mro, &actual, wanted))
    }

    /// The request holding the record a path ends on, and the trailing
    /// column if the path ends on a base field.
    fn resolve(&mut self, path: &[String]) -> Result<(u64, Option<String>), CompileError> {
        let types = self.types;
        let mut id = ROOT;
        for (i, field) in path.iter().enumerate() {
            let class = self.class_of(id).to_string();
            match field_type(types, &class, field)? {
                Type::Base { .. } if i + 1 == path.len() => return Ok((id, Some(field.clone()))),
                Type::Base { .. } => {
                    return Err(CompileError::NotARelation {
                        class_tag: class,
                        field: field.clone(),
                    });
                }
                Type::Relation {
                    other_class_tag,
                    my_field,
                    other_field,
                    ..
                } => {
                    let prefix = path[..=i].to_vec();
                    id = match self.by_path.get(&prefix) {
                        Some(child) => *child,
                        None => {
                            let child = self.requests.len() as u64;
                            self.requests.insert(
                                child,
                                FetchRequest {
                                    class_tag: other_class_tag.clone(),
                                    constraints: Vec::new(),
                                },
                            );
                            self.constrain(
                                id,
                                Constraint {
                                    kind: ConstraintKind::In,
                                    field: Some(my_field.clone()),
                                    value: ConstraintValue::Ref {
                                        field: Some(other_field.clone()),
                                        result_id: child,
                                    },
                                },
                            );
                            self.depends(id, child);
                            self.parents.insert(child, id);
                            self.by_path.insert(prefix, child);
                            child
                        }
                    };
                }
            }
        }
        Ok((id, None))
    }

    fn is_ancestor(&self, ancestor: u64, mut id: u64) -> bool {
        while let Some(parent) = self.parents.get(&id) {
            if *parent == ancestor {
                return true;
            }
            id = *parent;
        }
        false
    }

    fn compare(&mut self, comparison: Comparison, left: Operand, right: Operand) -> Result<(), CompileError> {
        let unsupported = |l: &Operand, r: &Operand| CompileError::Unsupported {
            constraint: format!("{l:?} {comparison:?} {r:?}"),
        };
        match (&left, &right) {
            (Operand::Path(path), Operand::Value(value)) => {
                let (id, field) = self.resolve(path)?;
                self.constrain(
                    id,
                    Constraint {
                        kind: comparison.into(),
                        field,
                        value: ConstraintValue::Term(value.clone()),
                    },
                );
            }
            (Operand::Value(value), Operand::Path(path)) => {
                let kind = match comparison {
                    Comparison::In => ConstraintKind::Contains,
                    other => other
                        .flipped()
                        .map(ConstraintKind::from)
                        .ok_or_else(|| unsupported(&left, &right))?,
                };
                let (id, field) = self.resolve(path)?;
                self.constrain(
                    id,
                    Constraint {
                        kind,
                        field,
                        value: ConstraintValue::Term(value.clone()),
                    },
                );
            }
            (Operand::Path(a), Operand::Path(b)) => {
                let (ia, fa) = self.resolve(a)?;
                let (ib, fb) = self.resolve(b)?;
                if ia == ib {
                    match (fa, fb) {
                        (fa, Some(fb)) => self.constrain(
                            ia,
                            Constraint {
                                kind: comparison.into(),
                                field: fa,
                                value: ConstraintValue::Field(fb),
                            },
                        ),
                        (None, None) if comparison == Comparison::Eq => {}
                        _ => return Err(unsupported(&left, &right)),
                    }
                } else if self.is_ancestor(ia, ib) || ia == ROOT {
                    // The referenced side must be fetched first.
                    self.constrain(
                        ia,
                        Constraint {
                            kind: comparison.into(),
                            field: fa,
                            value: ConstraintValue::Ref {
                                field: fb,
                                result_id: ib,
                            },
                        },
                    );
                    self.depends(ia, ib);
                } else {
                    let kind = comparison
                        .flipped()
                        .map(ConstraintKind::from)
                        .ok_or_else(|| unsupported(&left, &right))?;
                    self.constrain(
                        ib,
                        Constraint {
                            kind,
                            field: fb,
                            value: ConstraintValue::Ref {
                                field: fa,
                                result_id: ia,
                            },
                        },
                    );
                    self.depends(ib, ia);
                }
            }
            (Operand::Value(_), Operand::Value(_)) => return Err(unsupported(&left, &right)),
        }
        Ok(())
    }

    fn finish(self) -> Result<ResultSet, CompileError> {
        let order = toposort(&self.graph, None).map_err(|_| CompileError::Unsupported {
            constraint: "fetch requests that depend on each other".to_string(),
        })?;
        Ok(ResultSet {
            resolve_order: order.into_iter().map(|n| self.graph[n]).collect(),
            requests: self.requests,
            result_id: ROOT,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::tests::{path, result, types};
    use crate::term::{Operator, Symbol, THIS};

    fn and(cs: Vec<Term>) -> Term {
        Term::op(Operator::And, cs)
    }

    fn build(partial: Term) -> Result<FilterPlan, CompileError> {
        FilterPlan::build(&types(), &[result("r", partial)], "r", "Doc", &Mro::new())
    }

    #[test]
    fn owner_column_becomes_an_eq_constraint() {
        let plan = build(and(vec![
            Term::op(Operator::Isa, vec![Term::var(THIS), Term::instance_pattern("Doc")]),
            Term::op(Operator::Unify, vec![path(THIS, &["owner"]), Term::string("alice")]),
        ]))
        .unwrap();
        assert_eq!(plan.result_sets.len(), 1);
        let set = &plan.result_sets[0];
        assert_eq!(set.resolve_order, vec![0]);
        assert_eq!(set.result_id, 0);
        assert_eq!(
            set.requests[&0],
            FetchRequest {
                class_tag: "Doc".into(),
                constraints: vec![Constraint {
                    kind: ConstraintKind::Eq,
                    field: Some("owner".into()),
                    value: ConstraintValue::Term(Term::string("alice")),
                }],
            }
        );
    }

    #[test]
    fn relations_become_joined_requests() {
        let plan = build(and(vec![
            Term::op(Operator::Unify, vec![path(THIS, &["folder", "name"]), Term::string("eng")]),
            Term::op(Operator::Gt, vec![path(THIS, &["folder", "team", "id"]), Term::int(3)]),
        ]))
        .unwrap();
        let set = &plan.result_sets[0];
        assert_eq!(set.requests.len(), 3);
        assert_eq!(set.resolve_order, vec![2, 1, 0]);
        assert_eq!(
            set.requests[&0].constraints,
            vec![Constraint {
                kind: ConstraintKind::In,
                field: Some("folder_id".into()),
                value: ConstraintValue::Ref {
                    field: Some("id".into()),
                    result_id: 1,
                },
            }]
        );
        assert_eq!(set.requests[&2].class_tag, "Team");
        assert_eq!(set.requests[&2].constraints[0].kind, ConstraintKind::Gt);
    }

    #[test]
    fn values_on_the_left_are_flipped() {
        let plan = build(and(vec![
            Term::op(Operator::Lt, vec![Term::int(2), path(THIS, &["level"])]),
            Term::op(Operator::In, vec![Term::string("a"), path(THIS, &["owner"])]),
        ]))
        .unwrap();
        let kinds: Vec<_> = plan.result_sets[0].requests[&0]
            .constraints
            .iter()
            .map(|c| c.kind)
            .collect();
        assert_eq!(kinds, vec![ConstraintKind::Gt, ConstraintKind::Contains]);
    }

    #[test]
    fn negated_membership_is_nin() {
        let plan = build(and(vec![Term::op(
            Operator::Not,
            vec![Term::op(
                Operator::In,
                vec![path(THIS, &["owner"]), Term::list(vec![Term::string("eve")])],
            )],
        )]))
        .unwrap();
        assert_eq!(
            plan.result_sets[0].requests[&0].constraints[0].kind,
            ConstraintKind::Nin
        );
    }

    #[test]
    fn concrete_bindings_are_identity_constraints() {
        let plan = build(Term::external(4, Some("Doc"))).unwrap();
        let c = &plan.result_sets[0].requests[&0].constraints[0];
        assert_eq!(c.field, None);
        assert_eq!(c.value, ConstraintValue::Term(Term::external(4, Some("Doc"))));
    }

    #[test]
    fn contradicting_type_checks_drop_the_result() {
        let plan = build(and(vec![Term::op(
            Operator::Isa,
            vec![Term::var(THIS), Term::instance_pattern("Team")],
        )]))
        .unwrap();
        assert!(plan.result_sets.is_empty());

        let mro = Mro::from([(Symbol::new("Doc"), vec![Symbol::new("Doc"), Symbol::new("Record")])]);
        let partial = and(vec![Term::op(
            Operator::Isa,
            vec![Term::var(THIS), Term::instance_pattern("Record")],
        )]);
        let plan = FilterPlan::build(&types(), &[result("r", partial)], "r", "Doc", &mro).unwrap();
        assert_eq!(plan.result_sets.len(), 1);
    }

    #[test]
    fn schema_errors_are_reported() {
        let through_base = and(vec![Term::op(
            Operator::Unify,
            vec![path(THIS, &["owner", "name"]), Term::string("x")],
        )]);
        assert!(matches!(build(through_base), Err(CompileError::NotARelation { .. })));

        let unknown_field = and(vec![Term::op(
            Operator::Unify,
            vec![path(THIS, &["colour"]), Term::string("red")],
        )]);
        assert!(matches!(
            build(unknown_field),
            Err(CompileError::UnregisteredField { .. })
        ));

        assert!(matches!(
            FilterPlan::build(&types(), &[], "r", "Ghost", &Mro::new()),
            Err(CompileError::UnknownClass { .. })
        ));
        assert!(matches!(
            FilterPlan::build(&types(), &[result("other", Term::int(1))], "r", "Doc", &Mro::new()),
            Err(CompileError::MissingBinding { .. })
        ));
    }

    #[test]
    fn plans_serialize_to_json() {
        let plan = build(and(vec![Term::op(
            Operator::Unify,
            vec![path(THIS, &["owner"]), Term::string("alice")],
        )]))
        .unwrap();
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["result_sets"][0]["requests"]["0"]["class_tag"], "Doc");
        assert_eq!(
            json["result_sets"][0]["requests"]["0"]["constraints"][0]["kind"],
            "Eq"
        );
        let back: FilterPlan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }
}
