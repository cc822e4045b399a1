//! Rules: named Horn clauses with optionally specialized parameters.

use std::collections::HashMap;
use std::fmt;

use crate::error::LoadError;
use crate::term::{Dictionary, Operator, Pattern, SourceInfo, Symbol, Term, Value};

/// Names handled by the evaluator itself; rules may not use them.
pub const RESERVED_NAMES: &[&str] = &["cut", "print", "debug", "forall"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub parameter: Term,
    /// `Class`, `Class{field: value}` or `{key: value}` restriction.
    pub specializer: Option<Term>,
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.specializer {
            Some(spec) => write!(f, "{}: {}", self.parameter, spec),
            None => write!(f, "{}", self.parameter),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: Symbol,
    pub params: Vec<Parameter>,
    /// Conjunction of goals; an empty `And` is a fact.
    pub body: Term,
    pub source: Option<SourceInfo>,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.params == other.params && self.body == other.body
    }
}

impl Eq for Rule {}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{p}")?;
        }
        f.write_str(")")?;
        if !self.is_fact() {
            write!(f, " if {}", self.body)?;
        }
        f.write_str(";")
    }
}

impl Rule {
    pub fn is_fact(&self) -> bool {
        matches!(self.body.value(), Value::Expression(op) if op.operator == Operator::And && op.args.is_empty())
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Reject reserved names and parameters that cannot be matched by unification.
    pub fn validate(&self) -> Result<(), LoadError> {
        if RESERVED_NAMES.contains(&self.name.as_str()) {
            return Err(LoadError::ReservedName {
                name: self.name.0.clone(),
            });
        }
        for p in &self.params {
            if let Some(reason) = invalid_parameter_reason(&p.parameter) {
                return Err(LoadError::InvalidParameter {
                    rule: self.name.0.clone(),
                    parameter: p.parameter.to_string(),
                    reason,
                });
            }
            if let Some(spec) = &p.specializer {
                if !matches!(spec.value(), Value::Pattern(_)) || !spec_fields_valid(spec) {
                    return Err(LoadError::InvalidSpecializer {
                        rule: self.name.0.clone(),
                        specializer: spec.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Whether this rule fits the declared rule type `declared`: same arity,
    /// and every parameter at least as specific as the declared one.
    pub fn conforms_to(
        &self,
        declared: &Rule,
        is_subclass: impl Fn(&Symbol, &Symbol) -> bool,
    ) -> bool {
        self.name == declared.name
            && self.arity() == declared.arity()
            && self
                .params
                .iter()
                .zip(&declared.params)
                .all(|(p, d)| parameter_conforms(p, d, &is_subclass))
    }

    /// Variables that occur exactly once and are not marked anonymous with `_`.
    pub fn singletons(&self, is_constant: impl Fn(&Symbol) -> bool) -> Vec<Symbol> {
        let mut counts: HashMap<Symbol, usize> = HashMap::new();
        let mut order = Vec::new();
        let mut count = |t: &Term| {
            t.walk(&mut |sub| {
                if let Value::Variable(s) | Value::RestVariable(s) = sub.value() {
                    let n = counts.entry(s.clone()).or_insert(0);
                    if *n == 0 {
                        order.push(s.clone());
                    }
                    *n += 1;
                }
            })
        };
        for p in &self.params {
            count(&p.parameter);
            if let Some(spec) = &p.specializer {
                count(spec);
            }
        }
        count(&self.body);
        order
            .into_iter()
            .filter(|s| counts.get(s) == Some(&1) && !s.is_temporary() && !is_constant(s))
            .collect()
    }

    /// Names of rules invoked from goal positions of the body.
    pub fn called_rules(&self) -> Vec<Symbol> {
        let mut out = Vec::new();
        collect_goal_calls(&self.body, &mut out);
        out
    }

    /// Give every non-constant variable a fresh name for one application.
    pub fn rename(&self, suffix: u64, is_constant: impl Fn(&Symbol) -> bool) -> Rule {
        let mut fresh = |t: &Term| -> Option<Term> {
            match t.value() {
                Value::Variable(s) if !is_constant(s) => {
                    Some(t.clone_with_value(Value::Variable(renamed(s, suffix))))
                }
                Value::RestVariable(s) if !is_constant(s) => {
                    Some(t.clone_with_value(Value::RestVariable(renamed(s, suffix))))
                }
                _ => None,
            }
        };
        Rule {
            name: self.name.clone(),
            params: self
                .params
                .iter()
                .map(|p| Parameter {
                    parameter: p.parameter.replace(&mut fresh),
                    specializer: p.specializer.as_ref().map(|s| s.replace(&mut fresh)),
                })
                .collect(),
            body: self.body.replace(&mut fresh),
            source: self.source.clone(),
        }
    }
}

fn renamed(s: &Symbol, suffix: u64) -> Symbol {
    Symbol(format!("_{}_{}", s.0, suffix))
}

fn invalid_parameter_reason(t: &Term) -> Option<String> {
    match t.value() {
        Value::Variable(_)
        | Value::String(_)
        | Value::Number(_)
        | Value::Boolean(_)
        | Value::ExternalInstance(_) => None,
        Value::List(l) => l.elements.iter().find_map(invalid_parameter_reason),
        Value::Dictionary(d) => d.fields.values().find_map(invalid_parameter_reason),
        Value::Expression(op) if op.operator == Operator::Dot => {
            Some("attribute lookups are not allowed in rule heads".to_string())
        }
        Value::Expression(op) if op.operator.is_arithmetic() => {
            Some("arithmetic is not allowed in rule heads".to_string())
        }
        other => Some(format!("a {} cannot be a parameter", other.type_name())),
    }
}

fn spec_fields_valid(spec: &Term) -> bool {
    let fields = match spec.value() {
        Value::Pattern(Pattern::Dictionary(d)) => d,
        Value::Pattern(Pattern::Instance(lit)) => &lit.fields,
        _ => return false,
    };
    fields
        .fields
        .values()
        .all(|v| invalid_parameter_reason(v).is_none())
}

fn parameter_conforms(
    param: &Parameter,
    declared: &Parameter,
    is_subclass: &impl Fn(&Symbol, &Symbol) -> bool,
) -> bool {
    let Some(declared_spec) = &declared.specializer else {
        // A declared variable admits anything; a declared literal only itself.
        return matches!(declared.parameter.value(), Value::Variable(_))
            || (param.specializer.is_none() && param.parameter == declared.parameter);
    };
    match (&param.specializer, param.parameter.value()) {
        (Some(spec), _) => pattern_narrows(spec, declared_spec, is_subclass),
        (None, Value::Variable(_)) => false,
        (None, value) => value_fits(value, declared_spec),
    }
}

fn pattern_narrows(
    spec: &Term,
    declared: &Term,
    is_subclass: &impl Fn(&Symbol, &Symbol) -> bool,
) -> bool {
    match (spec.value(), declared.value()) {
        (Value::Pattern(Pattern::Instance(s)), Value::Pattern(Pattern::Instance(d))) => {
            is_subclass(&s.tag, &d.tag) && has_fields(&s.fields, &d.fields)
        }
        (Value::Pattern(Pattern::Instance(s)), Value::Pattern(Pattern::Dictionary(d))) => {
            has_fields(&s.fields, d)
        }
        (Value::Pattern(Pattern::Dictionary(s)), Value::Pattern(Pattern::Dictionary(d))) => {
            has_fields(s, d)
        }
        _ => false,
    }
}

fn value_fits(value: &Value, declared: &Term) -> bool {
    match (declared.value(), value) {
        (Value::Pattern(Pattern::Instance(d)), value) => {
            d.fields.fields.is_empty() && value.is_builtin_instance(d.tag.as_str())
        }
        (Value::Pattern(Pattern::Dictionary(d)), Value::Dictionary(v)) => has_fields(v, d),
        _ => false,
    }
}

/// Every field of `required` appears in `fields` with the same value.
fn has_fields(fields: &Dictionary, required: &Dictionary) -> bool {
    required
        .fields
        .iter()
        .all(|(k, v)| fields.fields.get(k) == Some(v))
}

fn collect_goal_calls(goal: &Term, out: &mut Vec<Symbol>) {
    match goal.value() {
        Value::Call(c) if c.name.as_str() == "forall" => {
            for a in &c.args {
                collect_goal_calls(a, out);
            }
        }
        Value::Call(c) => {
            if !RESERVED_NAMES.contains(&c.name.as_str()) && !out.contains(&c.name) {
                out.push(c.name.clone());
            }
        }
        Value::Expression(op) if matches!(op.operator, Operator::And | Operator::Or | Operator::Not) => {
            for a in &op.args {
                collect_goal_calls(a, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Line, parse_lines};

    fn rule(src: &str) -> Rule {
        match parse_lines(src, None).unwrap().remove(0) {
            Line::Rule(r) | Line::RuleType(r) => r,
            Line::Query(_) => panic!("expected a rule"),
        }
    }

    #[test]
    fn displays_in_source_form() {
        let r = rule("allow(actor, \"read\", r: Doc) if r.public = true;");
        assert_eq!(r.to_string(), "allow(actor, \"read\", r: Doc) if r.public = true;");
        assert_eq!(rule("f(1);").to_string(), "f(1);");
    }

    #[test]
    fn reserved_names_are_rejected() {
        let err = rule("cut(x);").validate().unwrap_err();
        assert!(matches!(err, LoadError::ReservedName { .. }));
    }

    #[test]
    fn lookups_in_heads_are_rejected() {
        let err = rule("f(x.y);").validate().unwrap_err();
        assert!(matches!(err, LoadError::InvalidParameter { .. }));
    }

    #[test]
    fn conformance_to_declared_rule_types() {
        let declared = rule("type allow(actor: User, action, resource: Resource);");
        let same_class = |a: &Symbol, b: &Symbol| a == b;
        let docs_are_resources =
            |a: &Symbol, b: &Symbol| a == b || (a.as_str() == "Doc" && b.as_str() == "Resource");

        let exact = rule("allow(a: User, \"read\", r: Resource);");
        assert!(exact.conforms_to(&declared, same_class));

        let narrower = rule("allow(a: User{admin: true}, action, r: Doc) if r.open = action;");
        assert!(!narrower.conforms_to(&declared, same_class));
        assert!(narrower.conforms_to(&declared, docs_are_resources));

        let unspecialized = rule("allow(a, \"read\", r: Resource);");
        assert!(!unspecialized.conforms_to(&declared, same_class));

        let wrong_arity = rule("allow(a: User, r: Resource);");
        assert!(!wrong_arity.conforms_to(&declared, same_class));
    }

    #[test]
    fn declared_literals_and_builtin_classes() {
        let declared = rule("type level(\"admin\", n: Integer);");
        assert!(rule("level(\"admin\", 3);").conforms_to(&declared, |a, b| a == b));
        assert!(!rule("level(\"guest\", 3);").conforms_to(&declared, |a, b| a == b));
        assert!(!rule("level(\"admin\", \"high\");").conforms_to(&declared, |a, b| a == b));
    }

    #[test]
    fn lookups_in_specializer_fields_are_rejected() {
        use miette::Diagnostic;

        let err = rule("f(x: Doc{owner: y.name});").validate().unwrap_err();
        assert!(matches!(err, LoadError::InvalidSpecializer { .. }));
        let help = err.help().map(|h| h.to_string()).unwrap_or_default();
        assert!(help.contains("Class{field: value}"));
    }

    #[test]
    fn singletons_skip_anonymous_variables() {
        let r = rule("f(x, _y, z) if z = 1;");
        assert_eq!(r.singletons(|_| false), vec![Symbol::new("x")]);
    }

    #[test]
    fn rename_leaves_constants_alone() {
        let r = rule("f(x) if x = ADMIN;");
        let renamed = r.rename(3, |s| s.as_str() == "ADMIN");
        assert_eq!(renamed.to_string(), "f(_x_3) if _x_3 = ADMIN;");
    }

    #[test]
    fn called_rules_ignore_method_calls() {
        let r = rule("f(x) if g(x) and x.h(1) and not k(x);");
        let names: Vec<_> = r.called_rules().into_iter().map(|s| s.0).collect();
        assert_eq!(names, vec!["g", "k"]);
    }
}
