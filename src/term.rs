//! Core term types for the akh-gate engine.
//!
//! A [`Term`] is an immutable, cheaply cloneable value of the policy language.
//! Terms cross the host boundary as self-describing JSON (see [`crate::codec`]);
//! host objects are only ever referenced through an [`ExternalInstance`] id
//! handed out by the knowledge base, never by pointer.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use crate::symbol::{Symbol, THIS};

// ---------------------------------------------------------------------------
// Numbers
// ---------------------------------------------------------------------------

/// Integer or float. Integers and floats compare by numeric value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Numeric {
    Integer(i64),
    Float(f64),
}

impl Numeric {
    fn as_f64(self) -> f64 {
        match self {
            Numeric::Integer(i) => i as f64,
            Numeric::Float(f) => f,
        }
    }

    fn float_op(self, other: Numeric, op: impl Fn(f64, f64) -> f64) -> Option<Numeric> {
        let r = op(self.as_f64(), other.as_f64());
        r.is_finite().then_some(Numeric::Float(r))
    }

    pub fn add(self, other: Numeric) -> Option<Numeric> {
        match (self, other) {
            (Numeric::Integer(a), Numeric::Integer(b)) => a.checked_add(b).map(Numeric::Integer),
            _ => self.float_op(other, |a, b| a + b),
        }
    }

    pub fn sub(self, other: Numeric) -> Option<Numeric> {
        match (self, other) {
            (Numeric::Integer(a), Numeric::Integer(b)) => a.checked_sub(b).map(Numeric::Integer),
            _ => self.float_op(other, |a, b| a - b),
        }
    }

    pub fn mul(self, other: Numeric) -> Option<Numeric> {
        match (self, other) {
            (Numeric::Integer(a), Numeric::Integer(b)) => a.checked_mul(b).map(Numeric::Integer),
            _ => self.float_op(other, |a, b| a * b),
        }
    }

    /// Division always yields a float.
    pub fn div(self, other: Numeric) -> Option<Numeric> {
        if other.is_zero() {
            return None;
        }
        self.float_op(other, |a, b| a / b)
    }

    /// Floored modulo (result takes the sign of the divisor).
    pub fn modulo(self, other: Numeric) -> Option<Numeric> {
        if other.is_zero() {
            return None;
        }
        match (self, other) {
            (Numeric::Integer(a), Numeric::Integer(b)) => {
                a.checked_rem(b).map(|r| if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
                    .map(Numeric::Integer)
            }
            _ => self.float_op(other, |a, b| {
                let r = a % b;
                if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }
            }),
        }
    }

    /// Truncated remainder (result takes the sign of the dividend).
    pub fn rem(self, other: Numeric) -> Option<Numeric> {
        if other.is_zero() {
            return None;
        }
        match (self, other) {
            (Numeric::Integer(a), Numeric::Integer(b)) => a.checked_rem(b).map(Numeric::Integer),
            _ => self.float_op(other, |a, b| a % b),
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            Numeric::Integer(i) => i == 0,
            Numeric::Float(f) => f == 0.0,
        }
    }
}

impl PartialEq for Numeric {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Numeric::Integer(a), Numeric::Integer(b)) => a == b,
            _ => self.as_f64() == other.as_f64(),
        }
    }
}

impl Eq for Numeric {}

impl PartialOrd for Numeric {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Numeric::Integer(a), Numeric::Integer(b)) => a.partial_cmp(b),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}

impl Hash for Numeric {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Integral floats hash like the equal integer.
        match *self {
            Numeric::Integer(i) => i.hash(state),
            Numeric::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                (f as i64).hash(state)
            }
            Numeric::Float(f) => f.to_bits().hash(state),
        }
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Numeric::Integer(i) => write!(f, "{i}"),
            Numeric::Float(x) => write!(f, "{x:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Compound values
// ---------------------------------------------------------------------------

/// Reference to a host object, identified by an id from the knowledge base counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalInstance {
    pub instance_id: u64,
    /// Host class of the instance, when the host chose to disclose it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_tag: Option<Symbol>,
    /// Human-readable representation for traces and messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dictionary {
    pub fields: BTreeMap<Symbol, Term>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `Class{field: value}` as written in specializers and `matches`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceLiteral {
    pub tag: Symbol,
    pub fields: Dictionary,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pattern {
    Dictionary(Dictionary),
    Instance(InstanceLiteral),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Call {
    pub name: Symbol,
    pub args: Vec<Term>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct List {
    pub elements: Vec<Term>,
    /// `*rest` tail variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest_var: Option<Symbol>,
}

impl List {
    pub fn new(elements: Vec<Term>) -> Self {
        Self { elements, rest_var: None }
    }

    pub fn is_ground(&self) -> bool {
        self.rest_var.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operator {
    Debug,
    Print,
    Cut,
    In,
    Isa,
    Dot,
    Not,
    Mul,
    Div,
    Mod,
    Rem,
    Add,
    Sub,
    Eq,
    Geq,
    Leq,
    Neq,
    Gt,
    Lt,
    Unify,
    Or,
    And,
    ForAll,
    Assign,
}

impl Operator {
    /// Binding strength used when printing nested expressions.
    pub fn precedence(self) -> u8 {
        match self {
            Operator::Or => 1,
            Operator::And => 2,
            Operator::Not => 3,
            Operator::Unify
            | Operator::Eq
            | Operator::Neq
            | Operator::Lt
            | Operator::Gt
            | Operator::Leq
            | Operator::Geq
            | Operator::In
            | Operator::Isa
            | Operator::Assign => 4,
            Operator::Add | Operator::Sub => 5,
            Operator::Mul | Operator::Div | Operator::Mod | Operator::Rem => 6,
            Operator::Dot => 7,
            Operator::Debug | Operator::Print | Operator::Cut | Operator::ForAll => 8,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Debug => "debug",
            Operator::Print => "print",
            Operator::Cut => "cut",
            Operator::In => "in",
            Operator::Isa => "matches",
            Operator::Dot => ".",
            Operator::Not => "not",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Mod => "mod",
            Operator::Rem => "rem",
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Eq => "==",
            Operator::Geq => ">=",
            Operator::Leq => "<=",
            Operator::Neq => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Unify => "=",
            Operator::Or => "or",
            Operator::And => "and",
            Operator::ForAll => "forall",
            Operator::Assign => ":=",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::Eq | Operator::Neq | Operator::Lt | Operator::Gt | Operator::Leq | Operator::Geq
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Operator::Add | Operator::Sub | Operator::Mul | Operator::Div | Operator::Mod | Operator::Rem
        )
    }

    /// The operator that holds exactly when `self` does not.
    pub fn negated(self) -> Option<Operator> {
        Some(match self {
            Operator::Unify | Operator::Eq => Operator::Neq,
            Operator::Neq => Operator::Eq,
            Operator::Lt => Operator::Geq,
            Operator::Geq => Operator::Lt,
            Operator::Gt => Operator::Leq,
            Operator::Leq => Operator::Gt,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operation {
    pub operator: Operator,
    pub args: Vec<Term>,
}

// ---------------------------------------------------------------------------
// Values and terms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Number(Numeric),
    String(String),
    Boolean(bool),
    ExternalInstance(ExternalInstance),
    Dictionary(Dictionary),
    Pattern(Pattern),
    Call(Call),
    List(List),
    Variable(Symbol),
    RestVariable(Symbol),
    Expression(Operation),
}

impl Value {
    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Value::Variable(s) | Value::RestVariable(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_expression(&self) -> Option<&Operation> {
        match self {
            Value::Expression(op) => Some(op),
            _ => None,
        }
    }

    /// Short type name used in error messages.
    /// Whether this value belongs to the built-in class `tag`.
    pub fn is_builtin_instance(&self, tag: &str) -> bool {
        matches!(
            (tag, self),
            ("Integer", Value::Number(Numeric::Integer(_)))
                | ("Float", Value::Number(Numeric::Float(_)))
                | ("Number", Value::Number(_))
                | ("String", Value::String(_))
                | ("Boolean", Value::Boolean(_))
                | ("List", Value::List(_))
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(Numeric::Integer(_)) => "integer",
            Value::Number(Numeric::Float(_)) => "float",
            Value::String(_) => "string",
            Value::Boolean(_) => "boolean",
            Value::ExternalInstance(_) => "external instance",
            Value::Dictionary(_) => "dictionary",
            Value::Pattern(_) => "pattern",
            Value::Call(_) => "call",
            Value::List(_) => "list",
            Value::Variable(_) => "variable",
            Value::RestVariable(_) => "rest variable",
            Value::Expression(_) => "expression",
        }
    }
}

/// Where a term was written, for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub filename: Option<String>,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)?;
        if let Some(name) = &self.filename {
            write!(f, " in file {name}")?;
        }
        Ok(())
    }
}

/// An immutable policy-language value with optional source position.
///
/// Equality and hashing ignore the source position.
#[derive(Clone, Serialize, Deserialize)]
pub struct Term {
    #[serde(skip)]
    source: Option<Arc<SourceInfo>>,
    value: Arc<Value>,
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value) || self.value == other.value
    }
}

impl Eq for Term {}

impl Hash for Term {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Term({self})")
    }
}

impl From<Value> for Term {
    fn from(value: Value) -> Self {
        Term::new(value)
    }
}

impl Term {
    pub fn new(value: Value) -> Self {
        Self {
            source: None,
            value: Arc::new(value),
        }
    }

    pub fn with_source(mut self, source: SourceInfo) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn source(&self) -> Option<&SourceInfo> {
        self.source.as_deref()
    }

    /// Replace the value, keeping the source position.
    pub fn clone_with_value(&self, value: Value) -> Self {
        Self {
            source: self.source.clone(),
            value: Arc::new(value),
        }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Term::new(Value::Variable(Symbol::new(name)))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Term::new(Value::String(s.into()))
    }

    pub fn int(i: i64) -> Self {
        Term::new(Value::Number(Numeric::Integer(i)))
    }

    pub fn float(f: f64) -> Self {
        Term::new(Value::Number(Numeric::Float(f)))
    }

    pub fn boolean(b: bool) -> Self {
        Term::new(Value::Boolean(b))
    }

    pub fn list(elements: Vec<Term>) -> Self {
        Term::new(Value::List(List::new(elements)))
    }

    pub fn call(name: &str, args: Vec<Term>) -> Self {
        Term::new(Value::Call(Call {
            name: Symbol::new(name),
            args,
        }))
    }

    pub fn op(operator: Operator, args: Vec<Term>) -> Self {
        Term::new(Value::Expression(Operation { operator, args }))
    }

    pub fn external(instance_id: u64, class_tag: Option<&str>) -> Self {
        Term::new(Value::ExternalInstance(ExternalInstance {
            instance_id,
            class_tag: class_tag.map(Symbol::new),
            repr: None,
        }))
    }

    pub fn instance_pattern(tag: &str) -> Self {
        Term::new(Value::Pattern(Pattern::Instance(InstanceLiteral {
            tag: Symbol::new(tag),
            fields: Dictionary::new(),
        })))
    }

    /// An unconstrained partial: bind a query variable to this to leave it symbolic.
    pub fn partial() -> Self {
        Term::op(Operator::And, vec![])
    }

    /// A partial restricted to instances of `class_tag`.
    pub fn partial_of(class_tag: &str) -> Self {
        Term::op(
            Operator::And,
            vec![Term::op(
                Operator::Isa,
                vec![Term::var(THIS), Term::instance_pattern(class_tag)],
            )],
        )
    }

    pub fn is_ground(&self) -> bool {
        let mut ground = true;
        self.walk(&mut |t| {
            if matches!(t.value(), Value::Variable(_) | Value::RestVariable(_)) {
                ground = false;
            }
            if let Value::List(l) = t.value() {
                if l.rest_var.is_some() {
                    ground = false;
                }
            }
        });
        ground
    }

    /// Rebuild this term with `f` applied to each direct child.
    pub fn map_children<F>(&self, f: &mut F) -> Term
    where
        F: FnMut(&Term) -> Term,
    {
        let map_dict = |d: &Dictionary, f: &mut F| Dictionary {
            fields: d.fields.iter().map(|(k, v)| (k.clone(), f(v))).collect(),
        };
        let value = match self.value() {
            Value::Number(_)
            | Value::String(_)
            | Value::Boolean(_)
            | Value::ExternalInstance(_)
            | Value::Variable(_)
            | Value::RestVariable(_) => return self.clone(),
            Value::Dictionary(d) => Value::Dictionary(map_dict(d, f)),
            Value::Pattern(Pattern::Dictionary(d)) => Value::Pattern(Pattern::Dictionary(map_dict(d, f))),
            Value::Pattern(Pattern::Instance(lit)) => Value::Pattern(Pattern::Instance(InstanceLiteral {
                tag: lit.tag.clone(),
                fields: map_dict(&lit.fields, f),
            })),
            Value::Call(c) => Value::Call(Call {
                name: c.name.clone(),
                args: c.args.iter().map(|a| f(a)).collect(),
            }),
            Value::List(l) => Value::List(List {
                elements: l.elements.iter().map(|e| f(e)).collect(),
                rest_var: l.rest_var.as_ref().map(|r| {
                    match f(&Term::new(Value::RestVariable(r.clone()))).value() {
                        Value::RestVariable(s) | Value::Variable(s) => s.clone(),
                        _ => r.clone(),
                    }
                }),
            }),
            Value::Expression(op) => Value::Expression(Operation {
                operator: op.operator,
                args: op.args.iter().map(|a| f(a)).collect(),
            }),
        };
        self.clone_with_value(value)
    }

    /// Top-down replacement: where `f` returns `Some`, that subtree is replaced
    /// wholesale; otherwise the children are visited.
    pub fn replace<F>(&self, f: &mut F) -> Term
    where
        F: FnMut(&Term) -> Option<Term>,
    {
        match f(self) {
            Some(t) => t,
            None => self.map_children(&mut |c: &Term| c.replace(f)),
        }
    }

    /// Pre-order visit of every subterm.
    pub fn walk<F>(&self, f: &mut F)
    where
        F: FnMut(&Term),
    {
        f(self);
        let mut visit = |t: &Term| {
            t.walk(f);
            t.clone()
        };
        if !matches!(
            self.value(),
            Value::Number(_) | Value::String(_) | Value::Boolean(_) | Value::ExternalInstance(_)
        ) {
            self.map_children(&mut visit);
        }
    }

    /// Variables in order of first occurrence (rest variables included).
    pub fn variables(&self) -> Vec<Symbol> {
        let mut seen = Vec::new();
        self.walk(&mut |t| {
            let sym = match t.value() {
                Value::Variable(s) | Value::RestVariable(s) => Some(s),
                _ => None,
            };
            if let Some(s) = sym {
                if !seen.contains(s) {
                    seen.push(s.clone());
                }
            }
        });
        seen
    }

    pub fn contains_variable(&self, name: &Symbol) -> bool {
        let mut found = false;
        self.walk(&mut |t| {
            if t.value().as_symbol() == Some(name) {
                found = true;
            }
        });
        found
    }

    /// Rename every occurrence of variable `from` to `to`.
    pub fn rename_var(&self, from: &Symbol, to: &Symbol) -> Term {
        self.replace(&mut |t| match t.value() {
            Value::Variable(s) if s == from => Some(t.clone_with_value(Value::Variable(to.clone()))),
            Value::RestVariable(s) if s == from => {
                Some(t.clone_with_value(Value::RestVariable(to.clone())))
            }
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Policy-syntax formatting
// ---------------------------------------------------------------------------

fn fmt_args(f: &mut fmt::Formatter<'_>, args: &[Term]) -> fmt::Result {
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{a}")?;
    }
    Ok(())
}

fn fmt_fields(f: &mut fmt::Formatter<'_>, d: &Dictionary) -> fmt::Result {
    f.write_str("{")?;
    for (i, (k, v)) in d.fields.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{k}: {v}")?;
    }
    f.write_str("}")
}

fn fmt_operand(f: &mut fmt::Formatter<'_>, parent: Operator, arg: &Term) -> fmt::Result {
    match arg.value() {
        Value::Expression(child)
            if child.operator.precedence() < parent.precedence()
                && !matches!(child.operator, Operator::And if child.args.len() < 2) =>
        {
            write!(f, "({arg})")
        }
        _ => write!(f, "{arg}"),
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.operator;
        match op {
            Operator::And | Operator::Or => {
                if self.args.is_empty() {
                    return f.write_str(if op == Operator::And { "true" } else { "false" });
                }
                for (i, a) in self.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", op.symbol())?;
                    }
                    fmt_operand(f, op, a)?;
                }
                Ok(())
            }
            Operator::Not => {
                f.write_str("not ")?;
                match self.args.first() {
                    Some(a) => fmt_operand(f, op, a),
                    None => Ok(()),
                }
            }
            Operator::Dot if self.args.len() == 2 => {
                fmt_operand(f, op, &self.args[0])?;
                match self.args[1].value() {
                    Value::String(field) => write!(f, ".{field}"),
                    Value::Call(c) => {
                        write!(f, ".{}(", c.name)?;
                        fmt_args(f, &c.args)?;
                        f.write_str(")")
                    }
                    other => write!(f, ".({})", Term::new(other.clone())),
                }
            }
            Operator::Debug | Operator::Print | Operator::Cut | Operator::ForAll | Operator::Dot => {
                write!(f, "{}(", op.symbol())?;
                fmt_args(f, &self.args)?;
                f.write_str(")")
            }
            _ if self.args.len() == 2 => {
                fmt_operand(f, op, &self.args[0])?;
                write!(f, " {} ", op.symbol())?;
                fmt_operand(f, op, &self.args[1])
            }
            _ => {
                write!(f, "{}(", op.symbol())?;
                fmt_args(f, &self.args)?;
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::ExternalInstance(e) => match &e.repr {
                Some(repr) => f.write_str(repr),
                None => write!(f, "^{{id: {}}}", e.instance_id),
            },
            Value::Dictionary(d) | Value::Pattern(Pattern::Dictionary(d)) => fmt_fields(f, d),
            Value::Pattern(Pattern::Instance(lit)) => {
                write!(f, "{}", lit.tag)?;
                if lit.fields.fields.is_empty() {
                    return Ok(());
                }
                fmt_fields(f, &lit.fields)
            }
            Value::Call(c) => {
                write!(f, "{}(", c.name)?;
                fmt_args(f, &c.args)?;
                f.write_str(")")
            }
            Value::List(l) => {
                f.write_str("[")?;
                fmt_args(f, &l.elements)?;
                if let Some(rest) = &l.rest_var {
                    if !l.elements.is_empty() {
                        f.write_str(", ")?;
                    }
                    write!(f, "*{rest}")?;
                }
                f.write_str("]")
            }
            Value::Variable(s) => write!(f, "{s}"),
            Value::RestVariable(s) => write!(f, "*{s}"),
            Value::Expression(op) => write!(f, "{op}"),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_and_floats_compare_numerically() {
        assert_eq!(Numeric::Integer(1), Numeric::Float(1.0));
        assert!(Numeric::Integer(1) < Numeric::Float(1.5));
        assert_eq!(Term::int(2), Term::float(2.0));
    }

    #[test]
    fn modulo_follows_divisor_sign() {
        assert_eq!(
            Numeric::Integer(-7).modulo(Numeric::Integer(3)),
            Some(Numeric::Integer(2))
        );
        assert_eq!(
            Numeric::Integer(-7).rem(Numeric::Integer(3)),
            Some(Numeric::Integer(-1))
        );
        assert_eq!(Numeric::Integer(1).div(Numeric::Integer(0)), None);
    }

    #[test]
    fn source_position_is_ignored_by_equality() {
        let a = Term::string("x").with_source(SourceInfo {
            filename: None,
            line: 3,
            column: 1,
        });
        assert_eq!(a, Term::string("x"));
    }

    #[test]
    fn variables_in_first_occurrence_order() {
        let t = Term::call(
            "f",
            vec![Term::var("b"), Term::list(vec![Term::var("a"), Term::var("b")])],
        );
        assert_eq!(t.variables(), vec![Symbol::new("b"), Symbol::new("a")]);
        assert!(!t.is_ground());
    }

    #[test]
    fn formats_in_policy_syntax() {
        let lookup = Term::op(Operator::Dot, vec![Term::var("r"), Term::string("owner")]);
        let t = Term::op(
            Operator::And,
            vec![
                Term::op(Operator::Unify, vec![lookup, Term::string("alice")]),
                Term::op(
                    Operator::Or,
                    vec![Term::boolean(true), Term::boolean(false)],
                ),
            ],
        );
        assert_eq!(t.to_string(), r#"r.owner = "alice" and (true or false)"#);
    }

    #[test]
    fn rename_reaches_rest_variables() {
        let t = Term::new(Value::List(List {
            elements: vec![Term::var("x")],
            rest_var: Some(Symbol::new("x")),
        }));
        let renamed = t.rename_var(&Symbol::new("x"), &Symbol::new("y"));
        assert_eq!(renamed.to_string(), "[y, *y]");
    }
}
