//! The resumable query evaluator.
//!
//! Evaluation is an explicit goal stack plus a stack of choice points. Each
//! choice point records a snapshot of the remaining goals, the binding trail
//! position, the number of recorded constraints and the active query frames,
//! so backtracking is a matter of restoring those four things and pushing the
//! next alternative. Nothing recurses on the native stack, which is what lets
//! a query stop at any external call and resume later from the same state.
//!
//! Variables bound to a *partial* stay symbolic: operations on them are
//! recorded as constraints instead of being evaluated, and a solution reports
//! the constraints in place of a value.

pub mod bindings;
pub mod debugger;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use crate::bridge::Bridge;
use crate::error::{BindError, BridgeError, DebugError, EvalError};
use crate::events::{Bindings, Question, QueryEvent};
use crate::kb::KnowledgeBase;
use crate::message::{Message, MessageQueue};
use crate::rules::Rule;
use crate::term::{
    Call, Dictionary, List, Operation, Operator, Pattern, Symbol, THIS, Term, Value,
};
use bindings::{BindingManager, Bsp};
use debugger::{DebugCommand, Debugger, HELP};

/// Default bound on the goal stack and the choice stack.
pub const DEFAULT_MAX_GOALS: usize = 10_000;

/// Names of the built-in classes checked without asking the host.
const BUILTIN_CLASSES: &[&str] = &["Integer", "Float", "Number", "String", "Boolean", "List", "Dictionary"];

#[derive(Debug, Clone)]
pub enum Goal {
    Query { term: Term, barrier: usize },
    Unify { left: Term, right: Term },
    Isa { left: Term, right: Term },
    Lookup { object: Term, field: Term, result: Term },
    Compare { operator: Operator, left: Term, right: Term },
    Arithmetic { operator: Operator, left: Term, right: Term, result: Term },
    Member { item: Term, collection: Term },
    Assign { left: Term, right: Term },
    ApplyRule { rule: Arc<Rule>, args: Vec<Term>, barrier: usize },
    /// Suspend until the host answers.
    Ask { question: Question },
    /// Record a constraint on a partial.
    Constrain { term: Term },
    /// Reached once per solution of a negated goal.
    CheckNegation { id: u64, choice: usize },
    /// Reached once the negated goal has no solutions left.
    FinishNegation { id: u64 },
    /// Record one of several constraints, trying each in turn.
    ConstrainAny { terms: Vec<Term> },
    Cut { barrier: usize },
    Backtrack,
    PopQuery,
    Debug { message: String },
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Goal::Query { term, .. } => write!(f, "{term}"),
            Goal::Unify { left, right } => write!(f, "{left} = {right}"),
            Goal::Isa { left, right } => write!(f, "{left} matches {right}"),
            Goal::Lookup { object, field, result } => write!(f, ".({object}, {field}, {result})"),
            Goal::Compare { operator, left, right } => {
                write!(f, "{left} {} {right}", operator.symbol())
            }
            Goal::Arithmetic { operator, left, right, result } => {
                write!(f, "{result} := {left} {} {right}", operator.symbol())
            }
            Goal::Member { item, collection } => write!(f, "{item} in {collection}"),
            Goal::Assign { left, right } => write!(f, "{left} := {right}"),
            Goal::ApplyRule { rule, .. } => write!(f, "apply {rule}"),
            Goal::Ask { question } => write!(f, "ask {question:?}"),
            Goal::Constrain { term } => write!(f, "constrain {term}"),
            Goal::CheckNegation { id, choice } => write!(f, "check negation {id} at #{choice}"),
            Goal::FinishNegation { id } => write!(f, "finish negation {id}"),
            Goal::ConstrainAny { terms } => {
                let terms = terms.iter().map(Term::to_string).collect::<Vec<_>>();
                write!(f, "constrain any of [{}]", terms.join(", "))
            }
            Goal::Cut { barrier } => write!(f, "cut to #{barrier}"),
            Goal::Backtrack => f.write_str("backtrack"),
            Goal::PopQuery => f.write_str("pop query"),
            Goal::Debug { message } => write!(f, "debug {message:?}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Choice {
    /// Remaining alternatives, next one last.
    alternatives: Vec<Vec<Goal>>,
    goals: Vec<Arc<Goal>>,
    bsp: Bsp,
    constraints: usize,
    queries: Vec<Term>,
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    Running,
    Done,
    Failed(String),
}

/// Evaluator state for one query.
pub struct Vm {
    kb: Weak<RwLock<KnowledgeBase>>,
    goals: Vec<Arc<Goal>>,
    choices: Vec<Choice>,
    bindings: BindingManager,
    constraints: Vec<Term>,
    /// Constraints supplied with a partial binding; never backtracked.
    seeds: Vec<Term>,
    partials: HashSet<Symbol>,
    /// Constraint sets gathered from each solution of an open negation.
    negations: HashMap<u64, Vec<Vec<Term>>>,
    constants: HashSet<Symbol>,
    query_vars: Vec<Symbol>,
    queries: Vec<Term>,
    bridge: Bridge,
    debugger: Debugger,
    messages: MessageQueue,
    warned_undefined: HashSet<Symbol>,
    trace: bool,
    max_goals: usize,
    renames: u64,
    temps: u64,
    state: State,
}

impl Vm {
    /// `term` must already be rewritten by the knowledge base.
    pub fn new(kb: &Arc<RwLock<KnowledgeBase>>, term: Term, trace: bool, max_goals: usize) -> Self {
        let mut bindings = BindingManager::new();
        let constants: HashSet<Symbol> = {
            let kb = kb.read().unwrap_or_else(PoisonError::into_inner);
            for (name, value) in kb.constants() {
                bindings.bind(name, value.clone());
            }
            kb.constants().keys().cloned().collect()
        };
        let query_vars = term
            .variables()
            .into_iter()
            .filter(|v| !v.is_temporary() && !constants.contains(v))
            .collect();
        Self {
            kb: Arc::downgrade(kb),
            goals: vec![Arc::new(Goal::Query { term, barrier: 0 })],
            choices: Vec::new(),
            bindings,
            constraints: Vec::new(),
            seeds: Vec::new(),
            partials: HashSet::new(),
            negations: HashMap::new(),
            constants,
            query_vars,
            queries: Vec::new(),
            bridge: Bridge::new(),
            debugger: Debugger::default(),
            messages: MessageQueue::new(),
            warned_undefined: HashSet::new(),
            trace,
            max_goals,
            renames: 0,
            temps: 0,
            state: State::Running,
        }
    }

    // ── Host-facing operations ────────────────────────────────────────

    pub fn pending_call(&self) -> Option<u64> {
        self.bridge.pending().map(|s| s.call_id())
    }

    pub fn next_event(&mut self) -> Result<QueryEvent, EvalError> {
        match &self.state {
            State::Done => return Ok(QueryEvent::Done),
            State::Failed(message) => {
                return Err(EvalError::Terminated {
                    message: message.clone(),
                });
            }
            State::Running => {}
        }
        if let Some(message) = self.bridge.take_application_error() {
            return Err(self.fail(EvalError::Application { message }));
        }

        loop {
            if self.goals.len() > self.max_goals || self.choices.len() > self.max_goals {
                let limit = self.max_goals;
                return Err(self.fail(EvalError::StackOverflow { limit }));
            }
            let Some(goal) = self.goals.pop() else {
                let bindings = self.result_bindings();
                tracing::debug!(vars = bindings.len(), "query produced a result");
                self.push(Goal::Backtrack);
                return Ok(QueryEvent::Result { bindings });
            };
            match self.step(&goal) {
                Ok(Some(event)) => {
                    if let QueryEvent::Debug { .. } = event {
                        self.debugger.activate();
                    }
                    return Ok(event);
                }
                Ok(None) => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    pub fn call_result(&mut self, call_id: u64, value: Option<Term>) -> Result<(), BridgeError> {
        let result = self.bridge.answer_call(call_id)?;
        match value {
            Some(value) => self.push(Goal::Unify {
                left: result,
                right: value,
            }),
            None => self.push(Goal::Backtrack),
        }
        Ok(())
    }

    pub fn question_result(&mut self, call_id: u64, answer: bool) -> Result<(), BridgeError> {
        self.bridge.answer_question(call_id)?;
        if !answer {
            self.push(Goal::Backtrack);
        }
        Ok(())
    }

    pub fn application_error(&mut self, message: String) {
        tracing::warn!(%message, "host reported an application error");
        self.bridge.record_application_error(message);
    }

    /// Bind a query variable. Binding to an `And` expression over `_this`
    /// makes the variable partial with those constraints.
    pub fn bind(&mut self, name: &str, value: Term) -> Result<(), BindError> {
        if self.state != State::Running {
            return Err(BindError::Finished {
                name: name.to_string(),
            });
        }
        let var = Symbol::new(name);
        if !self.query_vars.contains(&var) {
            return Err(BindError::UnknownVariable {
                name: name.to_string(),
            });
        }
        match value.value() {
            Value::Expression(op) if op.operator == Operator::And => {
                let this = Symbol::new(THIS);
                self.seeds
                    .extend(op.args.iter().map(|c| c.rename_var(&this, &var)));
                self.partials.insert(var);
            }
            _ if self.bindings.occurs(&var, &value) => {
                return Err(BindError::Cyclic {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
            _ => self.bindings.bind(&var, value),
        }
        Ok(())
    }

    pub fn next_message(&self) -> Option<Message> {
        self.messages.next()
    }

    pub fn messages(&self) -> &MessageQueue {
        &self.messages
    }

    /// Position of the innermost active query.
    pub fn source_info(&self) -> String {
        match self.queries.last() {
            Some(term) => describe_source(term),
            None => "no active query".to_string(),
        }
    }

    pub fn debug_command(&mut self, input: &str) -> Result<(), DebugError> {
        if !self.trace || !self.debugger.is_active() || self.state != State::Running {
            return Err(DebugError::NoSession);
        }
        let depth = self.queries.len();
        let output = match DebugCommand::parse(input)? {
            DebugCommand::Continue => {
                self.debugger.resume();
                None
            }
            DebugCommand::StepInto => {
                self.debugger.step_into();
                None
            }
            DebugCommand::StepOver => {
                self.debugger.step_over(depth);
                None
            }
            DebugCommand::StepOut => {
                self.debugger.step_out(depth);
                None
            }
            DebugCommand::Bindings => Some(self.describe_bindings()),
            DebugCommand::Var(names) if names.is_empty() => Some(
                self.query_vars
                    .iter()
                    .map(Symbol::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            DebugCommand::Var(names) => Some(
                names
                    .iter()
                    .map(|n| {
                        let var = Term::var(n.as_str());
                        let value = self.bindings.deep_deref(&var);
                        if value == var {
                            format!("{n} is unbound")
                        } else {
                            format!("{n} = {value}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            DebugCommand::Goals => Some(
                self.goals
                    .iter()
                    .rev()
                    .map(|g| g.to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            DebugCommand::Queries => Some(
                self.queries
                    .iter()
                    .rev()
                    .map(describe_source)
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            DebugCommand::Line(levels) => Some(
                self.queries
                    .iter()
                    .rev()
                    .nth(levels)
                    .map(describe_source)
                    .unwrap_or_else(|| "no query at that level".to_string()),
            ),
            DebugCommand::Help => Some(HELP.to_string()),
        };
        if let Some(message) = output {
            self.push(Goal::Debug { message });
        }
        Ok(())
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn fail(&mut self, error: EvalError) -> EvalError {
        tracing::warn!(error = %error, "query terminated");
        self.state = State::Failed(error.to_string());
        self.goals.clear();
        self.choices.clear();
        self.negations.clear();
        self.bridge.reset();
        error
    }

    fn push(&mut self, goal: Goal) {
        self.goals.push(Arc::new(goal));
    }

    /// Push goals so that they run in the given order.
    fn push_all(&mut self, goals: Vec<Goal>) {
        for goal in goals.into_iter().rev() {
            self.push(goal);
        }
    }

    /// Create a choice point whose alternatives run in the given order.
    fn choose(&mut self, mut alternatives: Vec<Vec<Goal>>) {
        if alternatives.is_empty() {
            return;
        }
        alternatives.reverse();
        self.choices.push(Choice {
            alternatives,
            goals: self.goals.clone(),
            bsp: self.bindings.bsp(),
            constraints: self.constraints.len(),
            queries: self.queries.clone(),
        });
    }

    /// Run the first alternative now and keep the rest as a choice point.
    fn choose_first(&mut self, mut alternatives: Vec<Vec<Goal>>) {
        if alternatives.is_empty() {
            self.push(Goal::Backtrack);
            return;
        }
        let first = alternatives.remove(0);
        self.choose(alternatives);
        self.push_all(first);
    }

    fn backtrack(&mut self) -> Option<QueryEvent> {
        loop {
            let Some(choice) = self.choices.last_mut() else {
                self.state = State::Done;
                self.goals.clear();
                tracing::debug!("query exhausted");
                return Some(QueryEvent::Done);
            };
            let Some(next) = choice.alternatives.pop() else {
                self.choices.pop();
                continue;
            };
            let bsp = choice.bsp;
            let constraints = choice.constraints;
            let goals = choice.goals.clone();
            let queries = choice.queries.clone();
            if choice.alternatives.is_empty() {
                self.choices.pop();
            }
            self.bindings.backtrack(bsp);
            self.constraints.truncate(constraints);
            self.goals = goals;
            self.queries = queries;
            self.push_all(next);
            return None;
        }
    }

    fn kb(&self) -> Result<Arc<RwLock<KnowledgeBase>>, EvalError> {
        self.kb.upgrade().ok_or(EvalError::KnowledgeBaseReleased)
    }

    fn fresh_temp(&mut self, prefix: &str) -> Term {
        self.temps += 1;
        Term::var(format!("_{prefix}_q{}", self.temps))
    }

    fn deref(&self, term: &Term) -> Term {
        self.bindings.deref(term)
    }

    fn deep(&self, term: &Term) -> Term {
        self.bindings.deep_deref(term)
    }

    /// The partial variable a term is rooted at: the variable itself or a
    /// lookup path on it.
    fn partial_root(&self, term: &Term) -> Option<Symbol> {
        match term.value() {
            Value::Variable(s) if self.partials.contains(s) && !self.bindings.is_bound(s) => {
                Some(s.clone())
            }
            Value::Expression(op) if op.operator == Operator::Dot && op.args.len() == 2 => {
                self.partial_root(&self.deref(&op.args[0]))
            }
            _ => None,
        }
    }

    fn mentions_partial(&self, term: &Term) -> bool {
        let mut found = false;
        self.deep(term).walk(&mut |t| {
            if let Value::Variable(s) = t.value() {
                if self.partials.contains(s) {
                    found = true;
                }
            }
        });
        found
    }

    fn step(&mut self, goal: &Goal) -> Result<Option<QueryEvent>, EvalError> {
        match goal {
            Goal::Query { term, barrier } => return self.query(term, *barrier),
            Goal::Unify { left, right } => self.unify(left, right)?,
            Goal::Isa { left, right } => self.isa(left, right)?,
            Goal::Lookup { object, field, result } => return self.lookup(object, field, result),
            Goal::Compare { operator, left, right } => self.compare(*operator, left, right)?,
            Goal::Arithmetic { operator, left, right, result } => {
                self.arithmetic(*operator, left, right, result)?
            }
            Goal::Member { item, collection } => self.member(item, collection)?,
            Goal::Assign { left, right } => self.assign(left, right)?,
            Goal::ApplyRule { rule, args, barrier } => self.apply_rule(rule, args, *barrier),
            Goal::Ask { question } => {
                let call_id = self.bridge.suspend_question();
                let question = match question {
                    Question::Isa { instance, class_tag } => Question::Isa {
                        instance: self.deep(instance),
                        class_tag: class_tag.clone(),
                    },
                    Question::Compare { operator, args } => Question::Compare {
                        operator: *operator,
                        args: args.iter().map(|a| self.deep(a)).collect(),
                    },
                };
                return Ok(Some(QueryEvent::Question { call_id, question }));
            }
            Goal::Constrain { term } => {
                let term = self.deep(term);
                tracing::trace!(constraint = %term, "constraint recorded");
                self.constraints.push(term);
            }
            Goal::CheckNegation { id, choice } => self.check_negation(*id, *choice)?,
            Goal::FinishNegation { id } => self.finish_negation(*id)?,
            Goal::ConstrainAny { terms } => {
                let alternatives = terms
                    .iter()
                    .map(|term| vec![Goal::Constrain { term: term.clone() }])
                    .collect();
                self.choose_first(alternatives);
            }
            Goal::Cut { barrier } => self.choices.truncate(*barrier),
            Goal::Backtrack => return Ok(self.backtrack()),
            Goal::PopQuery => {
                self.queries.pop();
            }
            Goal::Debug { message } => {
                return Ok(Some(QueryEvent::Debug {
                    message: message.clone(),
                }));
            }
        }
        Ok(None)
    }

    // ── Queries ───────────────────────────────────────────────────────

    fn query(&mut self, term: &Term, barrier: usize) -> Result<Option<QueryEvent>, EvalError> {
        if let Value::Expression(op) = term.value() {
            match op.operator {
                Operator::And => {
                    let goals = op
                        .args
                        .iter()
                        .map(|a| Goal::Query {
                            term: a.clone(),
                            barrier,
                        })
                        .collect();
                    self.push_all(goals);
                    return Ok(None);
                }
                Operator::Or => {
                    let alternatives = op
                        .args
                        .iter()
                        .map(|a| {
                            vec![Goal::Query {
                                term: a.clone(),
                                barrier,
                            }]
                        })
                        .collect();
                    self.choose_first(alternatives);
                    return Ok(None);
                }
                _ => {}
            }
        }

        self.queries.push(term.clone());
        self.push(Goal::PopQuery);

        match term.value() {
            Value::Expression(op) => self.query_operation(term, op)?,
            Value::Call(call) => self.query_call(term, call, barrier)?,
            Value::Boolean(true) => {}
            Value::Boolean(false) => self.push(Goal::Backtrack),
            Value::Variable(s) => {
                let value = self.deref(term);
                if value.value().as_symbol().is_some() {
                    return Err(EvalError::Unbound {
                        variable: s.to_string(),
                        context: "goal position".to_string(),
                    });
                }
                self.push(Goal::Query {
                    term: value,
                    barrier,
                });
            }
            other => {
                return Err(EvalError::MalformedGoal {
                    goal: format!("{term} ({} is not a goal)", other.type_name()),
                });
            }
        }

        if !self.trace {
            return Ok(None);
        }
        let mut message = format!("QUERY: {term}");
        let shown: Vec<String> = term
            .variables()
            .into_iter()
            .filter_map(|v| {
                let value = self.deep(&Term::var(v.as_str()));
                (value.value().as_symbol() != Some(&v)).then(|| format!("{v} = {value}"))
            })
            .collect();
        if !shown.is_empty() {
            message.push_str(&format!(", BINDINGS: {{{}}}", shown.join(", ")));
        }
        if self.debugger.should_break(self.queries.len()) {
            message = format!("[paused] {message}");
        }
        Ok(Some(QueryEvent::Debug { message }))
    }

    fn query_operation(&mut self, term: &Term, op: &Operation) -> Result<(), EvalError> {
        let arg = |i: usize| -> Result<Term, EvalError> {
            op.args.get(i).cloned().ok_or_else(|| EvalError::MalformedGoal {
                goal: term.to_string(),
            })
        };
        let goal = match (op.operator, op.args.len()) {
            (Operator::Not, 1) => {
                self.negate(&op.args[0]);
                return Ok(());
            }
            (Operator::Unify, 2) => Goal::Unify {
                left: arg(0)?,
                right: arg(1)?,
            },
            (Operator::Isa, 2) => Goal::Isa {
                left: arg(0)?,
                right: arg(1)?,
            },
            (Operator::In, 2) => Goal::Member {
                item: arg(0)?,
                collection: arg(1)?,
            },
            (Operator::Assign, 2) => Goal::Assign {
                left: arg(0)?,
                right: arg(1)?,
            },
            (operator, 2) if operator.is_comparison() => Goal::Compare {
                operator,
                left: arg(0)?,
                right: arg(1)?,
            },
            (Operator::Dot, 3) => Goal::Lookup {
                object: arg(0)?,
                field: arg(1)?,
                result: arg(2)?,
            },
            (operator, 3) if operator.is_arithmetic() => Goal::Arithmetic {
                operator,
                left: arg(0)?,
                right: arg(1)?,
                result: arg(2)?,
            },
            _ => {
                return Err(EvalError::MalformedGoal {
                    goal: term.to_string(),
                });
            }
        };
        self.push(goal);
        Ok(())
    }

    fn query_call(&mut self, term: &Term, call: &Call, barrier: usize) -> Result<(), EvalError> {
        match (call.name.as_str(), call.args.len()) {
            ("cut", 0) => {
                self.push(Goal::Cut { barrier });
                return Ok(());
            }
            ("print", _) => {
                let text = call
                    .args
                    .iter()
                    .map(|a| self.deep(a).to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                self.messages.push(Message::print(text));
                return Ok(());
            }
            ("debug", _) => {
                if self.trace {
                    self.debugger.break_next();
                    self.push(Goal::Debug {
                        message: "Welcome to the debugger! Type `h` for help.".to_string(),
                    });
                } else {
                    self.messages.push(Message::warning(
                        "debug() has no effect: the query is not traced",
                    ));
                }
                return Ok(());
            }
            ("forall", 2) => {
                // forall(cond, action) holds when no cond lacks its action.
                let inner = Term::op(
                    Operator::And,
                    vec![
                        call.args[0].clone(),
                        Term::op(Operator::Not, vec![call.args[1].clone()]),
                    ],
                );
                self.negate(&inner);
                return Ok(());
            }
            _ => {}
        }

        let (defined, rules): (bool, Vec<Arc<Rule>>) = {
            let kb = self.kb()?;
            let kb = kb.read().unwrap_or_else(PoisonError::into_inner);
            (
                kb.has_rules(&call.name),
                kb.rules_named(&call.name)
                    .iter()
                    .filter(|r| r.arity() == call.args.len())
                    .cloned()
                    .collect(),
            )
        };

        if !defined {
            if call.args.iter().any(|a| self.mentions_partial(a)) {
                self.push(Goal::Constrain { term: term.clone() });
            } else {
                if self.warned_undefined.insert(call.name.clone()) {
                    self.messages.push(Message::warning(format!(
                        "Query for undefined rule `{}`",
                        call.name
                    )));
                }
                self.push(Goal::Backtrack);
            }
            return Ok(());
        }

        // Cuts in the bodies drop this rule's remaining alternatives.
        let barrier = self.choices.len();
        let alternatives = rules
            .into_iter()
            .map(|rule| {
                vec![Goal::ApplyRule {
                    rule,
                    args: call.args.clone(),
                    barrier,
                }]
            })
            .collect();
        self.choose_first(alternatives);
        Ok(())
    }

    fn apply_rule(&mut self, rule: &Rule, args: &[Term], barrier: usize) {
        self.renames += 1;
        let constants = &self.constants;
        let rule = rule.rename(self.renames, |s| constants.contains(s));
        let mut goals = Vec::with_capacity(rule.params.len() * 2 + 1);
        for (param, arg) in rule.params.iter().zip(args) {
            goals.push(Goal::Unify {
                left: arg.clone(),
                right: param.parameter.clone(),
            });
            if let Some(spec) = &param.specializer {
                goals.push(Goal::Isa {
                    left: arg.clone(),
                    right: spec.clone(),
                });
            }
        }
        goals.push(Goal::Query {
            term: rule.body.clone(),
            barrier,
        });
        self.push_all(goals);
    }

    // ── Negation ──────────────────────────────────────────────────────

    fn negate(&mut self, inner: &Term) {
        self.temps += 1;
        let id = self.temps;
        let choice = self.choices.len();
        // Taken once every solution of `inner` has been seen.
        self.choose(vec![vec![Goal::FinishNegation { id }]]);
        self.negations.insert(id, Vec::new());
        self.push(Goal::Backtrack);
        self.push(Goal::CheckNegation { id, choice });
        self.push(Goal::Query {
            term: inner.clone(),
            barrier: choice + 1,
        });
    }

    fn check_negation(&mut self, id: u64, choice: usize) -> Result<(), EvalError> {
        let Some(saved) = self.choices.get(choice) else {
            return Err(EvalError::Internal {
                message: format!("negation choice point #{choice} is missing"),
            });
        };
        let mark = saved.constraints;
        if self.constraints.len() == mark {
            // The negated goal holds outright, so `not` fails.
            self.negations.remove(&id);
            self.choices.truncate(choice);
            return Ok(());
        }
        let solution: Vec<Term> = self.constraints[mark..]
            .iter()
            .map(|c| self.deep(c))
            .collect();
        match self.negations.get_mut(&id) {
            Some(solutions) => solutions.push(solution),
            None => {
                return Err(EvalError::Internal {
                    message: format!("negation {id} is not open"),
                });
            }
        }
        tracing::trace!(negation = id, "negated goal produced a partial solution");
        Ok(())
    }

    /// Every way the negated goal could hold must be ruled out:
    /// not (a or b) == not a and not b, and not (a and b) == not a or not b.
    fn finish_negation(&mut self, id: u64) -> Result<(), EvalError> {
        let solutions = self.negations.remove(&id).unwrap_or_default();
        let goals = solutions
            .iter()
            .map(|solution| {
                solution
                    .iter()
                    .map(invert_constraint)
                    .collect::<Result<Vec<_>, _>>()
                    .map(|terms| Goal::ConstrainAny { terms })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.push_all(goals);
        Ok(())
    }

    // ── Unification ───────────────────────────────────────────────────

    fn unify(&mut self, left: &Term, right: &Term) -> Result<(), EvalError> {
        let l = self.deref(left);
        let r = self.deref(right);
        if l == r {
            return Ok(());
        }
        let l_partial = self.partial_root(&l).is_some();
        let r_partial = self.partial_root(&r).is_some();

        match (l.value(), r.value()) {
            (Value::Variable(a) | Value::RestVariable(a), _) if !l_partial => {
                if self.bindings.occurs(a, &r) {
                    self.push(Goal::Backtrack);
                } else {
                    self.bindings.bind(a, r.clone());
                }
            }
            (_, Value::Variable(b) | Value::RestVariable(b)) if !r_partial => {
                if self.bindings.occurs(b, &l) {
                    self.push(Goal::Backtrack);
                } else {
                    self.bindings.bind(b, l.clone());
                }
            }
            _ if l_partial || r_partial => {
                self.push(Goal::Constrain {
                    term: Term::op(Operator::Unify, vec![l.clone(), r.clone()]),
                });
            }
            (Value::Pattern(_), _) | (_, Value::Pattern(_)) => {
                return Err(EvalError::TypeError {
                    message: format!("cannot unify {l} with {r}: use `matches` for patterns"),
                });
            }
            (Value::List(a), Value::List(b)) => self.unify_lists(a, b),
            (Value::Dictionary(a), Value::Dictionary(b)) => {
                if a.fields.len() != b.fields.len()
                    || !a.fields.keys().all(|k| b.fields.contains_key(k))
                {
                    self.push(Goal::Backtrack);
                } else {
                    let goals = a
                        .fields
                        .iter()
                        .filter_map(|(k, v)| {
                            b.fields.get(k).map(|w| Goal::Unify {
                                left: v.clone(),
                                right: w.clone(),
                            })
                        })
                        .collect();
                    self.push_all(goals);
                }
            }
            (Value::Call(a), Value::Call(b)) => {
                if a.name == b.name && a.args.len() == b.args.len() {
                    self.unify_pairs(&a.args, &b.args);
                } else {
                    self.push(Goal::Backtrack);
                }
            }
            (Value::Expression(a), Value::Expression(b)) => {
                if a.operator == b.operator && a.args.len() == b.args.len() {
                    self.unify_pairs(&a.args, &b.args);
                } else {
                    self.push(Goal::Backtrack);
                }
            }
            (Value::ExternalInstance(a), Value::ExternalInstance(b)) => {
                if a.instance_id != b.instance_id {
                    self.push(Goal::Ask {
                        question: Question::Compare {
                            operator: Operator::Unify,
                            args: vec![l.clone(), r.clone()],
                        },
                    });
                }
            }
            (Value::Number(a), Value::Number(b)) if a == b => {}
            _ => self.push(Goal::Backtrack),
        }
        Ok(())
    }

    fn unify_pairs(&mut self, left: &[Term], right: &[Term]) {
        let goals = left
            .iter()
            .zip(right)
            .map(|(l, r)| Goal::Unify {
                left: l.clone(),
                right: r.clone(),
            })
            .collect();
        self.push_all(goals);
    }

    fn unify_lists(&mut self, a: &List, b: &List) {
        let rest_list = |elements: &[Term], rest_var: Option<Symbol>| {
            Term::new(Value::List(List {
                elements: elements.to_vec(),
                rest_var,
            }))
        };
        let n = a.elements.len().min(b.elements.len());
        let mut goals: Vec<Goal> = a.elements[..n]
            .iter()
            .zip(&b.elements[..n])
            .map(|(l, r)| Goal::Unify {
                left: l.clone(),
                right: r.clone(),
            })
            .collect();
        match (&a.rest_var, &b.rest_var) {
            (None, None) if a.elements.len() != b.elements.len() => {
                self.push(Goal::Backtrack);
                return;
            }
            (None, None) => {}
            (Some(ra), None) | (Some(ra), Some(_)) if a.elements.len() <= b.elements.len() => {
                goals.push(Goal::Unify {
                    left: Term::var(ra.as_str()),
                    right: rest_list(&b.elements[n..], b.rest_var.clone()),
                });
            }
            (_, Some(rb)) if b.elements.len() <= a.elements.len() => {
                goals.push(Goal::Unify {
                    left: Term::var(rb.as_str()),
                    right: rest_list(&a.elements[n..], a.rest_var.clone()),
                });
            }
            // One side is closed and shorter than the other's fixed prefix.
            _ => {
                self.push(Goal::Backtrack);
                return;
            }
        }
        self.push_all(goals);
    }

    // ── Type checks ───────────────────────────────────────────────────

    fn isa(&mut self, left: &Term, right: &Term) -> Result<(), EvalError> {
        let l = self.deref(left);
        let r = self.deref(right);
        let (tag, fields) = match r.value() {
            Value::Pattern(Pattern::Instance(lit)) => (Some(lit.tag.clone()), lit.fields.clone()),
            Value::Pattern(Pattern::Dictionary(d)) => (None, d.clone()),
            _ => {
                self.push(Goal::Unify { left: l, right: r });
                return Ok(());
            }
        };

        let mut goals = Vec::new();
        if self.partial_root(&l).is_some() {
            if let Some(tag) = &tag {
                goals.push(Goal::Constrain {
                    term: Term::op(
                        Operator::Isa,
                        vec![l.clone(), Term::instance_pattern(tag.as_str())],
                    ),
                });
            }
            goals.extend(self.field_checks(&l, &fields));
            self.push_all(goals);
            return Ok(());
        }

        match (l.value(), &tag) {
            (Value::Variable(s), _) => {
                return Err(EvalError::Unbound {
                    variable: s.to_string(),
                    context: format!("{l} matches {r}"),
                });
            }
            (Value::ExternalInstance(instance), Some(tag)) => {
                let known = match &instance.class_tag {
                    Some(class) => {
                        let kb = self.kb()?;
                        let kb = kb.read().unwrap_or_else(PoisonError::into_inner);
                        kb.is_subclass(class, tag)
                    }
                    None => None,
                };
                match known {
                    Some(true) => {}
                    Some(false) => {
                        self.push(Goal::Backtrack);
                        return Ok(());
                    }
                    None => goals.push(Goal::Ask {
                        question: Question::Isa {
                            instance: l.clone(),
                            class_tag: tag.clone(),
                        },
                    }),
                }
                goals.extend(self.field_checks(&l, &fields));
            }
            (Value::ExternalInstance(_), None) => goals.extend(self.field_checks(&l, &fields)),
            (Value::Dictionary(d), tag) => {
                if tag.as_ref().is_some_and(|t| t.as_str() != "Dictionary") {
                    self.push(Goal::Backtrack);
                    return Ok(());
                }
                for (k, v) in &fields.fields {
                    match d.fields.get(k) {
                        Some(value) => goals.push(Goal::Unify {
                            left: value.clone(),
                            right: v.clone(),
                        }),
                        None => {
                            self.push(Goal::Backtrack);
                            return Ok(());
                        }
                    }
                }
            }
            (value, Some(tag)) if BUILTIN_CLASSES.contains(&tag.as_str()) && fields.fields.is_empty() => {
                if !value.is_builtin_instance(tag.as_str()) {
                    goals.push(Goal::Backtrack);
                }
            }
            _ => goals.push(Goal::Backtrack),
        }
        self.push_all(goals);
        Ok(())
    }

    /// `object.k = v` for every field of a pattern.
    fn field_checks(&mut self, object: &Term, fields: &Dictionary) -> Vec<Goal> {
        let mut goals = Vec::new();
        for (k, v) in &fields.fields {
            let tmp = self.fresh_temp("field");
            goals.push(Goal::Lookup {
                object: object.clone(),
                field: Term::string(k.as_str()),
                result: tmp.clone(),
            });
            goals.push(Goal::Unify {
                left: tmp,
                right: v.clone(),
            });
        }
        goals
    }

    // ── Lookups ───────────────────────────────────────────────────────

    fn lookup(&mut self, object: &Term, field: &Term, result: &Term) -> Result<Option<QueryEvent>, EvalError> {
        let object = self.deref(object);
        let field = self.deep(field);

        if self.partial_root(&object).is_some() {
            let path = Term::op(Operator::Dot, vec![object, field]);
            self.push(Goal::Unify {
                left: result.clone(),
                right: path,
            });
            return Ok(None);
        }

        let (attribute, args) = match field.value() {
            Value::String(name) => (Symbol::new(name.as_str()), None),
            Value::Call(call) => (call.name.clone(), Some(call.args.clone())),
            other => {
                return Err(EvalError::TypeError {
                    message: format!("{} cannot name a field", other.type_name()),
                });
            }
        };

        match object.value() {
            Value::Dictionary(d) => {
                if args.is_some() {
                    return Err(EvalError::TypeError {
                        message: format!("dictionaries have no methods; cannot call {field} on {object}"),
                    });
                }
                match d.fields.get(&attribute) {
                    Some(value) => self.push(Goal::Unify {
                        left: result.clone(),
                        right: value.clone(),
                    }),
                    None => self.push(Goal::Backtrack),
                }
                Ok(None)
            }
            Value::Variable(s) => Err(EvalError::Unbound {
                variable: s.to_string(),
                context: format!("lookup of {field}"),
            }),
            Value::ExternalInstance(_)
            | Value::String(_)
            | Value::Number(_)
            | Value::Boolean(_)
            | Value::List(_) => {
                let call_id = self.bridge.suspend_call(result.clone());
                tracing::trace!(call_id, %attribute, "external call");
                Ok(Some(QueryEvent::ExternalCall {
                    call_id,
                    instance: self.deep(&object),
                    attribute,
                    args,
                }))
            }
            other => Err(EvalError::TypeError {
                message: format!("cannot look up {field} on a {}", other.type_name()),
            }),
        }
    }

    // ── Comparison and arithmetic ─────────────────────────────────────

    fn compare(&mut self, operator: Operator, left: &Term, right: &Term) -> Result<(), EvalError> {
        let l = self.deref(left);
        let r = self.deref(right);
        if self.partial_root(&l).is_some() || self.partial_root(&r).is_some() {
            self.push(Goal::Constrain {
                term: Term::op(operator, vec![l, r]),
            });
            return Ok(());
        }

        use std::cmp::Ordering;
        let ordering: Option<Ordering> = match (l.value(), r.value()) {
            (Value::Variable(s), _) | (_, Value::Variable(s)) => {
                return Err(EvalError::Unbound {
                    variable: s.to_string(),
                    context: format!("{l} {} {r}", operator.symbol()),
                });
            }
            (Value::ExternalInstance(a), Value::ExternalInstance(b))
                if a.instance_id == b.instance_id && matches!(operator, Operator::Eq | Operator::Neq) =>
            {
                Some(Ordering::Equal)
            }
            (Value::ExternalInstance(_), _) | (_, Value::ExternalInstance(_)) => {
                self.push(Goal::Ask {
                    question: Question::Compare {
                        operator,
                        args: vec![l.clone(), r.clone()],
                    },
                });
                return Ok(());
            }
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => {
                if !matches!(operator, Operator::Eq | Operator::Neq) {
                    return Err(EvalError::TypeError {
                        message: format!(
                            "cannot order {} and {} with {}",
                            l.value().type_name(),
                            r.value().type_name(),
                            operator.symbol()
                        ),
                    });
                }
                let equal = self.deep(&l) == self.deep(&r);
                Some(if equal { Ordering::Equal } else { Ordering::Less })
            }
        };

        let holds = match (operator, ordering) {
            (Operator::Neq, None) => true,
            (_, None) => false,
            (Operator::Eq, Some(o)) => o == Ordering::Equal,
            (Operator::Neq, Some(o)) => o != Ordering::Equal,
            (Operator::Lt, Some(o)) => o == Ordering::Less,
            (Operator::Leq, Some(o)) => o != Ordering::Greater,
            (Operator::Gt, Some(o)) => o == Ordering::Greater,
            (Operator::Geq, Some(o)) => o != Ordering::Less,
            _ => false,
        };
        if !holds {
            self.push(Goal::Backtrack);
        }
        Ok(())
    }

    fn arithmetic(&mut self, operator: Operator, left: &Term, right: &Term, result: &Term) -> Result<(), EvalError> {
        let l = self.deref(left);
        let r = self.deref(right);
        let expression = || format!("{l} {} {r}", operator.symbol());
        if self.partial_root(&l).is_some() || self.partial_root(&r).is_some() {
            return Err(EvalError::Unsupported {
                message: format!("arithmetic over a partially evaluated value: {}", expression()),
            });
        }
        let (a, b) = match (l.value(), r.value()) {
            (Value::Number(a), Value::Number(b)) => (*a, *b),
            (Value::Variable(s), _) | (_, Value::Variable(s)) => {
                return Err(EvalError::Unbound {
                    variable: s.to_string(),
                    context: expression(),
                });
            }
            _ => {
                return Err(EvalError::TypeError {
                    message: format!("{} needs numbers", expression()),
                });
            }
        };
        let value = match operator {
            Operator::Add => a.add(b),
            Operator::Sub => a.sub(b),
            Operator::Mul => a.mul(b),
            Operator::Div => a.div(b),
            Operator::Mod => a.modulo(b),
            Operator::Rem => a.rem(b),
            _ => {
                return Err(EvalError::MalformedGoal { goal: expression() });
            }
        };
        let Some(value) = value else {
            return Err(
                if matches!(operator, Operator::Div | Operator::Mod | Operator::Rem) && b.is_zero() {
                    EvalError::DivisionByZero { expression: expression() }
                } else {
                    EvalError::Overflow { expression: expression() }
                },
            );
        };
        self.push(Goal::Unify {
            left: result.clone(),
            right: Term::new(Value::Number(value)),
        });
        Ok(())
    }

    fn assign(&mut self, left: &Term, right: &Term) -> Result<(), EvalError> {
        let l = self.deref(left);
        match l.value() {
            Value::Variable(s) if self.partial_root(&l).is_none() => {
                let value = self.deep(right);
                self.bindings.bind(s, value);
                Ok(())
            }
            _ => Err(EvalError::TypeError {
                message: format!("can only assign to unbound variables, not {l}"),
            }),
        }
    }

    fn member(&mut self, item: &Term, collection: &Term) -> Result<(), EvalError> {
        let item = self.deref(item);
        let coll = self.deref(collection);
        let coll_partial = self.partial_root(&coll).is_some();
        let item_partial = self.partial_root(&item).is_some();
        if coll_partial || (item_partial && matches!(coll.value(), Value::List(_))) {
            self.push(Goal::Constrain {
                term: Term::op(Operator::In, vec![item, coll]),
            });
            return Ok(());
        }

        let candidates: Vec<Term> = match coll.value() {
            Value::List(list) => list.elements.clone(),
            Value::Dictionary(d) => d
                .fields
                .iter()
                .map(|(k, v)| Term::list(vec![Term::string(k.as_str()), v.clone()]))
                .collect(),
            Value::String(haystack) => {
                let holds = match self.deref(&item).value() {
                    Value::String(needle) => haystack.contains(needle.as_str()),
                    _ => {
                        return Err(EvalError::TypeError {
                            message: format!("{item} in {coll}: only strings can be found in a string"),
                        });
                    }
                };
                if !holds {
                    self.push(Goal::Backtrack);
                }
                return Ok(());
            }
            Value::Variable(s) => {
                return Err(EvalError::Unbound {
                    variable: s.to_string(),
                    context: format!("{item} in {coll}"),
                });
            }
            Value::ExternalInstance(_) => {
                return Err(EvalError::Unsupported {
                    message: format!(
                        "iterating host collection {coll}; look up a list-valued attribute instead"
                    ),
                });
            }
            other => {
                return Err(EvalError::TypeError {
                    message: format!("cannot search a {}", other.type_name()),
                });
            }
        };
        let alternatives = candidates
            .into_iter()
            .map(|c| {
                vec![Goal::Unify {
                    left: item.clone(),
                    right: c,
                }]
            })
            .collect();
        self.choose_first(alternatives);
        Ok(())
    }

    // ── Results ───────────────────────────────────────────────────────

    fn result_bindings(&self) -> Bindings {
        let this = Symbol::new(THIS);
        let mut out = Bindings::new();
        for var in &self.query_vars {
            if self.partials.contains(var) {
                let mut constraints: Vec<Term> = Vec::new();
                for c in self.seeds.iter().chain(&self.constraints) {
                    let c = self.deep(c);
                    if c.contains_variable(var) {
                        let c = c.rename_var(var, &this);
                        if !constraints.contains(&c) {
                            constraints.push(c);
                        }
                    }
                }
                out.insert(var.clone(), Term::op(Operator::And, constraints));
            } else {
                out.insert(var.clone(), self.deep(&Term::var(var.as_str())));
            }
        }
        out
    }

    fn describe_bindings(&self) -> String {
        let mut names: Vec<&Symbol> = self.query_vars.iter().collect();
        names.sort();
        names
            .into_iter()
            .map(|v| format!("{v} = {}", self.deep(&Term::var(v.as_str()))))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn describe_source(term: &Term) -> String {
    match term.source() {
        Some(source) => format!("{term} at {source}"),
        None => term.to_string(),
    }
}

/// The constraint that holds exactly when `c` does not.
fn invert_constraint(c: &Term) -> Result<Term, EvalError> {
    let unsupported = || EvalError::Unsupported {
        message: format!("cannot negate constraint {c}"),
    };
    let Value::Expression(op) = c.value() else {
        return Err(unsupported());
    };
    match op.operator {
        Operator::In => Ok(Term::op(Operator::Not, vec![c.clone()])),
        Operator::Not => op.args.first().cloned().ok_or_else(unsupported),
        other => match other.negated() {
            Some(neg) => Ok(Term::op(neg, op.args.clone())),
            None => Err(unsupported()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kb::Source;
    use crate::parser::parse_query;

    fn kb_with(src: &str) -> Arc<RwLock<KnowledgeBase>> {
        let mut kb = KnowledgeBase::new();
        kb.load(&[Source::new(src)], false).unwrap();
        Arc::new(RwLock::new(kb))
    }

    fn vm(kb: &Arc<RwLock<KnowledgeBase>>, q: &str) -> Vm {
        let term = kb.read().unwrap().rewrite_query(&parse_query(q).unwrap());
        Vm::new(kb, term, false, DEFAULT_MAX_GOALS)
    }

    fn results(vm: &mut Vm) -> Vec<Bindings> {
        let mut out = Vec::new();
        loop {
            match vm.next_event().unwrap() {
                QueryEvent::Result { bindings } => out.push(bindings),
                QueryEvent::Done => return out,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    fn values(results: &[Bindings], var: &str) -> Vec<String> {
        results
            .iter()
            .map(|b| b[&Symbol::new(var)].to_string())
            .collect()
    }

    #[test]
    fn rules_are_tried_in_load_order() {
        let kb = kb_with("f(1); f(2); f(3);");
        let mut q = vm(&kb, "f(x)");
        assert_eq!(values(&results(&mut q), "x"), vec!["1", "2", "3"]);
        assert!(q.next_event().unwrap().is_done());
    }

    #[test]
    fn cut_commits_to_the_first_rule() {
        let kb = kb_with("f(x) if x = 1 and cut; f(x) if x = 2;");
        let mut q = vm(&kb, "f(x)");
        assert_eq!(values(&results(&mut q), "x"), vec!["1"]);
    }

    #[test]
    fn cut_inside_a_rule_leaves_the_caller_alone() {
        let kb = kb_with("g(x) if x = 1 and cut; g(x) if x = 2; h(1); h(2);");
        let mut q = vm(&kb, "h(y) and g(x)");
        assert_eq!(values(&results(&mut q), "y"), vec!["1", "2"]);
    }

    #[test]
    fn negation_as_failure() {
        let kb = kb_with("banned(\"eve\");");
        let mut q = vm(&kb, "x in [\"alice\", \"eve\"] and not banned(x)");
        assert_eq!(values(&results(&mut q), "x"), vec!["\"alice\""]);
    }

    #[test]
    fn forall_checks_every_solution() {
        let kb = kb_with("");
        let mut q = vm(&kb, "forall(x in [1, 2, 3], x > 0)");
        assert_eq!(results(&mut q).len(), 1);
        let mut q = vm(&kb, "forall(x in [1, -2], x > 0)");
        assert!(results(&mut q).is_empty());
    }

    #[test]
    fn lists_with_rest_variables() {
        let kb = kb_with("head([h, *_t], h);");
        let mut q = vm(&kb, "head([7, 8, 9], x) and [a, *rest] = [1, 2, 3]");
        let r = results(&mut q);
        assert_eq!(values(&r, "x"), vec!["7"]);
        assert_eq!(values(&r, "rest"), vec!["[2, 3]"]);
    }

    #[test]
    fn arithmetic_and_comparison() {
        let kb = kb_with("");
        let mut q = vm(&kb, "x = 2 + 3 * 4 and x > 10 and y = x mod 5");
        let r = results(&mut q);
        assert_eq!(values(&r, "x"), vec!["14"]);
        assert_eq!(values(&r, "y"), vec!["4"]);
    }

    #[test]
    fn division_by_zero_is_terminal() {
        let kb = kb_with("");
        let mut q = vm(&kb, "x = 1 / 0");
        assert!(matches!(q.next_event(), Err(EvalError::DivisionByZero { .. })));
        assert!(matches!(q.next_event(), Err(EvalError::Terminated { .. })));
    }

    #[test]
    fn dictionary_lookups_do_not_call_out() {
        let kb = kb_with("");
        let mut q = vm(&kb, "d = {name: \"x\"} and d.name = n");
        assert_eq!(values(&results(&mut q), "n"), vec!["\"x\""]);
    }

    #[test]
    fn external_call_round_trip() {
        let kb = kb_with("owner(r, o) if r.owner = o;");
        let mut q = vm(&kb, "owner(r, o)");
        q.bind("r", Term::external(5, Some("Doc"))).unwrap();
        let QueryEvent::ExternalCall { call_id, attribute, .. } = q.next_event().unwrap() else {
            panic!("expected an external call")
        };
        assert_eq!(call_id, 1);
        assert_eq!(attribute, Symbol::new("owner"));
        assert_eq!(q.pending_call(), Some(1));
        assert!(q.call_result(2, Some(Term::string("bob"))).is_err());
        q.call_result(1, Some(Term::string("alice"))).unwrap();
        assert_eq!(values(&results(&mut q), "o"), vec!["\"alice\""]);
    }

    #[test]
    fn host_no_value_fails_the_branch() {
        let kb = kb_with("");
        let mut q = vm(&kb, "r.missing = 1");
        q.bind("r", Term::external(1, None)).unwrap();
        let call_id = q.next_event().unwrap().call_id().unwrap();
        q.call_result(call_id, None).unwrap();
        assert!(q.next_event().unwrap().is_done());
    }

    #[test]
    fn isa_uses_registered_mro_before_asking() {
        let kb = kb_with("");
        kb.write()
            .unwrap()
            .register_mro(Symbol::new("Doc"), vec![Symbol::new("Doc"), Symbol::new("Resource")]);
        let mut q = vm(&kb, "r matches Resource");
        q.bind("r", Term::external(1, Some("Doc"))).unwrap();
        assert_eq!(results(&mut q).len(), 1);

        let mut q = vm(&kb, "r matches Resource");
        q.bind("r", Term::external(2, Some("User"))).unwrap();
        let QueryEvent::Question { call_id, question } = q.next_event().unwrap() else {
            panic!("expected a question")
        };
        assert!(matches!(question, Question::Isa { .. }));
        q.question_result(call_id, false).unwrap();
        assert!(q.next_event().unwrap().is_done());
    }

    #[test]
    fn partial_collects_constraints() {
        let kb = kb_with("allow(u, r) if r.owner = u and r.level > 2;");
        let mut q = vm(&kb, "allow(\"alice\", resource)");
        q.bind("resource", Term::partial_of("Doc")).unwrap();
        let r = results(&mut q);
        assert_eq!(
            values(&r, "resource"),
            vec!["_this matches Doc and _this.owner = \"alice\" and _this.level > 2"]
        );
    }

    #[test]
    fn negated_partial_is_inverted() {
        let kb = kb_with("ok(r) if not r.banned = true;");
        let mut q = vm(&kb, "ok(resource)");
        q.bind("resource", Term::partial()).unwrap();
        let r = results(&mut q);
        assert_eq!(values(&r, "resource"), vec!["_this.banned != true"]);
    }

    #[test]
    fn negation_rules_out_every_partial_solution() {
        let kb = kb_with("ok(r) if not denied(r); denied(r) if r.a = 1; denied(r) if r.b = 2;");
        let mut q = vm(&kb, "ok(resource)");
        q.bind("resource", Term::partial_of("Doc")).unwrap();
        assert_eq!(
            values(&results(&mut q), "resource"),
            vec!["_this matches Doc and _this.a != 1 and _this.b != 2"]
        );
    }

    #[test]
    fn negating_a_conjunction_branches_per_conjunct() {
        let kb = kb_with(
            "ok(r) if not denied(r); denied(r) if r.a = 1 and r.b = 2; denied(r) if r.c = 3;",
        );
        let mut q = vm(&kb, "ok(resource)");
        q.bind("resource", Term::partial()).unwrap();
        assert_eq!(
            values(&results(&mut q), "resource"),
            vec![
                "_this.a != 1 and _this.c != 3",
                "_this.b != 2 and _this.c != 3",
            ]
        );
    }

    #[test]
    fn negation_fails_when_any_solution_needs_no_constraints() {
        let kb = kb_with("ok(r) if not denied(r); denied(r) if r.a = 1; denied(_r);");
        let mut q = vm(&kb, "ok(resource)");
        q.bind("resource", Term::partial()).unwrap();
        assert!(results(&mut q).is_empty());
    }

    #[test]
    fn undefined_rule_fails_with_a_warning() {
        let kb = kb_with("");
        let mut q = vm(&kb, "nope(1)");
        assert!(q.next_event().unwrap().is_done());
        let warning = q.next_message().unwrap();
        assert!(warning.msg.contains("nope"));
    }

    #[test]
    fn unbounded_recursion_overflows() {
        let kb = kb_with("loop(x) if loop(x);");
        let term = kb.read().unwrap().rewrite_query(&parse_query("loop(1)").unwrap());
        let mut q = Vm::new(&kb, term, false, 200);
        assert!(matches!(q.next_event(), Err(EvalError::StackOverflow { .. })));
    }

    #[test]
    fn print_goes_to_the_message_queue() {
        let kb = kb_with("");
        let mut q = vm(&kb, "x = 1 and print(\"x is\", x)");
        results(&mut q);
        assert_eq!(q.next_message(), Some(Message::print("\"x is\", 1")));
    }

    #[test]
    fn cyclic_terms_do_not_unify() {
        let kb = kb_with("");
        let mut q = vm(&kb, "x = [x]");
        assert!(results(&mut q).is_empty());
        let mut q = vm(&kb, "x = y and y = {inner: x}");
        assert!(results(&mut q).is_empty());
        let mut q = vm(&kb, "[1, *rest] = rest");
        assert!(results(&mut q).is_empty());
    }

    #[test]
    fn bind_rejects_a_value_containing_the_variable() {
        let kb = kb_with("");
        let mut q = vm(&kb, "x = 1");
        assert!(matches!(
            q.bind("x", Term::list(vec![Term::var("x")])),
            Err(BindError::Cyclic { .. })
        ));
        assert_eq!(values(&results(&mut q), "x"), vec!["1"]);
    }

    #[test]
    fn bind_rejects_unknown_variables() {
        let kb = kb_with("");
        let mut q = vm(&kb, "x = 1");
        assert!(matches!(
            q.bind("y", Term::int(1)),
            Err(BindError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn tracing_emits_debug_events_and_accepts_commands() {
        let kb = kb_with("f(1);");
        let term = kb.read().unwrap().rewrite_query(&parse_query("f(x)").unwrap());
        let mut q = Vm::new(&kb, term, true, DEFAULT_MAX_GOALS);
        assert!(matches!(q.debug_command("h"), Err(DebugError::NoSession)));
        let QueryEvent::Debug { message } = q.next_event().unwrap() else {
            panic!("expected a debug event")
        };
        assert!(message.starts_with("QUERY: f(x)"));
        q.debug_command("h").unwrap();
        let QueryEvent::Debug { message } = q.next_event().unwrap() else {
            panic!("expected help output")
        };
        assert!(message.contains("Debugger commands"));
        assert!(matches!(
            q.debug_command("bogus"),
            Err(DebugError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn constants_are_visible_and_never_renamed() {
        let mut kb = KnowledgeBase::new();
        kb.register_constant(Symbol::new("LIMIT"), Term::int(3));
        kb.load(&[Source::new("small(x) if x < LIMIT;")], false).unwrap();
        let kb = Arc::new(RwLock::new(kb));
        let mut q = vm(&kb, "small(2)");
        assert_eq!(results(&mut q).len(), 1);
        let mut q = vm(&kb, "small(5)");
        assert!(results(&mut q).is_empty());
    }
}
