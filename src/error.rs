//! Rich diagnostic error types for the akh-gate engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. At the host boundary every error is
//! flattened into an [`ErrorEnvelope`] carrying a stable `kind` tag.

use miette::{Diagnostic, NamedSource, SourceSpan};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for the akh-gate engine.
#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Debug(#[from] DebugError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Boundary(#[from] BoundaryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

impl From<ParseError> for GateError {
    fn from(e: ParseError) -> Self {
        GateError::Load(LoadError::Parse(Box::new(e)))
    }
}

// ---------------------------------------------------------------------------
// Parse / load errors
// ---------------------------------------------------------------------------

/// A syntax error with the offending source attached for rendering.
#[derive(Debug, Error, Diagnostic)]
#[error("{message} at line {line}, column {column}")]
#[diagnostic(
    code(gate::load::parse),
    help("Check the policy syntax near the highlighted position.")
)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
    #[source_code]
    pub src: NamedSource<String>,
    #[label("here")]
    pub span: SourceSpan,
}

#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(Box<ParseError>),

    #[error("source file \"{filename}\" is already loaded")]
    #[diagnostic(
        code(gate::load::duplicate_source),
        help("Each filename may be loaded once. Call clear_rules() before reloading it.")
    )]
    DuplicateSource { filename: String },

    #[error("rule {rule} is defined twice")]
    #[diagnostic(
        code(gate::load::duplicate_rule),
        help("Remove the repeated definition; an identical rule adds no new answers.")
    )]
    DuplicateRule { rule: String },

    #[error("\"{name}\" is a built-in and cannot be used as a rule name")]
    #[diagnostic(
        code(gate::load::reserved_name),
        help("Rename the rule. Reserved names: cut, print, debug, forall.")
    )]
    ReservedName { name: String },

    #[error("invalid parameter {parameter} in rule {rule}: {reason}")]
    #[diagnostic(
        code(gate::load::invalid_parameter),
        help("Rule parameters must be variables, literals, lists or dictionaries. Move lookups and arithmetic into the rule body.")
    )]
    InvalidParameter {
        rule: String,
        parameter: String,
        reason: String,
    },

    #[error("invalid specializer {specializer} in rule {rule}")]
    #[diagnostic(
        code(gate::load::invalid_specializer),
        help("A specializer is a class name, Class{{field: value}}, or a dictionary pattern.")
    )]
    InvalidSpecializer { rule: String, specializer: String },

    #[error("rule {rule} does not match any declared type of {name}: {declared}")]
    #[diagnostic(
        code(gate::load::incompatible_rule),
        help("Make the parameters match a `type` declaration with the same name and arity, or declare another type.")
    )]
    IncompatibleRule {
        rule: String,
        name: String,
        declared: String,
    },
}

// ---------------------------------------------------------------------------
// Evaluation errors
// ---------------------------------------------------------------------------

/// Errors that terminate a query.
#[derive(Debug, Error, Diagnostic)]
pub enum EvalError {
    #[error("malformed goal: {goal}")]
    #[diagnostic(code(gate::eval::malformed_goal))]
    MalformedGoal { goal: String },

    #[error("host application error: {message}")]
    #[diagnostic(
        code(gate::eval::application),
        help("The host reported a failure while answering an external call.")
    )]
    Application { message: String },

    #[error("goal stack exceeded {limit} entries")]
    #[diagnostic(
        code(gate::eval::stack_overflow),
        help("The query recursed too deeply. Check for unbounded recursion, or raise max_goal_stack in the engine config.")
    )]
    StackOverflow { limit: usize },

    #[error("type error: {message}")]
    #[diagnostic(code(gate::eval::type_error))]
    TypeError { message: String },

    #[error("{variable} is unbound in {context}")]
    #[diagnostic(
        code(gate::eval::unbound),
        help("Bind the variable before using it here, for example by reordering the rule body.")
    )]
    Unbound { variable: String, context: String },

    #[error("unsupported: {message}")]
    #[diagnostic(code(gate::eval::unsupported))]
    Unsupported { message: String },

    #[error("division by zero in {expression}")]
    #[diagnostic(code(gate::eval::division_by_zero))]
    DivisionByZero { expression: String },

    #[error("arithmetic overflow in {expression}")]
    #[diagnostic(code(gate::eval::overflow))]
    Overflow { expression: String },

    #[error("the knowledge base backing this query was released")]
    #[diagnostic(
        code(gate::eval::kb_released),
        help("Keep the engine alive until all of its queries have finished.")
    )]
    KnowledgeBaseReleased,

    #[error("query already failed: {message}")]
    #[diagnostic(
        code(gate::eval::terminated),
        help("A query that reported an error cannot be resumed. Start a new query.")
    )]
    Terminated { message: String },

    #[error("internal error: {message}")]
    #[diagnostic(code(gate::eval::internal))]
    Internal { message: String },
}

// ---------------------------------------------------------------------------
// Bridge errors
// ---------------------------------------------------------------------------

/// Protocol violations by the host. These never change query state.
#[derive(Debug, Error, Diagnostic)]
pub enum BridgeError {
    #[error("no pending request with call id {call_id}")]
    #[diagnostic(
        code(gate::bridge::mismatch),
        help("Answer exactly the call id carried by the most recent ExternalCall or Question event.")
    )]
    Mismatch { call_id: u64 },

    #[error("call id {call_id} is still waiting for an answer")]
    #[diagnostic(
        code(gate::bridge::unanswered),
        help("Supply call_result or question_result for the pending call before asking for the next event.")
    )]
    Unanswered { call_id: u64 },
}

// ---------------------------------------------------------------------------
// Bind / debug errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum BindError {
    #[error("{name} is not a variable of this query")]
    #[diagnostic(
        code(gate::bind::unknown_variable),
        help("Only variables that occur in the query term can be bound.")
    )]
    UnknownVariable { name: String },

    #[error("cannot bind {name}: the query has finished")]
    #[diagnostic(code(gate::bind::finished))]
    Finished { name: String },

    #[error("cannot bind {name} to {value}: the value contains {name}")]
    #[diagnostic(code(gate::bind::cyclic))]
    Cyclic { name: String, value: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum DebugError {
    #[error("no debugger session is active")]
    #[diagnostic(
        code(gate::debug::no_session),
        help("Start the query with tracing enabled to use debugger commands.")
    )]
    NoSession,

    #[error("unknown debugger command: {command}")]
    #[diagnostic(code(gate::debug::unknown_command), help("Type `h` for a list of commands."))]
    UnknownCommand { command: String },
}

// ---------------------------------------------------------------------------
// Filter compilation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error("unknown class {class_tag}")]
    #[diagnostic(
        code(gate::compile::unknown_class),
        help("Register the class in the types map passed to the filter builder.")
    )]
    UnknownClass { class_tag: String },

    #[error("class {class_tag} has no registered field {field}")]
    #[diagnostic(
        code(gate::compile::unregistered_field),
        help("Add the field to the class entry of the types map.")
    )]
    UnregisteredField { class_tag: String, field: String },

    #[error("cannot traverse {class_tag}.{field}: it is not a relation")]
    #[diagnostic(code(gate::compile::not_a_relation))]
    NotARelation { class_tag: String, field: String },

    #[error("method call {call} cannot be translated into a filter")]
    #[diagnostic(
        code(gate::compile::method_call),
        help("Replace the method call with a registered field or relation.")
    )]
    MethodCall { call: String },

    #[error("irreducible predicate {predicate} in partial results")]
    #[diagnostic(
        code(gate::compile::irreducible),
        help("The predicate has no rules that apply to a partially evaluated argument. Define it in the policy or drop it from the filtered path.")
    )]
    Irreducible { predicate: String },

    #[error("unsupported constraint {constraint}")]
    #[diagnostic(code(gate::compile::unsupported))]
    Unsupported { constraint: String },

    #[error("constraint {constraint} refers to variable {variable}, which is not the filtered variable")]
    #[diagnostic(code(gate::compile::foreign_variable))]
    ForeignVariable { variable: String, constraint: String },

    #[error("result has no binding for {variable}")]
    #[diagnostic(code(gate::compile::missing_binding))]
    MissingBinding { variable: String },
}

// ---------------------------------------------------------------------------
// Boundary / config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum BoundaryError {
    #[error("null pointer passed for {argument}")]
    #[diagnostic(code(gate::boundary::null_pointer))]
    NullPointer { argument: String },

    #[error("argument {argument} is not valid UTF-8")]
    #[diagnostic(code(gate::boundary::invalid_utf8))]
    InvalidUtf8 { argument: String },

    #[error("malformed {what}: {message}")]
    #[diagnostic(
        code(gate::boundary::serialization),
        help("Terms and events are exchanged as JSON; check the payload against the documented format.")
    )]
    Serialization { what: String, message: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config {path}: {message}")]
    #[diagnostic(code(gate::config::io))]
    Io { path: String, message: String },

    #[error("invalid config: {message}")]
    #[diagnostic(
        code(gate::config::invalid),
        help("See EngineConfig for the accepted keys and value ranges.")
    )]
    Invalid { message: String },
}

// ---------------------------------------------------------------------------
// Boundary envelope
// ---------------------------------------------------------------------------

/// The JSON shape an error takes when it crosses the host boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub kind: String,
    pub code: String,
    pub message: String,
}

impl GateError {
    /// Stable category tag for the host.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::Load(_) => "LoadError",
            GateError::Eval(_) => "EvalError",
            GateError::Bridge(_) => "BridgeMismatchError",
            GateError::Bind(_) => "BindError",
            GateError::Debug(_) => "DebugError",
            GateError::Compile(_) => "CompileError",
            GateError::Boundary(_) => "BoundaryError",
            GateError::Config(_) => "ConfigError",
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            kind: self.kind().to_string(),
            code: self.code().map(|c| c.to_string()).unwrap_or_default(),
            message: self.to_string(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type GateResult<T> = std::result::Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_kind_and_code() {
        let err: GateError = BridgeError::Mismatch { call_id: 7 }.into();
        let env = err.envelope();
        assert_eq!(env.kind, "BridgeMismatchError");
        assert_eq!(env.code, "gate::bridge::mismatch");
        assert!(env.message.contains('7'));
    }

    #[test]
    fn parse_errors_surface_as_load_errors() {
        let err: GateError = ParseError {
            message: "unexpected token".into(),
            line: 1,
            column: 4,
            src: NamedSource::new("policy.polar", "foo(;".to_string()),
            span: (4, 1).into(),
        }
        .into();
        assert_eq!(err.kind(), "LoadError");
        assert!(err.to_string().contains("line 1, column 4"));
    }
}
