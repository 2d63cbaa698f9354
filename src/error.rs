//! Error taxonomy for the composer pipeline.
//!
//! Each pipeline stage gets its own enum so callers can match on a specific
//! failure mode instead of parsing a message string.

use thiserror::Error;

/// Errors raised while building or deserializing a composition tree.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BuildError {
    #[error("unknown combinator: {0}")]
    UnknownCombinator(String),

    #[error("too many arguments for combinator `{combinator}`: expected at most {max}, got {got}")]
    TooManyArguments { combinator: String, max: usize, got: usize },

    #[error("invalid argument for combinator `{combinator}`, slot `{slot}`: {reason}")]
    InvalidArgument { combinator: String, slot: String, reason: String },

    #[error("invalid action name: {0}")]
    InvalidName(String),

    #[error("cannot capture native code as a composition function")]
    NativeFunctionCapture,

    #[error("anonymous composition cannot be deployed")]
    AnonymousComposition,

    #[error("malformed composition JSON: {0}")]
    MalformedJson(String),
}

impl BuildError {
    pub fn invalid_argument(combinator: impl Into<String>, slot: impl Into<String>, reason: impl Into<String>) -> Self {
        BuildError::InvalidArgument { combinator: combinator.into(), slot: slot.into(), reason: reason.into() }
    }

    pub fn too_many_arguments(combinator: impl Into<String>, max: usize, got: usize) -> Self {
        BuildError::TooManyArguments { combinator: combinator.into(), max, got }
    }
}

/// Errors raised while lowering an AST to a target combinator set.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LowerError {
    #[error("no rewrite available for combinator `{0}` and it is outside the lowering target")]
    NoRewrite(String),

    #[error("rewrite of `{combinator}` produced an invalid tree: {reason}")]
    InvalidRewrite { combinator: String, reason: String },

    #[error("invalid version string: {0}")]
    InvalidVersion(String),
}

impl LowerError {
    pub fn invalid_rewrite(combinator: impl Into<String>, reason: impl Into<String>) -> Self {
        LowerError::InvalidRewrite { combinator: combinator.into(), reason: reason.into() }
    }
}

/// Errors raised while compiling a lowered AST into an FSM.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("combinator `{0}` is not primitive and cannot be compiled directly")]
    NotPrimitive(String),

    #[error("combinator `{combinator}` is missing required slot `{slot}`")]
    MissingSlot { combinator: String, slot: String },

    #[error("internal compiler invariant violated: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn missing_slot(combinator: impl Into<String>, slot: impl Into<String>) -> Self {
        CompileError::MissingSlot { combinator: combinator.into(), slot: slot.into() }
    }
}

/// Protocol and invariant-violation errors surfaced by the conductor.
///
/// These are distinct from ordinary composition runtime errors (which are
/// materialized as `{"error": ...}` inside `params` and handled by the FSM's
/// own try/catch machinery, never as a Rust `Result::Err`).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConductError {
    #[error("malformed resume token: {0}")]
    MalformedResume(String),

    #[error("resume state index {0} is out of range")]
    ResumeStateOutOfRange(usize),

    #[error("exit state popped an empty stack")]
    EmptyStackPop,

    #[error("fsm state index {0} is out of range")]
    StateOutOfRange(usize),

    #[error("relative jump from state {from} by {offset} is out of range")]
    JumpOutOfRange { from: usize, offset: i64 },
}

impl ConductError {
    /// True for protocol-class errors (malformed host input, 400-equivalent).
    pub fn is_protocol(&self) -> bool {
        matches!(self, ConductError::MalformedResume(_) | ConductError::ResumeStateOutOfRange(_))
    }
}

/// Errors raised while evaluating an inline function's source against the
/// current variable environment.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("expression error: {0}")]
    Expression(String),

    #[error("unknown identifier `{0}` in assignment")]
    UnknownIdentifier(String),

    #[error("function returned a callable value, which is not a valid composition result")]
    ReturnedCallable,

    #[error("malformed function source: {0}")]
    MalformedSource(String),
}
