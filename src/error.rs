//! Error types for every stage of the filter engine.
//!
//! Lexing, parsing and macro failures are always surfaced to whoever triggered
//! the parse. Evaluation failures are mapped by the call site (see
//! [`crate::policy`]); compile failures are reported back to the API caller.

use thiserror::Error;

/// A bad token in the source string.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("lex error at offset {offset}: {message}")]
pub struct LexError {
    pub offset: usize,
    pub message: String,
}

impl LexError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// Malformed grammar. The parser never partially succeeds.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("parse error at offset {offset}: expected {expected}, found {found}")]
pub struct ParseError {
    pub offset: usize,
    pub expected: String,
    pub found: String,
}

impl ParseError {
    pub fn new(offset: usize, expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self {
            offset,
            expected: expected.into(),
            found: found.into(),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroErrorKind {
    #[error("unknown macro")]
    Unknown,
    #[error("malformed offset")]
    MalformedOffset,
    #[error("offset unit requires a signed amount such as +1 or -7")]
    MissingOffset,
    #[error("resulting date is out of range")]
    OutOfRange,
}

/// An unknown datetime macro or a bad offset suffix.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("macro error at offset {offset}: @{name}: {kind}")]
pub struct MacroError {
    pub offset: usize,
    pub name: String,
    pub kind: MacroErrorKind,
}

/// Field or type issues found while evaluating an expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("cannot apply {operator} to {left} and {right}")]
    TypeMismatch {
        operator: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("modifier :{modifier} cannot be applied to a {found} value")]
    InvalidModifier {
        modifier: &'static str,
        found: &'static str,
    },

    #[error("relation depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("evaluation exceeded the budget of {0} steps")]
    BudgetExceeded(usize),

    #[error("invalid pattern: {0}")]
    Pattern(String),
}

/// Failures that only occur when turning an expression into SQL.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("unknown field: {path}")]
    UnknownField { path: String },

    #[error("not supported in SQL: {construct}")]
    Unsupported { construct: String },

    #[error("field path {path} exceeds the maximum relation depth of {max}")]
    DepthExceeded { path: String, max: usize },

    #[error("unknown collection: {0}")]
    UnknownCollection(String),
}

impl CompileError {
    pub(crate) fn unsupported(construct: impl Into<String>) -> Self {
        CompileError::Unsupported {
            construct: construct.into(),
        }
    }
}

/// Failure reported by the storage collaborator while prefetching relations.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("failed to fetch {collection} records: {message}")]
pub struct ResolveError {
    pub collection: String,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file does not exist: {0}")]
    Missing(String),

    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid schema: {0}")]
    Schema(String),
}

/// Umbrella error for the one-shot entry points.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Macro(#[from] MacroError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

impl FilterError {
    /// Whether an HTTP boundary should answer with a 400-class response.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, FilterError::Eval(_))
    }

    /// Source offset of the failure, when it has one.
    pub fn offset(&self) -> Option<usize> {
        match self {
            FilterError::Lex(e) => Some(e.offset),
            FilterError::Parse(e) => Some(e.offset),
            FilterError::Macro(e) => Some(e.offset),
            FilterError::Eval(_) | FilterError::Compile(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
