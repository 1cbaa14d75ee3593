//! Filter and access-rule expression engine.
//!
//! Expressions such as `status = 'active' && author.name ~ 'ada'` are
//! tokenized, parsed into an immutable [`Expr`], and then either evaluated
//! in process against a record ([`evaluate`]) or compiled into a
//! parameterized SQL predicate ([`SqlCompiler`]).

pub mod adapters;
pub mod ast;
pub mod cache;
pub mod config;
pub mod context;
pub mod date_macro;
pub mod error;
pub mod evaluator;
pub mod lexer;
pub mod parser;
pub mod policy;
pub mod projection;
pub mod schema;
pub mod sql_compiler;
pub mod token;
pub mod value;

use tracing::debug;

pub use adapters::{ContextBuilder, MutationEvent, Prefetcher, RelationResolver, Subscription};
pub use ast::{Expr, FieldPath, Literal, Modifier, Operand, Operator, PathRoot};
pub use cache::ExprCache;
pub use config::{Config, EngineConfig};
pub use context::{EvaluationContext, Record, RequestContext, RequestInfo};
pub use date_macro::{Clock, FixedClock, SystemClock};
pub use error::{CompileError, EvalError, FilterError, Result};
pub use evaluator::{evaluate, EvalLimits, Evaluator};
pub use parser::ParseOptions;
pub use policy::{AccessGate, Rule, RuleSet, SubscriptionMatcher};
pub use projection::FieldSelection;
pub use schema::{SchemaLookup, StaticSchema};
pub use sql_compiler::{CompiledPredicate, Dialect, SqlCompiler};
pub use value::Value;

/// Parses a client filter against the system clock.
pub fn parse(source: &str) -> Result<Expr> {
    parse_with(source, ParseOptions::FILTER, &SystemClock)
}

/// Parses `source` with explicit limits. Every datetime macro in the
/// expression resolves against a single reading of `clock`.
pub fn parse_with(source: &str, options: ParseOptions, clock: &dyn Clock) -> Result<Expr> {
    let tokens = lexer::tokenize(source)?;
    let expr = parser::Parser::new(&tokens, clock, options).parse()?;
    debug!(source, "parsed expression");
    Ok(expr)
}
