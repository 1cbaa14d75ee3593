//! In-process evaluation of an expression against an [`EvaluationContext`].

use std::cmp::Ordering;

use regex::RegexBuilder;

use crate::ast::{Expr, FieldPath, Modifier, Operand, Operator};
use crate::context::EvaluationContext;
use crate::error::EvalError;
use crate::value::Value;

/// Resource limits for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalLimits {
    /// Upper bound on visited nodes plus element comparisons.
    pub max_steps: usize,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self { max_steps: 10_000 }
    }
}

/// Evaluates `expr` against `ctx` with default limits.
pub fn evaluate(expr: &Expr, ctx: &EvaluationContext) -> Result<bool, EvalError> {
    Evaluator::new(ctx).evaluate(expr)
}

pub struct Evaluator<'c> {
    ctx: &'c EvaluationContext,
    limits: EvalLimits,
    steps: usize,
}

impl<'c> Evaluator<'c> {
    pub fn new(ctx: &'c EvaluationContext) -> Self {
        Self::with_limits(ctx, EvalLimits::default())
    }

    pub fn with_limits(ctx: &'c EvaluationContext, limits: EvalLimits) -> Self {
        Self {
            ctx,
            limits,
            steps: 0,
        }
    }

    pub fn evaluate(&mut self, expr: &Expr) -> Result<bool, EvalError> {
        self.steps = 0;
        self.eval(expr)
    }

    /// Resolves a field and applies its modifier.
    pub fn resolve_field(&self, path: &FieldPath) -> Result<Value, EvalError> {
        let value = self.ctx.resolve(path)?;
        match &path.modifier {
            Some(modifier) => apply_modifier(value, modifier),
            None => Ok(value),
        }
    }

    fn tick(&mut self) -> Result<(), EvalError> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(EvalError::BudgetExceeded(self.limits.max_steps));
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<bool, EvalError> {
        self.tick()?;
        match expr {
            Expr::And(left, right) => Ok(self.eval(left)? && self.eval(right)?),
            Expr::Or(left, right) => Ok(self.eval(left)? || self.eval(right)?),
            Expr::Not(inner) => Ok(!self.eval(inner)?),
            Expr::Group(inner) => self.eval(inner),
            Expr::Comparison { left, op, right } => self.eval_comparison(left, *op, right),
            Expr::AnyQuantifier { field, op, values } => {
                let candidates = self.resolve_field(field)?;
                let op = op.scalar();
                for element in candidates.elements() {
                    for literal in values {
                        self.tick()?;
                        if compare(element, op, &Value::from(literal))? {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
        }
    }

    fn eval_comparison(
        &mut self,
        left: &Operand,
        op: Operator,
        right: &Operand,
    ) -> Result<bool, EvalError> {
        let lhs = self.operand(left)?;
        let rhs = self.operand(right)?;

        if is_each(left) {
            for element in lhs.elements() {
                self.tick()?;
                if compare(element, op, &rhs)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        if is_each(right) {
            for element in rhs.elements() {
                self.tick()?;
                if compare(&lhs, op, element)? {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        compare(&lhs, op, &rhs)
    }

    fn operand(&self, operand: &Operand) -> Result<Value, EvalError> {
        match operand {
            Operand::Literal(literal) => Ok(Value::from(literal)),
            Operand::Field(path) => self.resolve_field(path),
        }
    }
}

fn is_each(operand: &Operand) -> bool {
    matches!(operand, Operand::Field(path) if path.modifier == Some(Modifier::Each))
}

/// Applies a field modifier to a resolved value.
pub fn apply_modifier(value: Value, modifier: &Modifier) -> Result<Value, EvalError> {
    match modifier {
        Modifier::IsSet => Ok(Value::Bool(!value.is_null())),
        Modifier::Each => Ok(value),
        Modifier::Length => match value {
            Value::Null => Ok(Value::Null),
            Value::Text(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::Array(items) => Ok(Value::Int(items.len() as i64)),
            other => Err(EvalError::InvalidModifier {
                modifier: modifier.name(),
                found: other.type_name(),
            }),
        },
        Modifier::Lower => Ok(map_text(value, &|s: &str| s.to_lowercase())),
        Modifier::Upper => Ok(map_text(value, &|s: &str| s.to_uppercase())),
        Modifier::Excerpt {
            max_chars,
            ellipsis,
        } => match value {
            Value::Null => Ok(Value::Null),
            Value::Array(_) => Err(EvalError::InvalidModifier {
                modifier: modifier.name(),
                found: value.type_name(),
            }),
            other => Ok(Value::Text(excerpt(&other.to_text(), *max_chars, ellipsis))),
        },
    }
}

fn map_text(value: Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Text(s) => Value::Text(f(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| map_text(v, f)).collect()),
        other => other,
    }
}

/// Cuts `text` to at most `max_chars` characters, appending `ellipsis` when
/// anything was cut.
pub fn excerpt(text: &str, max_chars: usize, ellipsis: &str) -> String {
    let mut chars = text.char_indices();
    match chars.nth(max_chars) {
        Some((cut, _)) => format!("{}{}", text[..cut].trim_end(), ellipsis),
        None => text.to_string(),
    }
}

/// Compares two resolved values with a scalar operator.
///
/// Null only equals null; every other comparison involving null is false
/// except `!=` against a non-null value.
pub fn compare(left: &Value, op: Operator, right: &Value) -> Result<bool, EvalError> {
    match (left.is_null(), right.is_null()) {
        (true, true) => return Ok(op == Operator::Eq),
        (true, false) | (false, true) => return Ok(op == Operator::Neq),
        (false, false) => {}
    }

    match op {
        Operator::Eq => Ok(values_equal(left, right)),
        Operator::Neq => Ok(!values_equal(left, right)),
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let ordering = order(left, op, right)?;
            Ok(match op {
                Operator::Gt => ordering == Ordering::Greater,
                Operator::Gte => ordering != Ordering::Less,
                Operator::Lt => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            })
        }
        Operator::Like | Operator::NotLike => {
            reject_arrays(left, op, right)?;
            let matched = like(&left.to_text(), &right.to_text())?;
            Ok(matched == (op == Operator::Like))
        }
        quantified => compare(left, quantified.scalar(), right),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Array(_), _) | (_, Value::Array(_)) => false,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Instant(_), _) | (_, Value::Instant(_)) => {
            match (left.as_instant(), right.as_instant()) {
                (Some(a), Some(b)) => a == b,
                _ => left.to_text() == right.to_text(),
            }
        }
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => left.to_text() == right.to_text(),
        },
    }
}

fn order(left: &Value, op: Operator, right: &Value) -> Result<Ordering, EvalError> {
    reject_arrays(left, op, right)?;
    if matches!(left, Value::Instant(_)) || matches!(right, Value::Instant(_)) {
        if let (Some(a), Some(b)) = (left.as_instant(), right.as_instant()) {
            return Ok(a.cmp(&b));
        }
    }
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return Ok(a.partial_cmp(&b).unwrap_or(Ordering::Equal));
    }
    Ok(left.to_text().cmp(&right.to_text()))
}

fn reject_arrays(left: &Value, op: Operator, right: &Value) -> Result<(), EvalError> {
    if matches!(left, Value::Array(_)) || matches!(right, Value::Array(_)) {
        return Err(EvalError::TypeMismatch {
            operator: op.as_str(),
            left: left.type_name(),
            right: right.type_name(),
        });
    }
    Ok(())
}

/// Matches `value` against a `~` pattern.
///
/// A pattern containing `%` is a LIKE pattern (`%` any run, `_` any single
/// character). Anything else is a case-insensitive substring test.
pub fn like(value: &str, pattern: &str) -> Result<bool, EvalError> {
    if !pattern.contains('%') {
        return Ok(value.to_lowercase().contains(&pattern.to_lowercase()));
    }
    let mut regex = String::from("^");
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    regex.push('$');
    let compiled = RegexBuilder::new(&regex)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| EvalError::Pattern(e.to_string()))?;
    Ok(compiled.is_match(value))
}
