//! Access rules and realtime subscription matching.
//!
//! Both surfaces fail closed: a rule or filter that cannot be evaluated
//! denies access and the failure is logged.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::adapters::{ContextBuilder, MutationEvent, Subscription};
use crate::ast::Expr;
use crate::context::EvaluationContext;
use crate::date_macro::Clock;
use crate::error::FilterError;
use crate::evaluator::{EvalLimits, Evaluator};
use crate::parser::ParseOptions;

/// An access rule as stored on a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    /// No rule set: only superusers pass.
    Locked,
    /// Empty rule: everyone passes.
    Public,
    Expr(Arc<Expr>),
}

impl Rule {
    /// `None` locks the action, an empty string opens it, anything else is
    /// parsed as a rule expression.
    pub fn parse(source: Option<&str>, clock: &dyn Clock) -> Result<Self, FilterError> {
        match source {
            None => Ok(Rule::Locked),
            Some(text) if text.trim().is_empty() => Ok(Rule::Public),
            Some(text) => {
                let expr = crate::parse_with(text, ParseOptions::RULE, clock)?;
                Ok(Rule::Expr(Arc::new(expr)))
            }
        }
    }

    pub fn expr(&self) -> Option<&Expr> {
        match self {
            Rule::Expr(expr) => Some(&**expr),
            Rule::Locked | Rule::Public => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    List,
    View,
    Create,
    Update,
    Delete,
}

/// The per-action rules of one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    pub list: Rule,
    pub view: Rule,
    pub create: Rule,
    pub update: Rule,
    pub delete: Rule,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            list: Rule::Locked,
            view: Rule::Locked,
            create: Rule::Locked,
            update: Rule::Locked,
            delete: Rule::Locked,
        }
    }
}

impl RuleSet {
    pub fn rule(&self, action: Action) -> &Rule {
        match action {
            Action::List => &self.list,
            Action::View => &self.view,
            Action::Create => &self.create,
            Action::Update => &self.update,
            Action::Delete => &self.delete,
        }
    }
}

/// Decides whether a request may act on a record.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessGate {
    limits: EvalLimits,
}

impl AccessGate {
    pub fn new(limits: EvalLimits) -> Self {
        Self { limits }
    }

    /// Superusers bypass every rule. Evaluation failures deny.
    pub fn check(&self, rule: &Rule, ctx: &EvaluationContext) -> bool {
        if ctx.request().is_superuser {
            return true;
        }
        match rule {
            Rule::Locked => false,
            Rule::Public => true,
            Rule::Expr(expr) => self.eval_or_deny(expr, ctx, "access rule"),
        }
    }

    pub fn allows(&self, rules: &RuleSet, action: Action, ctx: &EvaluationContext) -> bool {
        let allowed = self.check(rules.rule(action), ctx);
        debug!(?action, collection = %ctx.record().collection, allowed, "access check");
        allowed
    }

    fn eval_or_deny(&self, expr: &Expr, ctx: &EvaluationContext, what: &str) -> bool {
        match Evaluator::with_limits(ctx, self.limits).evaluate(expr) {
            Ok(allowed) => allowed,
            Err(err) => {
                warn!(error = %err, expr = %expr, "{what} evaluation failed, denying");
                false
            }
        }
    }
}

/// Decides which subscribers receive a mutation event.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionMatcher {
    gate: AccessGate,
}

impl SubscriptionMatcher {
    pub fn new(gate: AccessGate) -> Self {
        Self { gate }
    }

    /// The event is delivered when the collection's view rule admits the
    /// subscriber and the subscriber's own filter, if any, matches. Both are
    /// evaluated by the same evaluator used for direct access checks.
    pub fn matches(
        &self,
        event: &MutationEvent,
        subscription: &Subscription,
        view_rule: &Rule,
        contexts: &ContextBuilder<'_>,
    ) -> bool {
        if event.collection != subscription.collection {
            return false;
        }
        let exprs: Vec<&Expr> = view_rule
            .expr()
            .into_iter()
            .chain(subscription.filter.as_deref())
            .collect();
        let ctx = match contexts.for_event(event, subscription, &exprs) {
            Ok(Some(ctx)) => ctx,
            Ok(None) => return false,
            Err(err) => {
                warn!(error = %err, subscription = %subscription.id, "cannot build realtime context, skipping");
                return false;
            }
        };
        if !self.gate.check(view_rule, &ctx) {
            return false;
        }
        match &subscription.filter {
            Some(filter) => self.gate.eval_or_deny(filter, &ctx, "subscription filter"),
            None => true,
        }
    }
}
