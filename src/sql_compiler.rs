//! SQL compiler that turns an expression into a parameterized WHERE predicate
//! using sea-query.
//!
//! Every user-supplied value (literals, macro instants, `@request.*`
//! attributes) is bound as a parameter. Identifiers only ever come from the
//! schema.
//!
//! Single relations become LEFT JOINs on the outer query. A path crossing a
//! multi relation becomes a correlated `EXISTS` sub-select over the stored id
//! array, so quantifiers keep per-record semantics under `NOT` and `AND`.

use std::mem;

use sea_query::{
    Alias, Asterisk, BinOper, Expr as SqlExpr, Func, Iden, JoinType, LikeExpr,
    PostgresQueryBuilder, Query, SelectStatement, SimpleExpr, SqliteQueryBuilder,
    Value as SqlValue,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ast::{Expr, FieldPath, Literal, Modifier, Operand, Operator, PathRoot};
use crate::context::{RequestInfo, DEFAULT_MAX_RELATION_DEPTH};
use crate::error::CompileError;
use crate::evaluator::apply_modifier;
use crate::schema::{FieldInfo, SchemaLookup};
use crate::value::{format_datetime, Value};

/// Target SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    #[default]
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerConfig {
    pub dialect: Dialect,
    /// Maximum relation hops a field path may take.
    pub max_relation_depth: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::Sqlite,
            max_relation_depth: DEFAULT_MAX_RELATION_DEPTH,
        }
    }
}

/// Table or table alias identifier
#[derive(Debug, Clone)]
pub struct TableName(pub String);

impl Iden for TableName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let _ = s.write_str(&self.0);
    }
}

/// Column identifier wrapper
#[derive(Debug, Clone)]
pub struct ColumnName(pub String);

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let _ = s.write_str(&self.0);
    }
}

const JSON_EACH: &str = "json_each";
const JSON_EACH_VALUE: &str = "value";
const ID_COLUMN: &str = "id";

/// A LEFT JOIN needed to reach a field through a single relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinClause {
    pub table: String,
    pub alias: String,
    pub source_alias: String,
    pub source_column: String,
}

impl JoinClause {
    fn on(&self) -> SimpleExpr {
        SqlExpr::col((TableName(self.alias.clone()), ColumnName(ID_COLUMN.to_string()))).equals((
            TableName(self.source_alias.clone()),
            ColumnName(self.source_column.clone()),
        ))
    }
}

/// Result of compiling one expression.
#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    /// Boolean SQL expression with placeholders.
    pub sql: String,
    /// Values for the placeholders, in order.
    pub params: Vec<SqlValue>,
    /// Joins the predicate needs on the outer query.
    pub joins: Vec<JoinClause>,
    pub condition: SimpleExpr,
    table: String,
    dialect: Dialect,
}

impl CompiledPredicate {
    /// `SELECT table.* FROM table [LEFT JOIN ...] WHERE predicate`
    pub fn to_select(&self) -> SelectStatement {
        let mut select = Query::select();
        select
            .column((TableName(self.table.clone()), Asterisk))
            .from(TableName(self.table.clone()));
        for join in &self.joins {
            select.join_as(
                JoinType::LeftJoin,
                TableName(join.table.clone()),
                TableName(join.alias.clone()),
                join.on(),
            );
        }
        select.and_where(self.condition.clone());
        select
    }

    /// The full select statement rendered for the compiled dialect.
    pub fn to_select_sql(&self) -> (String, Vec<SqlValue>) {
        let select = self.to_select();
        let (sql, values) = match self.dialect {
            Dialect::Sqlite => select.build(SqliteQueryBuilder),
            Dialect::Postgres => select.build(PostgresQueryBuilder),
        };
        (sql, values.0)
    }
}

/// SQL Compiler that converts expressions to predicates over one collection
pub struct SqlCompiler<'a> {
    schema: &'a dyn SchemaLookup,
    collection: String,
    config: CompilerConfig,
    request: Option<&'a RequestInfo>,
}

/// One query level: the outer select or an `EXISTS` sub-select.
struct Level {
    collection: String,
    alias: String,
    joins: Vec<JoinClause>,
    /// Relation path (relative to this level) each join was made for.
    join_paths: Vec<Vec<String>>,
}

impl Level {
    fn new(collection: String, alias: String) -> Self {
        Self {
            collection,
            alias,
            joins: Vec::new(),
            join_paths: Vec::new(),
        }
    }
}

struct Scope {
    level: Level,
    /// Aliases are numbered across all levels so sub-selects never shadow
    /// an outer table.
    next_alias: usize,
}

impl Scope {
    fn alias(&mut self, kind: &str, name: &str) -> String {
        self.next_alias += 1;
        if name.is_empty() {
            format!("__{kind}{}", self.next_alias)
        } else {
            format!("__{kind}{}_{name}", self.next_alias)
        }
    }
}

/// The part of a path that lies beyond a multi relation.
struct Related {
    /// Column holding the JSON array of related ids.
    source: SimpleExpr,
    table: String,
    collection: String,
    /// Path up to and including the multi relation, for error messages.
    via: String,
    /// Remaining path, resolved inside the sub-select.
    rest: FieldPath,
}

impl Related {
    fn is_each(&self) -> bool {
        self.rest.modifier == Some(Modifier::Each)
    }
}

/// A compiled operand.
enum Term {
    Column {
        expr: SimpleExpr,
        /// The column holds a JSON array.
        array: bool,
    },
    IsSet(SimpleExpr),
    /// `:each` over a JSON array column.
    Each(SimpleExpr),
    Bound(Value),
    Related(Box<Related>),
}

impl Term {
    fn element(expr: SimpleExpr) -> Self {
        Term::Column { expr, array: false }
    }

    fn into_expr(self) -> Result<SimpleExpr, CompileError> {
        match self {
            Term::Column { expr, .. } => Ok(expr),
            Term::Bound(value) => Ok(SimpleExpr::Value(to_sql_value(value)?)),
            Term::IsSet(_) => Err(CompileError::unsupported(":isset outside a boolean comparison")),
            Term::Each(_) => Err(CompileError::unsupported(":each on both sides")),
            Term::Related(_) => Err(CompileError::unsupported(
                "plain comparison on a field reached through a multi relation",
            )),
        }
    }
}

impl<'a> SqlCompiler<'a> {
    pub fn new(schema: &'a dyn SchemaLookup, collection: impl Into<String>) -> Self {
        Self {
            schema,
            collection: collection.into(),
            config: CompilerConfig::default(),
            request: None,
        }
    }

    pub fn with_config(mut self, config: CompilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Binds `@request.*` attributes from `request`. Without one, the request
    /// is treated as anonymous.
    pub fn with_request(mut self, request: &'a RequestInfo) -> Self {
        self.request = Some(request);
        self
    }

    pub fn compile(&self, expr: &Expr) -> Result<CompiledPredicate, CompileError> {
        let table = self
            .schema
            .table(&self.collection)
            .ok_or_else(|| CompileError::UnknownCollection(self.collection.clone()))?;
        let mut scope = Scope {
            level: Level::new(self.collection.clone(), table.clone()),
            next_alias: 0,
        };
        let condition = self.compile_expr(expr, &mut scope)?;
        let (sql, params) = render_predicate(self.config.dialect, &condition);
        debug!(
            collection = %self.collection,
            %sql,
            params = params.len(),
            joins = scope.level.joins.len(),
            "compiled filter"
        );
        Ok(CompiledPredicate {
            sql,
            params,
            joins: scope.level.joins,
            condition,
            table,
            dialect: self.config.dialect,
        })
    }

    fn compile_expr(&self, expr: &Expr, scope: &mut Scope) -> Result<SimpleExpr, CompileError> {
        match expr {
            Expr::And(left, right) => {
                let left = self.compile_expr(left, scope)?;
                let right = self.compile_expr(right, scope)?;
                Ok(left.and(right))
            }
            Expr::Or(left, right) => {
                let left = self.compile_expr(left, scope)?;
                let right = self.compile_expr(right, scope)?;
                Ok(left.or(right))
            }
            Expr::Not(inner) => Ok(self.compile_expr(inner, scope)?.not()),
            Expr::Group(inner) => self.compile_expr(inner, scope),
            Expr::Comparison { left, op, right } => {
                let left = self.term(left, scope)?;
                let right = self.term(right, scope)?;
                self.compare_terms(left, *op, right, scope)
            }
            Expr::AnyQuantifier { field, op, values } => {
                if field.root != PathRoot::Record {
                    return Err(CompileError::unsupported(format!("{} on {field}", op_label(*op))));
                }
                let term = self.field_term(field, scope)?;
                self.quantify(term, op.scalar(), values, scope)
            }
        }
    }

    /// At least one element of `term` matches at least one of `values`.
    fn quantify(
        &self,
        term: Term,
        op: Operator,
        values: &[Literal],
        scope: &mut Scope,
    ) -> Result<SimpleExpr, CompileError> {
        match term {
            Term::Related(related) => self.within_related(*related, scope, |compiler, inner, scope| {
                compiler.quantify(inner, op, values, scope)
            }),
            Term::Each(source) | Term::Column { expr: source, array: true } => {
                let (alias, element) = self.each_element(scope)?;
                let condition = self.any_of(element, op, values, scope)?;
                Ok(exists_in_json_each(source, &alias, condition))
            }
            Term::Column { expr, .. } => self.any_of(expr, op, values, scope),
            Term::IsSet(_) | Term::Bound(_) => Err(CompileError::unsupported(format!(
                "{} on a modifier or request value",
                op_label(op)
            ))),
        }
    }

    fn any_of(
        &self,
        element: SimpleExpr,
        op: Operator,
        values: &[Literal],
        scope: &mut Scope,
    ) -> Result<SimpleExpr, CompileError> {
        let mut combined: Option<SimpleExpr> = None;
        for literal in values {
            let condition = self.compare_terms(
                Term::element(element.clone()),
                op,
                Term::Bound(Value::from(literal)),
                scope,
            )?;
            combined = Some(match combined {
                Some(previous) => previous.or(condition),
                None => condition,
            });
        }
        Ok(combined.unwrap_or_else(|| constant(false)))
    }

    fn compare_terms(
        &self,
        left: Term,
        op: Operator,
        right: Term,
        scope: &mut Scope,
    ) -> Result<SimpleExpr, CompileError> {
        match (left, right) {
            (Term::Related(related), right) if related.is_each() => {
                self.within_related(*related, scope, |compiler, inner, scope| {
                    compiler.compare_terms(inner, op, right, scope)
                })
            }
            (left, Term::Related(related)) if related.is_each() => {
                self.within_related(*related, scope, |compiler, inner, scope| {
                    compiler.compare_terms(left, op, inner, scope)
                })
            }
            (Term::Related(_), _) | (_, Term::Related(_)) => Err(CompileError::unsupported(
                "plain comparison on a field reached through a multi relation",
            )),
            (Term::Each(source), right) => {
                let (alias, element) = self.each_element(scope)?;
                let condition = self.compare_terms(Term::element(element), op, right, scope)?;
                Ok(exists_in_json_each(source, &alias, condition))
            }
            (left, Term::Each(source)) => {
                let (alias, element) = self.each_element(scope)?;
                let condition = self.compare_terms(left, op, Term::element(element), scope)?;
                Ok(exists_in_json_each(source, &alias, condition))
            }
            (Term::IsSet(column), Term::Bound(Value::Bool(expected)))
            | (Term::Bound(Value::Bool(expected)), Term::IsSet(column)) => {
                let set = match op {
                    Operator::Eq => expected,
                    Operator::Neq => !expected,
                    other => {
                        return Err(CompileError::unsupported(format!(":isset with {other}")))
                    }
                };
                let column = SqlExpr::expr(column);
                Ok(if set {
                    column.is_not_null()
                } else {
                    column.is_null()
                })
            }
            (Term::IsSet(_), _) | (_, Term::IsSet(_)) => Err(CompileError::unsupported(
                ":isset compared with anything but true or false",
            )),
            (Term::Bound(Value::Null), Term::Bound(Value::Null)) => Ok(constant(op == Operator::Eq)),
            (Term::Bound(Value::Null), other) | (other, Term::Bound(Value::Null)) => {
                let other = SqlExpr::expr(other.into_expr()?);
                Ok(match op {
                    Operator::Eq => other.is_null(),
                    Operator::Neq => other.is_not_null(),
                    _ => constant(false),
                })
            }
            (left, right) => match op {
                Operator::Like | Operator::NotLike => self.like(left.into_expr()?, op, right),
                _ => self.binary(left.into_expr()?, op, right.into_expr()?),
            },
        }
    }

    fn like(&self, left: SimpleExpr, op: Operator, pattern: Term) -> Result<SimpleExpr, CompileError> {
        // LIKE is case-insensitive in SQLite; lower both sides elsewhere.
        let fold = self.config.dialect == Dialect::Postgres;
        let left = if fold {
            SqlExpr::expr(Func::lower(left))
        } else {
            SqlExpr::expr(left)
        };
        match pattern {
            Term::Bound(value) => {
                let mut pattern = like_pattern(&value.to_text());
                if fold {
                    pattern = pattern.to_lowercase();
                }
                let pattern = LikeExpr::new(pattern).escape('\\');
                Ok(if op == Operator::Like {
                    left.like(pattern)
                } else {
                    left.not_like(pattern)
                })
            }
            column => {
                let mut right = column.into_expr()?;
                if fold {
                    right = Func::lower(right).into();
                }
                let oper = if op == Operator::Like {
                    BinOper::Like
                } else {
                    BinOper::NotLike
                };
                Ok(left.binary(oper, right))
            }
        }
    }

    /// Scalar comparisons keep SQL's own null handling: a NULL column
    /// matches neither `=` nor `<>`.
    fn binary(&self, left: SimpleExpr, op: Operator, right: SimpleExpr) -> Result<SimpleExpr, CompileError> {
        let left = SqlExpr::expr(left);
        let expr = match op {
            Operator::Eq => left.eq(right),
            Operator::Neq => left.ne(right),
            Operator::Gt => left.gt(right),
            Operator::Gte => left.gte(right),
            Operator::Lt => left.lt(right),
            Operator::Lte => left.lte(right),
            other => return Err(CompileError::unsupported(format!("operator {other}"))),
        };
        Ok(expr)
    }

    fn term(&self, operand: &Operand, scope: &mut Scope) -> Result<Term, CompileError> {
        match operand {
            Operand::Literal(literal) => Ok(Term::Bound(Value::from(literal))),
            Operand::Field(path) => self.field_term(path, scope),
        }
    }

    fn field_term(&self, path: &FieldPath, scope: &mut Scope) -> Result<Term, CompileError> {
        if path.root != PathRoot::Record {
            return self.request_term(path);
        }
        let (expr, info) = match self.column(path, scope)? {
            Resolved::Column(expr, info) => (expr, info),
            Resolved::Related(related) => return Ok(Term::Related(Box::new(related))),
        };
        let array = info.is_array();
        let term = match &path.modifier {
            None => Term::Column { expr, array },
            Some(Modifier::Lower) | Some(Modifier::Upper) if array => {
                return Err(CompileError::unsupported(format!("{path} on an array field")))
            }
            Some(Modifier::Lower) => Term::Column {
                expr: Func::lower(expr).into(),
                array,
            },
            Some(Modifier::Upper) => Term::Column {
                expr: Func::upper(expr).into(),
                array,
            },
            Some(Modifier::Length) => {
                let function = if array { "json_array_length" } else { "length" };
                Term::Column {
                    expr: Func::cust(Alias::new(function)).arg(expr).into(),
                    array: false,
                }
            }
            Some(Modifier::IsSet) => Term::IsSet(expr),
            Some(Modifier::Each) if array => Term::Each(expr),
            // A scalar reached inside a multi relation sub-select.
            Some(Modifier::Each) => Term::Column { expr, array },
            Some(Modifier::Excerpt { .. }) => return Err(CompileError::unsupported(":excerpt")),
        };
        Ok(term)
    }

    fn request_term(&self, path: &FieldPath) -> Result<Term, CompileError> {
        let anonymous = RequestInfo::default();
        let request = self.request.unwrap_or(&anonymous);
        let value = request
            .attribute(path.root, &path.segments)
            .ok_or_else(|| CompileError::unsupported(format!("relation traversal in {path}")))?;
        let value = match &path.modifier {
            Some(Modifier::Each) => {
                return Err(CompileError::unsupported(format!(":each on {path}")))
            }
            Some(modifier) => apply_modifier(value, modifier)
                .map_err(|e| CompileError::unsupported(e.to_string()))?,
            None => value,
        };
        Ok(Term::Bound(value))
    }

    /// Resolves a record path against the current level, registering the
    /// single relation joins needed to reach it. Stops at the first multi
    /// relation and hands the rest of the path back for a sub-select.
    fn column(&self, path: &FieldPath, scope: &mut Scope) -> Result<Resolved, CompileError> {
        let unknown = || CompileError::UnknownField {
            path: path.dotted(),
        };
        let Some((leaf, hops)) = path.segments.split_last() else {
            return Err(unknown());
        };
        if path.relation_depth() > self.config.max_relation_depth {
            return Err(CompileError::DepthExceeded {
                path: path.dotted(),
                max: self.config.max_relation_depth,
            });
        }

        let mut collection = scope.level.collection.clone();
        let mut alias = scope.level.alias.clone();
        for (i, hop) in hops.iter().enumerate() {
            let info = self.schema.field(&collection, hop).ok_or_else(unknown)?;
            let Some(target) = info.relation else {
                return Err(unknown());
            };
            let table = self
                .schema
                .table(&target.collection)
                .ok_or_else(|| CompileError::UnknownCollection(target.collection.clone()))?;

            if target.multiple {
                if self.config.dialect == Dialect::Postgres {
                    return Err(CompileError::unsupported(format!(
                        "multi relation {hop} on postgres"
                    )));
                }
                let mut rest = FieldPath::new(PathRoot::Record, path.segments[i + 1..].to_vec());
                rest.modifier = path.modifier.clone();
                return Ok(Resolved::Related(Related {
                    source: SqlExpr::col((TableName(alias), ColumnName(info.column))).into(),
                    table,
                    collection: target.collection,
                    via: path.segments[..=i].join("."),
                    rest,
                }));
            }

            // Joins are keyed by the full relation path, never by alias text.
            let key = &path.segments[..=i];
            let existing = scope
                .level
                .join_paths
                .iter()
                .position(|joined| joined.as_slice() == key)
                .and_then(|index| scope.level.joins.get(index))
                .map(|join| join.alias.clone());
            alias = match existing {
                Some(joined) => joined,
                None => {
                    let join_alias = scope.alias("rel", hop);
                    scope.level.joins.push(JoinClause {
                        table,
                        alias: join_alias.clone(),
                        source_alias: alias,
                        source_column: info.column,
                    });
                    scope.level.join_paths.push(key.to_vec());
                    join_alias
                }
            };
            collection = target.collection;
        }

        let info = self.schema.field(&collection, leaf).ok_or_else(unknown)?;
        let expr = SqlExpr::col((TableName(alias), ColumnName(info.column.clone()))).into();
        Ok(Resolved::Column(expr, info))
    }

    /// Compiles `build` inside `EXISTS (SELECT 1 FROM json_each(ids) JOIN
    /// target ...)`, with the rest of the related path resolved against the
    /// target table.
    fn within_related<F>(&self, related: Related, scope: &mut Scope, build: F) -> Result<SimpleExpr, CompileError>
    where
        F: FnOnce(&Self, Term, &mut Scope) -> Result<SimpleExpr, CompileError>,
    {
        let ids_alias = scope.alias("each", "");
        let target_alias = scope.alias("rel", &related.collection);
        let inner = Level::new(related.collection.clone(), target_alias.clone());
        let outer = mem::replace(&mut scope.level, inner);
        let condition = self
            .field_term(&related.rest, scope)
            .and_then(|term| build(self, term, scope));
        let inner = mem::replace(&mut scope.level, outer);
        let condition = condition.map_err(|err| match err {
            CompileError::UnknownField { path } => CompileError::UnknownField {
                path: format!("{}.{path}", related.via),
            },
            other => other,
        })?;

        let mut select = Query::select();
        select
            .expr(SqlExpr::cust("1"))
            .from_function(
                Func::cust(Alias::new(JSON_EACH)).arg(related.source),
                TableName(ids_alias.clone()),
            )
            .join_as(
                JoinType::InnerJoin,
                TableName(related.table),
                TableName(target_alias.clone()),
                SqlExpr::col((TableName(target_alias), ColumnName(ID_COLUMN.to_string())))
                    .equals((TableName(ids_alias), ColumnName(JSON_EACH_VALUE.to_string()))),
            );
        for join in &inner.joins {
            select.join_as(
                JoinType::LeftJoin,
                TableName(join.table.clone()),
                TableName(join.alias.clone()),
                join.on(),
            );
        }
        select.and_where(condition);
        Ok(SqlExpr::exists(select))
    }

    fn each_element(&self, scope: &mut Scope) -> Result<(String, SimpleExpr), CompileError> {
        if self.config.dialect == Dialect::Postgres {
            return Err(CompileError::unsupported("JSON array operators on postgres"));
        }
        let alias = scope.alias("each", "");
        let element = SqlExpr::col((
            TableName(alias.clone()),
            ColumnName(JSON_EACH_VALUE.to_string()),
        ))
        .into();
        Ok((alias, element))
    }
}

/// A record path resolved against one query level.
enum Resolved {
    Column(SimpleExpr, FieldInfo),
    Related(Related),
}

fn exists_in_json_each(source: SimpleExpr, alias: &str, condition: SimpleExpr) -> SimpleExpr {
    let mut select = Query::select();
    select
        .expr(SqlExpr::cust("1"))
        .from_function(
            Func::cust(Alias::new(JSON_EACH)).arg(source),
            TableName(alias.to_string()),
        )
        .and_where(condition);
    SqlExpr::exists(select)
}

fn constant(value: bool) -> SimpleExpr {
    SqlExpr::cust(if value { "1 = 1" } else { "1 = 0" })
}

fn op_label(op: Operator) -> String {
    format!("?{op}")
}

/// A pattern with `%` is used as written; anything else becomes a
/// substring match with `\` escaping the LIKE metacharacters.
fn like_pattern(value: &str) -> String {
    if value.contains('%') {
        return value.to_string();
    }
    let mut pattern = String::with_capacity(value.len() + 2);
    pattern.push('%');
    for c in value.chars() {
        if c == '\\' || c == '_' {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn to_sql_value(value: Value) -> Result<SqlValue, CompileError> {
    Ok(match value {
        Value::Null => SqlValue::String(None),
        Value::Bool(b) => b.into(),
        Value::Int(n) => n.into(),
        Value::Float(n) => n.into(),
        Value::Text(s) => s.into(),
        Value::Instant(at) => format_datetime(&at).into(),
        Value::Array(_) => {
            return Err(CompileError::unsupported("array value in a scalar comparison"))
        }
    })
}

/// Renders a bare condition. sea-query renders full statements, so the
/// condition is rendered as the WHERE clause of a constant select.
fn render_predicate(dialect: Dialect, condition: &SimpleExpr) -> (String, Vec<SqlValue>) {
    const PREFIX: &str = "SELECT 1 WHERE ";
    let probe = Query::select()
        .expr(SqlExpr::cust("1"))
        .and_where(condition.clone())
        .to_owned();
    let (sql, values) = match dialect {
        Dialect::Sqlite => probe.build(SqliteQueryBuilder),
        Dialect::Postgres => probe.build(PostgresQueryBuilder),
    };
    let sql = match sql.strip_prefix(PREFIX) {
        Some(predicate) => predicate.to_string(),
        None => sql,
    };
    (sql, values.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Record;
    use crate::date_macro::FixedClock;
    use crate::lexer::tokenize;
    use crate::parser::{ParseOptions, Parser};
    use crate::schema::{CollectionSchema, FieldType, StaticSchema};
    use chrono::{TimeZone, Utc};

    fn schema() -> StaticSchema {
        StaticSchema::new()
            .with_collection(
                "posts",
                CollectionSchema::new("posts")
                    .field("title", FieldType::Text)
                    .field("status", FieldType::Text)
                    .field("views", FieldType::Number)
                    .field("tags", FieldType::Json)
                    .relation("author", "users", false)
                    .relation("editors", "users", true),
            )
            .with_collection(
                "users",
                CollectionSchema::new("users")
                    .field("name", FieldType::Text)
                    .relation("company", "companies", false),
            )
            .with_collection(
                "companies",
                CollectionSchema::new("companies").field("name", FieldType::Text),
            )
    }

    fn parse(source: &str) -> Expr {
        let clock = FixedClock(Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap());
        let tokens = tokenize(source).unwrap();
        Parser::new(&tokens, &clock, ParseOptions::RULE).parse().unwrap()
    }

    fn compile(source: &str) -> Result<CompiledPredicate, CompileError> {
        let schema = schema();
        SqlCompiler::new(&schema, "posts").compile(&parse(source))
    }

    #[test]
    fn test_simple_filter_compilation() {
        let result = compile("status = 'active' && views > 100").unwrap();
        assert_eq!(result.sql, r#""posts"."status" = ? AND "posts"."views" > ?"#);
        assert_eq!(result.params, vec![SqlValue::from("active"), SqlValue::from(100i64)]);
        assert!(result.joins.is_empty());
    }

    #[test]
    fn test_values_are_never_inlined() {
        let result = compile(r#"title = "x'; DROP TABLE posts; --""#).unwrap();
        assert!(!result.sql.contains("DROP"));
        assert_eq!(result.params, vec![SqlValue::from("x'; DROP TABLE posts; --")]);
    }

    #[test]
    fn test_postgres_placeholders() {
        let schema = schema();
        let config = CompilerConfig {
            dialect: Dialect::Postgres,
            ..Default::default()
        };
        let result = SqlCompiler::new(&schema, "posts")
            .with_config(config)
            .compile(&parse("status = 'a' || views >= 2"))
            .unwrap();
        assert!(result.sql.contains("$1"));
        assert!(result.sql.contains("$2"));
    }

    #[test]
    fn test_inequality_keeps_sql_null_semantics() {
        let result = compile("status != 'draft'").unwrap();
        assert_eq!(result.sql, r#""posts"."status" <> ?"#);

        let schema = schema();
        let config = CompilerConfig {
            dialect: Dialect::Postgres,
            ..Default::default()
        };
        let result = SqlCompiler::new(&schema, "posts")
            .with_config(config)
            .compile(&parse("status != 'draft'"))
            .unwrap();
        assert_eq!(result.sql, r#""posts"."status" <> $1"#);
    }

    #[test]
    fn test_null_comparisons() {
        let result = compile("title = null").unwrap();
        assert_eq!(result.sql, r#""posts"."title" IS NULL"#);
        let result = compile("title != null").unwrap();
        assert_eq!(result.sql, r#""posts"."title" IS NOT NULL"#);
        assert!(result.params.is_empty());
    }

    #[test]
    fn test_like_wraps_plain_values() {
        let result = compile("title ~ 'a_b'").unwrap();
        assert!(result.sql.contains("LIKE"));
        assert_eq!(result.params.first(), Some(&SqlValue::from(r"%a\_b%")));

        let result = compile("title !~ 'Hello%'").unwrap();
        assert!(result.sql.contains("NOT LIKE"));
        assert_eq!(result.params.first(), Some(&SqlValue::from("Hello%")));
    }

    #[test]
    fn test_relation_joins() {
        let result = compile("author.name = 'Ada' && author.company.name = 'Acme'").unwrap();
        let aliases: Vec<_> = result.joins.iter().map(|j| j.alias.as_str()).collect();
        assert_eq!(aliases, vec!["__rel1_author", "__rel2_company"]);
        assert_eq!(result.joins[1].source_alias, "__rel1_author");

        let (sql, params) = result.to_select_sql();
        assert!(sql.contains(r#"LEFT JOIN "users" AS "__rel1_author""#));
        assert!(sql.contains(r#"LEFT JOIN "companies" AS "__rel2_company""#));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_join_aliases_follow_the_relation_path() {
        let schema = StaticSchema::new()
            .with_collection(
                "posts",
                CollectionSchema::new("posts")
                    .relation("a", "users", false)
                    .relation("a_b", "companies", false),
            )
            .with_collection("users", CollectionSchema::new("users").relation("b", "companies", false))
            .with_collection("companies", CollectionSchema::new("companies").field("name", FieldType::Text));

        let result = SqlCompiler::new(&schema, "posts")
            .compile(&parse("a_b.name = 'x' && a.b.name = 'y'"))
            .unwrap();
        let joins: Vec<_> = result
            .joins
            .iter()
            .map(|j| (j.table.as_str(), j.alias.as_str(), j.source_alias.as_str()))
            .collect();
        assert_eq!(
            joins,
            vec![
                ("companies", "__rel1_a_b", "posts"),
                ("users", "__rel2_a", "posts"),
                ("companies", "__rel3_b", "__rel2_a"),
            ]
        );
        assert_eq!(
            result.sql,
            r#""__rel1_a_b"."name" = ? AND "__rel3_b"."name" = ?"#
        );
    }

    #[test]
    fn test_multi_relation_needs_quantifier() {
        let err = compile("editors.name = 'Ada'").unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { .. }));

        let result = compile("editors.name ?= ['Ada', 'Bob']").unwrap();
        assert!(result.joins.is_empty());
        assert!(result.sql.starts_with("EXISTS (SELECT 1 FROM json_each("));
        assert!(result.sql.contains(
            r#"INNER JOIN "users" AS "__rel2_users" ON "__rel2_users"."id" = "__each1"."value""#
        ));
        assert!(result.sql.contains(r#""__rel2_users"."name" = ? OR "__rel2_users"."name" = ?"#));

        let (sql, _) = result.to_select_sql();
        assert!(sql.starts_with(r#"SELECT "posts".* FROM "posts" WHERE"#));
        assert!(!sql.contains("DISTINCT"));
        assert!(!sql.contains("LEFT JOIN"));
    }

    #[test]
    fn test_multi_relation_quantifiers_stay_per_record() {
        let negated = compile("!(editors.name ?= ['Ada'])").unwrap();
        assert!(negated.sql.starts_with("NOT"));
        assert_eq!(negated.sql.matches("EXISTS (SELECT 1 FROM json_each(").count(), 1);
        assert!(negated.joins.is_empty());

        let both = compile("editors.name ?= ['Ada'] && editors.name ?= ['Bob']").unwrap();
        assert_eq!(both.sql.matches("EXISTS (SELECT 1").count(), 2);
        assert!(both.sql.contains(" AND "));
        assert!(!both.sql.contains("DISTINCT"));
        assert!(both.joins.is_empty());
        assert_eq!(both.params, vec![SqlValue::from("Ada"), SqlValue::from("Bob")]);
    }

    #[test]
    fn test_joins_inside_multi_relation_stay_in_the_subselect() {
        let result = compile("editors.company.name ?= ['Acme']").unwrap();
        assert!(result.joins.is_empty());
        assert!(result.sql.contains(r#"LEFT JOIN "companies" AS "__rel3_company" ON "__rel3_company"."id" = "__rel2_users"."company""#));
        assert!(result.sql.contains(r#"WHERE "__rel3_company"."name" = ?"#));

        let result = compile("editors.name:each ~ 'bo'").unwrap();
        assert!(result.sql.starts_with("EXISTS"));
        assert!(result.sql.contains("LIKE"));

        assert_eq!(
            compile("editors.missing ?= ['x']").unwrap_err(),
            CompileError::UnknownField {
                path: "editors.missing".to_string()
            }
        );
    }

    #[test]
    fn test_json_array_quantifier_and_each() {
        let result = compile("tags ?= ['news', 'tech']").unwrap();
        assert!(result.sql.starts_with("EXISTS"));
        assert!(result.sql.contains("json_each"));
        assert_eq!(result.params, vec![SqlValue::from("news"), SqlValue::from("tech")]);

        let result = compile("tags:each ~ 'ec'").unwrap();
        assert!(result.sql.contains("EXISTS"));
        assert!(result.sql.contains("LIKE"));

        let result = compile("tags ?= []").unwrap();
        assert!(result.sql.contains("1 = 0"));
    }

    #[test]
    fn test_each_on_the_right_hand_side() {
        let result = compile("'tech' = tags:each").unwrap();
        assert!(result.sql.starts_with("EXISTS (SELECT 1 FROM json_each("));
        assert!(result.sql.contains(r#""posts"."tags""#));
        assert!(result.sql.contains(r#"WHERE ? = "__each1"."value""#));
        assert_eq!(result.params, vec![SqlValue::from("tech")]);
    }

    #[test]
    fn test_json_arrays_unsupported_on_postgres() {
        let schema = schema();
        let config = CompilerConfig {
            dialect: Dialect::Postgres,
            ..Default::default()
        };
        let err = SqlCompiler::new(&schema, "posts")
            .with_config(config)
            .compile(&parse("tags ?= ['news']"))
            .unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { .. }));
    }

    #[test]
    fn test_modifiers() {
        let result = compile("title:lower = 'x'").unwrap();
        assert!(result.sql.starts_with(r#"LOWER("posts"."title")"#));
        let result = compile("tags:length > 2").unwrap();
        assert!(result.sql.contains("json_array_length"));
        let result = compile("title:isset = false").unwrap();
        assert_eq!(result.sql, r#""posts"."title" IS NULL"#);

        assert!(compile("title:isset > 1").is_err());
        assert!(compile("title:excerpt(10) = 'x'").is_err());
    }

    #[test]
    fn test_request_values_are_bound() {
        let schema = schema();
        let request = RequestInfo::new("get").with_auth(Record::new("users").with("id", "u1"));
        let result = SqlCompiler::new(&schema, "posts")
            .with_request(&request)
            .compile(&parse("author = @request.auth.id && @request.method = 'GET'"))
            .unwrap();
        assert_eq!(
            result.params,
            vec![SqlValue::from("u1"), SqlValue::from("GET"), SqlValue::from("GET")]
        );
    }

    #[test]
    fn test_anonymous_request_binds_null() {
        let result = compile("@request.auth.id != ''").unwrap();
        assert_eq!(result.sql, "? IS NOT NULL");
    }

    #[test]
    fn test_datetime_macro_is_bound_as_text() {
        let result = compile("created > @day-7").unwrap();
        assert_eq!(result.params, vec![SqlValue::from("2025-01-08 12:00:00.000Z")]);
    }

    #[test]
    fn test_unknown_fields() {
        assert_eq!(
            compile("missing = 1").unwrap_err(),
            CompileError::UnknownField {
                path: "missing".to_string()
            }
        );
        assert_eq!(
            compile("title.name = 1").unwrap_err(),
            CompileError::UnknownField {
                path: "title.name".to_string()
            }
        );
        let schema = schema();
        let err = SqlCompiler::new(&schema, "nope").compile(&parse("id = 1")).unwrap_err();
        assert_eq!(err, CompileError::UnknownCollection("nope".to_string()));
    }

    #[test]
    fn test_depth_limit() {
        let schema = schema();
        let config = CompilerConfig {
            max_relation_depth: 1,
            ..Default::default()
        };
        let err = SqlCompiler::new(&schema, "posts")
            .with_config(config)
            .compile(&parse("author.company.name = 'x'"))
            .unwrap_err();
        assert!(matches!(err, CompileError::DepthExceeded { max: 1, .. }));
    }

    #[test]
    fn test_grouping_is_preserved() {
        let result = compile("(status = 'a' || status = 'b') && views > 1").unwrap();
        assert!(result.sql.starts_with('('));
        assert_eq!(result.params.len(), 3);
    }
}
