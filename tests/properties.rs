use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sea_query::Value as SqlValue;

use record_filter::ast::{Literal, Operand};
use record_filter::policy::Action;
use record_filter::schema::{CollectionSchema, FieldType, StaticSchema};
use record_filter::{
    evaluate, parse, parse_with, AccessGate, EvalLimits, EvaluationContext, Expr, FixedClock,
    ParseOptions, Record, RequestInfo, Rule, RuleSet, SqlCompiler,
};

const EXPRESSIONS: &[&str] = &[
    "status=active&&views>=100",
    "tags?=[news,tech,'with space']",
    r#"title~"Hello" || title!~'it\'s'"#,
    "!(a = 1 || b != 2.5) && c <= -3",
    "created > @day-7 && updated < @todayEnd",
    "@request.auth.id = @record.user_id",
    "@request.auth.id = owner && @request.method = 'GET'",
    "author.name:lower ~ 'ada' && tags:length > 2",
    "tags ?!= [spam] && tags:each = 'news'",
    "a = null && b != null && c = true",
    r#"summary:excerpt(10, "..") = 'x'"#,
    "@request.headers.x_token = 'abc' && @request.context != 'realtime'",
];

fn clock() -> FixedClock {
    FixedClock(Utc.with_ymd_and_hms(2025, 1, 15, 8, 30, 0).unwrap())
}

fn parse_fixed(source: &str) -> Expr {
    parse_with(source, ParseOptions::RULE, &clock()).unwrap()
}

fn sample() -> EvaluationContext {
    let record = Record::new("posts")
        .with("id", "p1")
        .with("status", "active")
        .with("views", 150i64)
        .with("title", "say hello world")
        .with("tags", vec!["news", "tech"])
        .with("user_id", "u1")
        .with("created", "2025-01-12 10:00:00.000Z");
    let request = RequestInfo::new("get").with_auth(Record::new("users").with("id", "u1"));
    EvaluationContext::new(record, request)
}

#[test]
fn printing_and_reparsing_gives_the_same_tree() {
    for source in EXPRESSIONS {
        let expr = parse_fixed(source);
        let printed = expr.to_string();
        let reparsed = parse_fixed(&printed);
        assert_eq!(expr, reparsed, "round trip of {source} via {printed}");
        assert_eq!(printed, reparsed.to_string());
    }
}

#[test]
fn evaluation_is_deterministic() {
    let ctx = sample();
    for source in EXPRESSIONS {
        let expr = parse_fixed(source);
        let first = evaluate(&expr, &ctx);
        for _ in 0..5 {
            assert_eq!(evaluate(&expr, &ctx), first, "{source}");
        }
    }
}

#[test]
fn macros_share_one_snapshot() {
    let expr = parse_fixed("created <= @now && updated >= @now");
    let Expr::And(left, right) = &expr else {
        panic!("expected a conjunction, got {expr:?}");
    };
    let instant = |e: &Expr| match e {
        Expr::Comparison {
            right: Operand::Literal(Literal::Instant { at, .. }),
            ..
        } => *at,
        other => panic!("expected a macro comparison, got {other:?}"),
    };
    assert_eq!(instant(left), instant(right));
    assert_eq!(instant(left), clock().0);

    let record = Record::new("posts")
        .with("created", "2025-01-15 08:30:00.000Z")
        .with("updated", "2025-01-15 08:30:00.000Z");
    let ctx = EvaluationContext::new(record, RequestInfo::new("GET"));
    assert!(evaluate(&expr, &ctx).unwrap());
}

#[test]
fn missing_fields_resolve_to_false() {
    let empty = EvaluationContext::new(Record::new("posts"), RequestInfo::new("GET"));
    for source in [
        "status = 'active'",
        "views > 10",
        "title ~ 'x'",
        "tags ?= [a]",
        "author.name = 'ada'",
        "@request.auth.id = owner",
    ] {
        assert_eq!(evaluate(&parse(source).unwrap(), &empty), Ok(false), "{source}");
    }
}

#[test]
fn rules_fail_closed() {
    let rules = RuleSet {
        view: Rule::parse(Some("tags > 3"), &clock()).unwrap(),
        list: Rule::parse(Some(""), &clock()).unwrap(),
        ..RuleSet::default()
    };
    let gate = AccessGate::default();
    let ctx = sample();

    // ordering an array is a type error, which denies
    assert!(evaluate(rules.view.expr().unwrap(), &ctx).is_err());
    assert!(!gate.allows(&rules, Action::View, &ctx));
    assert!(gate.allows(&rules, Action::List, &ctx));
    assert!(!gate.allows(&rules, Action::Delete, &ctx));

    let starved = AccessGate::new(EvalLimits { max_steps: 1 });
    let public = Rule::parse(Some("status = 'active' && views > 1"), &clock()).unwrap();
    assert!(gate.check(&public, &ctx));
    assert!(!starved.check(&public, &ctx));
}

#[test]
fn compiled_sql_never_contains_literals() {
    let schema = StaticSchema::new().with_collection(
        "posts",
        CollectionSchema::new("posts")
            .field("title", FieldType::Text)
            .field("views", FieldType::Number),
    );
    let hostile = "x' OR '1'='1";
    let expr = parse(&format!(r#"title = "{hostile}" || title ~ "{hostile}" || views > 42"#)).unwrap();
    let compiled = SqlCompiler::new(&schema, "posts").compile(&expr).unwrap();

    assert!(!compiled.sql.contains("OR '1'"));
    assert!(!compiled.sql.contains("42"));
    assert_eq!(compiled.params.len(), 3);
    assert_eq!(compiled.params[0], SqlValue::from(hostile));
    assert_eq!(compiled.params[2], SqlValue::from(42i64));
}

#[test]
fn shared_trees_evaluate_in_parallel() {
    let expr = Arc::new(parse("status = active && views >= 100").unwrap());
    let ctx = sample();
    let results: Vec<bool> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let expr = Arc::clone(&expr);
                let ctx = &ctx;
                scope.spawn(move || evaluate(&expr, ctx).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(results.into_iter().all(|matched| matched));
}
