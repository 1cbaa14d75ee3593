use chrono::{TimeZone, Utc};
use sea_query::Value as SqlValue;

use record_filter::error::CompileError;
use record_filter::schema::{CollectionSchema, FieldType, StaticSchema};
use record_filter::{
    evaluate, parse, parse_with, EvaluationContext, FilterError, FixedClock, ParseOptions, Record,
    RequestInfo, SqlCompiler,
};

fn eval(source: &str, record: Record) -> bool {
    let expr = parse(source).unwrap();
    evaluate(&expr, &EvaluationContext::new(record, RequestInfo::new("GET"))).unwrap()
}

fn posts_schema() -> StaticSchema {
    StaticSchema::new().with_collection(
        "posts",
        CollectionSchema::new("posts")
            .field("status", FieldType::Text)
            .field("views", FieldType::Number)
            .field("title", FieldType::Text)
            .field("tags", FieldType::Json)
            .field("user_id", FieldType::Text),
    )
}

#[test]
fn active_and_popular() {
    let record = Record::new("posts").with("status", "active").with("views", 150i64);
    assert!(eval("status=active&&views>=100", record.clone()));
    assert!(!eval("status=active&&views>=200", record));
}

#[test]
fn any_tag_matches() {
    let record = Record::new("posts").with("tags", vec!["tech", "life"]);
    assert!(eval("tags?=[news,tech]", record.clone()));
    assert!(!eval("tags?=[news,sport]", record));
}

#[test]
fn contains_ignores_case() {
    let record = Record::new("posts").with("title", "say hello world");
    assert!(eval(r#"title~"Hello""#, record.clone()));
    assert!(!eval(r#"title!~"Hello""#, record));
}

#[test]
fn day_offset_resolves_against_the_clock() {
    let clock = FixedClock(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
    let expr = parse_with("created>@day-7", ParseOptions::FILTER, &clock).unwrap();

    let recent = Record::new("posts").with("created", "2025-01-10 09:30:00.000Z");
    let old = Record::new("posts").with("created", "2025-01-07 23:59:59.999Z");
    let boundary = Record::new("posts").with("created", "2025-01-08 00:00:00.000Z");
    let ctx = |record| EvaluationContext::new(record, RequestInfo::new("GET"));
    assert!(evaluate(&expr, &ctx(recent)).unwrap());
    assert!(!evaluate(&expr, &ctx(old)).unwrap());
    assert!(!evaluate(&expr, &ctx(boundary)).unwrap());

    let schema = posts_schema();
    let compiled = SqlCompiler::new(&schema, "posts").compile(&expr).unwrap();
    assert_eq!(compiled.sql, r#""posts"."created" > ?"#);
    assert_eq!(compiled.params, vec![SqlValue::from("2025-01-08 00:00:00.000Z")]);
}

#[test]
fn auth_matches_owner() {
    let expr = parse("@request.auth.id = @record.user_id").unwrap();
    let request = RequestInfo::new("GET").with_auth(Record::new("users").with("id", "u1"));

    let mine = Record::new("posts").with("user_id", "u1");
    let theirs = Record::new("posts").with("user_id", "u2");
    assert!(evaluate(&expr, &EvaluationContext::new(mine, request.clone())).unwrap());
    assert!(!evaluate(&expr, &EvaluationContext::new(theirs, request)).unwrap());

    let guest = EvaluationContext::new(Record::new("posts").with("user_id", "u1"), RequestInfo::new("GET"));
    assert!(!evaluate(&expr, &guest).unwrap());
}

#[test]
fn unknown_field_is_reported() {
    let schema = posts_schema();
    let expr = parse("unknown_field=1").unwrap();
    let err = SqlCompiler::new(&schema, "posts").compile(&expr).unwrap_err();
    assert!(matches!(err, CompileError::UnknownField { path } if path == "unknown_field"));
}

#[test]
fn hostile_nesting_is_a_parse_error() {
    let parens = format!("{}status = 1{}", "(".repeat(50_000), ")".repeat(50_000));
    assert!(matches!(parse(&parens), Err(FilterError::Parse(_))));

    let negations = format!("{}status = 1", "!".repeat(50_000));
    assert!(matches!(parse(&negations), Err(FilterError::Parse(_))));

    let long_chain = vec!["views > 1"; 10_000].join(" && ");
    assert!(matches!(parse(&long_chain), Err(FilterError::Parse(_))));

    let fine = format!("{}status = 1{}", "(".repeat(10), ")".repeat(10));
    let record = Record::new("posts").with("status", 1i64);
    assert!(eval(&fine, record));
}
