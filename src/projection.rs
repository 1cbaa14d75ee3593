//! Field projections: `fields=title,body:excerpt(200,true),author.name`.

use std::collections::BTreeMap;

use crate::ast::FieldPath;
use crate::context::EvaluationContext;
use crate::date_macro::SystemClock;
use crate::error::{EvalError, FilterError};
use crate::evaluator::Evaluator;
use crate::lexer::tokenize;
use crate::parser::{ParseOptions, Parser};
use crate::value::Value;

/// A parsed comma-separated field list.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSelection {
    fields: Vec<FieldPath>,
}

impl FieldSelection {
    pub fn parse(source: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(source)?;
        let fields = Parser::new(&tokens, &SystemClock, ParseOptions::FILTER).parse_field_list()?;
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[FieldPath] {
        &self.fields
    }

    /// Resolves every selected field, keyed by the field as written
    /// (root and modifier included) so `title` and `title:upper` stay apart.
    /// Modifiers such as `:excerpt` are applied to the value.
    pub fn apply(&self, ctx: &EvaluationContext) -> Result<BTreeMap<String, Value>, EvalError> {
        let evaluator = Evaluator::new(ctx);
        self.fields
            .iter()
            .map(|path| Ok((path.to_string(), evaluator.resolve_field(path)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Modifier;
    use crate::context::{Record, RequestInfo};

    #[test]
    fn test_parse_and_apply() {
        let selection = FieldSelection::parse("title, body:excerpt(5, true)").unwrap();
        assert_eq!(selection.fields().len(), 2);
        assert_eq!(
            selection.fields()[1].modifier,
            Some(Modifier::Excerpt {
                max_chars: 5,
                ellipsis: "...".to_string()
            })
        );

        let record = Record::new("posts")
            .with("title", "Hello")
            .with("body", "Lorem ipsum dolor");
        let ctx = EvaluationContext::new(record, RequestInfo::default());
        let projected = selection.apply(&ctx).unwrap();
        assert_eq!(projected["title"], Value::from("Hello"));
        let excerpt_key = selection.fields()[1].to_string();
        assert!(excerpt_key.starts_with("body:excerpt(5, "));
        assert_eq!(projected[&excerpt_key], Value::from("Lorem..."));
    }

    #[test]
    fn test_same_field_with_different_modifiers_or_roots() {
        let selection = FieldSelection::parse("title, title:upper, @request.auth.title").unwrap();
        let record = Record::new("posts").with("title", "Hello");
        let request = RequestInfo::default().with_auth(Record::new("users").with("title", "Admin"));
        let ctx = EvaluationContext::new(record, request);

        let projected = selection.apply(&ctx).unwrap();
        assert_eq!(projected.len(), 3);
        assert_eq!(projected["title"], Value::from("Hello"));
        assert_eq!(projected["title:upper"], Value::from("HELLO"));
        assert_eq!(projected["@request.auth.title"], Value::from("Admin"));
    }

    #[test]
    fn test_missing_fields_project_as_null() {
        let selection = FieldSelection::parse("missing").unwrap();
        let ctx = EvaluationContext::new(Record::new("posts"), RequestInfo::default());
        assert_eq!(selection.apply(&ctx).unwrap()["missing"], Value::Null);
    }

    #[test]
    fn test_rejects_expressions() {
        assert!(FieldSelection::parse("title = 'x'").is_err());
        assert!(FieldSelection::parse("title,").is_err());
    }
}
