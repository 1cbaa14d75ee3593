//! Builds evaluation contexts for the two in-process callers: access checks
//! on a single stored record, and realtime delivery of mutation events.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::ast::{Expr, FieldPath, PathRoot};
use crate::context::{
    EvaluationContext, Parent, Record, RelationArena, RequestContext, RequestInfo,
    DEFAULT_MAX_RELATION_DEPTH,
};
use crate::error::ResolveError;
use crate::schema::SchemaLookup;
use crate::value::Value;

/// Storage collaborator that loads related records by id.
pub trait RelationResolver: Send + Sync {
    /// Records of `collection` with the given ids. Missing ids are skipped.
    fn fetch(&self, collection: &str, ids: &[String]) -> Result<Vec<Record>, ResolveError>;
}

/// Loads the related records an expression traverses, up to a bounded depth.
pub struct Prefetcher<'a> {
    schema: &'a dyn SchemaLookup,
    resolver: &'a dyn RelationResolver,
    max_depth: usize,
}

impl<'a> Prefetcher<'a> {
    pub fn new(schema: &'a dyn SchemaLookup, resolver: &'a dyn RelationResolver) -> Self {
        Self {
            schema,
            resolver,
            max_depth: DEFAULT_MAX_RELATION_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Fetches every relation hop made by the record and auth paths in
    /// `exprs`. Each `(parent, field)` pair is fetched at most once.
    pub fn prefetch(
        &self,
        exprs: &[&Expr],
        record: &Record,
        auth: Option<&Record>,
    ) -> Result<RelationArena, ResolveError> {
        let mut arena = RelationArena::new(self.max_depth);
        let mut fetched: HashSet<(Parent, String)> = HashSet::new();
        let mut paths: Vec<&FieldPath> = Vec::new();
        for &expr in exprs {
            expr.walk_fields(&mut |path| {
                if path.segments.len() > 1 && matches!(path.root, PathRoot::Record | PathRoot::Auth) {
                    paths.push(path);
                }
            });
        }

        for path in paths {
            let (start, root_collection) = match (path.root, auth) {
                (PathRoot::Auth, Some(auth)) => (Parent::Auth, auth.collection.clone()),
                (PathRoot::Auth, None) => continue,
                _ => (Parent::Record, record.collection.clone()),
            };
            let hops = &path.segments[..path.segments.len() - 1];
            if hops.len() > self.max_depth {
                warn!(%path, max = self.max_depth, "relation path deeper than prefetch limit");
            }

            let mut frontier = vec![(start, root_collection)];
            for hop in hops.iter().take(self.max_depth) {
                let mut next = Vec::new();
                for (parent, collection) in frontier {
                    let Some(target) = self.schema.field(&collection, hop).and_then(|f| f.relation)
                    else {
                        continue;
                    };
                    if fetched.insert((parent, hop.clone())) {
                        let ids = match source_record(&arena, parent, record, auth) {
                            Some(source) => relation_ids(source.get(hop)),
                            None => Vec::new(),
                        };
                        if !ids.is_empty() {
                            let related = self.resolver.fetch(&target.collection, &ids)?;
                            debug!(
                                collection = %target.collection,
                                requested = ids.len(),
                                found = related.len(),
                                "prefetched related records"
                            );
                            for entry in order_by_ids(related, &ids) {
                                arena.insert(parent, hop.as_str(), entry);
                            }
                        }
                    }
                    next.extend(
                        arena
                            .children(parent, hop)
                            .map(|(index, _)| (Parent::Entry(index), target.collection.clone())),
                    );
                }
                frontier = next;
            }
        }
        Ok(arena)
    }
}

fn source_record<'r>(
    arena: &'r RelationArena,
    parent: Parent,
    record: &'r Record,
    auth: Option<&'r Record>,
) -> Option<&'r Record> {
    match parent {
        Parent::Record => Some(record),
        Parent::Auth => auth,
        Parent::Entry(index) => arena.get(index).map(|entry| &entry.record),
    }
}

/// Ids stored in a relation field: a single id or a JSON array of ids.
fn relation_ids(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Text(id)) if !id.is_empty() => vec![id.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Text(id) if !id.is_empty() => Some(id.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Keeps the stored id order so multi relations resolve deterministically.
fn order_by_ids(mut records: Vec<Record>, ids: &[String]) -> Vec<Record> {
    records.sort_by_key(|record| {
        record
            .id()
            .and_then(|id| ids.iter().position(|candidate| candidate == id))
            .unwrap_or(usize::MAX)
    });
    records
}

/// Assembles evaluation contexts, prefetching relations when configured to.
#[derive(Default)]
pub struct ContextBuilder<'a> {
    prefetcher: Option<Prefetcher<'a>>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new() -> Self {
        Self { prefetcher: None }
    }

    pub fn with_prefetcher(mut self, prefetcher: Prefetcher<'a>) -> Self {
        self.prefetcher = Some(prefetcher);
        self
    }

    /// Context for checking an access rule against one stored record.
    pub fn for_record(
        &self,
        record: Record,
        request: RequestInfo,
        exprs: &[&Expr],
    ) -> Result<EvaluationContext, ResolveError> {
        let related = match &self.prefetcher {
            Some(prefetcher) => prefetcher.prefetch(exprs, &record, request.auth.as_ref())?,
            None => RelationArena::default(),
        };
        Ok(EvaluationContext::new(record, request).with_related(related))
    }

    /// Context for delivering `event` to `subscription`. Returns `None` when
    /// the event carries no record to test.
    pub fn for_event(
        &self,
        event: &MutationEvent,
        subscription: &Subscription,
        exprs: &[&Expr],
    ) -> Result<Option<EvaluationContext>, ResolveError> {
        let Some(subject) = event.subject() else {
            return Ok(None);
        };
        let request = subscription
            .request
            .clone()
            .with_context(RequestContext::Realtime);
        self.for_record(subject.clone(), request, exprs).map(Some)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

/// A record change broadcast to realtime subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEvent {
    pub action: MutationAction,
    pub collection: String,
    pub before: Option<Record>,
    pub after: Option<Record>,
}

impl MutationEvent {
    pub fn created(record: Record) -> Self {
        Self {
            action: MutationAction::Create,
            collection: record.collection.clone(),
            before: None,
            after: Some(record),
        }
    }

    pub fn updated(before: Record, after: Record) -> Self {
        Self {
            action: MutationAction::Update,
            collection: after.collection.clone(),
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn deleted(record: Record) -> Self {
        Self {
            action: MutationAction::Delete,
            collection: record.collection.clone(),
            before: Some(record),
            after: None,
        }
    }

    /// The record filters are tested against: the removed record for
    /// deletes, the new state otherwise.
    pub fn subject(&self) -> Option<&Record> {
        match self.action {
            MutationAction::Delete => self.before.as_ref(),
            MutationAction::Create | MutationAction::Update => self.after.as_ref(),
        }
    }
}

/// A realtime client's interest in one collection.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub collection: String,
    /// Optional client filter, parsed once at subscribe time.
    pub filter: Option<std::sync::Arc<Expr>>,
    /// The subscriber's request info, captured at subscribe time.
    pub request: RequestInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_macro::SystemClock;
    use crate::evaluator::evaluate;
    use crate::lexer::tokenize;
    use crate::parser::{ParseOptions, Parser};
    use crate::schema::{CollectionSchema, FieldType, StaticSchema};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemoryStore {
        records: HashMap<String, Vec<Record>>,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl MemoryStore {
        fn new(records: Vec<Record>) -> Self {
            let mut by_collection: HashMap<String, Vec<Record>> = HashMap::new();
            for record in records {
                by_collection.entry(record.collection.clone()).or_default().push(record);
            }
            Self {
                records: by_collection,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl RelationResolver for MemoryStore {
        fn fetch(&self, collection: &str, ids: &[String]) -> Result<Vec<Record>, ResolveError> {
            self.calls.lock().unwrap().push((collection.to_string(), ids.to_vec()));
            let records = self.records.get(collection).cloned().unwrap_or_default();
            Ok(records
                .into_iter()
                .filter(|r| r.id().is_some_and(|id| ids.iter().any(|i| i == id)))
                .collect())
        }
    }

    struct FailingStore;

    impl RelationResolver for FailingStore {
        fn fetch(&self, collection: &str, _ids: &[String]) -> Result<Vec<Record>, ResolveError> {
            Err(ResolveError {
                collection: collection.to_string(),
                message: "connection refused".to_string(),
            })
        }
    }

    fn schema() -> StaticSchema {
        StaticSchema::new()
            .with_collection(
                "posts",
                CollectionSchema::new("posts")
                    .field("title", FieldType::Text)
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

    fn store() -> MemoryStore {
        MemoryStore::new(vec![
            Record::new("users").with("id", "u1").with("name", "Ada").with("company", "c1"),
            Record::new("users").with("id", "u2").with("name", "Bob"),
            Record::new("companies").with("id", "c1").with("name", "Acme"),
        ])
    }

    fn parse(source: &str) -> Expr {
        let tokens = tokenize(source).unwrap();
        Parser::new(&tokens, &SystemClock, ParseOptions::RULE).parse().unwrap()
    }

    fn post() -> Record {
        Record::new("posts")
            .with("id", "p1")
            .with("author", "u1")
            .with("editors", vec!["u2", "u1"])
    }

    #[test]
    fn test_prefetch_follows_nested_relations() {
        let schema = schema();
        let store = store();
        let builder = ContextBuilder::new().with_prefetcher(Prefetcher::new(&schema, &store));
        let expr = parse("author.company.name = 'Acme'");
        let ctx = builder.for_record(post(), RequestInfo::default(), &[&expr]).unwrap();
        assert_eq!(ctx.related().len(), 2);
        assert!(evaluate(&expr, &ctx).unwrap());
    }

    #[test]
    fn test_prefetch_fetches_each_hop_once() {
        let schema = schema();
        let store = store();
        let prefetcher = Prefetcher::new(&schema, &store);
        let first = parse("author.name = 'Ada' && author.company.name = 'Acme'");
        let second = parse("author.name != ''");
        prefetcher.prefetch(&[&first, &second], &post(), None).unwrap();
        let calls = store.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                ("users".to_string(), vec!["u1".to_string()]),
                ("companies".to_string(), vec!["c1".to_string()]),
            ]
        );
    }

    #[test]
    fn test_multi_relation_keeps_stored_order() {
        let schema = schema();
        let store = store();
        let builder = ContextBuilder::new().with_prefetcher(Prefetcher::new(&schema, &store));
        let expr = parse("editors.name ?= ['Bob']");
        let ctx = builder.for_record(post(), RequestInfo::default(), &[&expr]).unwrap();
        let names = ctx.resolve(&FieldPath::record(["editors", "name"])).unwrap();
        assert_eq!(names, Value::from(vec!["Bob", "Ada"]));
        assert!(evaluate(&expr, &ctx).unwrap());
    }

    #[test]
    fn test_prefetch_respects_depth_limit() {
        let schema = schema();
        let store = store();
        let prefetcher = Prefetcher::new(&schema, &store).with_max_depth(1);
        let expr = parse("author.company.name = 'Acme'");
        let arena = prefetcher.prefetch(&[&expr], &post(), None).unwrap();
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_auth_relations_are_prefetched() {
        let schema = schema();
        let store = store();
        let builder = ContextBuilder::new().with_prefetcher(Prefetcher::new(&schema, &store));
        let expr = parse("@request.auth.company.name = 'Acme'");
        let auth = Record::new("users").with("id", "u1").with("company", "c1");
        let ctx = builder
            .for_record(post(), RequestInfo::default().with_auth(auth), &[&expr])
            .unwrap();
        assert!(evaluate(&expr, &ctx).unwrap());
    }

    #[test]
    fn test_resolver_errors_propagate() {
        let schema = schema();
        let builder = ContextBuilder::new().with_prefetcher(Prefetcher::new(&schema, &FailingStore));
        let expr = parse("author.name = 'Ada'");
        let err = builder.for_record(post(), RequestInfo::default(), &[&expr]).unwrap_err();
        assert_eq!(err.collection, "users");
    }

    #[test]
    fn test_event_subject() {
        let before = Record::new("posts").with("status", "old");
        let after = Record::new("posts").with("status", "new");
        let update = MutationEvent::updated(before.clone(), after.clone());
        assert_eq!(update.subject(), Some(&after));
        let delete = MutationEvent::deleted(before.clone());
        assert_eq!(delete.subject(), Some(&before));
        assert_eq!(MutationEvent::created(after.clone()).subject(), Some(&after));
    }

    #[test]
    fn test_event_context_is_realtime() {
        let subscription = Subscription {
            id: "s1".to_string(),
            collection: "posts".to_string(),
            filter: None,
            request: RequestInfo::new("get"),
        };
        let event = MutationEvent::created(post());
        let ctx = ContextBuilder::new()
            .for_event(&event, &subscription, &[])
            .unwrap()
            .unwrap();
        assert_eq!(ctx.request().context, RequestContext::Realtime);
        assert_eq!(ctx.record().id(), Some("p1"));
    }
}
