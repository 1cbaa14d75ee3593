//! Evaluation context: the record under test, the request that triggered the
//! check, and the related records reachable through relation fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ast::{FieldPath, PathRoot};
use crate::error::EvalError;
use crate::value::Value;

/// A stored record as seen by the engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub collection: String,
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Builds a record from a JSON object. Non-object input yields `None`.
    pub fn from_json(collection: impl Into<String>, json: serde_json::Value) -> Option<Self> {
        let serde_json::Value::Object(map) = json else {
            return None;
        };
        Some(Self {
            collection: collection.into(),
            fields: map.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn id(&self) -> Option<&str> {
        match self.fields.get("id") {
            Some(Value::Text(id)) => Some(id),
            _ => None,
        }
    }
}

/// Which surface issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestContext {
    #[default]
    Default,
    Realtime,
}

impl RequestContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestContext::Default => "default",
            RequestContext::Realtime => "realtime",
        }
    }
}

/// The request attributes reachable through `@request.*`.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub context: RequestContext,
    pub auth: Option<Record>,
    pub is_superuser: bool,
    pub data: BTreeMap<String, Value>,
    /// Keys are normalized with [`normalize_header`].
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            ..Self::default()
        }
    }

    pub fn with_auth(mut self, auth: Record) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_superuser(mut self, is_superuser: bool) -> Self {
        self.is_superuser = is_superuser;
        self
    }

    pub fn with_data(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(normalize_header(name), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&normalize_header(name)).map(String::as_str)
    }

    /// Resolves a request attribute that needs no relation traversal.
    ///
    /// Returns `None` for `@request.auth` paths that hop through a relation;
    /// those need the relation arena. Missing attributes resolve to null.
    pub fn attribute(&self, root: PathRoot, segments: &[String]) -> Option<Value> {
        let first = segments.first().map(String::as_str);
        let value = match root {
            PathRoot::Method => Value::Text(self.method.clone()),
            PathRoot::Context => Value::Text(self.context.as_str().to_string()),
            PathRoot::Headers => text_or_null(first.and_then(|name| self.header(name))),
            PathRoot::Query => {
                text_or_null(first.and_then(|name| self.query.get(name)).map(String::as_str))
            }
            PathRoot::Data => {
                if segments.len() > 1 {
                    Value::Null
                } else {
                    first
                        .and_then(|name| self.data.get(name))
                        .cloned()
                        .unwrap_or_default()
                }
            }
            PathRoot::Auth => {
                if segments.len() > 1 {
                    return None;
                }
                match (&self.auth, first) {
                    (Some(auth), Some(name)) => auth.get(name).cloned().unwrap_or_default(),
                    _ => Value::Null,
                }
            }
            PathRoot::Record => return None,
        };
        Some(value)
    }
}

fn text_or_null(text: Option<&str>) -> Value {
    text.map(|s| Value::Text(s.to_string())).unwrap_or_default()
}

/// Header names are matched case-insensitively with `-` read as `_`, so
/// `X-Token` is reachable as `@request.headers.x_token`.
pub fn normalize_header(name: &str) -> String {
    name.to_lowercase().replace('-', "_")
}

/// The record a related entry hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parent {
    Record,
    Auth,
    Entry(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelatedEntry {
    pub parent: Parent,
    pub field: String,
    /// 1 for records referenced directly by the root record.
    pub depth: usize,
    pub record: Record,
}

/// Relation hops allowed when no explicit limit is configured.
pub const DEFAULT_MAX_RELATION_DEPTH: usize = 6;

/// Flat, depth-indexed store of prefetched related records.
///
/// Entries reference their parent by index, so the graph can be walked
/// without the records owning each other.
#[derive(Debug, Clone)]
pub struct RelationArena {
    entries: Vec<RelatedEntry>,
    max_depth: usize,
}

impl Default for RelationArena {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RELATION_DEPTH)
    }
}

impl RelationArena {
    pub fn new(max_depth: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_depth,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Adds `record` as the value of `field` on `parent`. Returns `None`
    /// when the entry would sit deeper than the arena allows.
    pub fn insert(&mut self, parent: Parent, field: impl Into<String>, record: Record) -> Option<usize> {
        let depth = match parent {
            Parent::Record | Parent::Auth => 1,
            Parent::Entry(index) => self.entries.get(index)?.depth + 1,
        };
        if depth > self.max_depth {
            return None;
        }
        self.entries.push(RelatedEntry {
            parent,
            field: field.into(),
            depth,
            record,
        });
        Some(self.entries.len() - 1)
    }

    pub fn get(&self, index: usize) -> Option<&RelatedEntry> {
        self.entries.get(index)
    }

    /// Entries stored for `field` on `parent`, in insertion order.
    pub fn children<'a>(
        &'a self,
        parent: Parent,
        field: &'a str,
    ) -> impl Iterator<Item = (usize, &'a RelatedEntry)> + 'a {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, entry)| entry.parent == parent && entry.field == field)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything a field path can resolve against.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    record: Record,
    request: RequestInfo,
    related: RelationArena,
}

impl EvaluationContext {
    pub fn new(record: Record, request: RequestInfo) -> Self {
        Self {
            record,
            request,
            related: RelationArena::default(),
        }
    }

    pub fn with_related(mut self, related: RelationArena) -> Self {
        self.related = related;
        self
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn related(&self) -> &RelationArena {
        &self.related
    }

    /// Resolves `path` to a value, ignoring its modifier.
    ///
    /// Missing fields and unfetched relations resolve to null. A path that
    /// crosses a multi-valued relation resolves to an array of the leaf
    /// values found on every reachable record.
    pub fn resolve(&self, path: &FieldPath) -> Result<Value, EvalError> {
        let (start, parent) = match path.root {
            PathRoot::Record => (Some(&self.record), Parent::Record),
            PathRoot::Auth => match self.request.attribute(path.root, &path.segments) {
                Some(value) => return Ok(value),
                None => (self.request.auth.as_ref(), Parent::Auth),
            },
            root => return Ok(self.request.attribute(root, &path.segments).unwrap_or_default()),
        };
        let Some(start) = start else {
            return Ok(Value::Null);
        };
        let Some((leaf, hops)) = path.segments.split_last() else {
            return Ok(Value::Null);
        };
        if hops.is_empty() {
            return Ok(start.get(leaf).cloned().unwrap_or_default());
        }
        if hops.len() > self.related.max_depth() {
            return Err(EvalError::DepthExceeded {
                depth: hops.len(),
                max: self.related.max_depth(),
            });
        }

        let mut frontier = vec![parent];
        let mut multiple = false;
        for hop in hops {
            let mut next = Vec::new();
            for parent in &frontier {
                if matches!(self.record_of(*parent).and_then(|r| r.get(hop)), Some(Value::Array(_))) {
                    multiple = true;
                }
                next.extend(self.related.children(*parent, hop).map(|(i, _)| Parent::Entry(i)));
            }
            multiple |= next.len() > 1;
            frontier = next;
        }

        let mut values = Vec::new();
        for parent in &frontier {
            match self.record_of(*parent).and_then(|r| r.get(leaf)) {
                Some(Value::Array(items)) if multiple => values.extend(items.iter().cloned()),
                Some(value) => values.push(value.clone()),
                None => values.push(Value::Null),
            }
        }
        if multiple {
            Ok(Value::Array(values))
        } else {
            Ok(values.into_iter().next().unwrap_or_default())
        }
    }

    fn record_of(&self, parent: Parent) -> Option<&Record> {
        match parent {
            Parent::Record => Some(&self.record),
            Parent::Auth => self.request.auth.as_ref(),
            Parent::Entry(index) => self.related.get(index).map(|entry| &entry.record),
        }
    }
}
