//! Collection schema lookups used by the SQL compiler and relation prefetch.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Bool,
    Date,
    /// JSON column; arrays stored here take part in `?op` and `:each`.
    Json,
    Relation,
}

/// Target of a relation field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationTarget {
    pub collection: String,
    /// Multi relations store a JSON array of ids.
    pub multiple: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub column: String,
    pub kind: FieldType,
    pub nullable: bool,
    pub relation: Option<RelationTarget>,
}

impl FieldInfo {
    pub fn new(column: impl Into<String>, kind: FieldType) -> Self {
        Self {
            column: column.into(),
            kind,
            nullable: true,
            relation: None,
        }
    }

    pub fn relation(column: impl Into<String>, target: impl Into<String>, multiple: bool) -> Self {
        Self {
            relation: Some(RelationTarget {
                collection: target.into(),
                multiple,
            }),
            ..Self::new(column, FieldType::Relation)
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Whether the column holds a JSON array of values.
    pub fn is_array(&self) -> bool {
        match self.kind {
            FieldType::Json => true,
            FieldType::Relation => self.relation.as_ref().is_some_and(|r| r.multiple),
            FieldType::Text | FieldType::Number | FieldType::Bool | FieldType::Date => false,
        }
    }
}

/// Read-only view of the collections the engine can address.
pub trait SchemaLookup: Send + Sync {
    /// Table backing `collection`.
    fn table(&self, collection: &str) -> Option<String>;

    fn field(&self, collection: &str, name: &str) -> Option<FieldInfo>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub table: String,
    pub fields: HashMap<String, FieldInfo>,
}

impl CollectionSchema {
    /// A collection with the implicit `id`, `created` and `updated` fields.
    pub fn new(table: impl Into<String>) -> Self {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), FieldInfo::new("id", FieldType::Text).not_null());
        fields.insert("created".to_string(), FieldInfo::new("created", FieldType::Date).not_null());
        fields.insert("updated".to_string(), FieldInfo::new("updated", FieldType::Date).not_null());
        Self {
            table: table.into(),
            fields,
        }
    }

    /// Adds a field stored in a column of the same name.
    pub fn field(mut self, name: &str, kind: FieldType) -> Self {
        self.fields.insert(name.to_string(), FieldInfo::new(name, kind));
        self
    }

    pub fn relation(mut self, name: &str, target: &str, multiple: bool) -> Self {
        self.fields
            .insert(name.to_string(), FieldInfo::relation(name, target, multiple));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, info: FieldInfo) {
        self.fields.insert(name.into(), info);
    }
}

/// In-memory schema, usually built from a JSON config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticSchema {
    collections: HashMap<String, CollectionSchema>,
}

impl StaticSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, name: impl Into<String>, collection: CollectionSchema) -> Self {
        self.insert(name, collection);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, collection: CollectionSchema) {
        self.collections.insert(name.into(), collection);
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }
}

impl SchemaLookup for StaticSchema {
    fn table(&self, collection: &str) -> Option<String> {
        self.collections.get(collection).map(|c| c.table.clone())
    }

    fn field(&self, collection: &str, name: &str) -> Option<FieldInfo> {
        self.collections.get(collection)?.fields.get(name).cloned()
    }
}
