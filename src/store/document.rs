use async_trait::async_trait;
use serde_json::Value;

use crate::Result;

/// Lazily consumed result of [`DocumentStore::find_docs`].
pub type Documents = Box<dyn Iterator<Item = Value> + Send>;

/// Document query surface used by query resolvers and projectors.
///
/// Documents are JSON values keyed by their domain id inside a named collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn has_collection(&self, collection: &str) -> Result<bool>;

    /// Creates the collection; does nothing if it already exists.
    async fn add_collection(&self, collection: &str) -> Result<()>;

    async fn get_doc(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    async fn find_docs(&self, collection: &str, filter: &DocFilter) -> Result<Documents>;

    /// Inserts a new document, failing if `id` is already taken.
    async fn add_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()>;

    async fn upsert_doc(&self, collection: &str, id: &str, doc: Value) -> Result<()>;

    async fn delete_doc(&self, collection: &str, id: &str) -> Result<()>;

    async fn drop_collection(&self, collection: &str) -> Result<()>;
}

/// Filter over document fields. Field names may be dotted paths into nested objects
/// (`"address.city"`).
#[derive(Clone, Debug, PartialEq)]
pub enum DocFilter {
    /// Matches every document.
    Any,
    Eq(String, Value),
    /// String field containing a substring, or array field containing a string element.
    Contains(String, String),
    Exists(String),
    And(Vec<DocFilter>),
    Or(Vec<DocFilter>),
    Not(Box<DocFilter>),
}

impl DocFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::Contains(field.into(), needle.into())
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::Exists(field.into())
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Eq(field, value) => lookup(doc, field) == Some(value),
            Self::Contains(field, needle) => match lookup(doc, field) {
                Some(Value::String(text)) => text.contains(needle.as_str()),
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str() == Some(needle.as_str())),
                _ => false,
            },
            Self::Exists(field) => lookup(doc, field).is_some_and(|value| !value.is_null()),
            Self::And(filters) => filters.iter().all(|filter| filter.matches(doc)),
            Self::Or(filters) => filters.iter().any(|filter| filter.matches(doc)),
            Self::Not(filter) => !filter.matches(doc),
        }
    }
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, segment| value.get(segment))
}
