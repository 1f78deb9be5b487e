//! Document store collaborator.
//!
//! The engine only reads from the store: script documents for resolution,
//! template documents for nested renders, and whatever scripts query through
//! the proxy's `documentStore` actions.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use thiserror::Error;

/// Collection holding script documents.
pub const SCRIPTS_COLLECTION: &str = "scripts";
/// Collection holding template documents.
pub const TEMPLATES_COLLECTION: &str = "templates";

/// Who is asking. Passed to every store query.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// Authenticated identity, if any.
    pub user: Option<Value>,
}

impl AuthContext {
    fn principal(&self) -> Option<&str> {
        match &self.user {
            Some(Value::String(s)) => Some(s),
            Some(Value::Object(o)) => o.get("name").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// Errors from a document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The filter is not something the store understands.
    #[error("invalid filter for collection '{collection}': {reason}")]
    InvalidFilter {
        /// Collection queried.
        collection: String,
        /// What was wrong.
        reason: String,
    },
    /// The backend failed.
    #[error("document store backend error: {0}")]
    Backend(String),
}

/// Read access to stored documents.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Documents in `collection` matching `filter` that `auth` may read, in
    /// storage order.
    async fn find(
        &self,
        collection: &str,
        filter: &Value,
        auth: &AuthContext,
    ) -> Result<Vec<Value>, StoreError>;

    /// First match of [`find`](Self::find).
    async fn find_one(
        &self,
        collection: &str,
        filter: &Value,
        auth: &AuthContext,
    ) -> Result<Option<Value>, StoreError> {
        Ok(self
            .find(collection, filter, auth)
            .await?
            .into_iter()
            .next())
    }
}

/// Store kept in memory. Filters match by equality on top-level fields.
///
/// A document carrying a `readPermissions` array is only visible to users
/// whose name is listed.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl InMemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a document to `collection`.
    pub fn insert(&self, collection: &str, document: Value) {
        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(self, collection: &str, document: Value) -> Self {
        self.insert(collection, document);
        self
    }
}

fn matches(document: &Value, filter: &serde_json::Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(key, expected)| document.get(key) == Some(expected))
}

fn readable(document: &Value, auth: &AuthContext) -> bool {
    let Some(allowed) = document.get("readPermissions").and_then(Value::as_array) else {
        return true;
    };
    auth.principal()
        .is_some_and(|p| allowed.iter().any(|a| a.as_str() == Some(p)))
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryStore {
    async fn find(
        &self,
        collection: &str,
        filter: &Value,
        auth: &AuthContext,
    ) -> Result<Vec<Value>, StoreError> {
        let empty = serde_json::Map::new();
        let filter = match filter {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(StoreError::InvalidFilter {
                    collection: collection.to_string(),
                    reason: format!("expected an object, got {other}"),
                })
            }
        };
        let collections = self
            .collections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| matches(d, filter) && readable(d, auth))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
