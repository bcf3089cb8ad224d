//! Document store seam.
//!
//! The pipeline treats its store as a set of named collections of JSON
//! documents supporting insert, find-one and delete-many. No transactions
//! are assumed: callers that need multi-step protocols (see
//! [`crate::persistence`]) accept that intermediate states are visible.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use snapfeed_core::DocumentId;

/// Errors produced by [`DocumentStore`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("document is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported store url '{0}' (expected sqlite://<path> or memory://)")]
    UnsupportedUrl(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Document selector.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    /// Every document whose id differs from the given one.
    IdNe(DocumentId),
    /// Documents whose top-level `field` equals `value`.
    FieldEq(String, Value),
}

impl Filter {
    pub fn field_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::FieldEq(field.into(), value.into())
    }

    pub fn matches(&self, id: DocumentId, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::IdNe(other) => id != *other,
            Filter::FieldEq(field, value) => doc.get(field) == Some(value),
        }
    }
}

/// A document together with its store-assigned id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub body: Value,
}

/// Storage contract for pipeline documents.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn DocumentStore>`.
pub trait DocumentStore: Send + Sync {
    /// Insert a new document, returning its id. Ids increase monotonically.
    fn insert_one(&self, collection: &str, doc: &Value) -> Result<DocumentId>;

    /// First matching document in insertion order, if any.
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<StoredDocument>>;

    /// Delete every matching document. Returns the number removed.
    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Number of matching documents.
    fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;
}

/// Open a store from a connection string.
///
/// `sqlite://<path>` opens (or creates) a SQLite file; `memory://` gives a
/// process-local store that vanishes on exit.
pub fn open_store(url: &str) -> Result<Arc<dyn DocumentStore>> {
    if let Some(path) = url.strip_prefix("sqlite://") {
        if path.is_empty() {
            return Err(StoreError::UnsupportedUrl(url.to_string()));
        }
        return Ok(Arc::new(SqliteStore::open(std::path::Path::new(path))?));
    }
    if url == "memory://" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    Err(StoreError::UnsupportedUrl(url.to_string()))
}
