//! In-process [`DocumentStore`], used for tests and `memory://` runs.
//!
//! Supports failure injection per operation so persistence code paths that
//! must survive a failing store can be exercised.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use super::{DocumentStore, Filter, Result, StoreError, StoredDocument};
use snapfeed_core::DocumentId;

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    collections: BTreeMap<String, Vec<StoredDocument>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_inserts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `insert_one` fail (or stop failing).
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `delete_many` fail (or stop failing).
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of every document in a collection, in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<StoredDocument> {
        self.lock()
            .map(|inner| inner.collections.get(collection).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl DocumentStore for MemoryStore {
    fn insert_one(&self, collection: &str, doc: &Value) -> Result<DocumentId> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("insert rejected".into()));
        }
        let mut inner = self.lock()?;
        inner.next_id += 1;
        let id = DocumentId(inner.next_id);
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(StoredDocument {
                id,
                body: doc.clone(),
            });
        Ok(id)
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<StoredDocument>> {
        let inner = self.lock()?;
        Ok(inner
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| filter.matches(d.id, &d.body)))
            .cloned())
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("delete rejected".into()));
        }
        let mut inner = self.lock()?;
        let Some(docs) = inner.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !filter.matches(d.id, &d.body));
        Ok((before - docs.len()) as u64)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let inner = self.lock()?;
        Ok(inner
            .collections
            .get(collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(d.id, &d.body)).count())
            .unwrap_or(0) as u64)
    }
}
