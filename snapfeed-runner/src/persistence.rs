//! Snapshot persistence — "latest snapshot only" plus a per-date ledger.
//!
//! `SnapshotWriter::persist` runs a fixed two-step protocol:
//! 1. insert the new snapshot document, obtaining its id;
//! 2. delete every other document in the snapshot collection.
//!
//! The steps are not atomic. If step 2 fails, the new snapshot is still the
//! current truth and stale ones linger until the next successful cycle;
//! readers may briefly see two snapshots. Step 2 is never rolled back into
//! step 1.
//!
//! `DailyLedger` keeps at most one document per local calendar date: an
//! insert for a date that already has a document is skipped, never
//! overwritten.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use snapfeed_core::{BatchId, CycleResult, DocumentId, Record};

use crate::store::{DocumentStore, Filter, StoreError};

/// Date key format for the daily ledger (`21-04-2025`).
pub const DATE_KEY_FORMAT: &str = "%d-%m-%Y";

/// Field holding the date key in ledger documents.
pub const DATE_FIELD: &str = "date";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to insert into '{collection}': {source}")]
    Insert {
        collection: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to query '{collection}': {source}")]
    Query {
        collection: String,
        #[source]
        source: StoreError,
    },
}

/// Stored form of a cycle result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDocument {
    pub timestamp: DateTime<FixedOffset>,
    pub fetched_count: usize,
    pub total_expected: usize,
    pub record_count: usize,
    pub failed_batches: BTreeSet<BatchId>,
    pub records: Vec<Record>,
}

impl From<&CycleResult> for SnapshotDocument {
    fn from(cycle: &CycleResult) -> Self {
        Self {
            timestamp: cycle.captured_at,
            fetched_count: cycle.fetched_count,
            total_expected: cycle.total_expected,
            record_count: cycle.record_count(),
            failed_batches: cycle.failed_batches.clone(),
            records: cycle.records.clone(),
        }
    }
}

/// A persisted snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: DocumentId,
    pub document: SnapshotDocument,
    /// Stale snapshots removed by the cleanup step, or `None` if cleanup failed.
    pub stale_removed: Option<u64>,
}

/// Writes one snapshot per cycle and removes the previous ones.
pub struct SnapshotWriter {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl SnapshotWriter {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Insert the cycle as the new snapshot, then best-effort delete all others.
    pub fn persist(&self, cycle: &CycleResult) -> Result<Snapshot, PersistenceError> {
        let document = SnapshotDocument::from(cycle);
        let body = serde_json::to_value(&document)?;

        let id = self
            .store
            .insert_one(&self.collection, &body)
            .map_err(|source| PersistenceError::Insert {
                collection: self.collection.clone(),
                source,
            })?;

        let stale_removed = match self.store.delete_many(&self.collection, &Filter::IdNe(id)) {
            Ok(n) => {
                debug!(collection = %self.collection, removed = n, "stale snapshots removed");
                Some(n)
            }
            Err(e) => {
                warn!(
                    collection = %self.collection,
                    snapshot = %id,
                    error = %e,
                    "stale snapshot cleanup failed; new snapshot kept"
                );
                None
            }
        };

        info!(
            collection = %self.collection,
            snapshot = %id,
            fetched = document.fetched_count,
            expected = document.total_expected,
            records = document.record_count,
            "snapshot persisted"
        );

        Ok(Snapshot {
            id,
            document,
            stale_removed,
        })
    }
}

/// Result of a ledger insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerInsert {
    Inserted(DocumentId),
    AlreadyPresent,
}

/// At-most-one-document-per-date collection.
pub struct DailyLedger {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl DailyLedger {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn date_key(at: &DateTime<FixedOffset>) -> String {
        at.format(DATE_KEY_FORMAT).to_string()
    }

    /// Insert `fields` under the date of `at`, unless that date already has a
    /// document. `fields` must be a JSON object; its `date` is overwritten.
    pub fn record_once(
        &self,
        at: &DateTime<FixedOffset>,
        fields: Value,
    ) -> Result<LedgerInsert, PersistenceError> {
        let date = Self::date_key(at);
        let filter = Filter::field_eq(DATE_FIELD, date.clone());

        let existing = self
            .store
            .find_one(&self.collection, &filter)
            .map_err(|source| PersistenceError::Query {
                collection: self.collection.clone(),
                source,
            })?;
        if existing.is_some() {
            info!(collection = %self.collection, date = %date, "entry for date exists; skipping");
            return Ok(LedgerInsert::AlreadyPresent);
        }

        let mut doc = match fields {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        doc.insert(DATE_FIELD.into(), Value::String(date.clone()));

        let id = self
            .store
            .insert_one(&self.collection, &Value::Object(doc))
            .map_err(|source| PersistenceError::Insert {
                collection: self.collection.clone(),
                source,
            })?;
        info!(collection = %self.collection, date = %date, id = %id, "daily entry recorded");
        Ok(LedgerInsert::Inserted(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqliteStore};
    use chrono::TimeZone;
    use serde_json::json;

    fn at(day: u32, hour: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(2025, 4, day, hour, 0, 0)
            .unwrap()
    }

    fn cycle(n: usize, day: u32) -> CycleResult {
        let mut c = CycleResult::empty(at(day, 10), n + 1);
        c.records = (0..n).map(|i| Record::new(json!({ "i": i }))).collect();
        c.fetched_count = n;
        c.failed_batches.insert(BatchId(n as u32 + 1));
        c
    }

    #[test]
    fn persist_leaves_exactly_one_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let writer = SnapshotWriter::new(store.clone(), "latest");

        writer.persist(&cycle(1, 21)).unwrap();
        writer.persist(&cycle(2, 21)).unwrap();
        let last = writer.persist(&cycle(3, 21)).unwrap();

        let docs = store.documents("latest");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, last.id);
        assert_eq!(docs[0].body["fetchedCount"], 3);
        assert_eq!(docs[0].body["totalExpected"], 4);
        assert_eq!(docs[0].body["recordCount"], 3);
        assert_eq!(last.stale_removed, Some(1));
    }

    #[test]
    fn persist_removes_preexisting_foreign_documents() {
        let store = Arc::new(MemoryStore::new());
        store.insert_one("latest", &json!({"legacy": true})).unwrap();
        store.insert_one("latest", &json!({"legacy": true})).unwrap();
        let writer = SnapshotWriter::new(store.clone(), "latest");

        let snap = writer.persist(&cycle(1, 21)).unwrap();

        assert_eq!(snap.stale_removed, Some(2));
        assert_eq!(store.count("latest", &Filter::All).unwrap(), 1);
    }

    #[test]
    fn cleanup_failure_keeps_new_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let writer = SnapshotWriter::new(store.clone(), "latest");
        writer.persist(&cycle(1, 21)).unwrap();

        store.set_fail_deletes(true);
        let snap = writer.persist(&cycle(2, 21)).unwrap();

        assert_eq!(snap.stale_removed, None);
        let docs = store.documents("latest");
        assert_eq!(docs.len(), 2, "stale snapshot lingers after failed cleanup");
        assert!(docs.iter().any(|d| d.id == snap.id));

        // The next successful cycle converges back to one.
        store.set_fail_deletes(false);
        writer.persist(&cycle(3, 21)).unwrap();
        assert_eq!(store.documents("latest").len(), 1);
    }

    #[test]
    fn insert_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_inserts(true);
        let writer = SnapshotWriter::new(store, "latest");
        assert!(matches!(
            writer.persist(&cycle(1, 21)),
            Err(PersistenceError::Insert { .. })
        ));
    }

    #[test]
    fn empty_cycle_is_still_persisted() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let writer = SnapshotWriter::new(store.clone(), "latest");
        let snap = writer.persist(&CycleResult::empty(at(21, 10), 5)).unwrap();
        assert_eq!(snap.document.record_count, 0);
        assert_eq!(store.count("latest", &Filter::All).unwrap(), 1);
    }

    #[test]
    fn ledger_keeps_first_document_per_date() {
        let store = Arc::new(MemoryStore::new());
        let ledger = DailyLedger::new(store.clone(), "daily");

        let first = ledger.record_once(&at(21, 15), json!({"link": "a"})).unwrap();
        let second = ledger.record_once(&at(21, 16), json!({"link": "b"})).unwrap();
        let next_day = ledger.record_once(&at(22, 15), json!({"link": "c"})).unwrap();

        assert!(matches!(first, LedgerInsert::Inserted(_)));
        assert_eq!(second, LedgerInsert::AlreadyPresent);
        assert!(matches!(next_day, LedgerInsert::Inserted(_)));

        let docs = store.documents("daily");
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].body["link"], "a");
        assert_eq!(docs[0].body["date"], "21-04-2025");
        assert_eq!(docs[1].body["date"], "22-04-2025");
    }

    #[test]
    fn date_key_uses_local_offset() {
        // 23:00 UTC on the 20th is already the 21st at +05:30.
        let utc_evening = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2025, 4, 20, 23, 0, 0)
            .unwrap();
        let local = utc_evening.with_timezone(&FixedOffset::east_opt(330 * 60).unwrap());
        assert_eq!(DailyLedger::date_key(&local), "21-04-2025");
    }
}
