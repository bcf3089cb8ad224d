//! `SQLite`-backed implementation of [`DocumentStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Documents are stored
//! as JSON text in one table keyed by collection name. Filters run in SQL;
//! field filters on string and integer values go through `json_extract`,
//! anything else is evaluated on the decoded documents.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use super::{DocumentStore, Filter, Result, StoreError, StoredDocument};
use snapfeed_core::DocumentId;

/// Idempotent DDL for the document table.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents (collection, id);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` document database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// `WHERE` clause and its parameters for `filter`, or `None` when the
    /// filter has to be evaluated on decoded documents.
    fn sql_predicate(collection: &str, filter: &Filter) -> Option<(String, Vec<SqlValue>)> {
        let mut args = vec![SqlValue::Text(collection.to_string())];
        let clause = match filter {
            Filter::All => "collection = ?1".to_string(),
            Filter::IdNe(keep) => {
                args.push(SqlValue::Integer(keep.0));
                "collection = ?1 AND id != ?2".to_string()
            }
            Filter::FieldEq(field, value) => {
                if field.contains(['"', '\\']) {
                    return None;
                }
                let (json_type, bound) = match value {
                    Value::String(s) => ("text", SqlValue::Text(s.clone())),
                    Value::Number(n) => ("integer", SqlValue::Integer(n.as_i64()?)),
                    _ => return None,
                };
                args.push(SqlValue::Text(format!("$.\"{field}\"")));
                args.push(bound);
                args.push(SqlValue::Text(json_type.to_string()));
                "collection = ?1 AND json_type(body, ?2) = ?4 AND json_extract(body, ?2) = ?3"
                    .to_string()
            }
        };
        Some((clause, args))
    }

    /// Every document in `collection` matching `filter`, in id order.
    fn load_matching(
        conn: &Connection,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<StoredDocument>> {
        let mut stmt =
            conn.prepare("SELECT id, body FROM documents WHERE collection = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![collection], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, body) = row?;
            let id = DocumentId(id);
            let body: Value = serde_json::from_str(&body)?;
            if filter.matches(id, &body) {
                out.push(StoredDocument { id, body });
            }
        }
        Ok(out)
    }
}

impl DocumentStore for SqliteStore {
    fn insert_one(&self, collection: &str, doc: &Value) -> Result<DocumentId> {
        let body = serde_json::to_string(doc)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO documents (collection, body) VALUES (?1, ?2)",
            params![collection, body],
        )?;
        Ok(DocumentId(conn.last_insert_rowid()))
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<StoredDocument>> {
        let conn = self.lock_conn()?;
        let Some((clause, args)) = Self::sql_predicate(collection, filter) else {
            return Ok(Self::load_matching(&conn, collection, filter)?
                .into_iter()
                .next());
        };
        let row = conn
            .query_row(
                &format!("SELECT id, body FROM documents WHERE {clause} ORDER BY id LIMIT 1"),
                params_from_iter(args.iter()),
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        match row {
            Some((id, body)) => Ok(Some(StoredDocument {
                id: DocumentId(id),
                body: serde_json::from_str(&body)?,
            })),
            None => Ok(None),
        }
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut conn = self.lock_conn()?;
        let removed = match Self::sql_predicate(collection, filter) {
            Some((clause, args)) => conn.execute(
                &format!("DELETE FROM documents WHERE {clause}"),
                params_from_iter(args.iter()),
            )?,
            None => {
                let ids: Vec<i64> = Self::load_matching(&conn, collection, filter)?
                    .into_iter()
                    .map(|d| d.id.0)
                    .collect();
                let tx = conn.transaction()?;
                let mut removed = 0;
                for id in ids {
                    removed += tx.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
                }
                tx.commit()?;
                removed
            }
        };
        Ok(removed as u64)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let conn = self.lock_conn()?;
        let Some((clause, args)) = Self::sql_predicate(collection, filter) else {
            return Ok(Self::load_matching(&conn, collection, filter)?.len() as u64);
        };
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM documents WHERE {clause}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}
