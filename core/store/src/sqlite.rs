//! SQLite-backed document collection.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use gapsync_common::{Error, Record, Result};

use crate::store::{validate, DocumentStore, UpsertSummary};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        source_id TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_documents_created ON documents(created_at);
    CREATE INDEX IF NOT EXISTS idx_documents_updated ON documents(updated_at);
"#;

const UNIQUE_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_source_id ON documents(source_id)";

/// Document collection stored in a single SQLite table.
///
/// Each row holds one JSON document keyed by its source identifier. A unique
/// index on the identifier is created at open; databases written before the
/// index existed may hold duplicates, in which case the index is skipped
/// (with a warning) until [`DocumentStore::remove_duplicates`] runs.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a document database.
    ///
    /// # Errors
    /// - Database cannot be opened or the schema cannot be created
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        let store = Self::init(conn)?;
        info!("Document store opened at {}", db_path.as_ref().display());
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(storage_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        ensure_unique_index(&conn);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("document store lock poisoned".to_string()))
    }

    /// Whether the identifier uniqueness index is in place.
    pub fn has_unique_index(&self) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_documents_source_id'",
                [],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count > 0)
    }
}

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn ensure_unique_index(conn: &Connection) {
    match conn.execute(UNIQUE_INDEX, []) {
        Ok(_) => debug!("Identifier index verified"),
        Err(e) => warn!("Could not create identifier index: {}", e),
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn upsert(&self, records: &[Record]) -> Result<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        if records.is_empty() {
            return Ok(summary);
        }

        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        for record in records {
            let id = match validate(record) {
                Ok(id) => id,
                Err(reason) => {
                    warn!("Skipping record: {}", reason);
                    summary.errors += 1;
                    continue;
                }
            };
            let body = match serde_json::to_string(&record.document) {
                Ok(body) => body,
                Err(e) => {
                    warn!("Skipping record {}: {}", id, e);
                    summary.errors += 1;
                    continue;
                }
            };

            let updated = tx.execute(
                "UPDATE documents SET body = ?1, updated_at = ?2 WHERE source_id = ?3",
                params![body, now, id.as_str()],
            );
            let outcome = match updated {
                Ok(0) => tx
                    .execute(
                        "INSERT INTO documents (source_id, body, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                        params![id.as_str(), body, now],
                    )
                    .map(|_| true),
                Ok(_) => Ok(false),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(true) => summary.inserted += 1,
                Ok(false) => summary.updated += 1,
                Err(e) => {
                    warn!("Write failed for record {}: {}", id, e);
                    summary.errors += 1;
                }
            }
        }

        tx.commit().map_err(storage_err)?;
        debug!(
            "Bulk upsert completed: {} inserted, {} updated, {} errors",
            summary.inserted, summary.updated, summary.errors
        );
        Ok(summary)
    }

    async fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    async fn check_reachable(&self) -> bool {
        match self.conn() {
            Ok(conn) => conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .is_ok(),
            Err(_) => false,
        }
    }

    async fn remove_duplicates(&self) -> Result<u64> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM documents WHERE rowid NOT IN (SELECT MIN(rowid) FROM documents GROUP BY source_id)",
                [],
            )
            .map_err(storage_err)?;
        ensure_unique_index(&conn);
        info!("Removed {} duplicate documents", removed);
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(id: u64, version: u32) -> Record {
        Record::from_document(json!({"ID": id, "version": version}), "ID")
    }

    #[tokio::test]
    async fn test_upsert_never_duplicates() {
        let store = SqliteStore::in_memory().unwrap();

        let first = store.upsert(&[record(1, 1), record(2, 1)]).await.unwrap();
        assert_eq!(first.inserted, 2);
        assert_eq!(first.updated, 0);

        let second = store.upsert(&[record(1, 2)]).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 1);

        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.has_unique_index().unwrap());
    }

    #[tokio::test]
    async fn test_latest_body_wins() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert(&[record(7, 1)]).await.unwrap();
        store.upsert(&[record(7, 2)]).await.unwrap();

        let conn = store.conn().unwrap();
        let body: String = conn
            .query_row(
                "SELECT body FROM documents WHERE source_id = '7'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let doc: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["version"], 2);
    }

    #[tokio::test]
    async fn test_invalid_records_counted() {
        let store = SqliteStore::in_memory().unwrap();
        let no_id = Record::from_document(json!({"name": "x"}), "ID");

        let summary = store.upsert(&[no_id, record(3, 1)]).await.unwrap();

        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.errors, 1);
    }

    #[tokio::test]
    async fn test_remove_legacy_duplicates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("documents.db");

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(SCHEMA).unwrap();
            for _ in 0..3 {
                conn.execute(
                    "INSERT INTO documents VALUES ('9', '{}', 'then', 'then')",
                    [],
                )
                .unwrap();
            }
        }

        let store = SqliteStore::open(&path).unwrap();
        assert!(!store.has_unique_index().unwrap());
        assert_eq!(store.count().await.unwrap(), 3);

        assert_eq!(store.remove_duplicates().await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.has_unique_index().unwrap());
    }

    #[tokio::test]
    async fn test_reachable() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.check_reachable().await);
    }
}
