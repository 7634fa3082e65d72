//! In-memory document store for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::warn;

use gapsync_common::{Error, Record, Result, SourceId};

use crate::store::{validate, DocumentStore, UpsertSummary};

/// In-memory document store.
///
/// All data is lost on drop. Uniqueness comes from the map key, so
/// `remove_duplicates` never finds anything.
pub struct MemoryStore {
    documents: RwLock<HashMap<SourceId, Value>>,
    reachable: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Toggle reachability. An unreachable store rejects every write.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fetch a stored document.
    pub fn get(&self, id: &SourceId) -> Option<Value> {
        self.documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, records: &[Record]) -> Result<UpsertSummary> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory store unreachable".to_string()));
        }

        let mut summary = UpsertSummary::default();
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());

        for record in records {
            let id = match validate(record) {
                Ok(id) => id.clone(),
                Err(reason) => {
                    warn!("Skipping record: {}", reason);
                    summary.errors += 1;
                    continue;
                }
            };
            if documents.insert(id, record.document.clone()).is_some() {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }
        }

        Ok(summary)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self
            .documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len() as u64)
    }

    async fn check_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn remove_duplicates(&self) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: u64) -> Record {
        Record::from_document(json!({"ID": id, "v": 1}), "ID")
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = MemoryStore::new();

        let first = store.upsert(&[record(1), record(2)]).await.unwrap();
        assert_eq!(first.inserted, 2);

        let second = store.upsert(&[record(1)]).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 1);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_partial_success() {
        let store = MemoryStore::new();
        let bad = Record::from_document(json!({"name": "no id"}), "ID");

        let summary = store.upsert(&[record(1), bad, record(2)]).await.unwrap();

        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_rejects_batch() {
        let store = MemoryStore::new();
        store.set_reachable(false);
        assert!(!store.check_reachable().await);
        assert!(store.upsert(&[record(1)]).await.is_err());
    }
}
