//! In-memory catalog for testing and demos.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use gapsync_common::{Error, IdWindow, Record, Result};

use crate::source::{RemoteSource, WindowPage};

const ID_FIELD: &str = "ID";

/// Simulated gapped catalog.
///
/// Documents live at explicit identifier positions, so arbitrary gaps can
/// be laid out. Every fetch is logged, and fetches can be made to fail a
/// set number of times to exercise retry and skip paths.
pub struct MemorySource {
    documents: RwLock<BTreeMap<u64, Value>>,
    /// Identifier -> remaining failures for any window covering it.
    failures: Mutex<HashMap<u64, u32>>,
    fetch_log: Mutex<Vec<IdWindow>>,
    reachable: AtomicBool,
    declared_total: Mutex<Option<u64>>,
}

impl MemorySource {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(BTreeMap::new()),
            failures: Mutex::new(HashMap::new()),
            fetch_log: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            declared_total: Mutex::new(None),
        }
    }

    /// Add `count` records at consecutive identifiers starting at `from`.
    pub fn with_contiguous(self, from: u64, count: u64) -> Self {
        for id in from..from + count {
            self.insert(id);
        }
        self
    }

    /// Add records at the given identifiers.
    pub fn with_ids(self, ids: impl IntoIterator<Item = u64>) -> Self {
        for id in ids {
            self.insert(id);
        }
        self
    }

    /// Override the total the catalog reports about itself.
    pub fn with_declared_total(self, total: u64) -> Self {
        *self
            .declared_total
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(total);
        self
    }

    /// Place a generated document at `id`.
    pub fn insert(&self, id: u64) {
        self.insert_document(id, json!({ "ID": id, "name": format!("record-{}", id) }));
    }

    /// Place an arbitrary document at `id`.
    pub fn insert_document(&self, id: u64, document: Value) {
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, document);
    }

    /// Make the next `times` fetches of any window covering `id` fail.
    pub fn fail_fetches_covering(&self, id: u64, times: u32) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, times);
    }

    /// Toggle reachability. An unreachable catalog fails every call.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Every window requested so far, in order.
    pub fn fetch_log(&self) -> Vec<IdWindow> {
        self.fetch_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of fetch attempts made so far.
    pub fn fetch_count(&self) -> usize {
        self.fetch_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Number of documents held.
    pub fn len(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether the catalog holds no documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_failure(&self, window: IdWindow) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let hit = failures
            .iter_mut()
            .find(|(id, remaining)| window.contains(**id) && **remaining > 0);
        match hit {
            Some((_, remaining)) => {
                *remaining -= 1;
                true
            }
            None => false,
        }
    }

    fn reported_total(&self) -> u64 {
        let declared = *self
            .declared_total
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Identifier-range catalogs report their highest identifier, which
        // overstates the real count whenever there are gaps.
        declared.unwrap_or_else(|| {
            self.documents
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .next_back()
                .copied()
                .unwrap_or(0)
        })
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_window(&self, window: IdWindow) -> Result<WindowPage> {
        self.fetch_log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(window);

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Network("memory catalog unreachable".to_string()));
        }
        if self.take_failure(window) {
            return Err(Error::Network(format!(
                "injected failure for window {}",
                window
            )));
        }

        let records = self
            .documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .range(window.from()..=window.to())
            .map(|(_, doc)| Record::from_document(doc.clone(), ID_FIELD))
            .collect();

        Ok(WindowPage {
            records,
            declared_total: Some(self.reported_total()),
            last_index: Some(window.to()),
        })
    }

    async fn check_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn declared_total(&self) -> Result<u64> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Network("memory catalog unreachable".to_string()));
        }
        Ok(self.reported_total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gapped_fetch() {
        let source = MemorySource::new().with_ids([2, 3, 9, 40]);

        let page = source
            .fetch_window(IdWindow::new(1, 10).unwrap())
            .await
            .unwrap();
        let ids: Vec<String> = page
            .records
            .iter()
            .map(|r| r.id.clone().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["2", "3", "9"]);

        let gap = source
            .fetch_window(IdWindow::new(11, 39).unwrap())
            .await
            .unwrap();
        assert!(gap.is_empty());
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_declared_total_overstates_gapped_catalog() {
        let source = MemorySource::new().with_ids([1, 500, 1000]);
        assert_eq!(source.declared_total().await.unwrap(), 1000);
        assert_eq!(source.len(), 3);

        let overridden = MemorySource::new().with_declared_total(1);
        assert_eq!(overridden.declared_total().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let source = MemorySource::new().with_contiguous(1, 5);
        source.fail_fetches_covering(3, 1);
        let window = IdWindow::new(1, 5).unwrap();

        assert!(source.fetch_window(window).await.is_err());
        assert_eq!(source.fetch_window(window).await.unwrap().records.len(), 5);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let source = MemorySource::new();
        source.set_reachable(false);
        assert!(!source.check_reachable().await);
        assert!(source
            .fetch_window(IdWindow::new(1, 1).unwrap())
            .await
            .is_err());
    }
}
