//! Document store trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

use gapsync_common::{Record, Result, SourceId};

/// Outcome of one bulk upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    /// Documents created by this call.
    pub inserted: u64,
    /// Existing documents overwritten by this call.
    pub updated: u64,
    /// Records that could not be written.
    pub errors: u64,
}

impl UpsertSummary {
    /// Records that ended up in the store.
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl AddAssign for UpsertSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
        self.errors += rhs.errors;
    }
}

/// Idempotent document collection keyed by [`gapsync_common::SourceId`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Get the store name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Insert or overwrite each record by its identifier.
    ///
    /// # Postconditions
    /// - At most one document exists per identifier
    /// - Records without an identifier, or whose document is not a JSON
    ///   object, are counted in `errors` and skipped
    ///
    /// # Errors
    /// - Only when the store as a whole cannot be used; per-record failures
    ///   are reported through the summary
    async fn upsert(&self, records: &[Record]) -> Result<UpsertSummary>;

    /// Number of documents in the collection.
    async fn count(&self) -> Result<u64>;

    /// Probe whether the store is usable.
    async fn check_reachable(&self) -> bool;

    /// Remove extra documents sharing an identifier, keeping the oldest.
    ///
    /// Returns the number of documents removed.
    async fn remove_duplicates(&self) -> Result<u64>;
}

/// The key to store a record under, or why it cannot be stored.
pub(crate) fn validate(record: &Record) -> std::result::Result<&SourceId, &'static str> {
    let id = record.id.as_ref().ok_or("record has no source identifier")?;
    if !record.document.is_object() {
        return Err("record document is not an object");
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_summary_accumulates() {
        let mut total = UpsertSummary::default();
        total += UpsertSummary {
            inserted: 3,
            updated: 1,
            errors: 0,
        };
        total += UpsertSummary {
            inserted: 0,
            updated: 2,
            errors: 1,
        };
        assert_eq!(total.written(), 6);
        assert_eq!(total.errors, 1);
    }

    #[test]
    fn test_validate() {
        let good = Record::with_id(SourceId::new("1").unwrap(), json!({"ID": 1}));
        assert_eq!(validate(&good).unwrap().as_str(), "1");

        let no_id = Record::from_document(json!({"name": "x"}), "ID");
        assert!(validate(&no_id).is_err());

        let scalar = Record::with_id(SourceId::new("2").unwrap(), json!(5));
        assert!(validate(&scalar).is_err());
    }
}
