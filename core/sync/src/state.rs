//! Sync state tracking.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use gapsync_common::{Error, IdWindow, Result};

/// Target used when nothing else has been configured.
pub const DEFAULT_TARGET_RECORDS: u64 = 2_500_000;

/// One entry in the persisted error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
    /// Human-readable description.
    pub message: String,
    /// First identifier of the window being processed.
    pub identifier: u64,
}

/// Durable synchronization state, one per deployment.
///
/// `last_scanned_identifier` and `records_persisted` only ever move
/// forward; the mutators below are the only way to change them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncState {
    last_scanned_identifier: u64,
    records_persisted: u64,
    target_record_count: u64,
    session_id: Option<String>,
    session_started_at: Option<DateTime<Utc>>,
    batches_completed: u64,
    error_log: Vec<ErrorEntry>,
    /// Legacy informational total reported by the catalog. Not used for stopping.
    declared_scan_total: Option<u64>,
    last_batch_at: Option<DateTime<Utc>>,
}

/// Snapshot of progress counters for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStats {
    pub batches_completed: u64,
    pub records_persisted: u64,
    pub last_scanned_identifier: u64,
    pub target_record_count: u64,
    pub declared_scan_total: Option<u64>,
    pub session_id: Option<String>,
    pub session_started_at: Option<DateTime<Utc>>,
    pub last_batch_at: Option<DateTime<Utc>>,
    pub error_count: usize,
    pub completion_percentage: f64,
}

impl SyncState {
    /// Create an empty state aiming at `target` persisted records.
    pub fn new(target: u64) -> Self {
        Self {
            last_scanned_identifier: 0,
            records_persisted: 0,
            target_record_count: target.max(1),
            session_id: None,
            session_started_at: None,
            batches_completed: 0,
            error_log: Vec::new(),
            declared_scan_total: None,
            last_batch_at: None,
        }
    }

    pub fn last_scanned_identifier(&self) -> u64 {
        self.last_scanned_identifier
    }

    pub fn records_persisted(&self) -> u64 {
        self.records_persisted
    }

    pub fn target_record_count(&self) -> u64 {
        self.target_record_count
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn session_started_at(&self) -> Option<DateTime<Utc>> {
        self.session_started_at
    }

    pub fn batches_completed(&self) -> u64 {
        self.batches_completed
    }

    pub fn error_log(&self) -> &[ErrorEntry] {
        &self.error_log
    }

    pub fn declared_scan_total(&self) -> Option<u64> {
        self.declared_scan_total
    }

    pub fn last_batch_at(&self) -> Option<DateTime<Utc>> {
        self.last_batch_at
    }

    /// First identifier the next window should start at.
    pub fn resume_position(&self) -> u64 {
        self.last_scanned_identifier.saturating_add(1)
    }

    /// Whether the persisted count has reached the target.
    ///
    /// A target lowered below current progress counts as met.
    pub fn target_reached(&self) -> bool {
        self.records_persisted >= self.target_record_count
    }

    /// Persisted records as a percentage of the target, capped at 100 and
    /// rounded to two decimals.
    pub fn completion_percentage(&self) -> f64 {
        if self.target_reached() {
            return 100.0;
        }
        let pct = self.records_persisted as f64 / self.target_record_count as f64 * 100.0;
        (pct * 100.0).round() / 100.0
    }

    /// Records still needed to reach the target.
    pub fn remaining_records(&self) -> u64 {
        self.target_record_count.saturating_sub(self.records_persisted)
    }

    /// Mark the start of a session.
    pub fn begin_session(&mut self, session_id: impl Into<String>, now: DateTime<Utc>) {
        self.session_id = Some(session_id.into());
        self.session_started_at = Some(now);
    }

    /// Commit a successfully fetched window and the records persisted from it.
    ///
    /// Empty windows are committed with `persisted == 0`.
    pub fn commit_window(&mut self, window: IdWindow, persisted: u64, now: DateTime<Utc>) {
        self.advance_scan(window.to());
        self.records_persisted = self.records_persisted.saturating_add(persisted);
        self.batches_completed += 1;
        self.last_batch_at = Some(now);
    }

    /// Move the scan position past a window without counting a batch.
    pub fn skip_window(&mut self, window: IdWindow) {
        self.advance_scan(window.to());
    }

    fn advance_scan(&mut self, identifier: u64) {
        self.last_scanned_identifier = self.last_scanned_identifier.max(identifier);
    }

    /// Change the stopping goal.
    ///
    /// # Errors
    /// - `target` is zero
    pub fn set_target(&mut self, target: u64) -> Result<()> {
        if target == 0 {
            return Err(Error::InvalidInput(
                "Target record count must be greater than zero".to_string(),
            ));
        }
        self.target_record_count = target;
        Ok(())
    }

    /// Store the catalog's self-reported total.
    pub fn set_declared_scan_total(&mut self, total: u64) {
        self.declared_scan_total = Some(total);
    }

    /// Append to the error log, dropping the oldest entries beyond `limit`.
    pub fn push_error(&mut self, entry: ErrorEntry, limit: usize) {
        self.error_log.push(entry);
        if limit > 0 && self.error_log.len() > limit {
            let excess = self.error_log.len() - limit;
            self.error_log.drain(..excess);
        }
    }

    /// Rate-based time to completion since the current session started.
    ///
    /// Returns `None` until at least one record has been persisted after a
    /// session start.
    pub fn eta(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.session_started_at?;
        self.last_batch_at?;
        let elapsed = (now - started).num_milliseconds();
        if elapsed <= 0 || self.records_persisted == 0 {
            return None;
        }
        let per_ms = self.records_persisted as f64 / elapsed as f64;
        let remaining_ms = self.remaining_records() as f64 / per_ms;
        Some(Duration::milliseconds(remaining_ms as i64))
    }

    /// Snapshot the counters.
    pub fn statistics(&self) -> ProgressStats {
        ProgressStats {
            batches_completed: self.batches_completed,
            records_persisted: self.records_persisted,
            last_scanned_identifier: self.last_scanned_identifier,
            target_record_count: self.target_record_count,
            declared_scan_total: self.declared_scan_total,
            session_id: self.session_id.clone(),
            session_started_at: self.session_started_at,
            last_batch_at: self.last_batch_at,
            error_count: self.error_log.len(),
            completion_percentage: self.completion_percentage(),
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut state: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        state.target_record_count = state.target_record_count.max(1);
        Ok(state)
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_RECORDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn window(from: u64, to: u64) -> IdWindow {
        IdWindow::new(from, to).unwrap()
    }

    #[test]
    fn test_commit_window_advances() {
        let mut state = SyncState::new(100);
        state.commit_window(window(1, 10), 7, Utc::now());
        state.commit_window(window(11, 20), 0, Utc::now());

        assert_eq!(state.last_scanned_identifier(), 20);
        assert_eq!(state.records_persisted(), 7);
        assert_eq!(state.batches_completed(), 2);
        assert_eq!(state.resume_position(), 21);
        assert!(state.last_batch_at().is_some());
    }

    #[test]
    fn test_scan_position_never_moves_back() {
        let mut state = SyncState::new(100);
        state.skip_window(window(1, 50));
        state.commit_window(window(10, 20), 1, Utc::now());
        assert_eq!(state.last_scanned_identifier(), 50);
    }

    #[test]
    fn test_lowered_target_counts_as_met() {
        let mut state = SyncState::new(100);
        state.commit_window(window(1, 60), 60, Utc::now());
        assert!(!state.target_reached());

        state.set_target(40).unwrap();
        assert!(state.target_reached());
        assert_eq!(state.completion_percentage(), 100.0);
        assert_eq!(state.remaining_records(), 0);
        assert!(state.set_target(0).is_err());
    }

    #[test]
    fn test_completion_percentage_rounding() {
        let mut state = SyncState::new(50);
        state.commit_window(window(1, 45), 45, Utc::now());
        assert_eq!(state.completion_percentage(), 90.0);

        let mut third = SyncState::new(3);
        third.commit_window(window(1, 1), 1, Utc::now());
        assert_eq!(third.completion_percentage(), 33.33);
    }

    #[test]
    fn test_error_log_retention() {
        let mut state = SyncState::new(10);
        for i in 0..5 {
            state.push_error(
                ErrorEntry {
                    timestamp: Utc::now(),
                    message: format!("error {}", i),
                    identifier: i,
                },
                3,
            );
        }
        let ids: Vec<u64> = state.error_log().iter().map(|e| e.identifier).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_eta() {
        let start = Utc::now();
        let mut state = SyncState::new(200);
        assert!(state.eta(start).is_none());

        state.begin_session("s1", start);
        state.commit_window(window(1, 100), 100, start);
        let eta = state.eta(start + Duration::seconds(10)).unwrap();
        assert_eq!(eta.num_seconds(), 10);
    }

    #[test]
    fn test_state_serialization_roundtrip() {
        let mut state = SyncState::new(500);
        state.begin_session("20260101_000000", Utc::now());
        state.commit_window(window(1, 100), 42, Utc::now());
        state.set_declared_scan_total(420_000);
        state.push_error(
            ErrorEntry {
                timestamp: Utc::now(),
                message: "timeout".to_string(),
                identifier: 101,
            },
            10,
        );

        let json = state.to_json().unwrap();
        assert!(json.contains("lastScannedIdentifier"));
        let restored = SyncState::from_json(&json).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let restored = SyncState::from_json(r#"{"recordsPersisted": 12}"#).unwrap();
        assert_eq!(restored.records_persisted(), 12);
        assert_eq!(restored.last_scanned_identifier(), 0);
        assert_eq!(restored.target_record_count(), DEFAULT_TARGET_RECORDS);
    }

    proptest! {
        #[test]
        fn prop_counters_monotonic(ops in proptest::collection::vec((0u8..3, 1u64..500, 0u64..50), 1..60)) {
            let mut state = SyncState::new(1_000);
            let mut cursor = 1u64;
            for (op, span, persisted) in ops {
                let before_scan = state.last_scanned_identifier();
                let before_persisted = state.records_persisted();
                match op {
                    0 => state.commit_window(window(cursor, cursor + span), persisted, Utc::now()),
                    1 => state.skip_window(window(cursor, cursor + span)),
                    _ => { let _ = state.set_target(span); }
                }
                cursor = (cursor + span / 2).max(1);
                prop_assert!(state.last_scanned_identifier() >= before_scan);
                prop_assert!(state.records_persisted() >= before_persisted);
            }
        }
    }
}
