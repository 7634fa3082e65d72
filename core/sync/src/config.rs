//! Sync engine configuration.

use serde::{Deserialize, Serialize};

use crate::state::DEFAULT_TARGET_RECORDS;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identifiers requested per window.
    pub page_size: u64,
    /// Records one session may persist before yielding.
    pub session_batch_size: u64,
    /// Consecutive empty windows after which a session assumes the end of
    /// the catalog.
    pub max_consecutive_empty_pages: u32,
    /// Consecutive failed windows after which a session gives up.
    pub max_consecutive_failures: u32,
    /// Sessions expected per day, used only for estimates.
    pub sessions_per_day: u32,
    /// Target applied to a fresh progress store.
    pub default_target: u64,
    /// Maximum retained error log entries.
    pub error_log_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 500,
            session_batch_size: 14_000,
            max_consecutive_empty_pages: 50,
            max_consecutive_failures: 10,
            sessions_per_day: 3,
            default_target: DEFAULT_TARGET_RECORDS,
            error_log_limit: 1_000,
        }
    }
}

impl SyncConfig {
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_session_batch_size(mut self, size: u64) -> Self {
        self.session_batch_size = size;
        self
    }

    pub fn with_max_consecutive_empty_pages(mut self, max: u32) -> Self {
        self.max_consecutive_empty_pages = max;
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    pub fn with_sessions_per_day(mut self, sessions: u32) -> Self {
        self.sessions_per_day = sessions;
        self
    }

    pub fn with_default_target(mut self, target: u64) -> Self {
        self.default_target = target;
        self
    }

    pub fn with_error_log_limit(mut self, limit: usize) -> Self {
        self.error_log_limit = limit;
        self
    }

    /// Check that every limit is usable.
    ///
    /// # Errors
    /// - Any size, limit or target is zero
    pub fn validate(&self) -> gapsync_common::Result<()> {
        let checks = [
            ("page_size", self.page_size == 0),
            ("session_batch_size", self.session_batch_size == 0),
            (
                "max_consecutive_empty_pages",
                self.max_consecutive_empty_pages == 0,
            ),
            ("max_consecutive_failures", self.max_consecutive_failures == 0),
            ("sessions_per_day", self.sessions_per_day == 0),
            ("default_target", self.default_target == 0),
        ];
        match checks.iter().find(|(_, invalid)| *invalid) {
            Some((name, _)) => Err(gapsync_common::Error::Config(format!(
                "{} must be greater than zero",
                name
            ))),
            None => Ok(()),
        }
    }
}
