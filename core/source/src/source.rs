//! Remote source trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use gapsync_common::{IdWindow, Record, Result};

/// One decoded response for an identifier window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowPage {
    /// Records found inside the window. Empty when the window falls in a gap.
    pub records: Vec<Record>,
    /// Total the catalog claims to hold, if it reported one.
    ///
    /// Informational only: identifier gaps make this diverge from the
    /// number of records actually retrievable.
    pub declared_total: Option<u64>,
    /// Highest identifier the catalog says it considered, if reported.
    pub last_index: Option<u64>,
}

impl WindowPage {
    /// A page with records and nothing else.
    pub fn with_records(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    /// Whether the window held no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Identifier-indexed remote catalog.
///
/// Implementations handle their own authentication. Retry and pacing are
/// layered on by [`crate::SourceClient`], so implementations should make a
/// single attempt per call and classify failures with the common error
/// variants (`Network`/`Timeout` for transient, `Remote` for rejections).
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Get the source name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Fetch all records whose identifiers fall inside `window`.
    ///
    /// # Postconditions
    /// - An empty page is a valid outcome, not an error
    ///
    /// # Errors
    /// - Network/timeout errors (transient)
    /// - Remote rejection (authentication, bad request)
    /// - Undecodable response
    async fn fetch_window(&self, window: IdWindow) -> Result<WindowPage>;

    /// Probe whether the catalog answers at all.
    async fn check_reachable(&self) -> bool;

    /// Best-effort total the catalog reports about itself.
    async fn declared_total(&self) -> Result<u64>;
}
