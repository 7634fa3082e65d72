//! Session orchestration over a gapped identifier space.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gapsync_common::{Error, IdWindow, Result};
use gapsync_source::RemoteSource;
use gapsync_store::{DocumentStore, UpsertSummary};

use crate::config::SyncConfig;
use crate::progress::{ProgressStore, ProgressTracker};
use crate::state::{ProgressStats, SyncState};

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Persisted records reached the target.
    TargetReached,
    /// Too many consecutive empty windows; the catalog looks exhausted.
    MaxEmptyPagesReached,
    /// Too many consecutive windows failed.
    TooManyFailures,
    /// Cancelled from outside.
    Interrupted,
    /// The session persisted its share of records.
    SessionBudgetReached,
}

impl EndReason {
    /// Whether a further session could make progress right away.
    pub fn should_continue(&self) -> bool {
        matches!(self, EndReason::SessionBudgetReached)
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndReason::TargetReached => "target-reached",
            EndReason::MaxEmptyPagesReached => "max-empty-pages-reached",
            EndReason::TooManyFailures => "too-many-failures",
            EndReason::Interrupted => "interrupted",
            EndReason::SessionBudgetReached => "session-budget-reached",
        };
        f.write_str(name)
    }
}

/// Outcome of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResult {
    /// Identifier of the session; absent when no session was started.
    pub session_id: Option<String>,
    /// Records written during this session.
    pub session_records_persisted: u64,
    /// Non-empty windows fetched and stored.
    pub pages_fetched: u64,
    /// Every window attempted, including empty and failed ones.
    pub windows_scanned: u64,
    /// Windows given up on after retries.
    pub failed_windows: u64,
    /// Documents created during this session.
    pub inserted_count: u64,
    /// Existing documents overwritten during this session.
    pub updated_count: u64,
    /// Records rejected by the store.
    pub error_count: u64,
    /// Records persisted across all sessions.
    pub total_records_persisted: u64,
    /// Target the session ran against.
    pub target_record_count: u64,
    /// Progress toward the target, capped at 100.
    pub completion_percentage: f64,
    /// Highest identifier covered so far.
    pub last_scanned_identifier: u64,
    /// Empty windows in a row when the session ended.
    pub consecutive_empty_pages: u32,
    /// Why the session stopped.
    pub end_reason: EndReason,
    /// Linear projection; not a guarantee.
    pub estimated_remaining_sessions: f64,
    /// `estimated_remaining_sessions` spread over the configured sessions per day.
    pub estimated_remaining_days: f64,
    /// Wall-clock time spent in the session.
    pub duration_seconds: f64,
}

/// Reachability of both dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connectivity {
    /// The remote catalog answered.
    pub source: bool,
    /// The document store answered.
    pub store: bool,
}

impl Connectivity {
    pub fn all_reachable(&self) -> bool {
        self.source && self.store
    }
}

/// Engine status for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    /// Documents in the store, if it could be counted.
    pub persisted_count: Option<u64>,
    /// Counters from the saved progress.
    pub session_stats: ProgressStats,
    /// Reachability at the time of the call.
    pub connectivity: Connectivity,
    /// Rate-based time to completion, in seconds.
    pub eta_seconds: Option<i64>,
}

/// Linear plan for reaching the current target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePlan {
    /// Records the sync aims to persist.
    pub target_record_count: u64,
    /// Records persisted so far.
    pub records_persisted: u64,
    /// Records still missing from the target.
    pub remaining_records: u64,
    /// Identifiers requested per window.
    pub page_size: u64,
    /// Windows needed to fill one session's budget with no gaps.
    pub calls_per_session: u64,
    /// Session budget in records.
    pub records_per_session: u64,
    /// Sessions scheduled per day.
    pub sessions_per_day: u32,
    /// Records persisted per day at full budget.
    pub records_per_day: u64,
    /// Sessions needed for the remaining records.
    pub sessions_needed: u64,
    /// Days needed at the configured session rate.
    pub days_needed: f64,
}

#[derive(Debug, Default)]
struct SessionTally {
    session_id: Option<String>,
    records_persisted: u64,
    pages_fetched: u64,
    windows_scanned: u64,
    failed_windows: u64,
    written: UpsertSummary,
    consecutive_empty: u32,
    consecutive_failures: u32,
    interrupted: bool,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Sync engine pulling windows from a [`RemoteSource`] into a
/// [`DocumentStore`].
///
/// Only one session runs at a time per engine, and the progress store's
/// session lock keeps other processes out while it does.
pub struct SyncEngine<S: RemoteSource + ?Sized, D: DocumentStore + ?Sized> {
    source: Arc<S>,
    store: Arc<D>,
    progress: Mutex<ProgressTracker>,
    progress_store: Arc<dyn ProgressStore>,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl<S: RemoteSource + ?Sized, D: DocumentStore + ?Sized> SyncEngine<S, D> {
    /// Create an engine, loading saved progress.
    ///
    /// # Errors
    /// - `config` fails validation
    pub async fn new(
        source: Arc<S>,
        store: Arc<D>,
        progress: Arc<dyn ProgressStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let tracker = ProgressTracker::open(
            progress.clone(),
            config.default_target,
            config.error_log_limit,
        )
        .await;

        Ok(Self {
            source,
            store,
            progress: Mutex::new(tracker),
            progress_store: progress,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that interrupts a running session when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn store(&self) -> &Arc<D> {
        &self.store
    }

    /// Run one session.
    ///
    /// Resumes at the identifier after the last one scanned and walks
    /// forward window by window. Empty windows advance the position like
    /// any other; only `max_consecutive_empty_pages` of them in a row end
    /// the session. `max_pages` caps the session budget at
    /// `max_pages * page_size` records.
    ///
    /// # Errors
    /// - `page_size` is zero
    /// - Another session holds the progress store (`SessionLocked`)
    /// - Source or store unreachable at session start (`Connectivity`)
    pub async fn run_session(&self, page_size: u64, max_pages: Option<u64>) -> Result<SessionResult> {
        if page_size == 0 {
            return Err(Error::InvalidInput(
                "Page size must be greater than zero".to_string(),
            ));
        }
        let started = Instant::now();
        let mut progress = self.progress.try_lock().map_err(|_| {
            Error::SessionLocked("a session is already running in this process".to_string())
        })?;
        progress.refresh().await;

        if progress.state().target_reached() {
            info!(
                "Target already reached: {} of {} records persisted",
                progress.state().records_persisted(),
                progress.state().target_record_count()
            );
            return Ok(self.summarize(
                progress.state(),
                SessionTally::default(),
                EndReason::TargetReached,
                started,
            ));
        }

        let connectivity = self.check_connectivity().await;
        if !connectivity.all_reachable() {
            let message = format!(
                "source {} reachable: {}, store {} reachable: {}",
                self.source.name(),
                connectivity.source,
                self.store.name(),
                connectivity.store
            );
            error!("Cannot start session: {}", message);
            return Err(Error::Connectivity(message));
        }

        let _lock = self.progress_store.lock().await?;
        progress.refresh().await;
        let session_id = progress.start_session(Utc::now()).await;

        let session_target = match max_pages {
            Some(pages) => self
                .config
                .session_batch_size
                .min(pages.saturating_mul(page_size)),
            None => self.config.session_batch_size,
        };
        let mut position = progress.state().resume_position();
        info!(
            "Session {} starting at identifier {} (page size {}, budget {} records, {} of {} persisted)",
            session_id,
            position,
            page_size,
            session_target,
            progress.state().records_persisted(),
            progress.state().target_record_count()
        );

        let mut tally = SessionTally {
            session_id: Some(session_id),
            ..SessionTally::default()
        };

        loop {
            if progress.state().target_reached()
                || tally.records_persisted >= session_target
                || tally.consecutive_empty >= self.config.max_consecutive_empty_pages
                || tally.consecutive_failures >= self.config.max_consecutive_failures
            {
                break;
            }
            if self.cancel.is_cancelled() {
                tally.interrupted = true;
                break;
            }

            let remaining = session_target - tally.records_persisted;
            let upper = position.saturating_add(page_size.min(remaining)) - 1;
            let window = IdWindow::new(position, upper)?;
            tally.windows_scanned += 1;

            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Interrupted while fetching window {}", window);
                    tally.interrupted = true;
                    break;
                }
                result = self.source.fetch_window(window) => result,
            };

            match fetched {
                Ok(page) if page.is_empty() => {
                    tally.consecutive_empty += 1;
                    tally.consecutive_failures = 0;
                    debug!(
                        "Window {} empty ({} consecutive)",
                        window, tally.consecutive_empty
                    );
                    progress.record_window(window, 0).await;
                    position = window.next_start();
                }
                Ok(page) => {
                    match self.store.upsert(&page.records).await {
                        Ok(summary) => {
                            tally.consecutive_empty = 0;
                            tally.consecutive_failures = 0;
                            tally.pages_fetched += 1;
                            tally.records_persisted += summary.written();
                            tally.written += summary;
                            progress.record_window(window, summary.written()).await;
                            if summary.errors > 0 {
                                progress
                                    .record_error(
                                        format!(
                                            "{} of {} records in window {} could not be stored",
                                            summary.errors,
                                            page.records.len(),
                                            window
                                        ),
                                        window.from(),
                                    )
                                    .await;
                            }
                            info!(
                                "Window {}: {} records stored ({} new), {} total",
                                window,
                                summary.written(),
                                summary.inserted,
                                progress.state().records_persisted()
                            );
                            position = window.next_start();
                        }
                        Err(e) => {
                            // Position stays put so the window is fetched again.
                            tally.consecutive_failures += 1;
                            tally.failed_windows += 1;
                            error!("Failed to store window {}: {}", window, e);
                            progress
                                .record_error(
                                    format!("Store write failed for window {}: {}", window, e),
                                    window.from(),
                                )
                                .await;
                        }
                    }
                }
                Err(e) => {
                    tally.consecutive_failures += 1;
                    tally.failed_windows += 1;
                    warn!("Skipping window {} after failed fetch: {}", window, e);
                    progress
                        .record_failed_window(
                            window,
                            format!("Fetch failed for window {}: {}", window, e),
                        )
                        .await;
                    position = window.next_start();
                }
            }
        }

        if progress.is_dirty() {
            progress.commit().await;
        }

        let end_reason = self.end_reason(progress.state(), &tally);
        let result = self.summarize(progress.state(), tally, end_reason, started);
        info!(
            "Session finished ({}): {} records in {} pages, {} windows scanned, {:.2}% complete",
            result.end_reason,
            result.session_records_persisted,
            result.pages_fetched,
            result.windows_scanned,
            result.completion_percentage
        );
        Ok(result)
    }

    /// Run sessions back to back until one ends for any reason other than
    /// exhausting its budget, or `max_sessions` have run.
    pub async fn run_until_complete(
        &self,
        page_size: u64,
        max_sessions: Option<u32>,
    ) -> Result<Vec<SessionResult>> {
        let mut results = Vec::new();
        loop {
            if let Some(max) = max_sessions {
                if results.len() >= max as usize {
                    info!("Stopping after {} sessions", max);
                    break;
                }
            }
            let result = self.run_session(page_size, None).await?;
            let keep_going = result.end_reason.should_continue();
            results.push(result);
            if !keep_going {
                break;
            }
        }
        Ok(results)
    }

    fn end_reason(&self, state: &SyncState, tally: &SessionTally) -> EndReason {
        if state.target_reached() {
            EndReason::TargetReached
        } else if tally.consecutive_empty >= self.config.max_consecutive_empty_pages {
            EndReason::MaxEmptyPagesReached
        } else if tally.consecutive_failures >= self.config.max_consecutive_failures {
            EndReason::TooManyFailures
        } else if tally.interrupted {
            EndReason::Interrupted
        } else {
            EndReason::SessionBudgetReached
        }
    }

    fn summarize(
        &self,
        state: &SyncState,
        tally: SessionTally,
        end_reason: EndReason,
        started: Instant,
    ) -> SessionResult {
        let remaining_sessions =
            state.remaining_records() as f64 / self.config.session_batch_size as f64;
        let remaining_days = remaining_sessions / f64::from(self.config.sessions_per_day);

        SessionResult {
            session_id: tally.session_id,
            session_records_persisted: tally.records_persisted,
            pages_fetched: tally.pages_fetched,
            windows_scanned: tally.windows_scanned,
            failed_windows: tally.failed_windows,
            inserted_count: tally.written.inserted,
            updated_count: tally.written.updated,
            error_count: tally.written.errors,
            total_records_persisted: state.records_persisted(),
            target_record_count: state.target_record_count(),
            completion_percentage: state.completion_percentage(),
            last_scanned_identifier: state.last_scanned_identifier(),
            consecutive_empty_pages: tally.consecutive_empty,
            end_reason,
            estimated_remaining_sessions: round2(remaining_sessions),
            estimated_remaining_days: round2(remaining_days),
            duration_seconds: started.elapsed().as_secs_f64(),
        }
    }

    async fn check_connectivity(&self) -> Connectivity {
        let source = self.source.check_reachable().await;
        let store = self.store.check_reachable().await;
        if source {
            debug!("Source {} reachable", self.source.name());
        } else {
            warn!("Source {} unreachable", self.source.name());
        }
        if store {
            debug!("Store {} reachable", self.store.name());
        } else {
            warn!("Store {} unreachable", self.store.name());
        }
        Connectivity { source, store }
    }

    /// Probe both dependencies.
    pub async fn validate_connections(&self) -> bool {
        let connectivity = self.check_connectivity().await;
        info!(
            "Connection check: source {}, store {}",
            if connectivity.source { "ok" } else { "FAILED" },
            if connectivity.store { "ok" } else { "FAILED" }
        );
        connectivity.all_reachable()
    }

    /// Current progress, store count and connectivity.
    ///
    /// While a session is running in this engine the saved state is read
    /// instead of the live one.
    pub async fn get_status(&self) -> EngineStatus {
        let state = match self.progress.try_lock() {
            Ok(mut progress) => {
                progress.refresh().await;
                progress.state().clone()
            }
            Err(_) => self.saved_state().await,
        };

        let persisted_count = match self.store.count().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Could not count stored documents: {}", e);
                None
            }
        };

        EngineStatus {
            persisted_count,
            session_stats: state.statistics(),
            connectivity: self.check_connectivity().await,
            eta_seconds: state.eta(Utc::now()).map(|eta| eta.num_seconds()),
        }
    }

    async fn saved_state(&self) -> SyncState {
        match self.progress_store.load().await {
            Ok(Some(state)) => state,
            Ok(None) => SyncState::new(self.config.default_target),
            Err(e) => {
                warn!("Could not read saved progress: {}", e);
                SyncState::new(self.config.default_target)
            }
        }
    }

    /// Change the target record count.
    ///
    /// A target below the current persisted count makes the next session a
    /// no-op.
    ///
    /// # Errors
    /// - `target` is zero
    /// - A session holds the progress store (`SessionLocked`)
    /// - The change cannot be saved
    pub async fn set_target(&self, target: u64) -> Result<()> {
        let mut progress = self.progress.lock().await;
        let _lock = self.progress_store.lock().await?;
        progress.refresh().await;
        progress.set_target(target).await?;
        if progress.state().target_reached() {
            info!(
                "Target {} is already met by {} persisted records",
                target,
                progress.state().records_persisted()
            );
        }
        Ok(())
    }

    /// Discard all progress.
    ///
    /// # Errors
    /// - A session holds the progress store (`SessionLocked`)
    /// - The fresh state cannot be saved
    pub async fn reset(&self) -> Result<()> {
        let mut progress = self.progress.lock().await;
        let _lock = self.progress_store.lock().await?;
        progress.reset().await
    }

    /// Ask the source for its self-declared total and record it.
    ///
    /// The value is informational; sessions never stop on it.
    ///
    /// # Errors
    /// - The source cannot report a total
    /// - A session holds the progress store (`SessionLocked`)
    /// - The total cannot be saved
    pub async fn refresh_declared_total(&self) -> Result<u64> {
        let total = self.source.declared_total().await?;
        let mut progress = self.progress.lock().await;
        let _lock = self.progress_store.lock().await?;
        progress.refresh().await;
        progress.set_scan_total(total).await?;
        Ok(total)
    }

    /// Remove duplicate documents from the store.
    pub async fn cleanup(&self) -> Result<u64> {
        let removed = self.store.remove_duplicates().await?;
        info!("Cleanup removed {} duplicate documents", removed);
        Ok(removed)
    }

    /// Linear plan for the current target at the configured rates.
    pub async fn schedule_summary(&self) -> SchedulePlan {
        let state = {
            let mut progress = self.progress.lock().await;
            progress.refresh().await;
            progress.state().clone()
        };
        plan(&self.config, &state)
    }
}

fn plan(config: &SyncConfig, state: &SyncState) -> SchedulePlan {
    let remaining = state.remaining_records();
    let sessions_needed = remaining.div_ceil(config.session_batch_size);
    SchedulePlan {
        target_record_count: state.target_record_count(),
        records_persisted: state.records_persisted(),
        remaining_records: remaining,
        page_size: config.page_size,
        calls_per_session: config.session_batch_size.div_ceil(config.page_size),
        records_per_session: config.session_batch_size,
        sessions_per_day: config.sessions_per_day,
        records_per_day: config.session_batch_size * u64::from(config.sessions_per_day),
        sessions_needed,
        days_needed: round2(sessions_needed as f64 / f64::from(config.sessions_per_day)),
    }
}
