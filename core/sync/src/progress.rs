//! Durable progress persistence.
//!
//! [`ProgressStore`] is where [`SyncState`] lives between sessions;
//! [`ProgressTracker`] owns the in-memory copy during a session and writes
//! it back after every step.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use gapsync_common::{Error, IdWindow, Result};

use crate::state::{ErrorEntry, ProgressStats, SyncState};

/// Age after which a leftover lock file is considered abandoned.
pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

/// Persistence backend for [`SyncState`].
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Where the state lives, for log messages.
    fn describe(&self) -> String;

    /// Read the saved state.
    ///
    /// Returns `Ok(None)` when nothing has been saved yet.
    ///
    /// # Errors
    /// - Saved state exists but cannot be read or parsed
    async fn load(&self) -> Result<Option<SyncState>>;

    /// Replace the saved state.
    ///
    /// # Postconditions
    /// - A crash at any point leaves either the previous or the new state
    ///   readable, never a mix
    async fn save(&self, state: &SyncState) -> Result<()>;

    /// Claim exclusive use of the store for one session.
    ///
    /// # Errors
    /// - Another session holds the lock (`SessionLocked`)
    async fn lock(&self) -> Result<SessionLock>;
}

/// Exclusive session claim on a [`ProgressStore`]. Released on drop.
#[derive(Debug)]
pub struct SessionLock {
    release: Release,
}

#[derive(Debug)]
enum Release {
    File(PathBuf),
    Flag(Arc<AtomicBool>),
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        match &self.release {
            Release::File(path) => {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Failed to release session lock {}: {}", path.display(), e);
                } else {
                    debug!("Released session lock {}", path.display());
                }
            }
            Release::Flag(flag) => flag.store(false, Ordering::SeqCst),
        }
    }
}

/// JSON file progress store.
///
/// Saves go to `<path>.tmp` and are renamed over `<path>`. The session lock
/// is the file `<path>.lock`, created exclusively.
pub struct FileProgressStore {
    path: PathBuf,
    stale_lock_after: Duration,
}

impl FileProgressStore {
    /// Create a store backed by the file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            stale_lock_after: DEFAULT_STALE_LOCK_AFTER,
        }
    }

    /// Treat lock files older than `age` as left behind by a dead session.
    pub fn with_stale_lock_after(mut self, age: Duration) -> Self {
        self.stale_lock_after = age;
        self
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the session lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.sibling("lock")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    }

    async fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    async fn create_lock_file(path: &Path) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        let owner = format!("{} {}\n", std::process::id(), Utc::now().to_rfc3339());
        file.write_all(owner.as_bytes()).await?;
        file.sync_all().await
    }

    async fn lock_is_stale(&self, path: &Path) -> bool {
        let modified = match fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        modified
            .elapsed()
            .map(|age| age > self.stale_lock_after)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn load(&self) -> Result<Option<SyncState>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => SyncState::from_json(&content).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &SyncState) -> Result<()> {
        let json = state.to_json()?;
        self.ensure_parent().await?;

        let tmp = self.sibling("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        debug!("Progress saved to {}", self.path.display());
        Ok(())
    }

    async fn lock(&self) -> Result<SessionLock> {
        self.ensure_parent().await?;
        let lock_path = self.lock_path();

        match Self::create_lock_file(&lock_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !self.lock_is_stale(&lock_path).await {
                    return Err(Error::SessionLocked(lock_path.display().to_string()));
                }
                warn!("Breaking stale session lock {}", lock_path.display());
                fs::remove_file(&lock_path).await?;
                Self::create_lock_file(&lock_path).await.map_err(|e| {
                    if e.kind() == ErrorKind::AlreadyExists {
                        Error::SessionLocked(lock_path.display().to_string())
                    } else {
                        Error::Io(e)
                    }
                })?;
            }
            Err(e) => return Err(e.into()),
        }

        debug!("Acquired session lock {}", lock_path.display());
        Ok(SessionLock {
            release: Release::File(lock_path),
        })
    }
}

/// In-memory progress store for testing.
///
/// State is kept serialized so every load goes through the same JSON path
/// as the file store.
pub struct MemoryProgressStore {
    saved: Mutex<Option<String>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
    locked: Arc<AtomicBool>,
}

impl MemoryProgressStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            saved: Mutex::new(None),
            fail_saves: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
            locked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a store already holding `state`.
    pub fn with_state(state: &SyncState) -> Result<Self> {
        let store = Self::new();
        *store.saved.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.to_json()?);
        Ok(store)
    }

    /// Make every subsequent save fail until switched back.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// The last saved state, if any.
    pub fn snapshot(&self) -> Option<SyncState> {
        let saved = self.saved.lock().unwrap_or_else(|e| e.into_inner());
        saved
            .as_deref()
            .and_then(|json| SyncState::from_json(json).ok())
    }
}

impl Default for MemoryProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn load(&self) -> Result<Option<SyncState>> {
        let saved = self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone();
        saved.as_deref().map(SyncState::from_json).transpose()
    }

    async fn save(&self, state: &SyncState) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("simulated save failure")));
        }
        let json = state.to_json()?;
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = Some(json);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn lock(&self) -> Result<SessionLock> {
        self.locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::SessionLocked("memory".to_string()))?;
        Ok(SessionLock {
            release: Release::Flag(self.locked.clone()),
        })
    }
}

/// Owner of the live [`SyncState`] during and between sessions.
///
/// Every mutation is followed by a save. A failed save is logged, not
/// raised, and leaves the tracker dirty; the next successful save carries
/// the missed changes since the whole state is written each time.
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    state: SyncState,
    dirty: bool,
    default_target: u64,
    error_log_limit: usize,
}

impl ProgressTracker {
    /// Load saved state from `store`, or start fresh.
    ///
    /// A missing or unreadable state file yields a fresh state aiming at
    /// `default_target`; the unreadable case is logged as a warning.
    pub async fn open(
        store: Arc<dyn ProgressStore>,
        default_target: u64,
        error_log_limit: usize,
    ) -> Self {
        let state = match store.load().await {
            Ok(Some(state)) => {
                info!(
                    "Loaded progress from {}: {} records persisted, last identifier {}",
                    store.describe(),
                    state.records_persisted(),
                    state.last_scanned_identifier()
                );
                state
            }
            Ok(None) => {
                info!("No saved progress in {}, starting fresh", store.describe());
                SyncState::new(default_target)
            }
            Err(e) => {
                warn!(
                    "Could not read progress from {} ({}), starting fresh",
                    store.describe(),
                    e
                );
                SyncState::new(default_target)
            }
        };

        Self {
            store,
            state,
            dirty: false,
            default_target,
            error_log_limit,
        }
    }

    /// Re-read the saved state, picking up changes made by other processes.
    ///
    /// Skipped while unsaved changes are pending. An unreadable file keeps
    /// the in-memory state.
    pub async fn refresh(&mut self) {
        if self.dirty {
            debug!("Progress has unsaved changes, keeping in-memory state");
            return;
        }
        match self.store.load().await {
            Ok(Some(state)) => self.state = state,
            Ok(None) => self.state = SyncState::new(self.default_target),
            Err(e) => warn!("Could not refresh progress: {}", e),
        }
    }

    /// Current state.
    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    /// Whether the last save failed.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Begin a session stamped with `now`, returning its identifier.
    pub async fn start_session(&mut self, now: DateTime<Utc>) -> String {
        let session_id = now.format("%Y%m%d_%H%M%S").to_string();
        self.state.begin_session(session_id.clone(), now);
        self.commit().await;
        session_id
    }

    /// Commit a fetched window and the records persisted from it.
    pub async fn record_window(&mut self, window: IdWindow, persisted: u64) {
        self.state.commit_window(window, persisted, Utc::now());
        self.commit().await;
    }

    /// Move past a window whose fetch failed, logging why.
    pub async fn record_failed_window(&mut self, window: IdWindow, message: impl Into<String>) {
        self.state.skip_window(window);
        self.push_error(message.into(), window.from());
        self.commit().await;
    }

    /// Append to the error log.
    pub async fn record_error(&mut self, message: impl Into<String>, identifier: u64) {
        self.push_error(message.into(), identifier);
        self.commit().await;
    }

    fn push_error(&mut self, message: String, identifier: u64) {
        self.state.push_error(
            ErrorEntry {
                timestamp: Utc::now(),
                message,
                identifier,
            },
            self.error_log_limit,
        );
    }

    /// Change the target record count.
    ///
    /// # Errors
    /// - `target` is zero
    /// - The new state cannot be saved
    pub async fn set_target(&mut self, target: u64) -> Result<()> {
        self.state.set_target(target)?;
        info!("Target record count set to {}", target);
        self.save().await
    }

    /// Store the catalog's self-reported total.
    ///
    /// # Errors
    /// - The new state cannot be saved
    pub async fn set_scan_total(&mut self, total: u64) -> Result<()> {
        self.state.set_declared_scan_total(total);
        self.save().await
    }

    /// Return to a fresh state aiming at the default target.
    ///
    /// # Errors
    /// - The new state cannot be saved
    pub async fn reset(&mut self) -> Result<()> {
        self.state = SyncState::new(self.default_target);
        warn!("Progress reset in {}", self.store.describe());
        self.save().await
    }

    /// Snapshot of the counters.
    pub fn statistics(&self) -> ProgressStats {
        self.state.statistics()
    }

    /// Rate-based time to completion.
    pub fn eta(&self, now: DateTime<Utc>) -> Option<ChronoDuration> {
        self.state.eta(now)
    }

    /// Save, logging instead of raising on failure.
    ///
    /// Returns whether the save succeeded.
    pub async fn commit(&mut self) -> bool {
        match self.save().await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "Failed to persist progress to {}: {}",
                    self.store.describe(),
                    e
                );
                false
            }
        }
    }

    async fn save(&mut self) -> Result<()> {
        let result = self.store.save(&self.state).await;
        self.dirty = result.is_err();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn window(from: u64, to: u64) -> IdWindow {
        IdWindow::new(from, to).unwrap()
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileProgressStore::new(dir.path().join("nested").join("progress.json"));
        assert!(store.load().await.unwrap().is_none());

        let mut state = SyncState::new(100);
        state.commit_window(window(1, 50), 20, Utc::now());
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(!dir.path().join("nested").join("progress.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = Arc::new(FileProgressStore::new(&path));
        assert!(store.load().await.is_err());

        let tracker = ProgressTracker::open(store, 77, 10).await;
        assert_eq!(tracker.state().records_persisted(), 0);
        assert_eq!(tracker.state().target_record_count(), 77);
    }

    #[tokio::test]
    async fn test_file_lock_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = FileProgressStore::new(dir.path().join("progress.json"));

        let lock = store.lock().await.unwrap();
        assert!(store.lock_path().exists());
        assert!(matches!(store.lock().await, Err(Error::SessionLocked(_))));

        drop(lock);
        assert!(!store.lock_path().exists());
        assert!(store.lock().await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let store = FileProgressStore::new(dir.path().join("progress.json"))
            .with_stale_lock_after(Duration::ZERO);
        std::fs::write(store.lock_path(), "12345 earlier\n").unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let lock = store.lock().await;
        assert!(lock.is_ok());
    }

    #[tokio::test]
    async fn test_memory_lock_exclusive() {
        let store = MemoryProgressStore::new();
        let lock = store.lock().await.unwrap();
        assert!(store.lock().await.is_err());
        drop(lock);
        assert!(store.lock().await.is_ok());
    }

    #[tokio::test]
    async fn test_tracker_persists_each_step() {
        let store = Arc::new(MemoryProgressStore::new());
        let mut tracker = ProgressTracker::open(store.clone(), 100, 10).await;

        let id = tracker.start_session(Utc::now()).await;
        assert_eq!(id.len(), "20260101_120000".len());
        tracker.record_window(window(1, 10), 4).await;
        tracker.record_failed_window(window(11, 20), "timed out").await;

        let saved = store.snapshot().unwrap();
        assert_eq!(saved.last_scanned_identifier(), 20);
        assert_eq!(saved.records_persisted(), 4);
        assert_eq!(saved.error_log().len(), 1);
        assert_eq!(saved.error_log()[0].identifier, 11);
        assert_eq!(saved.session_id(), Some(id.as_str()));
        assert_eq!(store.save_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_save_retried_on_next_step() {
        let store = Arc::new(MemoryProgressStore::new());
        let mut tracker = ProgressTracker::open(store.clone(), 100, 10).await;

        store.set_fail_saves(true);
        tracker.record_window(window(1, 10), 5).await;
        assert!(tracker.is_dirty());
        assert_eq!(tracker.state().records_persisted(), 5);
        assert!(store.snapshot().is_none());

        // A refresh must not discard unsaved progress.
        tracker.refresh().await;
        assert_eq!(tracker.state().records_persisted(), 5);

        store.set_fail_saves(false);
        tracker.record_window(window(11, 20), 0).await;
        assert!(!tracker.is_dirty());
        assert_eq!(store.snapshot().unwrap().records_persisted(), 5);
    }

    #[tokio::test]
    async fn test_operator_changes_report_save_failure() {
        let store = Arc::new(MemoryProgressStore::new());
        let mut tracker = ProgressTracker::open(store.clone(), 100, 10).await;

        assert!(matches!(
            tracker.set_target(0).await,
            Err(Error::InvalidInput(_))
        ));

        store.set_fail_saves(true);
        assert!(tracker.set_target(50).await.is_err());
        store.set_fail_saves(false);
        tracker.set_target(50).await.unwrap();
        assert_eq!(store.snapshot().unwrap().target_record_count(), 50);
    }

    #[tokio::test]
    async fn test_reset_restores_defaults() {
        let mut seeded = SyncState::new(10);
        seeded.commit_window(window(1, 100), 9, Utc::now());
        let store = Arc::new(MemoryProgressStore::with_state(&seeded).unwrap());

        let mut tracker = ProgressTracker::open(store.clone(), 500, 10).await;
        assert_eq!(tracker.state().records_persisted(), 9);

        tracker.reset().await.unwrap();
        let saved = store.snapshot().unwrap();
        assert_eq!(saved.records_persisted(), 0);
        assert_eq!(saved.last_scanned_identifier(), 0);
        assert_eq!(saved.target_record_count(), 500);
    }

    #[tokio::test]
    async fn test_error_log_bounded() {
        let store = Arc::new(MemoryProgressStore::new());
        let mut tracker = ProgressTracker::open(store.clone(), 100, 2).await;
        for i in 0..4 {
            tracker.record_error(format!("e{}", i), i).await;
        }
        assert_eq!(tracker.statistics().error_count, 2);
        assert_eq!(tracker.state().error_log()[0].message, "e2");
    }
}
