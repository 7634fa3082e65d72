//! gapsync sync engine
//!
//! This module drives resumable batch synchronization from a gapped,
//! identifier-indexed catalog into a document store:
//! - Sessions that walk the identifier space window by window
//! - Empty-window tolerance, with a consecutive-empty cutoff marking the end
//! - Durable progress saved after every window, resumable after a crash
//! - Per-window failure isolation with a bounded error log
//! - Cooperative cancellation between windows

pub mod config;
pub mod engine;
pub mod progress;
pub mod state;

// Re-export main types
pub use config::SyncConfig;
pub use engine::{Connectivity, EndReason, EngineStatus, SchedulePlan, SessionResult, SyncEngine};
pub use progress::{
    FileProgressStore, MemoryProgressStore, ProgressStore, ProgressTracker, SessionLock,
};
pub use state::{ErrorEntry, ProgressStats, SyncState, DEFAULT_TARGET_RECORDS};
