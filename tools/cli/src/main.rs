//! gapsync CLI - Command line interface for catalog synchronization.
//!
//! This tool runs sync sessions against the configured catalog and
//! reports or adjusts the saved progress.

mod catalog;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gapsync_source::{MemorySource, RemoteSource, SourceClient};
use gapsync_store::SqliteStore;
use gapsync_sync::{FileProgressStore, SessionResult, SyncEngine};

use crate::catalog::{credentials_from_env, LazyCatalog};
use crate::config::{default_data_dir, AppConfig};

type Engine = SyncEngine<SourceClient<dyn RemoteSource>, SqliteStore>;

#[derive(Parser)]
#[command(name = "gapsync")]
#[command(about = "gapsync - Resumable batch sync from a gapped remote catalog")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long, env = "GAPSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Progress state file.
    #[arg(long, env = "GAPSYNC_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// SQLite document database.
    #[arg(long, env = "GAPSYNC_DATABASE")]
    database: Option<PathBuf>,

    /// Catalog base URL.
    #[arg(long, env = "GAPSYNC_BASE_URL")]
    base_url: Option<String>,

    /// Sync from a generated in-memory catalog instead of the HTTP source.
    #[arg(long)]
    demo: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync session.
    Run {
        /// Identifiers requested per window.
        #[arg(long)]
        page_size: Option<u64>,

        /// Stop after this many pages' worth of records.
        #[arg(long)]
        max_pages: Option<u64>,

        /// Keep running sessions until the target is reached or the catalog
        /// looks exhausted.
        #[arg(long)]
        until_complete: bool,

        /// Upper bound on sessions with --until-complete.
        #[arg(long, requires = "until_complete")]
        max_sessions: Option<u32>,
    },

    /// Show progress, store count and connectivity.
    Status {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Change the target record count.
    SetTarget {
        /// New target.
        target: u64,
    },

    /// Fetch and record the catalog's self-reported total.
    RefreshTotal,

    /// Discard all saved progress.
    Reset {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },

    /// Remove duplicate documents from the store.
    Cleanup,

    /// Check that the catalog and the store are reachable.
    Validate,

    /// Show the session plan for the current target.
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut app = AppConfig::load(cli.config.as_deref())?;
    if let Some(path) = cli.state_file.clone() {
        app.state_file = Some(path);
    }
    if let Some(path) = cli.database.clone() {
        app.database = Some(path);
    }
    if let Some(url) = cli.base_url.clone() {
        app.source.base_url = url;
    }

    // Setup logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        app.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine = build_engine(&app, cli.demo).await?;

    match cli.command {
        Commands::Run {
            page_size,
            max_pages,
            until_complete,
            max_sessions,
        } => {
            let page_size = page_size.unwrap_or(app.sync.page_size);
            cmd_run(&engine, page_size, max_pages, until_complete, max_sessions).await
        }

        Commands::Status { json } => cmd_status(&engine, json).await,

        Commands::SetTarget { target } => cmd_set_target(&engine, target).await,

        Commands::RefreshTotal => cmd_refresh_total(&engine).await,

        Commands::Reset { yes } => cmd_reset(&engine, yes).await,

        Commands::Cleanup => cmd_cleanup(&engine).await,

        Commands::Validate => cmd_validate(&engine).await,

        Commands::Plan => cmd_plan(&engine).await,
    }
}

/// Assemble source, store and progress store from configuration.
async fn build_engine(app: &AppConfig, demo: bool) -> Result<Engine> {
    let base = if demo {
        default_data_dir().join("demo")
    } else {
        default_data_dir()
    };
    let state_path = app.state_path(&base);
    let db_path = app.database_path(&base);
    std::fs::create_dir_all(&base)
        .with_context(|| format!("Failed to create data directory {}", base.display()))?;

    let (source, pacing) = build_source(app, demo);
    let client = SourceClient::from_arc(source)
        .with_retry(app.retry())
        .with_pacing(pacing);
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("Failed to open document store {}", db_path.display()))?;
    let progress = FileProgressStore::new(&state_path);

    SyncEngine::new(
        Arc::new(client),
        Arc::new(store),
        Arc::new(progress),
        app.sync.clone(),
    )
    .await
    .context("Invalid sync configuration")
}

/// The catalog to sync from and the pause between its calls.
///
/// The HTTP catalog reads its credentials from the environment and is
/// only built once a command actually calls it.
fn build_source(app: &AppConfig, demo: bool) -> (Arc<dyn RemoteSource>, Duration) {
    if demo {
        info!("Using generated demo catalog");
        let source: Arc<dyn RemoteSource> = Arc::new(demo_catalog());
        return (source, Duration::ZERO);
    }

    let source: Arc<dyn RemoteSource> =
        Arc::new(LazyCatalog::new(app.source.clone(), credentials_from_env()));
    (source, app.pacing())
}

/// A gapped catalog: every seventh identifier and one long stretch missing.
fn demo_catalog() -> MemorySource {
    MemorySource::new()
        .with_ids((1..=5_000u64).filter(|id| id % 7 != 0 && !(2_000..2_600).contains(id)))
}

/// Run one or more sessions.
async fn cmd_run(
    engine: &Engine,
    page_size: u64,
    max_pages: Option<u64>,
    until_complete: bool,
    max_sessions: Option<u32>,
) -> Result<()> {
    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current window");
            token.cancel();
        }
    });

    if until_complete {
        let results = engine
            .run_until_complete(page_size, max_sessions)
            .await
            .context("Sync run failed")?;
        for (i, result) in results.iter().enumerate() {
            println!("Session {}:", i + 1);
            print_session(result);
        }
    } else {
        let result = engine
            .run_session(page_size, max_pages)
            .await
            .context("Sync session failed")?;
        print_session(&result);
    }

    Ok(())
}

fn print_session(result: &SessionResult) {
    if let Some(id) = &result.session_id {
        println!("  Session ID: {}", id);
    }
    println!("  End reason: {}", result.end_reason);
    println!(
        "  Records this session: {} ({} new, {} updated, {} rejected)",
        result.session_records_persisted,
        result.inserted_count,
        result.updated_count,
        result.error_count
    );
    println!(
        "  Windows: {} scanned, {} with data, {} failed",
        result.windows_scanned, result.pages_fetched, result.failed_windows
    );
    println!(
        "  Progress: {} / {} ({:.2}%)",
        result.total_records_persisted, result.target_record_count, result.completion_percentage
    );
    println!("  Last identifier scanned: {}", result.last_scanned_identifier);
    println!(
        "  Estimated remaining: {:.2} sessions ({:.2} days)",
        result.estimated_remaining_sessions, result.estimated_remaining_days
    );
    println!("  Duration: {:.1}s", result.duration_seconds);
}

/// Show progress and connectivity.
async fn cmd_status(engine: &Engine, json: bool) -> Result<()> {
    let status = engine.get_status().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let stats = &status.session_stats;
    println!("Sync status:");
    println!(
        "  Records persisted: {} / {} ({:.2}%)",
        stats.records_persisted, stats.target_record_count, stats.completion_percentage
    );
    match status.persisted_count {
        Some(count) => println!("  Documents in store: {}", count),
        None => println!("  Documents in store: unknown"),
    }
    println!("  Last identifier scanned: {}", stats.last_scanned_identifier);
    println!("  Batches completed: {}", stats.batches_completed);
    if let Some(total) = stats.declared_scan_total {
        println!("  Catalog declared total: {} (informational)", total);
    }
    if let Some(id) = &stats.session_id {
        println!("  Last session: {}", id);
    }
    if let Some(at) = stats.last_batch_at {
        println!("  Last batch at: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("  Logged errors: {}", stats.error_count);
    if let Some(eta) = status.eta_seconds {
        println!("  ETA at current rate: {:.1} hours", eta as f64 / 3600.0);
    }
    println!(
        "  Catalog: {}",
        if status.connectivity.source { "reachable" } else { "UNREACHABLE" }
    );
    println!(
        "  Store: {}",
        if status.connectivity.store { "reachable" } else { "UNREACHABLE" }
    );

    Ok(())
}

/// Change the target record count.
async fn cmd_set_target(engine: &Engine, target: u64) -> Result<()> {
    engine
        .set_target(target)
        .await
        .context("Failed to set target")?;
    println!("Target set to {} records.", target);
    Ok(())
}

/// Record the catalog's declared total.
async fn cmd_refresh_total(engine: &Engine) -> Result<()> {
    let total = engine
        .refresh_declared_total()
        .await
        .context("Failed to query catalog total")?;
    println!("Catalog declares {} records.", total);
    println!("Gaps in the identifier space make this an upper bound at best.");
    Ok(())
}

/// Discard saved progress.
async fn cmd_reset(engine: &Engine, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Reset discards all progress; re-run with --yes to confirm");
    }
    engine.reset().await.context("Failed to reset progress")?;
    println!("Progress reset.");
    Ok(())
}

/// Remove duplicate documents.
async fn cmd_cleanup(engine: &Engine) -> Result<()> {
    let removed = engine.cleanup().await.context("Cleanup failed")?;
    println!("Removed {} duplicate documents.", removed);
    Ok(())
}

/// Check connectivity.
async fn cmd_validate(engine: &Engine) -> Result<()> {
    if engine.validate_connections().await {
        println!("All connections OK.");
        Ok(())
    } else {
        anyhow::bail!("Connection check failed")
    }
}

/// Show the session plan.
async fn cmd_plan(engine: &Engine) -> Result<()> {
    let plan = engine.schedule_summary().await;
    println!("Session plan:");
    println!(
        "  Target: {} records ({} persisted, {} remaining)",
        plan.target_record_count, plan.records_persisted, plan.remaining_records
    );
    println!(
        "  Per session: {} records in {} calls of {}",
        plan.records_per_session, plan.calls_per_session, plan.page_size
    );
    println!(
        "  Per day: {} sessions, {} records",
        plan.sessions_per_day, plan.records_per_day
    );
    println!(
        "  Sessions needed: {} (~{:.2} days)",
        plan.sessions_needed, plan.days_needed
    );
    Ok(())
}
