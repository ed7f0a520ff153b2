//! Tripsync CLI - Command line interface for the offline-first sync engine.
//!
//! This tool drives the cache and sync engine against a remote API: one-shot
//! sync passes, status inspection, trip creation and a long-running watch mode.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tripsync_cache::{CacheConfig, CacheStore};
use tripsync_common::{Collection, TripDraft};
use tripsync_sync::{
    BackgroundScheduler, Connectivity, HttpRemoteApi, PushEvent, SchedulerHandle, SyncConfig,
    SyncCoordinator,
};

#[derive(Parser)]
#[command(name = "tripsync")]
#[command(about = "Tripsync - Offline-first trip data synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Base URL of the remote API.
    #[arg(long, default_value = "http://localhost:8080/api")]
    api_url: String,

    /// Bearer token for the remote API.
    #[arg(long)]
    token: Option<String>,

    /// Cache database file (default: <data dir>/tripsync/cache.db).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Sync configuration file (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Start as offline.
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one synchronization pass.
    Sync {
        /// Refetch every collection regardless of hashes.
        #[arg(short, long)]
        force: bool,
    },

    /// Show sync status.
    Status,

    /// Upload trips created while offline.
    Reconcile,

    /// Create a trip (kept locally when offline).
    CreateTrip {
        /// Start location id.
        #[arg(long)]
        from: Option<i64>,

        /// End location id.
        #[arg(long)]
        to: Option<i64>,

        /// Trip type id.
        #[arg(long)]
        trip_type: Option<i64>,

        /// Vehicle id.
        #[arg(long)]
        vehicle: Option<i64>,

        /// Start time, RFC 3339 (default: now).
        #[arg(long)]
        started_at: Option<DateTime<Utc>>,

        /// Distance in kilometres.
        #[arg(short, long)]
        distance: Option<f64>,

        /// Free-form notes.
        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Print the cached records of a collection as JSON.
    List {
        /// Collection name (trips, locations, tripTypes, vehicles, vehicleTypes).
        collection: String,
    },

    /// Remove every cached record and the hash snapshot.
    Clear,

    /// Run the background scheduler until interrupted.
    ///
    /// Reads host events from stdin, one per line: `online`, `offline`,
    /// `visible`, `hidden`, `sync`, `sync!` (forced) or a JSON push event.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let engine = Engine::build(&cli)?;

    match cli.command {
        Commands::Sync { force } => cmd_sync(&engine, force).await,

        Commands::Status => cmd_status(&engine).await,

        Commands::Reconcile => cmd_reconcile(&engine).await,

        Commands::CreateTrip {
            from,
            to,
            trip_type,
            vehicle,
            started_at,
            distance,
            notes,
        } => {
            let draft = TripDraft {
                start_location_id: from,
                end_location_id: to,
                trip_type_id: trip_type,
                vehicle_id: vehicle,
                started_at: Some(started_at.unwrap_or_else(Utc::now)),
                distance_km: distance,
                notes,
                ..Default::default()
            };
            cmd_create_trip(&engine, draft).await
        }

        Commands::List { collection } => cmd_list(&engine, &collection).await,

        Commands::Clear => cmd_clear(&engine).await,

        Commands::Watch => cmd_watch(&engine).await,
    }
}

/// Wired-up cache, remote client and coordinator.
struct Engine {
    config: SyncConfig,
    cache: Arc<CacheStore>,
    coordinator: Arc<SyncCoordinator>,
}

impl Engine {
    fn build(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => SyncConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => SyncConfig::default(),
        };

        let db_path = match &cli.db {
            Some(path) => path.clone(),
            None => default_db_path()?,
        };
        let cache = Arc::new(CacheStore::from_config(&CacheConfig {
            path: Some(db_path),
            ..Default::default()
        }));

        let remote = HttpRemoteApi::new(&cli.api_url, cli.token.clone())
            .context("Failed to create API client")?;
        let coordinator = Arc::new(SyncCoordinator::new(
            cache.clone(),
            Arc::new(remote),
            Connectivity::new(!cli.offline),
            &config,
        ));

        Ok(Self {
            config,
            cache,
            coordinator,
        })
    }
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("Could not determine the user data directory")?;
    Ok(base.join("tripsync").join("cache.db"))
}

/// Run one sync pass.
async fn cmd_sync(engine: &Engine, force: bool) -> Result<()> {
    let outcome = engine
        .coordinator
        .perform_sync(force)
        .await
        .context("Sync failed")?;

    if outcome.changed.is_empty() {
        println!("Already up to date.");
        return Ok(());
    }

    println!("Sync finished in {:?}", outcome.duration);
    println!("  Changed: {}", outcome.changed.join(", "));
    for collection in &outcome.synced_collections {
        println!("  [OK]   {}", collection);
    }
    for error in &outcome.errors {
        println!("  [FAIL] {}: {}", error.collection, error.message);
    }

    if !outcome.success {
        anyhow::bail!(
            "{} collection(s) failed; they will be refetched on the next pass",
            outcome.errors.len()
        );
    }

    Ok(())
}

/// Show sync status.
async fn cmd_status(engine: &Engine) -> Result<()> {
    let status = engine.coordinator.get_status().await;
    let pending = engine.coordinator.pending_trips().await;
    let snapshot = engine.coordinator.detector().stored_snapshot().await;

    println!("Sync Status:");
    println!("  Backend: {}", engine.cache.backend_name());
    println!("  Online: {}", status.is_online);
    match status.last_sync_time {
        Some(time) => println!("  Last sync: {}", time),
        None => println!("  Last sync: never"),
    }
    println!("  Pending trips: {}", pending.len());
    for trip in &pending {
        let error = trip.sync_error.as_deref().unwrap_or("-");
        println!("    {} ({:?}, last error: {})", trip.id, trip.sync_status, error);
    }
    println!("  Known hashes:");
    for (name, hash) in &snapshot.hashes {
        println!("    {}: {}", name, hash);
    }

    Ok(())
}

/// Upload pending trips.
async fn cmd_reconcile(engine: &Engine) -> Result<()> {
    let outcome = engine
        .coordinator
        .reconcile_pending_writes()
        .await
        .context("Reconciliation failed")?;

    println!(
        "Reconciled {} of {} pending trip(s), {} failed",
        outcome.reconciled, outcome.attempted, outcome.failed
    );

    Ok(())
}

/// Create a trip.
async fn cmd_create_trip(engine: &Engine, draft: TripDraft) -> Result<()> {
    let trip = engine
        .coordinator
        .create_local_record(draft)
        .await
        .context("Failed to store trip")?;

    if trip.is_local {
        println!("Trip stored locally as {} (pending upload)", trip.id);
    } else {
        println!("Trip created: {}", trip.id);
    }

    Ok(())
}

/// Print cached records of a collection.
async fn cmd_list(engine: &Engine, collection: &str) -> Result<()> {
    let collection: Collection = collection.parse().context("Invalid collection")?;
    let records = engine.cache.get_all_values(collection).await;

    println!(
        "{}",
        serde_json::to_string_pretty(&records).context("Failed to render records")?
    );

    Ok(())
}

/// Wipe the cache.
async fn cmd_clear(engine: &Engine) -> Result<()> {
    engine.coordinator.reset().await;
    println!("Cache cleared.");
    Ok(())
}

/// Run the scheduler until ctrl-c or end of input.
async fn cmd_watch(engine: &Engine) -> Result<()> {
    let scheduler = BackgroundScheduler::new(engine.coordinator.clone(), &engine.config)
        .context("Invalid sync configuration")?;
    let handle = scheduler
        .start()
        .await
        .context("Failed to start scheduler")?;

    info!(
        "Watching (fast {:?}, slow {:?}); press ctrl-c to stop",
        engine.config.fast_interval(),
        engine.config.slow_interval()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = forward_host_event(&handle, line.trim()).await {
                        warn!("Ignoring input: {:#}", e);
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Stopped reading stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    info!("Stopping, waiting for the current pass to finish");
    scheduler.shutdown().await;
    engine.cache.close().await;

    Ok(())
}

/// Translate one line of watch-mode input into a scheduler event.
async fn forward_host_event(handle: &SchedulerHandle, line: &str) -> Result<()> {
    match line {
        "" => Ok(()),
        "online" => Ok(handle.connectivity_changed(true).await?),
        "offline" => Ok(handle.connectivity_changed(false).await?),
        "visible" => Ok(handle.visibility_changed(true).await?),
        "hidden" => Ok(handle.visibility_changed(false).await?),
        "sync" => Ok(handle.request_sync(false).await?),
        "sync!" => Ok(handle.request_sync(true).await?),
        json => {
            let event: PushEvent = serde_json::from_str(json).context("Unknown command")?;
            Ok(handle.push(event).await?)
        }
    }
}
