//! Shopsync CLI - operator interface to the offline-first store.
//!
//! Reads and writes records in the local database, runs sync cycles against
//! the configured remote and inspects engine state and the conflict log.

mod config;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shopsync_bridge::HostBridge;
use shopsync_common::{Entity, Payload};
use shopsync_remote::FirestoreRemote;
use shopsync_store::{LocalStore, SortOrder};
use shopsync_sync::SyncEngine;

use crate::config::{default_config_path, AppConfig, AUTH_TOKEN_ENV};

#[derive(Parser)]
#[command(name = "shopsync")]
#[command(about = "Shopsync - offline-first store with background sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: platform config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file, overriding the config.
    #[arg(short, long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// List live records of an entity.
    List {
        entity: Entity,

        /// Payload field to sort by ("id" and "updatedAt" address record columns).
        #[arg(short, long)]
        sort_by: Option<String>,

        /// Sort direction: "asc" or "desc".
        #[arg(short, long)]
        order: Option<SortOrder>,
    },

    /// Show one record.
    Get { entity: Entity, id: String },

    /// Insert or replace a record from a JSON object.
    Put {
        entity: Entity,

        /// Record payload, e.g. '{"id": "p1", "stock": 5}'.
        payload: String,
    },

    /// Delete a record.
    Delete { entity: Entity, id: String },

    /// Run one sync cycle.
    Sync,

    /// Show engine state.
    Status,

    /// Show the conflict log, newest first.
    Conflicts {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Suspend or resume all network activity.
    Offline { state: Toggle },

    /// Make failed outbox entries eligible again.
    Retry,

    /// Run the background loop and print events until interrupted.
    Watch {
        /// Seconds between runs (default: from config).
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Dispatch a raw host command, e.g. '{"command": "get_pending_count"}'.
    Exec { request: String },

    /// Generate shell completions.
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; stdout is reserved for command output.
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        let mut command = Cli::command();
        clap_complete::generate(shell, &mut command, "shopsync", &mut std::io::stdout());
        return Ok(());
    }

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path().context("No config directory on this platform")?,
    };
    let mut config = AppConfig::load(&config_path)?;
    if let Some(database) = cli.database {
        config.database_path = Some(database);
    }

    let bridge = open_bridge(&config)?;

    match cli.command {
        Commands::List {
            entity,
            sort_by,
            order,
        } => print_json(&bridge.list_records(entity, sort_by, order)?),

        Commands::Get { entity, id } => print_json(&bridge.get_record(entity, &id)?),

        Commands::Put { entity, payload } => {
            let payload: Payload =
                serde_json::from_str(&payload).context("Payload must be a JSON object")?;
            print_json(&bridge.upsert_record(entity, payload)?)
        }

        Commands::Delete { entity, id } => {
            bridge.delete_record(entity, &id)?;
            println!("Deleted {}/{}", entity, id);
            Ok(())
        }

        Commands::Sync => print_json(&bridge.sync_once().await),

        Commands::Status => print_json(&bridge.sync_status()),

        Commands::Conflicts { limit } => print_json(&bridge.list_conflicts(limit)?),

        Commands::Offline { state } => {
            let enabled = matches!(state, Toggle::On);
            bridge.set_offline_mode(enabled)?;
            println!("Offline mode {}", if enabled { "on" } else { "off" });
            Ok(())
        }

        Commands::Retry => {
            let reset = bridge.retry_failed()?;
            println!("{} entries reset", reset);
            Ok(())
        }

        Commands::Watch { interval } => cmd_watch(&bridge, interval, &config).await,

        Commands::Exec { request } => {
            println!("{}", bridge.handle_json(&request).await);
            Ok(())
        }

        Commands::Completions { .. } => Ok(()),
    }
}

/// Open the store, build the engine and apply credentials.
fn open_bridge(config: &AppConfig) -> Result<HostBridge> {
    let path = config.database_path()?;
    let store = Arc::new(
        LocalStore::open(&path)
            .with_context(|| format!("Failed to open database {}", path.display()))?,
    );
    let remote = Arc::new(FirestoreRemote::new()?);
    let engine = Arc::new(SyncEngine::new(Arc::clone(&store), remote, config.sync.clone())?);

    match &config.firebase {
        Some(firebase) => engine.set_firebase_config(firebase.clone())?,
        None => warn!("No firebase settings configured; sync runs will fail"),
    }
    if let Ok(token) = std::env::var(AUTH_TOKEN_ENV) {
        engine
            .set_auth_token(Some(token))
            .with_context(|| format!("Invalid {}", AUTH_TOKEN_ENV))?;
    }

    Ok(HostBridge::new(store, engine))
}

async fn cmd_watch(bridge: &HostBridge, interval: Option<u64>, config: &AppConfig) -> Result<()> {
    let period = interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.sync.interval());
    if period.is_zero() {
        anyhow::bail!("Interval must be at least one second");
    }

    let mut events = bridge.subscribe();
    let handle = bridge.start_sync_loop(period);
    info!("Watching; press Ctrl-C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
