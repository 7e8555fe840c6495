//! MetaPM CLI - command line front end for the offline store and sync queue.
//!
//! Inspects and drains the local queue, hydrates the store from the server,
//! and runs the background scheduler in the foreground.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use metapm_app::{resource_fetcher, ClientConfig, OfflineClient, SyncEvent, SyncReport};
use metapm_cache::{ResourceRequest, STALE_HEADER};
use metapm_common::{EntityKind, OperationKind};

#[derive(Parser)]
#[command(name = "metapm")]
#[command(about = "MetaPM offline store and sync queue")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Service origin, overriding the configuration file.
    #[arg(long)]
    base_url: Option<String>,

    /// Local database file, overriding the configuration file.
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connectivity, queue length and last sync time.
    Status,

    /// Run one sync pass now.
    Sync,

    /// List unsynced queue entries.
    Pending,

    /// List entries parked after reaching the attempt limit.
    Stuck,

    /// Put a stuck entry back into rotation.
    Retry {
        /// Queue entry id.
        id: i64,
    },

    /// Replace local collections with the server snapshot.
    Pull {
        /// Entity kind (task, project, bug, requirement). Default: all.
        #[arg(short, long)]
        kind: Option<EntityKind>,
    },

    /// Drop every queued operation, synced or not.
    ClearQueue {
        /// Confirm discarding unsynced changes.
        #[arg(long)]
        yes: bool,
    },

    /// Empty every local table and the queue.
    Reset {
        /// Confirm discarding all local data.
        #[arg(long)]
        yes: bool,
    },

    /// Run the monitor and scheduler until Ctrl-C.
    Watch,

    /// Apply a change locally and queue it, e.g. `enqueue UPDATE_TASK '{"taskId":1,...}'`.
    Enqueue {
        /// Operation kind such as CREATE_TASK or DELETE_BUG.
        operation: OperationKind,

        /// JSON payload: the full record, or just its key for deletes.
        payload: String,
    },

    /// Fetch a resource through the resource cache policies.
    Fetch {
        /// Request path, e.g. /static/capture.html.
        path: String,

        /// Treat the request as a page navigation.
        #[arg(long)]
        document: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Status => cmd_status(&open(&config).await?).await,
        Commands::Sync => cmd_sync(&open(&config).await?).await,
        Commands::Pending => cmd_pending(&open(&config).await?).await,
        Commands::Stuck => cmd_stuck(&open(&config).await?).await,
        Commands::Retry { id } => cmd_retry(&open(&config).await?, id).await,
        Commands::Pull { kind } => cmd_pull(&open(&config).await?, kind).await,
        Commands::ClearQueue { yes } => {
            confirm(yes, "clear-queue discards unsynced changes")?;
            let client = open(&config).await?;
            client
                .clear_sync_queue()
                .await
                .context("Failed to clear queue")?;
            println!("Sync queue cleared.");
            Ok(())
        }
        Commands::Reset { yes } => {
            confirm(yes, "reset discards all local data")?;
            let client = open(&config).await?;
            client.clear_all().await.context("Failed to reset store")?;
            println!("Local store reset.");
            Ok(())
        }
        Commands::Watch => cmd_watch(&open(&config).await?).await,
        Commands::Enqueue { operation, payload } => {
            cmd_enqueue(&open(&config).await?, operation, &payload).await
        }
        Commands::Fetch { path, document } => cmd_fetch(&config, path, document).await,
    }
}

async fn open(config: &ClientConfig) -> Result<OfflineClient> {
    OfflineClient::open(config)
        .await
        .context("Failed to open offline client")
}

/// Resolve configuration: file (or defaults), then command-line overrides.
fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if let Some(base_url) = &cli.base_url {
        config.base_url = base_url.clone();
    }
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn cmd_retry(client: &OfflineClient, id: i64) -> Result<()> {
    client
        .retry_stuck(id)
        .await
        .with_context(|| format!("Failed to reset entry {}", id))?;
    println!("Entry {} will be retried on the next sync.", id);
    Ok(())
}

async fn cmd_enqueue(client: &OfflineClient, operation: OperationKind, payload: &str) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let id = client
        .apply(operation, payload)
        .await
        .with_context(|| format!("Failed to apply {}", operation))?;
    println!("Queued {} as entry {}.", operation, id);
    Ok(())
}

fn confirm(yes: bool, what: &str) -> Result<()> {
    if !yes {
        anyhow::bail!("{}; pass --yes to confirm", what);
    }
    Ok(())
}

async fn cmd_status(client: &OfflineClient) -> Result<()> {
    let status = client.status().await.context("Failed to read status")?;

    println!("Connectivity: {}", if status.is_online { "online" } else { "offline" });
    println!("Pending:      {}", status.pending);
    if status.stuck > 0 {
        println!("Stuck:        {}", status.stuck);
    }
    match status.last_sync {
        Some(ts) => println!("Last sync:    {}", ts.to_rfc3339()),
        None => println!("Last sync:    never"),
    }
    Ok(())
}

async fn cmd_sync(client: &OfflineClient) -> Result<()> {
    match client.sync_now().await.context("Sync failed")? {
        Some(report) => print_report(&report),
        None => println!("Nothing synced: offline or a pass is already running."),
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!(
        "Synced {} of {} operations in {:?} ({} failed, {} stuck).",
        report.synced, report.attempted, report.duration, report.failed, report.skipped_stuck
    );
}

async fn cmd_pending(client: &OfflineClient) -> Result<()> {
    let pending = client.pending().await.context("Failed to read queue")?;
    if pending.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{:>6}  {:<20}  {:<26}  PAYLOAD", "ID", "OPERATION", "ENQUEUED");
    for op in pending {
        println!(
            "{:>6}  {:<20}  {:<26}  {}",
            op.id,
            op.operation,
            op.enqueued_at.to_rfc3339(),
            op.payload
        );
    }
    Ok(())
}

async fn cmd_stuck(client: &OfflineClient) -> Result<()> {
    let stuck = client.stuck().await.context("Failed to read stuck entries")?;
    if stuck.is_empty() {
        println!("No stuck entries.");
        return Ok(());
    }

    for entry in stuck {
        println!(
            "{:>6}  {:<20}  {} attempts  {}",
            entry.operation.id,
            entry.operation.operation,
            entry.failure.attempts,
            entry.failure.last_error
        );
    }
    Ok(())
}

async fn cmd_pull(client: &OfflineClient, kind: Option<EntityKind>) -> Result<()> {
    match kind {
        Some(kind) => {
            let count = client
                .pull(kind)
                .await
                .with_context(|| format!("Failed to pull {}", kind.table()))?;
            println!("{}: {} records", kind.table(), count);
        }
        None => {
            let counts = client.pull_all().await.context("Failed to pull")?;
            for kind in EntityKind::ALL {
                println!("{}: {} records", kind.table(), counts.get(&kind).copied().unwrap_or(0));
            }
        }
    }
    Ok(())
}

async fn cmd_watch(client: &OfflineClient) -> Result<()> {
    let mut events = client.subscribe();
    client.start().await.context("Failed to start scheduler")?;
    info!("Watching; press Ctrl-C to stop");

    // Drain anything queued while the service was already reachable.
    if let Err(e) = client.sync_now().await {
        warn!("Initial sync failed: {}", e);
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SyncEvent::ConnectivityChanged(online)) => {
                    println!("Connectivity: {}", if online { "online" } else { "offline" });
                }
                Ok(SyncEvent::SyncCompleted(report)) => print_report(&report),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn cmd_fetch(config: &ClientConfig, path: String, document: bool) -> Result<()> {
    let front = resource_fetcher(config).context("Failed to build resource fetcher")?;
    if let Err(e) = front.install().await {
        warn!("Precache incomplete: {}", e);
    }
    front.activate().await.context("Failed to activate cache")?;

    let request = if document {
        ResourceRequest::document(path)
    } else {
        ResourceRequest::get(path)
    };
    let response = front
        .handle(&request)
        .await
        .with_context(|| format!("Failed to fetch {}", request.path))?;

    println!("Status: {}", response.status);
    if let Some(marker) = response.header(STALE_HEADER) {
        println!("Cache:  {}", marker);
    }
    println!("Bytes:  {}", response.body.len());
    Ok(())
}
