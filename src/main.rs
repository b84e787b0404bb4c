use clap::{Parser, Subcommand};
use journal_sync::config::{default_data_dir, Config, CONFIG_FILE_NAME};
use journal_sync::sync::{
    Connectivity, HealthProbe, HttpRemote, LastWriteWinsResolver, LocalStore, SettingsStore,
    SqliteStore, StaticToken, SyncQueue, SyncQueueItem, SyncReport, SyncService,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "journal-sync")]
#[command(about = "Inspect and drive the journal offline sync engine", long_about = None)]
struct Args {
    /// Data directory holding sync.db and journal-sync.toml
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Sync server base URL (overrides config)
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default journal-sync.toml into the data directory
    Init,
    /// Show queue and sync state
    Status,
    /// List pending queue items in draining order
    Queue,
    /// List permanently failed items
    Failed,
    /// Give failed items a fresh attempt budget
    RetryFailed,
    /// Drop failed items
    ClearFailed,
    /// Drop every queued item
    ClearQueue,
    /// Run one sync against the server
    Sync {
        /// Push queued changes only
        #[arg(long, conflicts_with = "full_download")]
        push_only: bool,
        /// Re-download every record
        #[arg(long)]
        full_download: bool,
    },
    /// Keep syncing in the background and print status changes until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "journal_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)?;

    if let Command::Init = args.command {
        let path = data_dir.join(CONFIG_FILE_NAME);
        if Config::init(&data_dir)? {
            println!("Wrote {}", path.display());
        } else {
            println!("{} already exists", path.display());
        }
        return Ok(());
    }

    let mut config = Config::load(&data_dir)?;
    if let Some(server) = args.server {
        config.server_url = server;
    }
    let sync_config = config.sync_config();

    let store = Arc::new(SqliteStore::open_in_dir(&data_dir)?);
    let settings: Arc<dyn SettingsStore> = store.clone();
    let mut queue = SyncQueue::load(settings.clone(), sync_config.max_attempts);

    match args.command {
        Command::Init => {}
        Command::Status => {
            println!("Data dir:      {}", data_dir.display());
            println!("Server:        {}", config.server_url);
            println!("Queued items:  {}", queue.len());
            println!("Pending:       {}", queue.pending_count());
            println!("Failed:        {}", queue.get_failed_items().len());
            let last_sync = settings
                .get(journal_sync::sync::settings::LAST_SYNC_KEY)?
                .unwrap_or_else(|| "never".to_string());
            println!("Last sync:     {}", last_sync);
        }
        Command::Queue => print_items(queue.items()),
        Command::Failed => print_items(&queue.get_failed_items()),
        Command::RetryFailed => {
            let reset = queue.retry_failed_items()?;
            println!("Re-queued {} item(s)", reset);
        }
        Command::ClearFailed => {
            let removed = queue.clear_failed_items()?;
            println!("Removed {} failed item(s)", removed);
        }
        Command::ClearQueue => {
            let count = queue.len();
            queue.clear()?;
            println!("Removed {} item(s)", count);
        }
        Command::Sync {
            push_only,
            full_download,
        } => {
            let remote = Arc::new(HttpRemote::new(
                &config.server_url,
                sync_config.request_timeout,
                Box::new(StaticToken::new(config.token())),
            )?);
            let probe = Arc::new(HealthProbe::new(remote.clone()));
            let local: Arc<dyn LocalStore> = store.clone();
            let service = SyncService::new(
                sync_config,
                queue,
                settings,
                local,
                remote,
                probe,
                Arc::new(LastWriteWinsResolver),
            );

            if !service.refresh_connectivity().await {
                anyhow::bail!("Server {} is unreachable", config.server_url);
            }
            let report = if push_only {
                service.sync_changes().await?
            } else if full_download {
                service.full_download().await?
            } else {
                service.sync_all().await?
            };
            print_report(&report);
            service.dispose();
        }
        Command::Watch => {
            let remote = Arc::new(HttpRemote::new(
                &config.server_url,
                sync_config.request_timeout,
                Box::new(StaticToken::new(config.token())),
            )?);
            let probe = Arc::new(HealthProbe::new(remote.clone()));
            let probe_handle = probe.start(sync_config.probe_interval);
            let connectivity: Arc<dyn Connectivity> = probe;
            let local: Arc<dyn LocalStore> = store.clone();
            let service = SyncService::new(
                sync_config,
                queue,
                settings,
                local,
                remote,
                connectivity,
                Arc::new(LastWriteWinsResolver),
            );

            let mut updates = service.subscribe();
            match service.initialize().await {
                Ok(report) => print_report(&report),
                Err(e) => tracing::error!("Initial sync failed: {}", e),
            }

            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Ok(status) => println!(
                            "{} pending={} syncing={} last_sync={}{}",
                            status.state,
                            status.pending_count,
                            status.is_syncing,
                            status
                                .last_sync_time
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "never".to_string()),
                            status
                                .error_message
                                .as_ref()
                                .map(|m| format!(" error={}", m))
                                .unwrap_or_default(),
                        ),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Missed {} status updates", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }

            service.dispose();
            probe_handle.abort();
            let metrics = service.metrics();
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
    }

    Ok(())
}

fn print_items(items: &[SyncQueueItem]) {
    if items.is_empty() {
        println!("(empty)");
        return;
    }
    for item in items {
        println!(
            "{}  p{}  {:<10} {:<18} {}  attempts={}{}",
            item.queued_at.to_rfc3339(),
            u8::from(item.priority),
            item.operation_type.to_string(),
            item.entity_type.as_str(),
            item.entity_id,
            item.attempts,
            item.last_error
                .as_ref()
                .map(|e| format!("  last_error={}", e))
                .unwrap_or_default(),
        );
    }
}

fn print_report(report: &SyncReport) {
    if let Some(reason) = report.skipped {
        println!("Skipped: {:?}", reason);
        return;
    }
    println!(
        "pushed={} conflicts={} failed={} pulled={} deferred={}",
        report.pushed, report.conflicts, report.failed, report.pulled, report.deferred
    );
}
