//! Scanstate Ingest - scan message consumer

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use scanstate_common::logging::{init_logging, LogConfig, LogLevel};
use scanstate_common::ScanKey;
use scanstate_ingest::queue::{LinesSubscription, PgQueue};
use scanstate_ingest::{
    db, Config, InboundMessage, Ingestor, MemoryScanStore, PgScanStore, ScanDecoder, ScanStore,
    Subscription, TracingReporter,
};
use sqlx::PgPool;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "scanstate-ingest")]
#[command(author, version, about = "Ingest scan results into last-write-wins endpoint state")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume scan messages until interrupted
    Run {
        /// Where scan state is persisted
        #[arg(long, value_enum, default_value_t = StoreKind::Postgres)]
        store: StoreKind,

        /// Where scan messages come from
        #[arg(long, value_enum, default_value_t = QueueKind::Postgres)]
        queue: QueueKind,

        /// Override INGEST_MAX_IN_FLIGHT
        #[arg(long)]
        max_in_flight: Option<usize>,

        /// Apply database migrations before starting
        #[arg(long)]
        migrate: bool,
    },

    /// Enqueue scan messages, one JSON object per line
    Publish {
        /// Input file, or "-" for stdin
        #[arg(default_value = "-")]
        input: String,
    },

    /// Apply database migrations and exit
    Migrate,

    /// Print the stored state of one endpoint
    Show {
        #[arg(long)]
        ip: Ipv4Addr,

        #[arg(long)]
        port: u16,

        #[arg(long)]
        service: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum StoreKind {
    Postgres,
    /// In-process store, discarded on exit
    Memory,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum QueueKind {
    Postgres,
    /// Newline-delimited messages on stdin
    Stdin,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("scanstate-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let config = Config::load().context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            store,
            queue,
            max_in_flight,
            migrate,
        } => run(config, store, queue, max_in_flight, migrate).await,
        Command::Publish { input } => publish(&config, &input).await,
        Command::Migrate => {
            let pool = connect(&config).await?;
            db::run_migrations(&pool).await?;
            Ok(())
        }
        Command::Show { ip, port, service } => show(&config, ScanKey::new(ip, port, service)).await,
    }
}

async fn connect(config: &Config) -> Result<PgPool> {
    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    db::health_check(&pool).await?;
    Ok(pool)
}

async fn run(
    mut config: Config,
    store_kind: StoreKind,
    queue_kind: QueueKind,
    max_in_flight: Option<usize>,
    migrate: bool,
) -> Result<()> {
    if let Some(max_in_flight) = max_in_flight {
        config.ingest.max_in_flight = max_in_flight;
        config.validate()?;
    }

    let needs_database = store_kind == StoreKind::Postgres || queue_kind == QueueKind::Postgres;
    let pool = if needs_database {
        let pool = connect(&config).await?;
        if migrate {
            db::run_migrations(&pool).await?;
        }
        Some(pool)
    } else {
        None
    };

    let memory_store = Arc::new(MemoryScanStore::new());
    let store: Arc<dyn ScanStore> = match (&pool, store_kind) {
        (Some(pool), StoreKind::Postgres) => Arc::new(PgScanStore::new(pool.clone())),
        _ => memory_store.clone(),
    };

    let ingestor = Ingestor::new(
        ScanDecoder::default(),
        store,
        TracingReporter,
        config.ingestor_config(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    info!(store = ?store_kind, queue = ?queue_kind, "Starting ingestion");

    let stats = match (&pool, queue_kind) {
        (Some(pool), QueueKind::Postgres) => {
            let queue = PgQueue::new(pool.clone(), config.queue_config());
            ingestor.run(queue.subscribe(), shutdown).await
        }
        _ => {
            let stdin = BufReader::new(tokio::io::stdin());
            ingestor.run(LinesSubscription::new(stdin), shutdown).await
        }
    };

    info!(
        received = stats.received,
        acknowledged = stats.acknowledged(),
        rejected = stats.rejected(),
        "Ingestion finished"
    );

    if store_kind == StoreKind::Memory {
        let mut rows = memory_store.snapshot().await;
        rows.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        for row in rows {
            println!(
                "{}\t{}\t{}",
                row.key,
                row.updated_at.to_rfc3339(),
                String::from_utf8_lossy(&row.data)
            );
        }
    }

    Ok(())
}

async fn publish(config: &Config, input: &str) -> Result<()> {
    let pool = connect(config).await?;
    let queue = PgQueue::new(pool, config.queue_config());

    let published = if input == "-" {
        publish_lines(&queue, BufReader::new(tokio::io::stdin())).await?
    } else {
        let path = PathBuf::from(input);
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        publish_lines(&queue, BufReader::new(file)).await?
    };

    let depth = queue.depth().await?;
    info!(
        published,
        pending = depth.pending,
        failed = depth.failed,
        "Messages published"
    );
    Ok(())
}

async fn publish_lines<R>(queue: &PgQueue, reader: R) -> Result<u64>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut lines = LinesSubscription::new(reader);
    let mut published = 0;
    while let Some(line) = lines.next().await? {
        queue.publish(line.body()).await?;
        line.ack().await?;
        published += 1;
    }
    Ok(published)
}

async fn show(config: &Config, key: ScanKey) -> Result<()> {
    let pool = connect(config).await?;
    let store = PgScanStore::new(pool);

    match store.get(&key).await? {
        Some(row) => println!(
            "{}\t{}\t{}",
            row.key,
            row.updated_at.to_rfc3339(),
            String::from_utf8_lossy(&row.data)
        ),
        None => println!("No scan stored for {key}"),
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping intake");
        },
        _ = terminate => {
            info!("Received terminate signal, stopping intake");
        },
    }
}
