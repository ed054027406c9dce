//! Roster Ingest - queue worker and one-shot ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roster_common::logging::{init_logging, LogConfig, LogLevel};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use roster_ingest::config::Config;
use roster_ingest::dedup::PgDedupStore;
use roster_ingest::queue::PgNotificationQueue;
use roster_ingest::worker::IngestWorker;
use roster_ingest::writer::PgLoadWriter;
use roster_ingest::{fetcher, FileReference, IngestionPipeline};

#[derive(Parser, Debug)]
#[command(name = "roster-ingest")]
#[command(author, version, about = "Roster CSV ingestion worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the notification queue and ingest delivered files
    Worker {
        /// Apply pending migrations before starting
        #[arg(long)]
        migrate: bool,
    },

    /// Ingest the given blob paths once and exit
    Ingest {
        /// Blob paths, e.g. raw/enrollment.csv
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Publish notifications for the given blob paths
    Enqueue {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Show the registered file contracts
    Schemas,

    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("roster-ingest")
        .filter_directives(if cli.verbose {
            "roster_ingest=debug,roster_common=debug,sqlx=warn"
        } else {
            "roster_ingest=info,roster_common=info,sqlx=warn"
        })
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_lookup(log_config, |key| std::env::var(key).ok())?;
    let _log_guard = init_logging(&log_config)?;

    let config = Config::load()?;

    match cli.command {
        Command::Worker { migrate } => run_worker(&config, migrate).await,
        Command::Ingest { paths } => ingest_once(&config, &paths, cli.json).await,
        Command::Enqueue { paths } => enqueue(&config, &paths).await,
        Command::Schemas => show_schemas(&config, cli.json),
        Command::Migrate => {
            let pool = connect(&config).await?;
            run_migrations(&pool).await
        },
    }
}

async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;

    info!("Database connection pool established");
    Ok(pool)
}

async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");
    Ok(())
}

async fn build_pipeline(config: &Config, pool: &PgPool) -> Result<IngestionPipeline> {
    let registry = config
        .registry
        .load()
        .context("Failed to load schema registry")?;
    info!(contracts = registry.len(), "Schema registry loaded");

    let fetcher = fetcher::from_config(&config.source).await?;

    Ok(IngestionPipeline::new(
        Arc::new(registry),
        fetcher,
        Arc::new(PgDedupStore::new(pool.clone(), config.dedup.reservation_ttl())),
        Arc::new(PgLoadWriter::new(pool.clone())),
    ))
}

async fn run_worker(config: &Config, migrate: bool) -> Result<()> {
    info!("Starting roster ingest worker");

    let pool = connect(config).await?;
    if migrate {
        run_migrations(&pool).await?;
    }

    let pipeline = build_pipeline(config, &pool).await?;
    let queue = Arc::new(PgNotificationQueue::new(pool.clone()));
    let worker = IngestWorker::new(pipeline, queue, config.worker.clone());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let stats = worker.run(shutdown).await;

    pool.close().await;
    info!(received = stats.received, "Worker shut down gracefully");

    Ok(())
}

async fn ingest_once(config: &Config, paths: &[String], json: bool) -> Result<()> {
    let pool = connect(config).await?;
    let pipeline = build_pipeline(config, &pool).await?;

    let mut failed = 0usize;
    for path in paths {
        let file = FileReference::new(path.as_str());
        let Some(outcome) = pipeline
            .ingest_within(&file, config.worker.ingest_timeout())
            .await
        else {
            failed += 1;
            if json {
                println!("{}", serde_json::json!({ "file": file.as_str(), "outcome": "timeout" }));
            } else {
                println!("{}\ttimeout\tgave up after {}s", file, config.worker.ingest_timeout_secs);
            }
            continue;
        };
        if !outcome.is_success() {
            failed += 1;
        }

        let report = outcome.report(&file);
        if json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            match (&report.rows, &report.error) {
                (Some(rows), _) => println!("{}\t{}\t{} rows", file, report.outcome, rows),
                (_, Some(error)) => println!("{}\t{}\t{}", file, report.outcome, error),
                _ => println!("{}\t{}", file, report.outcome),
            }
        }
    }

    pool.close().await;

    if failed > 0 {
        anyhow::bail!("{} of {} files failed", failed, paths.len());
    }
    Ok(())
}

async fn enqueue(config: &Config, paths: &[String]) -> Result<()> {
    let pool = connect(config).await?;
    let queue = PgNotificationQueue::new(pool.clone());

    for path in paths {
        let file = FileReference::new(path.as_str());
        let id = queue
            .publish(&file)
            .await
            .with_context(|| format!("Failed to enqueue {}", file))?;
        info!(id = id, file = %file, "Notification enqueued");
    }

    pool.close().await;
    Ok(())
}

fn show_schemas(config: &Config, json: bool) -> Result<()> {
    let registry = config
        .registry
        .load()
        .context("Failed to load schema registry")?;

    if json {
        let entries: Vec<_> = registry
            .iter()
            .map(|(file_name, contract)| {
                serde_json::json!({
                    "file_name": file_name,
                    "table": contract.table(),
                    "columns": contract.columns(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for (file_name, contract) in registry.iter() {
            println!("{} -> {} ({})", file_name, contract.table(), contract.columns().join(", "));
        }
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
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
