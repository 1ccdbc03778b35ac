use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pricedragon_storage::PgCatalogStore;
use pricedragon_sync::{SyncConfig, SyncRunner};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pricedragon-cli")]
#[command(about = "PriceDragon catalog ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion per query against every enabled source.
    Sync {
        /// Defaults to PRICEDRAGON_SYNC_QUERIES.
        #[arg(long = "query", short)]
        queries: Vec<String>,
    },
    /// Apply database migrations.
    Migrate,
    /// Mark stale running sessions as failed.
    Sweep {
        #[arg(long)]
        stale_minutes: Option<i64>,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pricedragon=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { queries: Vec::new() }) {
        Commands::Sync { queries } => {
            let queries = if queries.is_empty() {
                config.sync_queries.clone()
            } else {
                queries
            };
            if queries.is_empty() {
                bail!("no query given; pass --query or set PRICEDRAGON_SYNC_QUERIES");
            }
            let runner = SyncRunner::from_config(config).await?;
            for query in &queries {
                let summary = runner.run_once(query).await?;
                println!(
                    "sync complete: session_id={} query={:?} batches={} records={} inserted={} updated={} failed={} matches={} reports={}",
                    summary.session_id,
                    summary.query,
                    summary.archived_batches.len(),
                    summary.total_records,
                    summary.inserted,
                    summary.updated,
                    summary.failed,
                    summary.matches_created,
                    summary.reports_dir
                );
            }
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to migrate");
            };
            let store = PgCatalogStore::connect(url)
                .await
                .context("connecting to catalog database")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Sweep { stale_minutes } => {
            if let Some(minutes) = stale_minutes {
                config.stale_session_minutes = minutes;
            }
            let runner = SyncRunner::from_config(config).await?;
            let swept = runner.sweep_stale_sessions().await?;
            println!("swept {swept} stale sessions");
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let runner = Arc::new(SyncRunner::from_config(config).await?);
            let Some(mut sched) = runner.maybe_build_scheduler().await? else {
                bail!("nothing to schedule; set PRICEDRAGON_SYNC_QUERIES");
            };
            sched.start().await.context("starting scheduler")?;
            info!(crons = ?runner.config().sync_crons, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
