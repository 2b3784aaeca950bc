use std::path::PathBuf;

use anyhow::{Context, Result};
use catalog_sync::{run_sync, staging, SyncConfig};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "catalog-cli")]
#[command(about = "Game store catalog sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every enabled source and write shards and/or staging rows.
    Sync {
        /// Treat every record as its own cluster.
        #[arg(long)]
        no_dedupe: bool,
        /// Shard output directory (overrides CATALOG_OUTPUT_DIR).
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        max_pages: Option<usize>,
    },
    /// Apply the staging schema to DATABASE_URL.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Sync {
        no_dedupe: false,
        out: None,
        max_pages: None,
    });

    match command {
        Commands::Sync {
            no_dedupe,
            out,
            max_pages,
        } => {
            let mut config = SyncConfig::from_env().context("invalid environment settings")?;
            if no_dedupe {
                config.dedupe = false;
            }
            if let Some(out) = out {
                config.output_dir = Some(out);
            }
            if let Some(n) = max_pages {
                config.max_pages = n;
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight pages");
                    on_signal.cancel();
                }
            });

            let result = run_sync(&config, cancel).await?;
            let summary = &result.summary;
            println!(
                "sync complete: run_id={} sources={} failed={} normalized={} rejected={} clusters={} review={}",
                summary.run_id,
                summary.sources.len(),
                summary.failed_sources(),
                summary.normalized,
                summary.rejected,
                summary.clusters,
                summary.review_candidates
            );
            if let Some(dir) = &summary.reports_dir {
                println!("reports: {dir}");
            }
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL is required for migrate")?;
            staging::run_migrations(&url).await?;
            info!("migrations complete");
        }
    }

    Ok(())
}
