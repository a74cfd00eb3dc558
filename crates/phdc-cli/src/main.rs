use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use phdc_storage::Repository;
use phdc_sync::{build_scheduler, run_collection_from_env, Collector, RunLock, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "phdc-cli")]
#[command(about = "Collect PhD listings from public sources into a local database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection pass and print its stats.
    Scrape,
    /// Create or upgrade the database schema.
    Migrate,
    /// Collect on the configured cron schedule until Ctrl+C.
    Schedule,
    /// Print the most recently collected listings.
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Scrape) {
        Commands::Scrape => {
            let stats = run_collection_from_env().await?;
            println!(
                "collection complete: scraped={} new={} duplicates={} errors={} storage_failures={}",
                stats.total_scraped,
                stats.new_saved,
                stats.duplicates,
                stats.errors,
                stats.storage_failures
            );
        }
        Commands::Migrate => {
            let repository = Repository::connect(&config.database_url).await?;
            repository.migrate().await.context("running migrations")?;
            println!("schema ready at {}", config.database_url);
        }
        Commands::Schedule => {
            let collector = Arc::new(Collector::from_config(&config).await?);
            let mut sched = build_scheduler(&config.schedule_cron, collector, RunLock::default()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.schedule_cron, "scheduler running, press Ctrl+C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl+C")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
        Commands::Recent { limit } => {
            let repository = Repository::connect(&config.database_url).await?;
            for record in repository.recent(limit).await? {
                println!(
                    "{}  [{}] {} | {} | {} | {}",
                    record.collected_at.format("%Y-%m-%d"),
                    record.region_label,
                    record.title,
                    record.university,
                    record.funding_type,
                    record.url
                );
            }
        }
    }

    Ok(())
}
