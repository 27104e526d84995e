use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hsw-cli")]
#[command(about = "HALEU Supply Watch command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over every enabled source.
    Sync,
    /// Apply the database schema.
    Migrate,
    /// Serve the REST API (and the scheduler, when enabled).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = hsw_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} sources={} failed={}",
                summary.run_id,
                summary.sources.len(),
                summary.failed_sources()
            );
        }
        Commands::Migrate => {
            let config = hsw_sync::SyncConfig::from_env();
            let db = hsw_storage::Database::connect(&config.database_url).await?;
            db.migrate().await?;
            println!("schema applied");
        }
        Commands::Serve => {
            hsw_web::serve_from_env().await?;
        }
    }

    Ok(())
}
