use anyhow::Result;
use clap::{Parser, Subcommand};
use fedscout_store::PgStore;
use fedscout_sync::DiscoveryConfig;

#[derive(Debug, Parser)]
#[command(name = "fedscout-cli")]
#[command(about = "Federal Opportunity Scout command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one forced discovery cycle and write through to the cache.
    Sync,
    /// Bootstrap the cache schema.
    Migrate,
    /// Serve the JSON API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync => {
            let response = fedscout_sync::run_discovery_once_from_env().await?;
            println!(
                "sync complete: found={} written_codes={} wildcard={}",
                response.total_found, response.code_count, response.wildcard
            );
        }
        Commands::Migrate => {
            let config = DiscoveryConfig::from_env();
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            fedscout_web::serve_from_env().await?;
        }
    }

    Ok(())
}
