use clap::Parser;
use procache::ProcessedImageCache;
use tracing::{Level, debug, error};
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;
mod error;
mod utils;

use cli::CliArgs;
use commands::CommandExecutor;
use config::FileConfig;
use error::AppError;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    let config = FileConfig::load(args.config.as_deref())?.into_cache_config(&args)?;
    debug!(?config, "Resolved cache configuration");

    let cache = ProcessedImageCache::open(config).await?;
    CommandExecutor::new(cache).execute(args.command).await
}
