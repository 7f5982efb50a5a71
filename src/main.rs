//! Kura - tenant-scoped trace block storage

use anyhow::Context;
use clap::Parser;
use kura::{app::App, config::Config, logging};
use std::path::PathBuf;
use tracing::info;

/// Kura - trace block storage with bloom/index lookups and compaction
#[derive(Parser, Debug)]
#[command(name = "kura")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level filter, overrides logging.level (RUST_LOG still wins)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    if args.check_config {
        println!("configuration {} is valid", args.config.display());
        return Ok(());
    }

    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    logging::init_subscriber(&config.logging)?;

    info!("Starting Kura v{}", kura::VERSION);
    info!("Loaded configuration from {:?}", args.config);

    let app = App::build(config).await?;
    app.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    })
    .await?;

    Ok(())
}
