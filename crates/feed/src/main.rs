//! tradewire feed binary
//!
//! Loads configuration, initializes tracing, and runs one exchange feed with
//! clock synchronization until Ctrl+C.

mod feed;

use std::path::PathBuf;

use clap::Parser;

use tw_core::config::AppConfig;

/// tradewire market data feed
#[derive(Parser, Debug)]
#[command(name = "tw-feed", about = "Exchange market data feed with clock sync")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Force JSON log output regardless of the configured format.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::load(args.config)?;
    if args.json_logs {
        config.logging.json = true;
    }

    tw_core::logging::init_tracing(&config.logging)?;

    tracing::info!(
        exchange = %config.exchange.name,
        ws_url = %config.exchange.ws_url,
        subscriptions = config.subscriptions.len(),
        ntp = config.clock.ntp_enabled,
        "starting tw-feed"
    );

    feed::run(config).await
}
