//! Trading Agent
//!
//! Scans the futures universe for entries and manages the resulting positions
//! for every configured account until interrupted.

mod paper;
mod runtime;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use exchange_core::config::AppConfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "agent", about = "Autonomous leveraged-futures trading agent")]
struct Args {
    /// TOML configuration file. Defaults to ./agent.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trade against an in-memory exchange fed with live market data.
    #[arg(long)]
    paper: bool,

    /// Starting balance for paper trading, in USDT.
    #[arg(long, default_value_t = 10_000)]
    paper_balance: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "agent=info,trading_engine=info,exchange_core=warn,tungstenite=warn,hyper=warn"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;
    if config.users.is_empty() {
        anyhow::bail!("no users configured; set BINANCE_API_KEY/BINANCE_SECRET_KEY or [[users]]");
    }

    info!(
        users = config.users.len(),
        paper = args.paper,
        universe = config.engine.universe.len(),
        "Starting trading agent"
    );

    let mut agent = if args.paper {
        runtime::Agent::paper(config, args.paper_balance).await?
    } else {
        runtime::Agent::live(config)?
    };
    agent.run().await
}
