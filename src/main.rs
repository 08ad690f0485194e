//! Settlement keeper entry point.
//!
//! Runs one or both keeper roles against a deployment:
//! - open: `openTrades` for queued trades and limit orders, plus
//!   `resolveQueuedTrades` for entries stuck in the record store
//! - close: `executeOptions` for expired options, plus the settled-outcome
//!   sync back to the record store
//!
//! Each role signs with its own account and runs as an independent loop in
//! the same process.

use anyhow::Result;
use clap::Parser;
use keeper_bot::config::load_config;
use keeper_bot::keeper::{build_context, open_stores, run_role, Role};
use tracing::info;

/// Options settlement keeper
#[derive(Parser)]
#[command(name = "keeper-bot")]
struct Args {
    /// Which role(s) to run (open, close, all)
    #[arg(short, long, default_value = "all")]
    bot: String,

    /// Deployment to run against (e.g. arb-mainnet, polygon-testnet)
    #[arg(short, long, env = "ENVIRONMENT")]
    environment: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let roles: Vec<Role> = match args.bot.as_str() {
        "open" => vec![Role::Open],
        "close" => vec![Role::Close],
        "all" => vec![Role::Open, Role::Close],
        other => anyhow::bail!("unknown bot role '{other}' (expected open, close, or all)"),
    };

    let config = load_config(&args.environment)?;
    info!(
        "keeper starting on {} (chain {}, router {})",
        config.environment, config.chain_id, config.deployment.router
    );

    // One store pair for the whole process; every role writes through it
    let stores = open_stores(&config);
    let mut tasks = Vec::new();
    for role in roles {
        let ctx = build_context(config.clone(), role, stores.clone()).await?;
        tasks.push(tokio::spawn(run_role(ctx)));
    }
    // Role loops never return; surface a panic if one dies
    futures::future::try_join_all(tasks).await?;
    Ok(())
}
