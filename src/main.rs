//! Funnelbot CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt as _;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "funnelbot")]
#[command(about = "Timed three-step outbound messaging funnel for Telegram private chats")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "funnelbot.toml")]
    config: std::path::PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("starting funnelbot");

    let config = funnelbot::config::Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    let db = funnelbot::db::Db::connect(&config.database.path)
        .await
        .with_context(|| format!("failed to open database {}", config.database.path.display()))?;
    let store = funnelbot::funnel::UserStore::new(db.pool.clone());

    tracing::info!(database = %config.database.path.display(), "database ready");

    // Clear send guards stranded by an earlier crash so those users become
    // eligible again.
    let released = store
        .release_stale_sends(config.funnel.stale_send_timeout())
        .await?;
    if released > 0 {
        tracing::warn!(released, "cleared stale send guards from a previous run");
    }

    let gateway = Arc::new(funnelbot::telegram::TelegramGateway::new(
        config.telegram.bot_token.clone(),
        config.telegram.poll_timeout_secs,
    ));
    gateway
        .connect()
        .await
        .with_context(|| "failed to reach the Telegram API")?;

    let orchestrator = Arc::new(funnelbot::funnel::Orchestrator::new(
        store,
        gateway.clone(),
        config.funnel.clone(),
        config.greeting.clone(),
    ));

    let mut events = gateway.clone().start();

    tracing::info!("funnelbot started, receiving updates");

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    tracing::warn!("inbound event stream ended");
                    break;
                };
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator.process_event(event).await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    db.close().await;
    tracing::info!("funnelbot stopped");
    Ok(())
}
