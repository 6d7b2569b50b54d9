mod config;
mod error;
mod matcher;
mod monitor;
mod notify;
mod platform;
mod rules;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::Bot;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::monitor::Monitor;
use crate::platform::telegram::{Listener, TelegramSink};
use crate::store::ProcessedStore;

#[tokio::main]
async fn main() -> Result<()> {
    // .env may carry RUST_LOG, so read it before the subscriber is built
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chanwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = dotenv {
        if !e.not_found() {
            warn!("Failed to read .env file: {}", e);
        }
    }

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let rules = config.rule_set().context("Invalid rule configuration")?;

    info!("Configuration loaded successfully");
    info!("  Database: {}", config.storage.database_path.display());
    info!("  Recipient: {}", config.telegram.notify_user_id);
    info!("  Channels: {}", rules.len());
    for key in rules.channel_keys() {
        let groups = rules.groups(key).map_or(0, <[_]>::len);
        info!("    {} ({} phrase group(s))", key, groups);
    }

    // The store must be ready before any message is consumed
    let store = ProcessedStore::open(&config.storage.database_path)
        .context("Failed to initialize processed-message store")?;
    info!("  Already processed: {} message(s)", store.count().await?);

    let bot = Bot::new(&config.telegram.bot_token);
    let sink = Arc::new(TelegramSink::new(bot.clone()));
    let monitor = Arc::new(Monitor::new(&config, rules, store, sink));

    let (listener, events) = Listener::start(bot);

    info!("Waiting for messages...");
    // Polling stops before in-flight messages are drained, so nothing is
    // acknowledged to Telegram without being handled
    monitor
        .run(
            events,
            async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for shutdown signal: {}", e);
                    std::future::pending::<()>().await;
                }
            },
            || listener.halt(),
        )
        .await;

    listener.halt().await;
    listener.join().await;
    info!("Stopped");

    Ok(())
}
