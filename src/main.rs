mod config;
mod error;
mod http;
mod pipeline;
mod platform;
mod plugins;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::platform::telegram::{self, TelegramSender};
use crate::plugins::PluginHost;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,linkbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("linkbot v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Allowed users: {:?}", config.telegram.allowed_user_ids);
    info!("  Cookies: {}", config.http.cookie_directory.display());
    info!(
        "  Retry: {} attempts, {}ms delay",
        config.retry.max_attempts, config.retry.delay_ms
    );

    let plugins = plugins::build(&config)?;

    let bot = teloxide::Bot::new(&config.telegram.bot_token);
    let sender = Arc::new(TelegramSender::new(bot.clone()));
    let host = Arc::new(PluginHost::new(
        plugins,
        sender,
        config.dispatch.max_concurrent,
    ));

    info!("Bot is starting...");
    telegram::run(host.clone(), config.telegram.allowed_user_ids.clone(), bot).await?;

    // Let in-flight lookups finish before exiting
    host.shutdown().await;
    Ok(())
}
