//! Rustbridge - Discord to Rust+ team chat bridge
//!
//! Keeps one Discord channel per guild in sync with the team chat of a Rust
//! game server, reached through a Rust+ companion connection.

mod bridge;
mod common;
mod config;
mod discord;
mod remote;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use bridge::{BridgeContext, BridgeRegistry};
use config::{env::get_config_path, load_and_validate, ConfigStore};
use discord::{BridgeHandler, CommandHandler, DiscordBot, DiscordChannel};
use remote::CompanionLink;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Rustbridge v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = get_config_path();
    info!("Loading configuration from {}...", config_path);

    let config = load_and_validate(&config_path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        error!("Please ensure {} exists and is properly formatted.", config_path);
        error!("See rustbridge.conf.example for reference.");
        e
    })?;

    info!("Configuration loaded successfully");
    info!("  Command prefix: {}", config.discord.command_prefix);
    info!("  Admins: {}", config.discord.admins.len());
    info!("  Bridge store: {}", config.store.path);

    let store = ConfigStore::open(&config.store.path).await?;

    let global_push = config
        .push
        .as_ref()
        .and_then(|push| push.credentials.clone())
        .map(Arc::new);
    if global_push.is_some() {
        info!("Global push credentials configured");
    }

    // Team chat -> Discord, posted while the bot has a gateway session.
    let local_channel = DiscordChannel::new();

    let ctx = BridgeContext {
        link: Arc::new(CompanionLink),
        local: Arc::new(local_channel.clone()),
        defaults: Arc::new(config.bridge.clone()),
        global_push,
        events: None,
    };
    let registry = Arc::new(BridgeRegistry::load(store, ctx).await);

    // ============================================================
    // Start Discord bot
    // ============================================================
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let commands = CommandHandler::new(
        registry.clone(),
        config.discord.command_prefix.clone(),
        config.discord.admins.clone(),
    );
    let handler = BridgeHandler::new(registry.clone(), commands);
    let discord_bot =
        DiscordBot::build(config.discord.token.clone(), handler, local_channel, shutdown_rx).await?;

    info!("Starting Discord bot...");
    let mut discord_task = tokio::spawn(discord_bot.run());

    // Bridges that were enabled before the last shutdown.
    registry.start_enabled().await;

    let shutdown = tokio::select! {
        biased;
        _ = shutdown_signal() => {
            info!("Shutdown signal received - stopping bridges...");
            true
        }
        _ = &mut discord_task => false,
    };

    let timeout = Duration::from_secs(5);
    if tokio::time::timeout(timeout, registry.shutdown()).await.is_err() {
        warn!("Bridge shutdown timed out");
    }

    if shutdown {
        if let Err(e) = shutdown_tx.send(true) {
            warn!("Discord task already exited: {}", e);
        }
        match tokio::time::timeout(timeout, discord_task).await {
            Ok(Ok(())) => info!("Discord disconnected gracefully"),
            Ok(Err(e)) => warn!("Discord task panicked: {}", e),
            Err(_) => warn!("Discord shutdown timed out"),
        }
    }

    info!("Exiting...");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
