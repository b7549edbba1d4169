//! Discord bot client.
//!
//! Gateway events are forwarded from serenity's handler onto a channel and
//! processed by a single loop. Team chat notifications are posted directly
//! through [`DiscordChannel`], which holds the HTTP handle of the current
//! gateway session and refuses to post while the bot is disconnected.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use serenity::builder::{CreateEmbed, CreateEmbedAuthor, CreateEmbedFooter, CreateMessage};
use serenity::http::{Http, HttpBuilder};
use serenity::model::gateway::Ready;
use serenity::model::id::ChannelId;
use serenity::model::Timestamp;
use serenity::prelude::*;
use serenity::Client;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::bridge::LocalChannel;
use crate::common::{LocalChannelId, LocalNotification};
use crate::discord::handler::BridgeHandler;

#[derive(Debug, Clone)]
pub enum DiscordBotEvent {
    /// Bot connected and ready.
    Ready { context: Context, ready: Ready },
    /// Message received.
    Message {
        context: Context,
        message: serenity::model::channel::Message,
    },
    Disconnected,
}

struct DiscordBotEvents {
    discord_events_tx: mpsc::UnboundedSender<DiscordBotEvent>,
}

impl DiscordBotEvents {
    fn new(discord_events_tx: mpsc::UnboundedSender<DiscordBotEvent>) -> Self {
        Self { discord_events_tx }
    }

    fn forward(&self, event: DiscordBotEvent) {
        if let Err(error) = self.discord_events_tx.send(event) {
            warn!("Failed to process discord event: {}", error);
        }
    }
}

#[serenity::async_trait]
impl EventHandler for DiscordBotEvents {
    async fn ready(&self, context: Context, ready: Ready) {
        self.forward(DiscordBotEvent::Ready { context, ready });
    }

    async fn message(&self, context: Context, message: serenity::model::channel::Message) {
        self.forward(DiscordBotEvent::Message { context, message });
    }
}

/// [`LocalChannel`] backed by the running Discord bot.
///
/// Clones share one connection slot. The bot fills it on `Ready` and clears
/// it on disconnect.
#[derive(Clone)]
pub struct DiscordChannel {
    http: Arc<watch::Sender<Option<Arc<Http>>>>,
}

impl Default for DiscordChannel {
    fn default() -> Self {
        let (http, _) = watch::channel(None);
        Self { http: Arc::new(http) }
    }
}

impl DiscordChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, http: Arc<Http>) {
        self.http.send_replace(Some(http));
    }

    fn detach(&self) {
        self.http.send_replace(None);
    }

    fn connection(&self) -> Option<Arc<Http>> {
        self.http.borrow().clone()
    }
}

#[async_trait]
impl LocalChannel for DiscordChannel {
    async fn deliver(
        &self,
        channel: LocalChannelId,
        notification: &LocalNotification,
    ) -> anyhow::Result<()> {
        let Some(http) = self.connection() else {
            debug!("Refusing notification - Discord not connected");
            anyhow::bail!("Discord not connected");
        };

        let message = CreateMessage::new().embed(notification_embed(notification));
        ChannelId::new(channel).send_message(&http, message).await?;
        Ok(())
    }
}

/// Embed for one team chat message.
pub fn notification_embed(notification: &LocalNotification) -> CreateEmbed {
    let mut embed = CreateEmbed::new()
        .author(CreateEmbedAuthor::new(&notification.author))
        .description(&notification.body)
        .colour(notification.color)
        .footer(CreateEmbedFooter::new(&notification.footer));

    if let Ok(timestamp) = Timestamp::from_unix_timestamp(notification.timestamp.timestamp()) {
        embed = embed.timestamp(timestamp);
    }
    embed
}

async fn build_client(
    token: &str,
    discord_events_tx: mpsc::UnboundedSender<DiscordBotEvent>,
) -> anyhow::Result<Client> {
    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILDS;

    // Build a custom reqwest client with timeout settings
    let reqwest_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    let http = HttpBuilder::new(token).client(reqwest_client).build();

    let events = DiscordBotEvents::new(discord_events_tx);
    let client = serenity::client::ClientBuilder::new_with_http(http, intents)
        .event_handler(events)
        .await?;
    Ok(client)
}

pub struct DiscordBot {
    client: Option<Client>,
    token: String,
    handler: BridgeHandler,
    discord_events_rx: mpsc::UnboundedReceiver<DiscordBotEvent>,
    discord_events_tx: mpsc::UnboundedSender<DiscordBotEvent>,
    local: DiscordChannel,
    shutdown_rx: watch::Receiver<bool>,
}

impl DiscordBot {
    pub async fn build(
        token: String,
        handler: BridgeHandler,
        local: DiscordChannel,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let (discord_events_tx, discord_events_rx) = mpsc::unbounded_channel();
        let client = build_client(&token, discord_events_tx.clone()).await?;

        Ok(Self {
            client: Some(client),
            token,
            handler,
            discord_events_rx,
            discord_events_tx,
            local,
            shutdown_rx,
        })
    }

    pub async fn run(mut self) {
        // Extract shard manager before we move client into run_connection
        let shard_manager = self.client.as_ref().map(|c| c.shard_manager.clone());
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::select! {
            _ = Self::run_connection(&mut self.client, &self.token, &self.discord_events_tx) => {},
            _ = Self::process_events(&mut self.discord_events_rx, &self.local, &self.handler) => {},
            _ = async {
                while !*shutdown_rx.borrow_and_update() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                if let Some(ref manager) = shard_manager {
                    info!("Initiating graceful Discord shutdown...");
                    manager.shutdown_all().await;
                    info!("Discord shutdown complete");
                }
            } => {}
        }
        info!("Discord task ended");
    }

    async fn run_connection(
        client: &mut Option<Client>,
        token: &str,
        discord_events_tx: &mpsc::UnboundedSender<DiscordBotEvent>,
    ) {
        /// 5s initial, 5min max, factor 1.1, with jitter, unlimited retries.
        fn discord_backoff() -> impl Iterator<Item = Duration> {
            backon::ExponentialBuilder::default()
                .with_min_delay(Duration::from_secs(5))
                .with_max_delay(Duration::from_secs(5 * 60))
                .with_factor(1.1)
                .with_jitter()
                .without_max_times()
                .build()
        }

        let mut backoff = discord_backoff();

        loop {
            info!("Connecting to Discord...");

            let mut client = match client.take() {
                Some(client) => client,
                None => match build_client(token, discord_events_tx.clone()).await {
                    Ok(client) => {
                        backoff = discord_backoff();
                        client
                    }
                    Err(e) => {
                        error!("Failed to rebuild Discord client: {}", e);
                        let delay = backoff.next().unwrap_or(Duration::from_secs(5 * 60));
                        warn!("Retrying in {:.1}s...", delay.as_secs_f64());
                        sleep(delay).await;
                        continue;
                    }
                },
            };

            let result = client.start().await;
            if let Err(error) = discord_events_tx.send(DiscordBotEvent::Disconnected) {
                warn!("Failed to process discord event: {}", error);
            }

            match result {
                Ok(()) => {
                    info!("Discord client disconnected normally");
                    break;
                }
                Err(e) => {
                    error!("Discord client error: {}", e);
                    let delay = backoff.next().unwrap_or(Duration::from_secs(5 * 60));
                    warn!(
                        "Discord disconnected. Reconnecting in {:.1}s...",
                        delay.as_secs_f64(),
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn process_events(
        discord_events_rx: &mut mpsc::UnboundedReceiver<DiscordBotEvent>,
        local: &DiscordChannel,
        handler: &BridgeHandler,
    ) {
        while let Some(event) = discord_events_rx.recv().await {
            match event {
                DiscordBotEvent::Ready { context, ready } => {
                    info!(
                        "Discord bot connected as {} in {} guilds",
                        ready.user.name,
                        ready.guilds.len()
                    );
                    local.attach(context.http.clone());
                }
                DiscordBotEvent::Message { context, message } => {
                    handler.handle_message(context, message).await;
                }
                DiscordBotEvent::Disconnected => {
                    local.detach();
                }
            }
        }
        debug!("Discord events channel closed.");
    }
}
