//! Discord message handling.

use std::sync::Arc;

use serenity::model::channel::Message;
use serenity::prelude::*;
use tracing::{debug, error, warn};

use crate::bridge::BridgeRegistry;
use crate::common::OutboundMessage;
use crate::discord::commands::CommandHandler;

pub struct BridgeHandler {
    registry: Arc<BridgeRegistry>,
    commands: CommandHandler,
}

impl BridgeHandler {
    pub fn new(registry: Arc<BridgeRegistry>, commands: CommandHandler) -> Self {
        Self { registry, commands }
    }

    pub async fn handle_message(&self, ctx: Context, msg: Message) {
        // Ignore our own messages, other bots and DMs.
        if msg.author.id == ctx.cache.current_user().id || msg.author.bot {
            return;
        }
        let Some(guild_id) = msg.guild_id else {
            return;
        };

        match self.commands.handle_command(&ctx, &msg).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                error!("Failed to handle bridge command: {}", e);
                return;
            }
        }

        let body = message_body(&msg);
        if body.is_empty() {
            return;
        }

        let outbound = OutboundMessage::new(display_name(&msg), body);
        let result = self
            .registry
            .forward_from_local(guild_id.get(), msg.channel_id.get(), &outbound)
            .await;

        let reaction = match result {
            None => return,
            Some(Ok(())) => '✅',
            Some(Err(e)) => {
                warn!(bridge = guild_id.get(), "Failed to forward to team chat: {}", e);
                '❌'
            }
        };

        if let Err(e) = msg.react(&ctx.http, reaction).await {
            debug!("Failed to react to message: {}", e);
        }
    }
}

/// Server nickname if set, else the account name.
fn display_name(msg: &Message) -> String {
    msg.member
        .as_ref()
        .and_then(|m| m.nick.clone())
        .or_else(|| msg.author.global_name.clone())
        .unwrap_or_else(|| msg.author.name.clone())
}

/// Message text with attachment urls appended.
fn message_body(msg: &Message) -> String {
    let mut parts = Vec::with_capacity(1 + msg.attachments.len());
    let content = msg.content.trim();
    if !content.is_empty() {
        parts.push(content.to_string());
    }
    parts.extend(msg.attachments.iter().map(|a| a.url.clone()));
    parts.join(" ")
}
