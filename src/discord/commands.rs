//! Bridge administration commands (`!rustbridge setup`, `!rustbridge status`, ...).
//!
//! Parsing and execution are independent of serenity. The handler only
//! feeds message text in and posts the returned reply.

use std::sync::Arc;

use serenity::model::channel::Message;
use serenity::prelude::*;
use tracing::{debug, info, warn};

use crate::bridge::BridgeRegistry;
use crate::common::error::BridgeError;
use crate::common::{BridgeId, BridgeStatus, ConnectionState, LocalChannelId};
use crate::config::{PushCredentials, ServerCredentials};

/// A parsed administrative command.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    Setup(ServerCredentials),
    /// Set the bridge channel. `None` means the channel the command came from.
    Channel(Option<LocalChannelId>),
    Enable,
    Disable,
    Status,
    Reconnect,
    Clear,
    PushStatus,
    PushSet(PushCredentials),
    PushClear,
    PushEnable,
    PushDisable,
    PollInterval(u64),
    Help,
}

impl AdminCommand {
    /// Commands whose message carries secrets.
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Setup(_) | Self::PushSet(_))
    }
}

/// Parse `content` if it starts with `prefix`.
///
/// Returns `None` for messages that are not bridge commands and
/// `Some(Err(usage))` for malformed ones.
pub fn parse_command(prefix: &str, content: &str) -> Option<Result<AdminCommand, String>> {
    let rest = content.trim().strip_prefix(prefix)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let rest = rest.trim();
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    Some(parse_subcommand(&name.to_lowercase(), args))
}

fn parse_subcommand(name: &str, args: &str) -> Result<AdminCommand, String> {
    match name {
        "" | "help" => Ok(AdminCommand::Help),
        "setup" => parse_setup(args),
        "channel" => parse_channel(args).map(AdminCommand::Channel),
        "enable" => Ok(AdminCommand::Enable),
        "disable" => Ok(AdminCommand::Disable),
        "status" => Ok(AdminCommand::Status),
        "reconnect" => Ok(AdminCommand::Reconnect),
        "clear" => Ok(AdminCommand::Clear),
        "push" => match args {
            "" => Ok(AdminCommand::PushStatus),
            a if a.eq_ignore_ascii_case("clear") => Ok(AdminCommand::PushClear),
            json => PushCredentials::parse(json)
                .map(AdminCommand::PushSet)
                .map_err(|e| format!("Invalid push credentials: {}", e)),
        },
        "pushenable" => Ok(AdminCommand::PushEnable),
        "pushdisable" => Ok(AdminCommand::PushDisable),
        "pollinterval" => args
            .parse::<u64>()
            .map(AdminCommand::PollInterval)
            .map_err(|_| "Usage: pollinterval <seconds 1-60>".to_string()),
        other => Err(format!("Unknown command `{}`. Try `help`.", other)),
    }
}

fn parse_setup(args: &str) -> Result<AdminCommand, String> {
    const USAGE: &str = "Usage: setup <server_ip> <server_port> <player_id> <player_token>";

    let parts: Vec<&str> = args.split_whitespace().collect();
    let [address, port, player_id, player_token] = parts.as_slice() else {
        return Err(USAGE.to_string());
    };

    Ok(AdminCommand::Setup(ServerCredentials {
        address: address.to_string(),
        port: port
            .parse()
            .map_err(|_| format!("Invalid port `{}`. {}", port, USAGE))?,
        player_id: player_id
            .parse()
            .map_err(|_| format!("Invalid player id `{}`. {}", player_id, USAGE))?,
        player_token: player_token
            .parse()
            .map_err(|_| format!("Invalid player token. {}", USAGE))?,
    }))
}

/// Accepts a channel mention (`<#123>`), a raw id, or nothing.
fn parse_channel(args: &str) -> Result<Option<LocalChannelId>, String> {
    if args.is_empty() {
        return Ok(None);
    }
    let raw = args
        .strip_prefix("<#")
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(args);
    raw.parse()
        .map(Some)
        .map_err(|_| format!("Invalid channel `{}`", args))
}

/// Who sent a command, and from where.
#[derive(Debug, Clone, Copy)]
pub struct Invocation {
    pub guild: BridgeId,
    pub user: u64,
    pub channel: LocalChannelId,
}

pub struct CommandHandler {
    registry: Arc<BridgeRegistry>,
    prefix: String,
    admins: Vec<u64>,
}

impl CommandHandler {
    pub fn new(registry: Arc<BridgeRegistry>, prefix: String, admins: Vec<u64>) -> Self {
        Self {
            registry,
            prefix,
            admins,
        }
    }

    /// Parse and execute a command from Discord.
    ///
    /// Returns `true` if the message was a bridge command, `false` otherwise.
    pub async fn handle_command(&self, ctx: &Context, msg: &Message) -> anyhow::Result<bool> {
        let Some(guild_id) = msg.guild_id else {
            return Ok(false);
        };
        let Some(parsed) = parse_command(&self.prefix, &msg.content) else {
            return Ok(false);
        };

        let invocation = Invocation {
            guild: guild_id.get(),
            user: msg.author.id.get(),
            channel: msg.channel_id.get(),
        };

        let reply = match parsed {
            Ok(command) => {
                if command.is_sensitive() {
                    // Player tokens and push credentials should not stay in the channel.
                    if let Err(e) = msg.delete(&ctx.http).await {
                        warn!("Could not delete message carrying credentials: {}", e);
                    }
                }
                self.run(invocation, command).await
            }
            Err(usage) => format!("❌ {}", usage),
        };

        msg.channel_id.say(&ctx.http, reply).await?;
        Ok(true)
    }

    /// Execute a parsed command and render the reply.
    pub async fn run(&self, invocation: Invocation, command: AdminCommand) -> String {
        if !self.admins.contains(&invocation.user) {
            info!(
                "Rejected bridge command from non-admin {} in guild {}",
                invocation.user, invocation.guild
            );
            return "❌ You are not allowed to manage the bridge.".to_string();
        }

        debug!("Bridge command {:?} in guild {}", command, invocation.guild);
        match self.execute(invocation, command).await {
            Ok(reply) => reply,
            Err(e) => format!("❌ {}", e),
        }
    }

    async fn execute(
        &self,
        invocation: Invocation,
        command: AdminCommand,
    ) -> Result<String, BridgeError> {
        let guild = invocation.guild;
        let registry = &self.registry;

        let reply = match command {
            AdminCommand::Help => self.help(),
            AdminCommand::Setup(server) => {
                let endpoint = server.endpoint();
                let player_id = server.player_id;
                registry.setup(guild, server, invocation.user).await?;
                format!(
                    "✅ Rust+ credentials configured!\nServer: `{}`\nPlayer ID: `{}`\nNext: `{} channel` and `{} enable`.",
                    endpoint, player_id, self.prefix, self.prefix
                )
            }
            AdminCommand::Channel(channel) => {
                let channel = channel.unwrap_or(invocation.channel);
                registry.set_channel(guild, channel).await?;
                format!("✅ Bridge channel set to <#{}>", channel)
            }
            AdminCommand::Enable => {
                registry.enable(guild).await?;
                "✅ Bridge enabled, connecting to the Rust server...".to_string()
            }
            AdminCommand::Disable => {
                if registry.disable(guild).await? {
                    "✅ Bridge disabled".to_string()
                } else {
                    "ℹ️ Bridge was not running".to_string()
                }
            }
            AdminCommand::Status => match registry.status(guild).await {
                Some(status) => render_status(&status),
                None => format!("ℹ️ Bridge is not configured. Start with `{} setup`.", self.prefix),
            },
            AdminCommand::Reconnect => {
                registry.reconnect(guild).await?;
                "🔄 Reconnecting to the Rust server...".to_string()
            }
            AdminCommand::Clear => {
                if registry.clear(guild).await? {
                    "✅ All bridge configuration cleared".to_string()
                } else {
                    "ℹ️ Nothing to clear".to_string()
                }
            }
            AdminCommand::PushStatus => match registry.status(guild).await {
                Some(status) if status.push_requested && status.push_configured => {
                    "✅ Push is enabled and configured".to_string()
                }
                Some(status) if status.push_configured => format!(
                    "⚠️ Push credentials are configured but push is not enabled. Use `{} pushenable`.",
                    self.prefix
                ),
                _ => "❌ Push is not configured. Provide credentials or keep polling.".to_string(),
            },
            AdminCommand::PushSet(credentials) => {
                registry.set_push_credentials(guild, Some(credentials)).await?;
                format!(
                    "✅ Push credentials configured! Use `{} pushenable` to turn on push delivery.",
                    self.prefix
                )
            }
            AdminCommand::PushClear => {
                registry.set_push_credentials(guild, None).await?;
                registry.set_use_push(guild, false).await?;
                "✅ Push credentials cleared. The bridge will poll.".to_string()
            }
            AdminCommand::PushEnable => {
                registry.set_use_push(guild, true).await?;
                "✅ Push delivery enabled".to_string()
            }
            AdminCommand::PushDisable => {
                registry.set_use_push(guild, false).await?;
                "✅ Push delivery disabled. The bridge will poll.".to_string()
            }
            AdminCommand::PollInterval(secs) => {
                registry.set_poll_interval(guild, secs).await?;
                format!("✅ Polling interval set to {} seconds", secs)
            }
        };

        Ok(reply)
    }

    fn help(&self) -> String {
        let p = &self.prefix;
        format!(
            "**Rust+ bridge commands:**\n\
             • `{p} setup <ip> <port> <player_id> <player_token>` - Store server credentials\n\
             • `{p} channel [#channel]` - Set the bridge channel\n\
             • `{p} enable` / `{p} disable` - Start or stop the bridge\n\
             • `{p} status` - Show connection status\n\
             • `{p} reconnect` - Drop the connection and start over\n\
             • `{p} push [<json>|clear]` - Show, set or clear push credentials\n\
             • `{p} pushenable` / `{p} pushdisable` - Toggle push delivery\n\
             • `{p} pollinterval <1-60>` - Set the polling interval\n\
             • `{p} clear` - Forget all bridge settings"
        )
    }
}

fn render_status(status: &BridgeStatus) -> String {
    let session = &status.session;
    let mut lines = vec!["**Rust+ bridge status**".to_string()];

    lines.push(format!(
        "Enabled: {}",
        if status.enabled { "yes" } else { "no" }
    ));
    lines.push(format!(
        "Server: {}",
        status.server.as_deref().unwrap_or("not configured")
    ));
    lines.push(match status.channel_id {
        Some(channel) => format!("Channel: <#{}>", channel),
        None => "Channel: not set".to_string(),
    });

    let connection = match (session.state, session.mode) {
        (ConnectionState::Connected, Some(mode)) => format!("connected ({})", mode),
        (state, _) => state.to_string(),
    };
    lines.push(format!("Connection: {}", connection));

    if session.retry_count > 0 {
        lines.push(format!("Retries: {}", session.retry_count));
    }
    if let Some(error) = &session.last_error {
        lines.push(format!("Last error: {}", error));
    }
    if let Some(activity) = session.last_activity {
        lines.push(format!("Last activity: <t:{}:R>", activity.timestamp()));
    }

    lines.push(format!(
        "Poll interval: {}s",
        status.poll_interval.as_secs()
    ));
    lines.push(format!(
        "Push: {}, {}",
        if status.push_configured { "configured" } else { "not configured" },
        if status.push_requested { "requested" } else { "not requested" }
    ));

    lines.join("\n")
}
