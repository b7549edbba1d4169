//! Discord bot integration.
//!
//! Provides the local side of every bridge: team chat notifications are
//! posted as embeds and bridge channel messages are forwarded to the team
//! chat. Administrative commands are handled here too.

pub mod client;
pub mod commands;
pub mod handler;

pub use client::{DiscordBot, DiscordChannel};
pub use commands::CommandHandler;
pub use handler::BridgeHandler;
