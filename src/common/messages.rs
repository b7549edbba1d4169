//! Canonical message types for bridge communication.
//!
//! Inbound messages come from the Rust+ team chat, outbound messages come
//! from the Discord bridge channel.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Identity used to detect duplicate inbound messages.
///
/// The server id wins when the remote supplies one. Otherwise the triple
/// `(sender, timestamp, body hash)` stands in for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Server(String),
    Derived {
        sender_id: u64,
        timestamp: i64,
        body_hash: u64,
    },
}

impl MessageId {
    pub fn derived(sender_id: u64, timestamp: DateTime<Utc>, body: &str) -> Self {
        let digest = Sha256::digest(body.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Self::Derived {
            sender_id,
            timestamp: timestamp.timestamp(),
            body_hash: u64::from_be_bytes(prefix),
        }
    }
}

/// A team chat message received from the remote server.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Unique id if the server provides one.
    pub server_id: Option<String>,
    /// Steam id of the sender.
    pub sender_id: u64,
    pub sender_name: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    /// Team color tag, e.g. `#AAFF55`.
    pub color: Option<String>,
}

impl InboundMessage {
    pub fn id(&self) -> MessageId {
        match &self.server_id {
            Some(id) => MessageId::Server(id.clone()),
            None => MessageId::derived(self.sender_id, self.timestamp, &self.body),
        }
    }
}

/// A Discord message headed for the team chat.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub display_name: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(display_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Fallback embed color (orange) for senders without a team color.
pub const DEFAULT_NOTIFICATION_COLOR: u32 = 0xE67E22;

/// A rendered inbound message, ready for the local channel.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalNotification {
    pub author: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub color: u32,
    pub footer: String,
}

impl From<&InboundMessage> for LocalNotification {
    fn from(msg: &InboundMessage) -> Self {
        Self {
            author: msg.sender_name.clone(),
            body: msg.body.clone(),
            timestamp: msg.timestamp,
            color: msg
                .color
                .as_deref()
                .and_then(parse_hex_color)
                .unwrap_or(DEFAULT_NOTIFICATION_COLOR),
            footer: format!("Steam ID: {}", msg.sender_id),
        }
    }
}

/// Parse a `#RRGGBB` color tag.
fn parse_hex_color(tag: &str) -> Option<u32> {
    let hex = tag.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}
