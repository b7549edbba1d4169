//! Companion link frame definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::InboundMessage;

/// Error codes returned in `response` frames.
pub mod error_codes {
    pub const NOT_AUTHORIZED: &str = "not_authorized";
    pub const NOT_IN_TEAM: &str = "not_in_team";
    pub const INVALID_PUSH_TOKEN: &str = "invalid_push_token";
}

/// Frames sent by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        seq: u32,
        player_id: u64,
        player_token: i64,
    },
    SendTeamMessage {
        seq: u32,
        message: String,
    },
    GetTeamChat {
        seq: u32,
    },
    Subscribe {
        seq: u32,
        credentials: serde_json::Value,
    },
    Ping {
        seq: u32,
    },
}

#[cfg(test)]
impl ClientFrame {
    pub fn seq(&self) -> u32 {
        match self {
            Self::Auth { seq, .. }
            | Self::SendTeamMessage { seq, .. }
            | Self::GetTeamChat { seq }
            | Self::Subscribe { seq, .. }
            | Self::Ping { seq } => *seq,
        }
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Response {
        seq: u32,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        messages: Vec<WireChatMessage>,
    },
    /// Unsolicited team chat broadcast (push path).
    TeamMessage { message: WireChatMessage },
}

/// A team chat entry as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChatMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub steam_id: u64,
    pub name: String,
    pub message: String,
    /// Unix seconds.
    pub time: i64,
    #[serde(default)]
    pub color: Option<String>,
}

impl From<WireChatMessage> for InboundMessage {
    fn from(wire: WireChatMessage) -> Self {
        Self {
            server_id: wire.id,
            sender_id: wire.steam_id,
            sender_name: wire.name,
            body: wire.message,
            timestamp: DateTime::<Utc>::from_timestamp(wire.time, 0).unwrap_or_default(),
            color: wire.color,
        }
    }
}
