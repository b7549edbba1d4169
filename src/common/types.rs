//! Shared types used across the application.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Identity of a bridge (the Discord guild that owns it).
pub type BridgeId = u64;

/// Discord channel identifier.
pub type LocalChannelId = u64;

/// Connection lifecycle state of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disabled,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Active ingestion strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryModeKind {
    Push,
    Poll,
}

impl fmt::Display for DeliveryModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => f.write_str("push"),
            Self::Poll => f.write_str("poll"),
        }
    }
}

/// Live view of a bridge's session, published by the connection manager.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect.
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Only set while connected.
    pub mode: Option<DeliveryModeKind>,
}

/// Snapshot returned by `status()` for the command layer.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeStatus {
    pub enabled: bool,
    pub server: Option<String>,
    pub channel_id: Option<LocalChannelId>,
    pub session: SessionStatus,
    pub poll_interval: Duration,
    pub push_configured: bool,
    pub push_requested: bool,
}
