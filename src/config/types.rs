//! Configuration type definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::reconnect::ReconnectConfig;
use crate::common::LocalChannelId;

/// Root configuration structure (HOCON file).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub discord: DiscordConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub bridge: BridgeDefaults,
    #[serde(default)]
    pub push: Option<PushConfig>,
}

/// Discord bot configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub token: String,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// User ids allowed to run bridge admin commands.
    #[serde(default)]
    pub admins: Vec<u64>,
}

fn default_command_prefix() -> String {
    "!rustbridge".to_string()
}

/// Location of the per-guild bridge settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "rustbridge.json".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Tuning shared by every bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeDefaults {
    /// Poll interval for newly set up bridges.
    pub poll_interval_secs: u64,
    /// Maximum length of a team chat line, in characters.
    pub max_outbound_chars: usize,
    pub connect_timeout_secs: u64,
    /// Upper bound for a single request beyond its natural wait.
    pub call_ceiling_secs: u64,
    /// Keepalive period while in push mode.
    pub heartbeat_secs: u64,
    pub backoff: BackoffConfig,
    pub dedup: DedupConfig,
}

impl Default for BridgeDefaults {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            max_outbound_chars: 128,
            connect_timeout_secs: 10,
            call_ceiling_secs: 5,
            heartbeat_secs: 30,
            backoff: BackoffConfig::default(),
            dedup: DedupConfig::default(),
        }
    }
}

impl BridgeDefaults {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn call_ceiling(&self) -> Duration {
        Duration::from_secs(self.call_ceiling_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_secs(self.backoff.initial_secs),
            max_delay: Duration::from_secs(self.backoff.max_secs),
            multiplier: 2.0,
        }
    }
}

/// Reconnect backoff bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_secs: 1,
            max_secs: 60,
        }
    }
}

/// Dedup cache watermarks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub high_watermark: usize,
    pub low_watermark: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            high_watermark: 1000,
            low_watermark: 500,
        }
    }
}

/// Global push settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    pub credentials: Option<PushCredentials>,
}

/// Opaque push-notification credentials (a JSON object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PushCredentials(serde_json::Value);

impl PushCredentials {
    /// Parse credentials supplied as a JSON document.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        Self::from_value(value)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, String> {
        if value.is_object() {
            Ok(Self(value))
        } else {
            Err("push credentials must be a JSON object".to_string())
        }
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Complete remote endpoint and player credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCredentials {
    pub address: String,
    pub port: u16,
    pub player_id: u64,
    pub player_token: i64,
}

impl ServerCredentials {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Durable per-guild bridge settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server_address: Option<String>,
    pub server_port: Option<u16>,
    pub player_id: Option<u64>,
    pub player_token: Option<i64>,
    /// User who supplied the credentials.
    pub authorized_user_id: Option<u64>,
    pub channel_id: Option<LocalChannelId>,
    pub push_credentials: Option<PushCredentials>,
    pub use_push: bool,
    pub poll_interval_secs: Option<u64>,
    pub enabled: bool,
}

impl BridgeConfig {
    /// Server credentials, if every field is present.
    pub fn credentials(&self) -> Option<ServerCredentials> {
        Some(ServerCredentials {
            address: self.server_address.clone()?,
            port: self.server_port?,
            player_id: self.player_id?,
            player_token: self.player_token?,
        })
    }

    pub fn poll_interval(&self, defaults: &BridgeDefaults) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(defaults.poll_interval_secs))
    }
}

/// Allowed range for poll intervals, in seconds.
pub const POLL_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 1..=60;
