//! Configuration validation.
//!
//! Validates configuration values and provides helpful error messages.

use crate::common::error::{BridgeError, ConfigError};
use crate::config::types::{BridgeConfig, Config, ServerCredentials, POLL_INTERVAL_RANGE};

/// Validate the process configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.discord.token.is_empty() {
        errors.push("discord.token is required".to_string());
    }
    if config.discord.token == "YOUR_DISCORD_TOKEN_HERE" {
        errors.push("discord.token has not been configured (still using placeholder)".to_string());
    }
    if config.discord.command_prefix.trim().is_empty() {
        errors.push("discord.command_prefix must not be empty".to_string());
    }

    let bridge = &config.bridge;
    if !POLL_INTERVAL_RANGE.contains(&bridge.poll_interval_secs) {
        errors.push(format!(
            "bridge.poll_interval_secs must be 1-60 (got {})",
            bridge.poll_interval_secs
        ));
    }
    if bridge.max_outbound_chars == 0 {
        errors.push("bridge.max_outbound_chars must be non-zero".to_string());
    }
    if bridge.connect_timeout_secs == 0 {
        errors.push("bridge.connect_timeout_secs must be non-zero".to_string());
    }
    if bridge.heartbeat_secs == 0 {
        errors.push("bridge.heartbeat_secs must be non-zero".to_string());
    }
    if bridge.backoff.initial_secs == 0 || bridge.backoff.initial_secs > bridge.backoff.max_secs {
        errors.push(format!(
            "bridge.backoff must satisfy 0 < initial_secs <= max_secs (got {} / {})",
            bridge.backoff.initial_secs, bridge.backoff.max_secs
        ));
    }
    if bridge.dedup.low_watermark >= bridge.dedup.high_watermark {
        errors.push(format!(
            "bridge.dedup.low_watermark ({}) must be below high_watermark ({})",
            bridge.dedup.low_watermark, bridge.dedup.high_watermark
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}

/// Check that a bridge has everything it needs to be enabled.
///
/// Returns the server credentials on success. Missing player credentials
/// are reported as an authentication error.
pub fn validate_bridge_config(config: &BridgeConfig) -> Result<ServerCredentials, BridgeError> {
    match config.server_address.as_deref() {
        None | Some("") => {
            return Err(BridgeError::MissingField {
                field: "server address",
            })
        }
        Some(_) => {}
    }
    match config.server_port {
        None | Some(0) => return Err(BridgeError::MissingField { field: "server port" }),
        Some(_) => {}
    }
    if config.player_id.is_none() || config.player_token.is_none() {
        return Err(BridgeError::Auth {
            reason: "player credentials are not configured".to_string(),
        });
    }
    if config.channel_id.is_none() {
        return Err(BridgeError::MissingField {
            field: "bridge channel",
        });
    }
    if let Some(secs) = config.poll_interval_secs {
        validate_poll_interval(secs)?;
    }

    config.credentials().ok_or(BridgeError::NotConfigured)
}

pub fn validate_poll_interval(secs: u64) -> Result<(), BridgeError> {
    if POLL_INTERVAL_RANGE.contains(&secs) {
        Ok(())
    } else {
        Err(BridgeError::InvalidValue {
            field: "poll interval",
            message: format!("must be between 1 and 60 seconds (got {})", secs),
        })
    }
}
