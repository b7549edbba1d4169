//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `RUSTBRIDGE_DISCORD_TOKEN` - Discord bot token
//! - `RUSTBRIDGE_COMMAND_PREFIX` - Admin command prefix
//! - `RUSTBRIDGE_STORE_PATH` - Bridge settings file

use std::env;

use crate::config::types::Config;

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "RUSTBRIDGE";

/// Apply environment variable overrides to a config.
///
/// This allows the bot token to be provided via the environment instead of
/// the config file.
pub fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(token) = env::var(format!("{}_DISCORD_TOKEN", ENV_PREFIX)) {
        config.discord.token = token;
    }
    if let Ok(prefix) = env::var(format!("{}_COMMAND_PREFIX", ENV_PREFIX)) {
        config.discord.command_prefix = prefix;
    }
    if let Ok(path) = env::var(format!("{}_STORE_PATH", ENV_PREFIX)) {
        config.store.path = path;
    }

    config
}

/// Get the config file path from environment or use default.
///
/// Checks `RUSTBRIDGE_CONFIG`, otherwise returns "rustbridge.conf".
pub fn get_config_path() -> String {
    env::var(format!("{}_CONFIG", ENV_PREFIX)).unwrap_or_else(|_| "rustbridge.conf".to_string())
}
