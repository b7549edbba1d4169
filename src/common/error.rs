//! Error types for the application.

use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

/// Connection-level errors raised while establishing or holding a session.
///
/// These never reach the caller of an administrative command; the
/// connection manager turns them into state transitions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// Credentials rejected by the server. Terminal until reconfigured.
    #[error("Authentication failed: {reason}")]
    Auth { reason: String },

    /// Transient failure (refused, reset, timed out). Drives backoff.
    #[error("Network error: {message}")]
    Network { message: String },

    /// The account is not part of a team on the server.
    #[error("Player is not in a team on this server")]
    TeamNotFound,
}

impl ConnectionError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Terminal errors stop the reconnect loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::TeamNotFound)
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::network(e.to_string())
    }
}

/// A single outbound message could not be delivered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendFailure {
    #[error("No active session")]
    NotConnected,

    #[error("Send timed out")]
    Timeout,

    #[error("Remote rejected message: {reason}")]
    Rejected { reason: String },

    #[error("Link error: {message}")]
    Link { message: String },
}

/// Push subscription could not be established or was lost.
///
/// Never fatal: the delivery controller falls back to polling.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushRegistrationError {
    #[error("No push credentials configured")]
    MissingCredentials,

    #[error("Push credentials rejected: {reason}")]
    Rejected { reason: String },

    #[error("Push channel unavailable: {message}")]
    Unavailable { message: String },
}

/// Persistence errors for the bridge config store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access store '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Store '{path}' is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors returned synchronously to administrative callers.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Credentials missing or unusable.
    #[error("Authentication error: {reason}")]
    Auth { reason: String },

    #[error("Missing required setting: {field}")]
    MissingField { field: &'static str },

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: &'static str, message: String },

    #[error("Bridge is enabled; disable it before changing {field}")]
    Locked { field: &'static str },

    #[error("Bridge is already enabled")]
    AlreadyEnabled,

    #[error("Bridge is not enabled")]
    NotEnabled,

    #[error("Bridge is not configured")]
    NotConfigured,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type alias for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;
