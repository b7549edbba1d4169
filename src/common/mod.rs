//! Common utilities and types shared across the application.

pub mod error;
pub mod messages;
pub mod reconnect;
pub mod types;

pub use messages::{InboundMessage, LocalNotification, MessageId, OutboundMessage};
pub use types::{
    BridgeId, BridgeStatus, ConnectionState, DeliveryModeKind, LocalChannelId, SessionStatus,
};
