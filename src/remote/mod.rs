//! Rust+ team chat link.
//!
//! The bridge core only sees the [`RemoteLink`] and [`RemoteSession`]
//! traits. [`companion::CompanionLink`] is the TCP implementation used in
//! production; tests supply scripted sessions.

pub mod codec;
pub mod companion;
pub mod frames;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::common::error::{ConnectionResult, PushRegistrationError, SendFailure};
use crate::common::InboundMessage;
use crate::config::{PushCredentials, ServerCredentials};

pub use companion::CompanionLink;

/// Opens authenticated sessions against a team chat server.
#[async_trait]
pub trait RemoteLink: Send + Sync {
    /// Connect and authenticate. The caller applies its own timeout.
    async fn connect(&self, credentials: &ServerCredentials)
        -> ConnectionResult<Arc<dyn RemoteSession>>;
}

/// One live, authenticated session.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn send_team_message(&self, text: &str) -> Result<(), SendFailure>;

    /// Fetch the current team chat backlog.
    async fn team_chat(&self) -> ConnectionResult<Vec<InboundMessage>>;

    /// Register for pushed team messages.
    async fn subscribe(
        &self,
        credentials: &PushCredentials,
    ) -> Result<PushSubscription, PushRegistrationError>;

    /// Cheap liveness check.
    async fn heartbeat(&self) -> ConnectionResult<()>;

    /// Close the session. Safe to call more than once.
    async fn disconnect(&self);
}

/// Stream of pushed team messages. Ends when the push channel is lost.
pub struct PushSubscription {
    rx: mpsc::Receiver<InboundMessage>,
}

impl PushSubscription {
    pub fn new(rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    /// An already buffered message, without waiting.
    pub fn try_next(&mut self) -> Option<InboundMessage> {
        self.rx.try_recv().ok()
    }
}
