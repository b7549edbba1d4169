//! Connection lifecycle for one bridge.
//!
//! State machine:
//!
//! ```text
//! Disabled -> Connecting -> Connected -> Reconnecting -> Connecting ...
//!                  |                          ^
//!                  +--------------------------+
//! ```
//!
//! Any state returns to `Disabled` on cancellation or on a terminal error
//! (rejected credentials, player not in a team).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::delivery::DeliveryModeController;
use super::{SessionSlot, StatusTx};
use crate::common::error::{ConnectionError, ConnectionResult};
use crate::common::reconnect::{ReconnectConfig, ReconnectState};
use crate::common::{BridgeId, ConnectionState};
use crate::config::ServerCredentials;
use crate::remote::{RemoteLink, RemoteSession};

/// Connection state change, as published on the optional event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub bridge: BridgeId,
    pub state: ConnectionState,
}

pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

pub struct ConnectionManager {
    bridge: BridgeId,
    link: Arc<dyn RemoteLink>,
    credentials: ServerCredentials,
    reconnect: ReconnectState,
    connect_timeout: Duration,
    status: StatusTx,
    session: SessionSlot,
    events: Option<EventSender>,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bridge: BridgeId,
        link: Arc<dyn RemoteLink>,
        credentials: ServerCredentials,
        reconnect: ReconnectConfig,
        connect_timeout: Duration,
        status: StatusTx,
        session: SessionSlot,
        events: Option<EventSender>,
    ) -> Self {
        Self {
            bridge,
            link,
            credentials,
            reconnect: ReconnectState::new(reconnect),
            connect_timeout,
            status,
            session,
            events,
        }
    }

    /// Open one session, bounded by the connect timeout.
    pub async fn connect(&mut self) -> ConnectionResult<Arc<dyn RemoteSession>> {
        self.transition(ConnectionState::Connecting);
        debug!(bridge = self.bridge, "Connecting to {}", self.credentials.endpoint());

        match timeout(self.connect_timeout, self.link.connect(&self.credentials)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::network(format!(
                "connect timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }

    /// Keep a session alive until cancelled or a terminal error occurs.
    ///
    /// Each connected session is handed to `controller` for ingestion. On a
    /// transient failure the loop waits out the backoff delay and retries.
    pub async fn maintain(
        &mut self,
        controller: &mut DeliveryModeController,
        cancel: &CancellationToken,
    ) {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                attempt = self.connect() => attempt,
            };

            let failure = match attempt {
                Ok(session) => {
                    self.on_connected(session.clone()).await;
                    let failure = controller.run(session, cancel).await;
                    self.close_session().await;
                    match failure {
                        Some(failure) => failure,
                        None => break,
                    }
                }
                Err(failure) => failure,
            };

            if failure.is_terminal() {
                error!(
                    bridge = self.bridge,
                    "Giving up on {}: {}",
                    self.credentials.endpoint(),
                    failure
                );
                self.status.send_modify(|status| {
                    status.last_error = Some(failure.to_string());
                });
                self.transition(ConnectionState::Disabled);
                return;
            }

            let delay = self.reconnect.next_delay();
            let retry_count = self.reconnect.attempts();
            self.status.send_modify(|status| {
                status.retry_count = retry_count;
                status.last_error = Some(failure.to_string());
            });
            self.transition(ConnectionState::Reconnecting);
            warn!(
                bridge = self.bridge,
                "Connection failed ({}), retry {} in {:?}", failure, retry_count, delay
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.disconnect().await;
    }

    /// Close the session, if any, and move to `Disabled`. Idempotent.
    pub async fn disconnect(&mut self) {
        self.close_session().await;
        if self.status.borrow().state != ConnectionState::Disabled {
            self.transition(ConnectionState::Disabled);
            info!(bridge = self.bridge, "Disconnected");
        }
    }

    async fn on_connected(&mut self, session: Arc<dyn RemoteSession>) {
        self.reconnect.reset();
        *self.session.lock().await = Some(session);
        self.status.send_modify(|status| {
            status.retry_count = 0;
            status.last_error = None;
            status.last_activity = Some(Utc::now());
        });
        self.transition(ConnectionState::Connected);
        info!(bridge = self.bridge, "Connected to {}", self.credentials.endpoint());
    }

    async fn close_session(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.disconnect().await;
        }
    }

    fn transition(&self, state: ConnectionState) {
        self.status.send_modify(|status| {
            status.state = state;
            if state != ConnectionState::Connected {
                status.mode = None;
            }
        });
        if let Some(events) = &self.events {
            let _ = events.send(ConnectionEvent {
                bridge: self.bridge,
                state,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::delivery::DeliverySettings;
    use crate::bridge::local::mock::RecordingChannel;
    use crate::bridge::router::MessageRouter;
    use crate::common::SessionStatus;
    use crate::config::BridgeDefaults;
    use crate::remote::mock::MockLink;
    use tokio::sync::{watch, Mutex};
    use tokio::time::Instant;

    struct Harness {
        manager: ConnectionManager,
        controller: DeliveryModeController,
        status: StatusTx,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        _settings: watch::Sender<DeliverySettings>,
    }

    fn credentials() -> ServerCredentials {
        ServerCredentials {
            address: "10.0.0.1".to_string(),
            port: 28082,
            player_id: 1,
            player_token: 2,
        }
    }

    fn harness(link: Arc<MockLink>) -> Harness {
        let defaults = BridgeDefaults::default();
        let status: StatusTx = Arc::new(watch::channel(SessionStatus::default()).0);
        let slot: SessionSlot = Arc::new(Mutex::new(None));
        let (events_tx, events) = mpsc::unbounded_channel();
        let (settings_tx, settings_rx) = watch::channel(DeliverySettings {
            push_credentials: None,
            use_push: false,
            poll_interval: Duration::from_secs(2),
        });
        let router = Arc::new(MessageRouter::new(
            3,
            10,
            Arc::new(RecordingChannel::default()),
            slot.clone(),
            status.clone(),
            &defaults,
        ));

        Harness {
            manager: ConnectionManager::new(
                3,
                link,
                credentials(),
                defaults.reconnect(),
                defaults.connect_timeout(),
                status.clone(),
                slot,
                Some(events_tx),
            ),
            controller: DeliveryModeController::new(3, router, settings_rx, status.clone(), &defaults),
            status,
            events,
            _settings: settings_tx,
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            states.push(event.state);
        }
        states
    }

    async fn wait_for(status: &StatusTx, state: ConnectionState) {
        let mut rx = status.subscribe();
        rx.wait_for(|s| s.state == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_then_success() {
        use ConnectionState::*;

        let link = MockLink::new(vec![
            Err(ConnectionError::network("refused")),
            Err(ConnectionError::network("refused")),
            Err(ConnectionError::network("refused")),
        ]);
        let Harness {
            mut manager,
            mut controller,
            status,
            mut events,
            _settings,
        } = harness(link.clone());

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let started = Instant::now();
        let task = tokio::spawn(async move { manager.maintain(&mut controller, &token).await });

        wait_for(&status, Connected).await;
        // 1s + 2s + 4s of backoff.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_secs(8));
        assert_eq!(link.attempts(), 4);
        assert_eq!(
            drain(&mut events),
            vec![
                Connecting, Reconnecting, Connecting, Reconnecting, Connecting, Reconnecting,
                Connecting, Connected
            ]
        );
        assert_eq!(status.borrow().retry_count, 0);
        assert!(status.borrow().last_error.is_none());

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(status.borrow().state, Disabled);
        assert_eq!(link.last_session().unwrap().disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_tracks_failures() {
        let link = MockLink::new(vec![
            Err(ConnectionError::network("refused")),
            Err(ConnectionError::network("refused")),
        ]);
        let mut h = harness(link);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let status = h.status.clone();
        let task = tokio::spawn(async move { h.manager.maintain(&mut h.controller, &token).await });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(status.borrow().state, ConnectionState::Reconnecting);
        assert_eq!(status.borrow().retry_count, 2);
        assert_eq!(
            status.borrow().last_error.as_deref(),
            Some("Network error: refused")
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_reconnecting_ends_disabled() {
        let link = MockLink::new(vec![Err(ConnectionError::network("refused"))]);
        let mut h = harness(link.clone());
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let status = h.status.clone();
        let task = tokio::spawn(async move { h.manager.maintain(&mut h.controller, &token).await });

        wait_for(&status, ConnectionState::Reconnecting).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(status.borrow().state, ConnectionState::Disabled);
        // The pending retry never ran.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(link.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_terminal() {
        let link = MockLink::new(vec![Err(ConnectionError::Auth {
            reason: "not_authorized".to_string(),
        })]);
        let mut h = harness(link.clone());
        let cancel = CancellationToken::new();

        h.manager.maintain(&mut h.controller, &cancel).await;

        let status = h.status.borrow().clone();
        assert_eq!(status.state, ConnectionState::Disabled);
        assert!(status.last_error.unwrap().contains("not_authorized"));
        assert_eq!(link.attempts(), 1);
        assert_eq!(
            drain(&mut h.events),
            vec![ConnectionState::Connecting, ConnectionState::Disabled]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_team_not_found_during_poll_is_terminal() {
        let link = MockLink::new(Vec::new());
        let mut h = harness(link.clone());
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let status = h.status.clone();
        let task = tokio::spawn(async move { h.manager.maintain(&mut h.controller, &token).await });

        wait_for(&status, ConnectionState::Connected).await;
        link.last_session()
            .unwrap()
            .fail_polls(ConnectionError::TeamNotFound);

        task.await.unwrap();
        assert_eq!(status.borrow().state, ConnectionState::Disabled);
        assert_eq!(link.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_network_error() {
        let link = MockLink::new(Vec::new());
        link.set_connect_delay(Duration::from_secs(30));
        let mut h = harness(link);

        let result = h.manager.connect().await;
        assert!(matches!(result, Err(ConnectionError::Network { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_loss_reconnects_with_base_delay() {
        let link = MockLink::new(Vec::new());
        let mut h = harness(link.clone());
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let status = h.status.clone();
        let task = tokio::spawn(async move { h.manager.maintain(&mut h.controller, &token).await });

        wait_for(&status, ConnectionState::Connected).await;
        let first = link.last_session().unwrap();
        first.fail_polls(ConnectionError::network("reset"));

        wait_for(&status, ConnectionState::Reconnecting).await;
        assert_eq!(first.disconnects(), 1);
        let lost_at = Instant::now();

        wait_for(&status, ConnectionState::Connected).await;
        let elapsed = lost_at.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));
        assert_eq!(link.attempts(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let link = MockLink::new(Vec::new());
        let mut h = harness(link);
        h.manager.disconnect().await;
        h.manager.disconnect().await;
        assert_eq!(h.status.borrow().state, ConnectionState::Disabled);
        assert!(drain(&mut h.events).is_empty());
    }
}
