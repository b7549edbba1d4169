//! Inbound delivery strategies.
//!
//! A bridge ingests team chat either from a push subscription or by
//! polling the chat backlog. The controller picks the mode from the current
//! [`DeliverySettings`], rebuilds it whenever they change, and falls back to
//! polling when push registration fails or the push stream ends.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::router::{InboundOutcome, MessageRouter};
use super::{touch_activity, StatusTx};
use crate::common::error::{ConnectionError, PushRegistrationError};
use crate::common::{BridgeId, DeliveryModeKind, InboundMessage};
use crate::config::{BridgeConfig, BridgeDefaults, PushCredentials};
use crate::remote::{PushSubscription, RemoteSession};

/// Inputs to mode selection. Changing them restarts the active mode.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverySettings {
    /// Per-bridge credentials, else the global ones.
    pub push_credentials: Option<Arc<PushCredentials>>,
    pub use_push: bool,
    pub poll_interval: Duration,
}

impl DeliverySettings {
    pub fn resolve(
        config: &BridgeConfig,
        defaults: &BridgeDefaults,
        global_push: Option<&Arc<PushCredentials>>,
    ) -> Self {
        Self {
            push_credentials: config
                .push_credentials
                .clone()
                .map(Arc::new)
                .or_else(|| global_push.cloned()),
            use_push: config.use_push,
            poll_interval: config.poll_interval(defaults),
        }
    }
}

enum ModeEvent {
    Messages(Vec<InboundMessage>),
    PushLost,
    Failed(ConnectionError),
}

/// The active ingestion strategy.
pub enum DeliveryMode {
    Push {
        subscription: PushSubscription,
        heartbeat: Interval,
        call_ceiling: Duration,
    },
    Poll {
        ticker: Interval,
        request_timeout: Duration,
    },
}

impl DeliveryMode {
    fn push(subscription: PushSubscription, heartbeat: Duration, call_ceiling: Duration) -> Self {
        let mut heartbeat = interval_at(Instant::now() + heartbeat, heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self::Push {
            subscription,
            heartbeat,
            call_ceiling,
        }
    }

    fn poll(every: Duration, call_ceiling: Duration) -> Self {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self::Poll {
            ticker,
            request_timeout: every + call_ceiling,
        }
    }

    pub fn kind(&self) -> DeliveryModeKind {
        match self {
            Self::Push { .. } => DeliveryModeKind::Push,
            Self::Poll { .. } => DeliveryModeKind::Poll,
        }
    }

    async fn next_event(&mut self, session: &dyn RemoteSession) -> ModeEvent {
        match self {
            Self::Push {
                subscription,
                heartbeat,
                call_ceiling,
            } => {
                tokio::select! {
                    message = subscription.next() => match message {
                        Some(message) => ModeEvent::Messages(vec![message]),
                        None => ModeEvent::PushLost,
                    },
                    _ = heartbeat.tick() => {
                        match timeout(*call_ceiling, session.heartbeat()).await {
                            Ok(Ok(())) => ModeEvent::Messages(Vec::new()),
                            Ok(Err(e)) => ModeEvent::Failed(e),
                            Err(_) => ModeEvent::Failed(ConnectionError::network("heartbeat timed out")),
                        }
                    }
                }
            }
            Self::Poll {
                ticker,
                request_timeout,
            } => {
                ticker.tick().await;
                match timeout(*request_timeout, session.team_chat()).await {
                    Ok(Ok(messages)) => ModeEvent::Messages(messages),
                    Ok(Err(e)) => ModeEvent::Failed(e),
                    Err(_) => ModeEvent::Failed(ConnectionError::network("poll timed out")),
                }
            }
        }
    }

    /// Messages already received but not yet handed out.
    fn drain_buffered(&mut self) -> Vec<InboundMessage> {
        let mut buffered = Vec::new();
        if let Self::Push { subscription, .. } = self {
            while let Some(message) = subscription.try_next() {
                buffered.push(message);
            }
        }
        buffered
    }
}

/// Runs the delivery mode for one session at a time.
pub struct DeliveryModeController {
    bridge: BridgeId,
    router: Arc<MessageRouter>,
    settings: watch::Receiver<DeliverySettings>,
    status: StatusTx,
    heartbeat: Duration,
    call_ceiling: Duration,
}

impl DeliveryModeController {
    pub fn new(
        bridge: BridgeId,
        router: Arc<MessageRouter>,
        settings: watch::Receiver<DeliverySettings>,
        status: StatusTx,
        defaults: &BridgeDefaults,
    ) -> Self {
        Self {
            bridge,
            router,
            settings,
            status,
            heartbeat: defaults.heartbeat(),
            call_ceiling: defaults.call_ceiling(),
        }
    }

    /// Ingest from `session` until it fails or `cancel` fires.
    ///
    /// Returns the session failure, or `None` when cancelled.
    pub async fn run(
        &mut self,
        session: Arc<dyn RemoteSession>,
        cancel: &CancellationToken,
    ) -> Option<ConnectionError> {
        loop {
            let settings = self.settings.borrow_and_update().clone();
            let mut mode = tokio::select! {
                _ = cancel.cancelled() => return None,
                mode = self.select_mode(&settings, session.as_ref()) => mode,
            };
            self.publish_mode(mode.kind());

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    changed = self.settings.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                        info!(bridge = self.bridge, "Delivery settings changed, restarting {} mode", mode.kind());
                        if !self.forward_all(mode.drain_buffered(), cancel).await {
                            return None;
                        }
                        break;
                    }
                    event = mode.next_event(session.as_ref()) => match event {
                        ModeEvent::Messages(messages) => {
                            touch_activity(&self.status);
                            if !self.forward_all(messages, cancel).await {
                                return None;
                            }
                        }
                        ModeEvent::PushLost => {
                            warn!(bridge = self.bridge, "Push channel lost, falling back to polling");
                            mode = DeliveryMode::poll(settings.poll_interval, self.call_ceiling);
                            self.publish_mode(mode.kind());
                        }
                        ModeEvent::Failed(e) => {
                            warn!(bridge = self.bridge, "Session failed during {} delivery: {}", mode.kind(), e);
                            return Some(e);
                        }
                    },
                }
            }
        }
    }

    /// Forward in receipt order. Returns false if cancelled part way.
    async fn forward_all(
        &self,
        messages: Vec<InboundMessage>,
        cancel: &CancellationToken,
    ) -> bool {
        for message in messages {
            if cancel.is_cancelled()
                || self.router.forward_to_local(&message, cancel).await == InboundOutcome::Cancelled
            {
                return false;
            }
        }
        true
    }

    async fn select_mode(
        &self,
        settings: &DeliverySettings,
        session: &dyn RemoteSession,
    ) -> DeliveryMode {
        if settings.use_push {
            match self.register_push(settings, session).await {
                Ok(subscription) => {
                    info!(bridge = self.bridge, "Receiving team chat via push");
                    return DeliveryMode::push(subscription, self.heartbeat, self.call_ceiling);
                }
                Err(e) => {
                    warn!(bridge = self.bridge, "Push registration failed, falling back to polling: {}", e);
                }
            }
        }

        debug!(
            bridge = self.bridge,
            "Polling team chat every {:?}", settings.poll_interval
        );
        DeliveryMode::poll(settings.poll_interval, self.call_ceiling)
    }

    async fn register_push(
        &self,
        settings: &DeliverySettings,
        session: &dyn RemoteSession,
    ) -> Result<PushSubscription, PushRegistrationError> {
        let credentials = settings
            .push_credentials
            .as_ref()
            .ok_or(PushRegistrationError::MissingCredentials)?;

        timeout(self.call_ceiling, session.subscribe(credentials))
            .await
            .unwrap_or_else(|_| {
                Err(PushRegistrationError::Unavailable {
                    message: "registration timed out".to_string(),
                })
            })
    }

    fn publish_mode(&self, kind: DeliveryModeKind) {
        self.status.send_modify(|status| status.mode = Some(kind));
    }
}
