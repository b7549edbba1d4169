//! Per-bridge orchestration.
//!
//! A `BridgeState` owns one bridge's durable settings and, while enabled,
//! its runtime: the router (and with it the dedup cache), the delivery
//! settings channel and the supervised connection task.
//!
//! The lifecycle is:
//! 1. `enable()` validates the settings and spawns the connection task
//! 2. `reconnect()` replaces the task, keeping the router and its dedup cache
//! 3. `disable()` cancels the task, closes the session and drops the runtime
//!
//! All lifecycle operations go through one mutex, so they never interleave
//! for the same bridge.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::connection::ConnectionManager;
use super::delivery::{DeliveryModeController, DeliverySettings};
use super::registry::BridgeContext;
use super::router::MessageRouter;
use super::{SessionSlot, StatusTx};
use crate::common::error::{BridgeError, SendFailure};
use crate::common::{
    BridgeId, BridgeStatus, ConnectionState, LocalChannelId, OutboundMessage, SessionStatus,
};
use crate::config::validate::validate_bridge_config;
use crate::config::{BridgeConfig, ServerCredentials};

/// How long a connection task gets to wind down before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct BridgeState {
    id: BridgeId,
    ctx: BridgeContext,
    inner: Mutex<Inner>,
    status: StatusTx,
}

struct Inner {
    config: BridgeConfig,
    runtime: Option<Runtime>,
}

/// Everything that lives for one enabled period.
struct Runtime {
    credentials: ServerCredentials,
    router: Arc<MessageRouter>,
    session: SessionSlot,
    settings: watch::Sender<DeliverySettings>,
    supervisor: Option<Supervisor>,
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BridgeState {
    pub fn new(id: BridgeId, config: BridgeConfig, ctx: BridgeContext) -> Self {
        Self {
            id,
            ctx,
            inner: Mutex::new(Inner {
                config,
                runtime: None,
            }),
            status: Arc::new(watch::channel(SessionStatus::default()).0),
        }
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub async fn config(&self) -> BridgeConfig {
        self.inner.lock().await.config.clone()
    }

    #[cfg(test)]
    pub async fn is_enabled(&self) -> bool {
        self.inner.lock().await.runtime.is_some()
    }

    /// Watch the session status.
    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Validate `config` and start the bridge with it.
    ///
    /// Nothing is started and the stored settings are left untouched when
    /// validation fails.
    pub async fn enable(&self, config: BridgeConfig) -> Result<BridgeConfig, BridgeError> {
        let mut inner = self.inner.lock().await;
        if inner.runtime.is_some() {
            return Err(BridgeError::AlreadyEnabled);
        }

        let credentials = validate_bridge_config(&config)?;
        let channel = config.channel_id.ok_or(BridgeError::MissingField {
            field: "bridge channel",
        })?;

        let session: SessionSlot = Arc::new(Mutex::new(None));
        let router = Arc::new(MessageRouter::new(
            self.id,
            channel,
            self.ctx.local.clone(),
            session.clone(),
            self.status.clone(),
            &self.ctx.defaults,
        ));
        let (settings, _) = watch::channel(self.delivery_settings(&config));

        let mut runtime = Runtime {
            credentials,
            router,
            session,
            settings,
            supervisor: None,
        };
        self.status.send_replace(SessionStatus::default());
        runtime.supervisor = Some(self.spawn(&runtime));

        inner.config = config;
        inner.config.enabled = true;
        inner.runtime = Some(runtime);

        info!(bridge = self.id, "Bridge enabled");
        Ok(inner.config.clone())
    }

    /// Stop the bridge and mark it disabled. Returns false if it was not running.
    pub async fn disable(&self) -> (bool, BridgeConfig) {
        let mut inner = self.inner.lock().await;
        inner.config.enabled = false;
        let was_running = match inner.runtime.take() {
            Some(runtime) => {
                self.teardown(runtime).await;
                info!(bridge = self.id, "Bridge disabled");
                true
            }
            None => false,
        };
        (was_running, inner.config.clone())
    }

    /// Stop the bridge for process exit, keeping its enabled flag.
    pub async fn shutdown(&self) {
        let runtime = self.inner.lock().await.runtime.take();
        if let Some(runtime) = runtime {
            self.teardown(runtime).await;
        }
    }

    /// Drop the current session and start over with a fresh retry counter.
    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        let runtime = inner.runtime.as_mut().ok_or(BridgeError::NotEnabled)?;

        if let Some(supervisor) = runtime.supervisor.take() {
            self.stop(supervisor).await;
        }
        self.status.send_modify(|status| {
            status.retry_count = 0;
            status.last_error = None;
        });
        runtime.supervisor = Some(self.spawn(runtime));

        info!(bridge = self.id, "Bridge reconnecting");
        Ok(())
    }

    pub async fn status(&self) -> BridgeStatus {
        let inner = self.inner.lock().await;
        let config = &inner.config;
        let session = match inner.runtime {
            Some(_) => self.status.borrow().clone(),
            None => SessionStatus::default(),
        };

        BridgeStatus {
            enabled: inner.runtime.is_some(),
            server: config
                .server_address
                .as_ref()
                .map(|address| match config.server_port {
                    Some(port) => format!("{}:{}", address, port),
                    None => address.clone(),
                }),
            channel_id: config.channel_id,
            session,
            poll_interval: config.poll_interval(&self.ctx.defaults),
            push_configured: config.push_credentials.is_some() || self.ctx.global_push.is_some(),
            push_requested: config.use_push,
        }
    }

    /// Change settings that are frozen while the bridge runs.
    pub async fn update_locked(
        &self,
        field: &'static str,
        update: impl FnOnce(&mut BridgeConfig),
    ) -> Result<BridgeConfig, BridgeError> {
        let mut inner = self.inner.lock().await;
        if inner.runtime.is_some() {
            return Err(BridgeError::Locked { field });
        }
        update(&mut inner.config);
        Ok(inner.config.clone())
    }

    /// Point the bridge at another local channel, live if running.
    pub async fn set_channel(&self, channel: LocalChannelId) -> BridgeConfig {
        let mut inner = self.inner.lock().await;
        inner.config.channel_id = Some(channel);
        if let Some(runtime) = &inner.runtime {
            runtime.router.set_channel(channel).await;
        }
        inner.config.clone()
    }

    /// Change delivery settings. A running bridge switches mode in place.
    pub async fn update_delivery(&self, update: impl FnOnce(&mut BridgeConfig)) -> BridgeConfig {
        let mut inner = self.inner.lock().await;
        update(&mut inner.config);

        if let Some(runtime) = &inner.runtime {
            let settings = self.delivery_settings(&inner.config);
            runtime.settings.send_if_modified(|current| {
                if *current == settings {
                    false
                } else {
                    *current = settings;
                    true
                }
            });
        }
        inner.config.clone()
    }

    /// Send a message from `channel` to the team chat.
    ///
    /// Returns `None` when the bridge is not running or `channel` is not its
    /// bridge channel.
    pub async fn forward_outbound(
        &self,
        channel: LocalChannelId,
        message: &OutboundMessage,
    ) -> Option<Result<(), SendFailure>> {
        let router = {
            let inner = self.inner.lock().await;
            let runtime = inner.runtime.as_ref()?;
            if runtime.router.channel().await != channel {
                return None;
            }
            runtime.router.clone()
        };
        Some(router.forward_to_external(message).await)
    }

    fn delivery_settings(&self, config: &BridgeConfig) -> DeliverySettings {
        DeliverySettings::resolve(config, &self.ctx.defaults, self.ctx.global_push.as_ref())
    }

    fn spawn(&self, runtime: &Runtime) -> Supervisor {
        let defaults = &self.ctx.defaults;
        let mut manager = ConnectionManager::new(
            self.id,
            self.ctx.link.clone(),
            runtime.credentials.clone(),
            defaults.reconnect(),
            defaults.connect_timeout(),
            self.status.clone(),
            runtime.session.clone(),
            self.ctx.events.clone(),
        );
        let mut controller = DeliveryModeController::new(
            self.id,
            runtime.router.clone(),
            runtime.settings.subscribe(),
            self.status.clone(),
            defaults,
        );

        self.status
            .send_modify(|status| status.state = ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            manager.maintain(&mut controller, &token).await;
        });

        Supervisor { cancel, task }
    }

    async fn stop(&self, supervisor: Supervisor) {
        supervisor.cancel.cancel();
        let mut task = supervisor.task;
        match timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(bridge = self.id, "Connection task failed: {}", e),
            Err(_) => {
                warn!(bridge = self.id, "Connection task did not stop in time, aborting");
                task.abort();
            }
        }
    }

    async fn teardown(&self, mut runtime: Runtime) {
        if let Some(supervisor) = runtime.supervisor.take() {
            self.stop(supervisor).await;
        }
        // Only left behind when the task had to be aborted.
        let session = runtime.session.lock().await.take();
        if let Some(session) = session {
            session.disconnect().await;
        }
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disabled;
            status.mode = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::local::mock::RecordingChannel;
    use crate::common::error::ConnectionError;
    use crate::common::DeliveryModeKind;
    use crate::config::{BridgeDefaults, PushCredentials};
    use crate::common::InboundMessage;
    use crate::remote::mock::MockLink;
    use chrono::{TimeZone, Utc};
    use tokio::time::Instant;

    fn complete_config() -> BridgeConfig {
        BridgeConfig {
            server_address: Some("10.0.0.1".to_string()),
            server_port: Some(28082),
            player_id: Some(76561198000000001),
            player_token: Some(-1234),
            channel_id: Some(500),
            ..Default::default()
        }
    }

    fn bridge(link: Arc<MockLink>) -> (BridgeState, Arc<RecordingChannel>) {
        let local = Arc::new(RecordingChannel::default());
        let ctx = BridgeContext {
            link,
            local: local.clone(),
            defaults: Arc::new(BridgeDefaults::default()),
            global_push: None,
            events: None,
        };
        (BridgeState::new(1, BridgeConfig::default(), ctx), local)
    }

    fn team_message(id: &str) -> InboundMessage {
        InboundMessage {
            server_id: Some(id.to_string()),
            sender_id: 76561198000000002,
            sender_name: "Rusty".to_string(),
            body: id.to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            color: None,
        }
    }

    async fn wait_for(state: &BridgeState, target: ConnectionState) {
        state
            .subscribe()
            .wait_for(|s| s.state == target)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_missing_credentials_is_auth_error() {
        let link = MockLink::new(Vec::new());
        let (state, _) = bridge(link.clone());

        let mut config = complete_config();
        config.player_token = None;
        let result = state.enable(config).await;

        assert!(matches!(result, Err(BridgeError::Auth { .. })));
        assert!(!state.is_enabled().await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(link.attempts(), 0);
        assert_eq!(state.status().await.session.state, ConnectionState::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_connects_and_polls() {
        let link = MockLink::new(Vec::new());
        let (state, _) = bridge(link.clone());

        let config = state.enable(complete_config()).await.unwrap();
        assert!(config.enabled);
        wait_for(&state, ConnectionState::Connected).await;

        let status = state.status().await;
        assert!(status.enabled);
        assert_eq!(status.server.as_deref(), Some("10.0.0.1:28082"));
        assert_eq!(status.poll_interval, Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            state.status().await.session.mode,
            Some(DeliveryModeKind::Poll)
        );

        assert!(matches!(
            state.enable(complete_config()).await,
            Err(BridgeError::AlreadyEnabled)
        ));
        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_while_reconnecting() {
        let link = MockLink::new(vec![Err(ConnectionError::network("refused"))]);
        let (state, _) = bridge(link.clone());

        state.enable(complete_config()).await.unwrap();
        wait_for(&state, ConnectionState::Reconnecting).await;

        let (was_running, config) = state.disable().await;
        assert!(was_running);
        assert!(!config.enabled);
        assert_eq!(
            state.subscribe().borrow().state,
            ConnectionState::Disabled
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(link.attempts(), 1);
        assert_eq!(
            state.subscribe().borrow().state,
            ConnectionState::Disabled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_closes_session() {
        let link = MockLink::new(Vec::new());
        let (state, _) = bridge(link.clone());

        state.enable(complete_config()).await.unwrap();
        wait_for(&state, ConnectionState::Connected).await;

        state.disable().await;
        assert_eq!(link.last_session().unwrap().disconnects(), 1);
        assert!(!state.disable().await.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_requires_enabled() {
        let (state, _) = bridge(MockLink::new(Vec::new()));
        assert!(matches!(
            state.reconnect().await,
            Err(BridgeError::NotEnabled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_terminal_error() {
        let link = MockLink::new(vec![Err(ConnectionError::TeamNotFound)]);
        let (state, _) = bridge(link.clone());

        state.enable(complete_config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = state.status().await;
        assert_eq!(status.session.state, ConnectionState::Disabled);
        assert!(status.session.last_error.is_some());
        assert!(status.enabled);

        state.reconnect().await.unwrap();
        wait_for(&state, ConnectionState::Connected).await;
        assert_eq!(link.attempts(), 2);
        assert!(state.status().await.session.last_error.is_none());
        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_locked_while_enabled() {
        let (state, _) = bridge(MockLink::new(Vec::new()));
        state.enable(complete_config()).await.unwrap();

        let result = state
            .update_locked("server settings", |c| c.server_port = Some(1))
            .await;
        assert!(matches!(result, Err(BridgeError::Locked { .. })));

        state.disable().await;
        let config = state
            .update_locked("server settings", |c| c.server_port = Some(1))
            .await
            .unwrap();
        assert_eq!(config.server_port, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_allowed_after_shutdown() {
        let (state, _) = bridge(MockLink::new(Vec::new()));
        state.enable(complete_config()).await.unwrap();
        state.shutdown().await;
        assert!(state.config().await.enabled);

        let config = state
            .update_locked("server settings", |c| c.server_port = Some(1))
            .await
            .unwrap();
        assert_eq!(config.server_port, Some(1));
        assert!(config.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_while_delivery_pending() {
        let link = MockLink::new(Vec::new());
        link.set_chat(vec![
            team_message("m1"),
            team_message("m2"),
            team_message("m3"),
        ]);
        let (state, local) = bridge(link.clone());
        local.hold(true);

        state.enable(complete_config()).await.unwrap();
        local.wait_for_pending().await;

        let started = Instant::now();
        state.reconnect().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        local.hold(false);
        wait_for(&state, ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(local.bodies(), vec!["m1", "m2", "m3"]);
        assert_eq!(link.attempts(), 2);
        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_switch_keeps_session() {
        let link = MockLink::new(Vec::new());
        let (state, _) = bridge(link.clone());

        state.enable(complete_config()).await.unwrap();
        wait_for(&state, ConnectionState::Connected).await;

        state
            .update_delivery(|c| {
                c.push_credentials = Some(PushCredentials::parse(r#"{"token": "t"}"#).unwrap());
                c.use_push = true;
            })
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = state.status().await;
        assert_eq!(status.session.mode, Some(DeliveryModeKind::Push));
        assert_eq!(status.session.state, ConnectionState::Connected);
        assert_eq!(link.attempts(), 1);

        state.update_delivery(|c| c.use_push = false).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            state.status().await.session.mode,
            Some(DeliveryModeKind::Poll)
        );
        assert_eq!(link.attempts(), 1);
        state.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_only_from_bridge_channel() {
        let link = MockLink::new(Vec::new());
        let (state, _) = bridge(link.clone());
        let message = OutboundMessage::new("Alice", "hi");

        assert!(state.forward_outbound(500, &message).await.is_none());

        state.enable(complete_config()).await.unwrap();
        wait_for(&state, ConnectionState::Connected).await;

        assert!(state.forward_outbound(501, &message).await.is_none());
        assert_eq!(state.forward_outbound(500, &message).await, Some(Ok(())));
        assert_eq!(link.last_session().unwrap().sent(), vec!["Alice: hi"]);

        state.set_channel(501).await;
        assert_eq!(state.forward_outbound(501, &message).await, Some(Ok(())));
        state.shutdown().await;
    }
}
