//! All bridges of the process, keyed by guild.
//!
//! Administrative operations land here. Each one forwards to the bridge's
//! [`BridgeState`] and writes the resulting settings to the [`ConfigStore`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{error, info};

use super::connection::EventSender;
use super::local::LocalChannel;
use super::state::BridgeState;
use crate::common::error::{BridgeError, SendFailure};
use crate::common::{BridgeId, BridgeStatus, LocalChannelId, OutboundMessage};
use crate::config::validate::validate_poll_interval;
use crate::config::{BridgeConfig, BridgeDefaults, ConfigStore, PushCredentials, ServerCredentials};
use crate::remote::RemoteLink;

/// Collaborators shared by every bridge.
#[derive(Clone)]
pub struct BridgeContext {
    pub link: Arc<dyn RemoteLink>,
    pub local: Arc<dyn LocalChannel>,
    pub defaults: Arc<BridgeDefaults>,
    /// Fallback push credentials for bridges without their own.
    pub global_push: Option<Arc<PushCredentials>>,
    pub events: Option<EventSender>,
}

pub struct BridgeRegistry {
    ctx: BridgeContext,
    store: ConfigStore,
    bridges: RwLock<HashMap<BridgeId, Arc<BridgeState>>>,
}

impl BridgeRegistry {
    /// Build a registry holding every bridge in `store`. Nothing is started.
    pub async fn load(store: ConfigStore, ctx: BridgeContext) -> Self {
        let bridges = store
            .all()
            .await
            .into_iter()
            .map(|(id, config)| (id, Arc::new(BridgeState::new(id, config, ctx.clone()))))
            .collect::<HashMap<_, _>>();

        info!("Loaded {} bridge configurations", bridges.len());
        Self {
            ctx,
            store,
            bridges: RwLock::new(bridges),
        }
    }

    async fn get(&self, id: BridgeId) -> Option<Arc<BridgeState>> {
        self.bridges.read().await.get(&id).cloned()
    }

    async fn get_or_create(&self, id: BridgeId) -> Arc<BridgeState> {
        if let Some(state) = self.get(id).await {
            return state;
        }
        self.bridges
            .write()
            .await
            .entry(id)
            .or_insert_with(|| {
                Arc::new(BridgeState::new(id, BridgeConfig::default(), self.ctx.clone()))
            })
            .clone()
    }

    async fn persist(&self, id: BridgeId, config: BridgeConfig) -> Result<(), BridgeError> {
        self.store.put(id, config).await?;
        Ok(())
    }

    /// Store server address and player credentials. Refused while enabled.
    pub async fn setup(
        &self,
        id: BridgeId,
        server: ServerCredentials,
        user_id: u64,
    ) -> Result<(), BridgeError> {
        let state = self.get_or_create(id).await;
        let config = state
            .update_locked("server settings", |config| {
                config.server_address = Some(server.address);
                config.server_port = Some(server.port);
                config.player_id = Some(server.player_id);
                config.player_token = Some(server.player_token);
                config.authorized_user_id = Some(user_id);
            })
            .await?;
        self.persist(id, config).await
    }

    pub async fn set_channel(&self, id: BridgeId, channel: LocalChannelId) -> Result<(), BridgeError> {
        let state = self.get_or_create(id).await;
        let config = state.set_channel(channel).await;
        self.persist(id, config).await
    }

    pub async fn enable(&self, id: BridgeId) -> Result<(), BridgeError> {
        let state = self.get(id).await.ok_or(BridgeError::NotConfigured)?;
        let config = state.enable(state.config().await).await?;
        self.persist(id, config).await
    }

    /// Returns false if the bridge was not running.
    pub async fn disable(&self, id: BridgeId) -> Result<bool, BridgeError> {
        let Some(state) = self.get(id).await else {
            return Ok(false);
        };
        let (was_running, config) = state.disable().await;
        self.persist(id, config).await?;
        Ok(was_running)
    }

    pub async fn reconnect(&self, id: BridgeId) -> Result<(), BridgeError> {
        let state = self.get(id).await.ok_or(BridgeError::NotEnabled)?;
        state.reconnect().await
    }

    pub async fn status(&self, id: BridgeId) -> Option<BridgeStatus> {
        Some(self.get(id).await?.status().await)
    }

    /// Stop the bridge and forget its settings. Returns false if none existed.
    pub async fn clear(&self, id: BridgeId) -> Result<bool, BridgeError> {
        let removed = self.bridges.write().await.remove(&id);
        if let Some(state) = &removed {
            state.disable().await;
        }
        let stored = self.store.remove(id).await?;
        Ok(removed.is_some() || stored.is_some())
    }

    pub async fn set_push_credentials(
        &self,
        id: BridgeId,
        credentials: Option<PushCredentials>,
    ) -> Result<(), BridgeError> {
        let state = self.get_or_create(id).await;
        let config = state
            .update_delivery(|config| config.push_credentials = credentials)
            .await;
        self.persist(id, config).await
    }

    /// Request push delivery. Needs push credentials, the bridge's or global ones.
    pub async fn set_use_push(&self, id: BridgeId, use_push: bool) -> Result<(), BridgeError> {
        let state = self.get_or_create(id).await;
        if use_push
            && state.config().await.push_credentials.is_none()
            && self.ctx.global_push.is_none()
        {
            return Err(BridgeError::MissingField {
                field: "push credentials",
            });
        }
        let config = state.update_delivery(|config| config.use_push = use_push).await;
        self.persist(id, config).await
    }

    pub async fn set_poll_interval(&self, id: BridgeId, secs: u64) -> Result<(), BridgeError> {
        validate_poll_interval(secs)?;
        let state = self.get_or_create(id).await;
        let config = state
            .update_delivery(|config| config.poll_interval_secs = Some(secs))
            .await;
        self.persist(id, config).await
    }

    /// Forward a message posted in `channel` of guild `id`.
    ///
    /// `None` means the message was not for a running bridge.
    pub async fn forward_from_local(
        &self,
        id: BridgeId,
        channel: LocalChannelId,
        message: &OutboundMessage,
    ) -> Option<Result<(), SendFailure>> {
        self.get(id).await?.forward_outbound(channel, message).await
    }

    /// Start every bridge whose stored settings say it was enabled.
    pub async fn start_enabled(&self) -> usize {
        let bridges: Vec<_> = self.bridges.read().await.values().cloned().collect();
        let mut started = 0;

        for state in bridges {
            let config = state.config().await;
            if !config.enabled {
                continue;
            }
            match state.enable(config).await {
                Ok(_) => started += 1,
                Err(e) => error!(bridge = state.id(), "Failed to start bridge: {}", e),
            }
        }

        info!("Started {} bridges", started);
        started
    }

    /// Stop every running bridge, keeping their enabled flags.
    pub async fn shutdown(&self) {
        let bridges: Vec<_> = self.bridges.read().await.values().cloned().collect();
        join_all(bridges.iter().map(|state| state.shutdown())).await;
        info!("All bridges stopped");
    }
}
