//! Message routing between the local channel and the team chat.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::dedup::DedupCache;
use super::local::LocalChannel;
use super::{touch_activity, SessionSlot, StatusTx};
use crate::common::error::SendFailure;
use crate::common::{
    BridgeId, InboundMessage, LocalChannelId, LocalNotification, OutboundMessage,
};
use crate::config::BridgeDefaults;

const ELLIPSIS: &str = "...";

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Delivered,
    Duplicate,
    Failed,
    Cancelled,
}

/// Formats and forwards messages in both directions for one bridge.
///
/// Outbound sends hold the session slot for their whole duration, so they
/// are serialized and a teardown waits for an in-flight send.
pub struct MessageRouter {
    bridge: BridgeId,
    local: Arc<dyn LocalChannel>,
    channel: RwLock<LocalChannelId>,
    dedup: Mutex<DedupCache>,
    session: SessionSlot,
    status: StatusTx,
    max_chars: usize,
    call_ceiling: Duration,
}

impl MessageRouter {
    pub fn new(
        bridge: BridgeId,
        channel: LocalChannelId,
        local: Arc<dyn LocalChannel>,
        session: SessionSlot,
        status: StatusTx,
        defaults: &BridgeDefaults,
    ) -> Self {
        Self {
            bridge,
            local,
            channel: RwLock::new(channel),
            dedup: Mutex::new(DedupCache::new(&defaults.dedup)),
            session,
            status,
            max_chars: defaults.max_outbound_chars,
            call_ceiling: defaults.call_ceiling(),
        }
    }

    pub async fn channel(&self) -> LocalChannelId {
        *self.channel.read().await
    }

    pub async fn set_channel(&self, channel: LocalChannelId) {
        *self.channel.write().await = channel;
    }

    /// Send a local message to the team chat.
    pub async fn forward_to_external(&self, message: &OutboundMessage) -> Result<(), SendFailure> {
        let text = format_outbound(message, self.max_chars);

        let slot = self.session.lock().await;
        let Some(session) = slot.as_ref() else {
            debug!(bridge = self.bridge, "Dropping outbound message, not connected");
            return Err(SendFailure::NotConnected);
        };

        match timeout(self.call_ceiling, session.send_team_message(&text)).await {
            Ok(Ok(())) => {
                touch_activity(&self.status);
                debug!(bridge = self.bridge, "Sent to team chat: {}", text);
                Ok(())
            }
            Ok(Err(failure)) => {
                warn!(bridge = self.bridge, "Team chat send failed: {}", failure);
                Err(failure)
            }
            Err(_) => {
                warn!(
                    bridge = self.bridge,
                    "Team chat send timed out after {:?}", self.call_ceiling
                );
                Err(SendFailure::Timeout)
            }
        }
    }

    /// Deliver a team chat message to the local channel unless already seen.
    ///
    /// A message that is not delivered, because the channel failed or
    /// `cancel` fired, is forgotten again so the next poll retries it.
    pub async fn forward_to_local(
        &self,
        message: &InboundMessage,
        cancel: &CancellationToken,
    ) -> InboundOutcome {
        let id = message.id();
        if !self.dedup.lock().await.check_and_record(id.clone()) {
            debug!(
                bridge = self.bridge,
                "Skipping duplicate message from {}", message.sender_name
            );
            return InboundOutcome::Duplicate;
        }

        let channel = self.channel().await;
        let notification = LocalNotification::from(message);
        let delivery = timeout(self.call_ceiling, self.local.deliver(channel, &notification));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(bridge = self.bridge, "Delivery to channel {} cancelled", channel);
                InboundOutcome::Cancelled
            }
            result = delivery => match result {
                Ok(Ok(())) => {
                    touch_activity(&self.status);
                    InboundOutcome::Delivered
                }
                Ok(Err(e)) => {
                    warn!(
                        bridge = self.bridge,
                        "Failed to deliver message to channel {}: {:#}", channel, e
                    );
                    InboundOutcome::Failed
                }
                Err(_) => {
                    warn!(
                        bridge = self.bridge,
                        "Delivery to channel {} timed out", channel
                    );
                    InboundOutcome::Failed
                }
            },
        };

        if outcome != InboundOutcome::Delivered {
            self.dedup.lock().await.forget(&id);
        }
        outcome
    }
}

/// Render an outbound message as team chat text.
pub fn format_outbound(message: &OutboundMessage, max_chars: usize) -> String {
    truncate_chars(
        &format!("{}: {}", message.display_name, message.body),
        max_chars,
    )
}

/// Truncate to at most `max_chars` characters, ending in `...` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= ELLIPSIS.len() {
        return text.chars().take(max_chars).collect();
    }

    let keep = max_chars - ELLIPSIS.len();
    let end = text
        .char_indices()
        .nth(keep)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    format!("{}{}", &text[..end], ELLIPSIS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::local::mock::RecordingChannel;
    use crate::common::SessionStatus;
    use crate::remote::mock::MockSession;
    use crate::remote::RemoteSession;
    use chrono::{TimeZone, Utc};
    use tokio::sync::watch;

    struct Fixture {
        router: MessageRouter,
        local: Arc<RecordingChannel>,
        session: Arc<MockSession>,
        status: StatusTx,
    }

    async fn fixture(connected: bool) -> Fixture {
        let local = Arc::new(RecordingChannel::default());
        let session = Arc::new(MockSession::default());
        let slot: SessionSlot = Arc::new(Mutex::new(None));
        if connected {
            *slot.lock().await = Some(session.clone() as Arc<dyn RemoteSession>);
        }
        let status = Arc::new(watch::channel(SessionStatus::default()).0);
        let router = MessageRouter::new(
            1,
            55,
            local.clone(),
            slot,
            status.clone(),
            &BridgeDefaults::default(),
        );
        Fixture {
            router,
            local,
            session,
            status,
        }
    }

    fn inbound(server_id: Option<&str>, body: &str, secs: i64) -> InboundMessage {
        InboundMessage {
            server_id: server_id.map(String::from),
            sender_id: 76561198000000001,
            sender_name: "Rusty".to_string(),
            body: body.to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            color: Some("#AAFF55".to_string()),
        }
    }

    #[test]
    fn test_truncate_ascii_to_limit() {
        let message = OutboundMessage::new("Alice", "x".repeat(200));
        let text = format_outbound(&message, 128);
        assert_eq!(text.chars().count(), 128);
        assert!(text.starts_with("Alice: xxx"));
        assert!(text.ends_with("..."));
    }

    #[test]
    fn test_short_message_untouched() {
        let message = OutboundMessage::new("Alice", "hello team");
        assert_eq!(format_outbound(&message, 128), "Alice: hello team");
    }

    #[test]
    fn test_truncate_never_splits_multibyte() {
        let text = "ж".repeat(300);
        let cut = truncate_chars(&text, 128);
        assert_eq!(cut.chars().count(), 128);
        assert!(cut.starts_with('ж'));
        assert!(cut.ends_with("..."));

        let emoji = "🦀".repeat(10);
        assert_eq!(truncate_chars(&emoji, 10), emoji);
        assert_eq!(truncate_chars(&emoji, 5), "🦀🦀...");
        assert_eq!(truncate_chars(&emoji, 2), "🦀🦀");
    }

    #[tokio::test]
    async fn test_outbound_sent_through_session() {
        let f = fixture(true).await;
        tokio_test::assert_ok!(
            f.router
                .forward_to_external(&OutboundMessage::new("Alice", "hi"))
                .await
        );
        assert_eq!(f.session.sent(), vec!["Alice: hi".to_string()]);
        assert!(f.status.borrow().last_activity.is_some());
    }

    #[tokio::test]
    async fn test_outbound_without_session() {
        let f = fixture(false).await;
        let result = f
            .router
            .forward_to_external(&OutboundMessage::new("Alice", "hi"))
            .await;
        assert_eq!(result, Err(SendFailure::NotConnected));
    }

    #[tokio::test]
    async fn test_outbound_failure_is_reported_not_retried() {
        let f = fixture(true).await;
        f.session.fail_sends(SendFailure::Rejected {
            reason: "rate_limited".to_string(),
        });

        let result = f
            .router
            .forward_to_external(&OutboundMessage::new("Alice", "hi"))
            .await;
        assert!(matches!(result, Err(SendFailure::Rejected { .. })));
        assert!(f.session.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_times_out_at_call_ceiling() {
        let f = fixture(true).await;
        f.session.delay_sends(Duration::from_secs(30));

        let result = f
            .router
            .forward_to_external(&OutboundMessage::new("Alice", "hi"))
            .await;
        assert_eq!(result, Err(SendFailure::Timeout));
    }

    #[tokio::test]
    async fn test_same_id_from_push_and_poll_delivered_once() {
        let f = fixture(true).await;

        let pushed = inbound(Some("msg-42"), "raid at B4", 1_700_000_000);
        let polled = inbound(Some("msg-42"), "raid at B4", 1_700_000_001);

        assert_eq!(
            f.router.forward_to_local(&pushed, &CancellationToken::new()).await,
            InboundOutcome::Delivered
        );
        assert_eq!(
            f.router.forward_to_local(&polled, &CancellationToken::new()).await,
            InboundOutcome::Duplicate
        );

        let delivered = f.local.delivered();
        assert_eq!(delivered.len(), 1);
        let (channel, notification) = &delivered[0];
        assert_eq!(*channel, 55);
        assert_eq!(notification.color, 0xAAFF55);
        assert_eq!(notification.footer, "Steam ID: 76561198000000001");
    }

    #[tokio::test]
    async fn test_retarget_channel() {
        let f = fixture(true).await;
        f.router.set_channel(77).await;
        f.router
            .forward_to_local(&inbound(None, "hello", 1_700_000_000), &CancellationToken::new())
            .await;
        assert_eq!(f.local.delivered()[0].0, 77);
    }

    #[tokio::test]
    async fn test_local_failure_is_scoped_to_message() {
        let f = fixture(true).await;
        let cancel = CancellationToken::new();
        let first = inbound(Some("m1"), "first", 1_700_000_000);
        f.local.set_failing(true);
        assert_eq!(
            f.router.forward_to_local(&first, &cancel).await,
            InboundOutcome::Failed
        );

        f.local.set_failing(false);
        assert_eq!(
            f.router
                .forward_to_local(&inbound(None, "second", 1_700_000_001), &cancel)
                .await,
            InboundOutcome::Delivered
        );
        assert_eq!(f.local.bodies(), vec!["second".to_string()]);

        // The failed message was not kept as seen.
        assert_eq!(
            f.router.forward_to_local(&first, &cancel).await,
            InboundOutcome::Delivered
        );
        assert_eq!(f.local.bodies(), vec!["second".to_string(), "first".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_delivery_is_retried_later() {
        let f = fixture(true).await;
        let message = inbound(Some("m1"), "held", 1_700_000_000);
        f.local.hold(true);

        let cancel = CancellationToken::new();
        let (outcome, _) = tokio::join!(f.router.forward_to_local(&message, &cancel), async {
            f.local.wait_for_pending().await;
            cancel.cancel();
        });
        assert_eq!(outcome, InboundOutcome::Cancelled);
        assert!(f.local.bodies().is_empty());

        f.local.hold(false);
        assert_eq!(
            f.router
                .forward_to_local(&message, &CancellationToken::new())
                .await,
            InboundOutcome::Delivered
        );
        assert_eq!(f.local.bodies(), vec!["held".to_string()]);
    }
}
