//! Local (Discord side) channel capability.

use async_trait::async_trait;

use crate::common::{LocalChannelId, LocalNotification};

/// Delivers rendered team chat notifications to a local channel.
#[async_trait]
pub trait LocalChannel: Send + Sync {
    async fn deliver(
        &self,
        channel: LocalChannelId,
        notification: &LocalNotification,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
pub mod mock {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use tokio::sync::watch;

    use super::*;

    /// Records every delivered notification.
    ///
    /// While held, deliveries wait until released.
    pub struct RecordingChannel {
        delivered: Mutex<Vec<(LocalChannelId, LocalNotification)>>,
        failing: AtomicBool,
        held: watch::Sender<bool>,
        pending: watch::Sender<usize>,
    }

    impl Default for RecordingChannel {
        fn default() -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                failing: AtomicBool::new(false),
                held: watch::channel(false).0,
                pending: watch::channel(0).0,
            }
        }
    }

    impl RecordingChannel {
        pub fn hold(&self, held: bool) {
            self.held.send_replace(held);
        }

        /// Wait until a delivery is blocked on the hold.
        pub async fn wait_for_pending(&self) {
            let mut pending = self.pending.subscribe();
            pending.wait_for(|n| *n > 0).await.unwrap();
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn delivered(&self) -> Vec<(LocalChannelId, LocalNotification)> {
            self.delivered.lock().unwrap().clone()
        }

        pub fn bodies(&self) -> Vec<String> {
            self.delivered()
                .into_iter()
                .map(|(_, n)| n.body)
                .collect()
        }
    }

    /// Counts a held delivery until it resumes or is dropped.
    struct PendingGuard<'a>(&'a watch::Sender<usize>);

    impl Drop for PendingGuard<'_> {
        fn drop(&mut self) {
            self.0.send_modify(|n| *n -= 1);
        }
    }

    #[async_trait]
    impl LocalChannel for RecordingChannel {
        async fn deliver(
            &self,
            channel: LocalChannelId,
            notification: &LocalNotification,
        ) -> anyhow::Result<()> {
            let held_now = *self.held.borrow();
            if held_now {
                self.pending.send_modify(|n| *n += 1);
                let _pending = PendingGuard(&self.pending);
                let mut held = self.held.subscribe();
                let _ = held.wait_for(|h| !*h).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("channel unavailable");
            }
            self.delivered
                .lock()
                .unwrap()
                .push((channel, notification.clone()));
            Ok(())
        }
    }
}
