use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::client::ConversationApi;
use crate::api::ConversationId;

/// Keeps one conversation's remote desktop alive while it is on screen.
///
/// Failed pings are logged and retried on the next tick; the poller only
/// stops when told to or dropped.
pub struct KeepalivePoller {
    conversation_id: ConversationId,
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl KeepalivePoller {
    pub fn spawn(
        api: Arc<dyn ConversationApi>,
        conversation_id: ConversationId,
        interval: Duration,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(conversation_id, ?interval, "desktop keepalive started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    result = api.keepalive(conversation_id) => result,
                };
                if let Err(err) = result {
                    warn!(conversation_id, error = %err, "desktop keepalive failed");
                }
            }
            debug!(conversation_id, "desktop keepalive stopped");
        });
        Self {
            conversation_id,
            cancel_token,
            handle,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn stop(self) {
        self.cancel_token.cancel();
    }
}

impl Drop for KeepalivePoller {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tests::ScriptedApi;

    #[tokio::test(start_paused = true)]
    async fn pings_every_interval_until_stopped() {
        let api = Arc::new(ScriptedApi::default());
        let poller = KeepalivePoller::spawn(api.clone(), 9, Duration::from_secs(60));
        assert_eq!(poller.conversation_id(), 9);

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(api.keepalive_calls(), vec![9, 9, 9]);

        poller.stop();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(api.keepalive_calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_poller() {
        let api = Arc::new(ScriptedApi {
            keepalive_fails: true,
            ..ScriptedApi::default()
        });
        let poller = KeepalivePoller::spawn(api.clone(), 4, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(api.keepalive_calls().len(), 3);
        assert!(!poller.is_finished());
    }
}
