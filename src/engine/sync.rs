// Authoritative history synchronizer
// One task per attached conversation. It listens to the push stream and
// re-fetches the full history on a timer or on demand, posting everything it
// sees back into the engine queue. Deduplication happens in the engine.

use futures_util::StreamExt;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::Internal;
use crate::network::{Conversation, HistoryStream, MessagingClient};

/// Owns the running sync task; dropping it stops synchronization
pub(crate) struct SyncHandle {
    task: JoinHandle<()>,
    refresh: Arc<Notify>,
}

impl SyncHandle {
    pub(crate) fn start(
        client: Arc<dyn MessagingClient>,
        conversation: Conversation,
        epoch: u64,
        updates: mpsc::UnboundedSender<Internal>,
        poll_interval: Duration,
    ) -> Self {
        let refresh = Arc::new(Notify::new());
        let task = tokio::spawn(run_sync(client, conversation, epoch, updates, poll_interval, refresh.clone()));
        SyncHandle { task, refresh }
    }

    /// Ask for an immediate re-fetch. Coalesces if one is already queued.
    pub(crate) fn request_refresh(&self) {
        self.refresh.notify_one();
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_sync(
    client: Arc<dyn MessagingClient>,
    conversation: Conversation,
    epoch: u64,
    updates: mpsc::UnboundedSender<Internal>,
    poll_interval: Duration,
    refresh: Arc<Notify>,
) {
    info!("Starting history sync for {:?}", conversation);

    // Subscribe before the first fetch so nothing lands in between
    let mut stream: Option<HistoryStream> = match client.subscribe(&conversation).await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Subscription to {:?} failed, falling back to polling: {}", conversation, e);
            let _ = updates.send(Internal::SyncFailed { epoch, reason: e.to_string() });
            None
        }
    };

    // First tick fires immediately and performs the initial load
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let update = tokio::select! {
            _ = ticker.tick() => Some(fetch(&*client, &conversation, epoch).await),
            _ = refresh.notified() => {
                debug!("Refresh requested for {:?}", conversation);
                Some(fetch(&*client, &conversation, epoch).await)
            }
            item = next_pushed(&mut stream) => item.map(|message| Internal::History { epoch, messages: vec![message] }),
        };

        let Some(update) = update else {
            info!("History stream for {:?} ended, continuing with polling only", conversation);
            stream = None;
            continue;
        };

        if updates.send(update).is_err() {
            debug!("Engine gone, stopping history sync for {:?}", conversation);
            return;
        }
    }
}

async fn fetch(client: &dyn MessagingClient, conversation: &Conversation, epoch: u64) -> Internal {
    match client.fetch_history(conversation).await {
        Ok(messages) => Internal::History { epoch, messages },
        Err(e) => Internal::SyncFailed { epoch, reason: e.to_string() },
    }
}

// Never resolves once the stream is gone
async fn next_pushed(stream: &mut Option<HistoryStream>) -> Option<crate::models::ConfirmedMessage> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
