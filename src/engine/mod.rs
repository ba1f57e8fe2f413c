// Message reconciliation engine
// Owns the merged view of one conversation: authoritative history plus the
// user's optimistic sends. All mutations run one at a time on a single task;
// callers talk to it through the cloneable ReconciliationEngine handle.

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ChatError, ChatResult};
use crate::models::{AccountIdentifier, ConfirmedMessage, DisplayMessage, LocalId, PendingMessage};
use crate::network::{Conversation, MessagingClient};

pub mod state;
mod sync;

pub use state::EngineState;
use sync::SyncHandle;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a `Published` entry may wait for its history record
    pub grace_window: Duration,
    /// Period of full history re-fetches
    pub poll_interval: Duration,
    /// Capacity of the event channel handed to the presentation layer
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            grace_window: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            event_buffer: 100,
        }
    }
}

/// Notifications for the presentation layer. Best effort: dropped when the
/// receiver falls behind, `view()` is always authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ViewChanged { revision: u64 },
    SendFailed { local_id: LocalId, reason: String },
    Reconciled { local_id: LocalId, message_id: String },
    GraceExpired { local_id: LocalId },
    SyncFailed { reason: String },
}

enum Intent {
    Attach(Conversation, oneshot::Sender<()>),
    Detach(oneshot::Sender<()>),
    Send(String, oneshot::Sender<ChatResult<LocalId>>),
    Retry(LocalId, oneshot::Sender<ChatResult<()>>),
    Cancel(LocalId, oneshot::Sender<ChatResult<()>>),
    View(oneshot::Sender<Vec<DisplayMessage>>),
    Refresh(oneshot::Sender<ChatResult<()>>),
    PendingCount(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

/// Results of work the engine started itself. Each carries the epoch of the
/// conversation it belongs to so leftovers from a previous one are dropped.
pub(crate) enum Internal {
    TransportResult { epoch: u64, local_id: LocalId, attempt: u32, result: Result<(), String> },
    History { epoch: u64, messages: Vec<ConfirmedMessage> },
    SyncFailed { epoch: u64, reason: String },
    GraceExpired { epoch: u64, local_id: LocalId, attempt: u32 },
}

/// Handle to a running engine. Cheap to clone; the engine stops when every
/// handle is dropped or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct ReconciliationEngine {
    intents: mpsc::UnboundedSender<Intent>,
}

impl ReconciliationEngine {
    /// Start the engine task. Must be called from within a tokio runtime.
    pub fn spawn(
        account: AccountIdentifier,
        client: Arc<dyn MessagingClient>,
        config: EngineConfig,
    ) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (intent_tx, intent_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));

        let actor = EngineActor {
            state: EngineState::new(account),
            client,
            config,
            active: None,
            epoch: 0,
            revision: 0,
            internal_tx,
            events: event_tx,
        };
        tokio::spawn(actor.run(intent_rx, internal_rx));

        (ReconciliationEngine { intents: intent_tx }, event_rx)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Intent) -> ChatResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.intents.send(make(reply_tx)).map_err(|_| ChatError::EngineStopped)?;
        reply_rx.await.map_err(|_| ChatError::EngineStopped)
    }

    /// Reset all state and start synchronizing with `conversation`
    pub async fn attach_conversation(&self, conversation: Conversation) -> ChatResult<()> {
        self.request(|reply| Intent::Attach(conversation, reply)).await
    }

    /// Stop synchronizing and discard the current conversation's state
    pub async fn detach_conversation(&self) -> ChatResult<()> {
        self.request(Intent::Detach).await
    }

    /// Queue `content` for sending and return its local id straight away.
    /// The transport call runs in the background; its outcome shows up in
    /// [`view`](Self::view).
    pub async fn send(&self, content: &str) -> ChatResult<LocalId> {
        let content = content.to_string();
        self.request(|reply| Intent::Send(content, reply)).await?
    }

    pub async fn retry(&self, local_id: &str) -> ChatResult<()> {
        let local_id = local_id.to_string();
        self.request(|reply| Intent::Retry(local_id, reply)).await?
    }

    pub async fn cancel(&self, local_id: &str) -> ChatResult<()> {
        let local_id = local_id.to_string();
        self.request(|reply| Intent::Cancel(local_id, reply)).await?
    }

    pub async fn view(&self) -> ChatResult<Vec<DisplayMessage>> {
        self.request(Intent::View).await
    }

    /// Trigger an immediate history re-fetch
    pub async fn refresh(&self) -> ChatResult<()> {
        self.request(Intent::Refresh).await?
    }

    pub async fn pending_count(&self) -> ChatResult<usize> {
        self.request(Intent::PendingCount).await
    }

    pub async fn shutdown(&self) -> ChatResult<()> {
        self.request(Intent::Shutdown).await
    }
}

struct ActiveConversation {
    conversation: Conversation,
    sync: SyncHandle,
}

struct EngineActor {
    state: EngineState,
    client: Arc<dyn MessagingClient>,
    config: EngineConfig,
    active: Option<ActiveConversation>,
    epoch: u64,
    revision: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events: mpsc::Sender<EngineEvent>,
}

impl EngineActor {
    async fn run(mut self, mut intents: mpsc::UnboundedReceiver<Intent>, mut internal: mpsc::UnboundedReceiver<Internal>) {
        info!("Reconciliation engine started for {}", self.state.account());
        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(Intent::Shutdown(reply)) => {
                        self.detach();
                        let _ = reply.send(());
                        break;
                    }
                    Some(intent) => self.handle_intent(intent),
                    None => break,
                },
                Some(msg) = internal.recv() => self.handle_internal(msg),
            }
        }
        self.detach();
        info!("Reconciliation engine stopped");
    }

    fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Attach(conversation, reply) => {
                self.attach(conversation);
                let _ = reply.send(());
            }
            Intent::Detach(reply) => {
                self.detach();
                self.emit_view();
                let _ = reply.send(());
            }
            Intent::Send(content, reply) => {
                let _ = reply.send(self.send(&content));
            }
            Intent::Retry(local_id, reply) => {
                let _ = reply.send(self.retry(&local_id));
            }
            Intent::Cancel(local_id, reply) => {
                let _ = reply.send(self.cancel(&local_id));
            }
            Intent::View(reply) => {
                let _ = reply.send(self.state.view());
            }
            Intent::Refresh(reply) => {
                let result = match &self.active {
                    Some(active) => {
                        active.sync.request_refresh();
                        Ok(())
                    }
                    None => Err(ChatError::NoConversation),
                };
                let _ = reply.send(result);
            }
            Intent::PendingCount(reply) => {
                let _ = reply.send(self.state.pending_count());
            }
            // Handled by the run loop
            Intent::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn attach(&mut self, conversation: Conversation) {
        self.detach();
        info!("Attaching to conversation {:?} (epoch {})", conversation, self.epoch);
        let sync = SyncHandle::start(
            self.client.clone(),
            conversation.clone(),
            self.epoch,
            self.internal_tx.clone(),
            self.config.poll_interval.max(Duration::from_millis(1)),
        );
        self.active = Some(ActiveConversation { conversation, sync });
        self.emit_view();
    }

    /// Drop the current conversation. Bumping the epoch makes any result
    /// still in flight for it stale.
    fn detach(&mut self) {
        if let Some(active) = self.active.take() {
            info!("Detaching from conversation {:?}", active.conversation);
        }
        self.state.reset();
        self.epoch += 1;
    }

    fn send(&mut self, content: &str) -> ChatResult<LocalId> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }
        let conversation = match &self.active {
            Some(active) => active.conversation.clone(),
            None => return Err(ChatError::NoConversation),
        };
        let pending = self.state.begin_send(content)?;
        info!("Queued message {} on {:?}", pending.local_id, conversation);
        self.dispatch_transport(conversation, &pending);
        self.emit_view();
        Ok(pending.local_id)
    }

    fn retry(&mut self, local_id: &str) -> ChatResult<()> {
        let conversation = match &self.active {
            Some(active) => active.conversation.clone(),
            None => return Err(ChatError::NotFound(local_id.to_string())),
        };
        let pending = self.state.begin_retry(local_id)?;
        info!("Retrying message {} (attempt {})", local_id, pending.attempt);
        self.dispatch_transport(conversation, &pending);
        self.emit_view();
        Ok(())
    }

    fn cancel(&mut self, local_id: &str) -> ChatResult<()> {
        let removed = self.state.cancel(local_id)?;
        info!("Cancelled failed message {} ({} chars)", removed.local_id, removed.content.len());
        self.emit_view();
        Ok(())
    }

    fn dispatch_transport(&self, conversation: Conversation, pending: &PendingMessage) {
        let client = self.client.clone();
        let results = self.internal_tx.clone();
        let epoch = self.epoch;
        let local_id = pending.local_id.clone();
        let attempt = pending.attempt;
        let content = pending.content.clone();

        tokio::spawn(async move {
            let result = client.send_on(&conversation, &content).await.map_err(|e| e.to_string());
            let msg = Internal::TransportResult { epoch, local_id, attempt, result };
            if results.send(msg).is_err() {
                debug!("Engine stopped before transport result arrived");
            }
        });
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::TransportResult { epoch, local_id, attempt, result } => {
                if epoch != self.epoch {
                    info!("Discarding transport result for {} from a previous conversation", local_id);
                    return;
                }
                self.on_transport_result(local_id, attempt, result);
            }
            Internal::History { epoch, messages } => {
                if epoch != self.epoch {
                    debug!("Discarding {} history messages from a previous conversation", messages.len());
                    return;
                }
                self.on_history(messages);
            }
            Internal::SyncFailed { epoch, reason } => {
                if epoch != self.epoch {
                    return;
                }
                // Keep the last known good history
                warn!("History sync failed: {}", reason);
                self.emit(EngineEvent::SyncFailed { reason });
            }
            Internal::GraceExpired { epoch, local_id, attempt } => {
                if epoch != self.epoch {
                    return;
                }
                if self.state.expire(&local_id, attempt) {
                    warn!("No history record for {} within the grace window, dropping it", local_id);
                    self.emit(EngineEvent::GraceExpired { local_id });
                    self.emit_view();
                }
            }
        }
    }

    fn on_transport_result(&mut self, local_id: LocalId, attempt: u32, result: Result<(), String>) {
        match result {
            Ok(()) => {
                if !self.state.mark_published(&local_id, attempt) {
                    debug!("Ignoring stale success for {} attempt {}", local_id, attempt);
                    return;
                }
                info!("Message {} published", local_id);
                self.schedule_grace_expiry(local_id, attempt);
                if let Some(active) = &self.active {
                    active.sync.request_refresh();
                }
                // The pushed copy may already be here
                self.apply_reconciliation();
                self.emit_view();
            }
            Err(reason) => {
                if !self.state.mark_failed(&local_id, attempt, &reason) {
                    debug!("Ignoring stale failure for {} attempt {}", local_id, attempt);
                    return;
                }
                error!("Message {} failed to send: {}", local_id, reason);
                self.emit(EngineEvent::SendFailed { local_id, reason });
                self.emit_view();
            }
        }
    }

    fn on_history(&mut self, messages: Vec<ConfirmedMessage>) {
        let added = self.state.merge_confirmed(messages);
        let reconciled = self.apply_reconciliation();
        if added > 0 || reconciled > 0 {
            debug!(
                "History sync added {} messages ({} total), reconciled {}",
                added,
                self.state.confirmed_count(),
                reconciled
            );
            self.emit_view();
        }
    }

    fn apply_reconciliation(&mut self) -> usize {
        let removed = self.state.reconcile();
        let count = removed.len();
        for (local_id, message_id) in removed {
            info!("Message {} confirmed as {}", local_id, message_id);
            self.emit(EngineEvent::Reconciled { local_id, message_id });
        }
        count
    }

    fn schedule_grace_expiry(&self, local_id: LocalId, attempt: u32) {
        let timer = self.internal_tx.clone();
        let epoch = self.epoch;
        let grace = self.config.grace_window;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = timer.send(Internal::GraceExpired { epoch, local_id, attempt });
        });
    }

    fn emit_view(&mut self) {
        self.revision += 1;
        self.emit(EngineEvent::ViewChanged { revision: self.revision });
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!("Engine event not delivered: {}", e);
        }
    }
}
