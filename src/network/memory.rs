// In-process messaging network
// Implements MessagingClient entirely in memory. Used by the demo binary and
// the test-suite; supports fault injection so every failure path of the
// engine can be exercised without a real network.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex as TokioMutex};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use super::{Conversation, ConversationKind, HistoryStream, MessagingClient};
use crate::error::{ChatError, ChatResult};
use crate::models::{AccountIdentifier, ConfirmedMessage};

const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Default)]
struct Faults {
    fail_next_sends: usize,
    fail_all_sends: bool,
    fail_fetches: bool,
    fail_creation: bool,
    send_delays: HashMap<String, Duration>,
}

struct ConversationRecord {
    handle: Conversation,
    history: Vec<ConfirmedMessage>,
    subscribers: Option<broadcast::Sender<ConfirmedMessage>>,
}

struct NetworkState {
    reachable: HashSet<String>,
    conversations: HashMap<String, ConversationRecord>,
    // Sorted member pair -> conversation id, so direct chats are reused
    direct_index: HashMap<(String, String), String>,
    faults: Faults,
    publish_to_history: bool,
    echo_replies: bool,
    send_calls: usize,
}

#[derive(Clone)]
pub struct InMemoryNetwork {
    account: AccountIdentifier,
    state: Arc<TokioMutex<NetworkState>>,
    // true = sends may complete
    send_gate: Arc<watch::Sender<bool>>,
}

impl InMemoryNetwork {
    pub fn new(account: AccountIdentifier) -> Self {
        let mut reachable = HashSet::new();
        reachable.insert(account.as_str().to_ascii_lowercase());
        let (send_gate, _) = watch::channel(true);
        InMemoryNetwork {
            account,
            state: Arc::new(TokioMutex::new(NetworkState {
                reachable,
                conversations: HashMap::new(),
                direct_index: HashMap::new(),
                faults: Faults::default(),
                publish_to_history: true,
                echo_replies: false,
                send_calls: 0,
            })),
            send_gate: Arc::new(send_gate),
        }
    }

    pub fn account(&self) -> &AccountIdentifier {
        &self.account
    }

    /// Make `identity` pass reachability checks
    pub async fn register(&self, identity: &str) {
        let mut state = self.state.lock().await;
        state.reachable.insert(identity.trim().to_ascii_lowercase());
    }

    pub async fn fail_next_sends(&self, count: usize) {
        self.state.lock().await.faults.fail_next_sends = count;
    }

    pub async fn fail_sends(&self, fail: bool) {
        self.state.lock().await.faults.fail_all_sends = fail;
    }

    pub async fn fail_fetches(&self, fail: bool) {
        self.state.lock().await.faults.fail_fetches = fail;
    }

    pub async fn fail_conversation_creation(&self, fail: bool) {
        self.state.lock().await.faults.fail_creation = fail;
    }

    /// Delay the transport call for messages with exactly this content
    pub async fn set_send_delay(&self, content: &str, delay: Duration) {
        self.state.lock().await.faults.send_delays.insert(content.to_string(), delay);
    }

    /// When disabled, sends succeed but never show up in history
    pub async fn set_publish_to_history(&self, publish: bool) {
        self.state.lock().await.publish_to_history = publish;
    }

    /// Peers in direct conversations answer every message with an echo
    pub async fn set_echo_replies(&self, echo: bool) {
        self.state.lock().await.echo_replies = echo;
    }

    /// Suspend all transport sends until [`release_sends`](Self::release_sends)
    pub fn hold_sends(&self) {
        self.send_gate.send_replace(false);
    }

    pub fn release_sends(&self) {
        self.send_gate.send_replace(true);
    }

    pub async fn send_calls(&self) -> usize {
        self.state.lock().await.send_calls
    }

    /// Append a message from another participant to a conversation's history
    pub async fn inject_message(&self, conversation: &Conversation, sender: &str, content: &str) -> ChatResult<ConfirmedMessage> {
        let mut state = self.state.lock().await;
        let record = state
            .conversations
            .get_mut(conversation.id())
            .ok_or_else(|| ChatError::Transport(format!("unknown conversation {}", conversation.id())))?;
        Ok(Self::record_message(record, sender, content))
    }

    /// End every open subscription stream for the conversation
    pub async fn close_subscriptions(&self, conversation: &Conversation) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.conversations.get_mut(conversation.id()) {
            info!("Closing history subscriptions for {:?}", conversation);
            record.subscribers = None;
        }
    }

    fn record_message(record: &mut ConversationRecord, sender: &str, content: &str) -> ConfirmedMessage {
        let message = ConfirmedMessage {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            sender_address: sender.to_string(),
            sent_at: Utc::now(),
        };
        record.history.push(message.clone());
        if let Some(tx) = &record.subscribers {
            // No receivers is fine, history still has it
            let _ = tx.send(message.clone());
        }
        message
    }

    fn create_conversation(state: &mut NetworkState, kind: ConversationKind, members: Vec<String>) -> Conversation {
        let prefix = match kind {
            ConversationKind::Direct => "dm",
            ConversationKind::Group => "group",
        };
        let handle = Conversation::new(format!("{}-{}", prefix, Uuid::new_v4()), kind, members);
        state.conversations.insert(
            handle.id().to_string(),
            ConversationRecord { handle: handle.clone(), history: Vec::new(), subscribers: None },
        );
        info!("Created conversation {:?} with {} members", handle, handle.members().len());
        handle
    }

    async fn wait_for_gate(&self) {
        let mut gate = self.send_gate.subscribe();
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl MessagingClient for InMemoryNetwork {
    async fn can_message(&self, identity: &str) -> ChatResult<bool> {
        let state = self.state.lock().await;
        Ok(state.reachable.contains(&identity.trim().to_ascii_lowercase()))
    }

    async fn open_direct(&self, routing_id: &str) -> ChatResult<Conversation> {
        let mut state = self.state.lock().await;
        if state.faults.fail_creation {
            return Err(ChatError::ConversationCreate(format!("network refused direct conversation with {}", routing_id)));
        }

        let me = self.account.as_str().to_ascii_lowercase();
        let peer = routing_id.to_ascii_lowercase();
        let key = if me <= peer { (me.clone(), peer.clone()) } else { (peer.clone(), me.clone()) };
        if let Some(existing) = state.direct_index.get(&key) {
            if let Some(record) = state.conversations.get(existing) {
                debug!("Reusing direct conversation {:?}", record.handle);
                return Ok(record.handle.clone());
            }
        }

        let handle = Self::create_conversation(&mut state, ConversationKind::Direct, vec![me, peer]);
        state.direct_index.insert(key, handle.id().to_string());
        Ok(handle)
    }

    async fn open_group(&self, routing_ids: &[String]) -> ChatResult<Conversation> {
        let mut state = self.state.lock().await;
        if state.faults.fail_creation {
            return Err(ChatError::ConversationCreate("network refused group creation".to_string()));
        }
        let mut members = vec![self.account.as_str().to_ascii_lowercase()];
        members.extend(routing_ids.iter().map(|id| id.to_ascii_lowercase()));
        Ok(Self::create_conversation(&mut state, ConversationKind::Group, members))
    }

    async fn send_on(&self, conversation: &Conversation, content: &str) -> ChatResult<()> {
        let delay = {
            let mut state = self.state.lock().await;
            state.send_calls += 1;
            state.faults.send_delays.get(content).copied()
        };

        self.wait_for_gate().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.faults.fail_all_sends {
            warn!("Rejecting send on {:?} (sends disabled)", conversation);
            return Err(ChatError::Transport("network rejected the message".to_string()));
        }
        if state.faults.fail_next_sends > 0 {
            state.faults.fail_next_sends -= 1;
            warn!("Rejecting send on {:?} ({} more failures queued)", conversation, state.faults.fail_next_sends);
            return Err(ChatError::Transport("network rejected the message".to_string()));
        }

        let publish = state.publish_to_history;
        let echo = state.echo_replies;
        let me = self.account.as_str().to_string();
        let record = state
            .conversations
            .get_mut(conversation.id())
            .ok_or_else(|| ChatError::Transport(format!("unknown conversation {}", conversation.id())))?;
        if publish {
            Self::record_message(record, &me, content);
        }
        if echo && record.handle.kind() == ConversationKind::Direct {
            let peer = record
                .handle
                .members()
                .iter()
                .find(|m| !m.eq_ignore_ascii_case(&me))
                .cloned();
            if let Some(peer) = peer {
                Self::record_message(record, &peer, &format!("echo: {}", content));
            }
        }
        Ok(())
    }

    async fn fetch_history(&self, conversation: &Conversation) -> ChatResult<Vec<ConfirmedMessage>> {
        let state = self.state.lock().await;
        if state.faults.fail_fetches {
            return Err(ChatError::Transport(format!("history fetch failed for {}", conversation.id())));
        }
        state
            .conversations
            .get(conversation.id())
            .map(|record| record.history.clone())
            .ok_or_else(|| ChatError::Transport(format!("unknown conversation {}", conversation.id())))
    }

    async fn subscribe(&self, conversation: &Conversation) -> ChatResult<HistoryStream> {
        let mut state = self.state.lock().await;
        let record = state
            .conversations
            .get_mut(conversation.id())
            .ok_or_else(|| ChatError::Transport(format!("unknown conversation {}", conversation.id())))?;
        let rx = record
            .subscribers
            .get_or_insert_with(|| broadcast::channel(SUBSCRIBER_CAPACITY).0)
            .subscribe();
        // Lagged receivers skip ahead; polling fills the gap
        Ok(BroadcastStream::new(rx).filter_map(|item| async move { item.ok() }).boxed())
    }
}
