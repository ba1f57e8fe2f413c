// Messaging network boundary for walletchat
// The engine, directory and selector only talk to the network through
// the MessagingClient trait, so any transport can be plugged in.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

use crate::error::ChatResult;
use crate::models::ConfirmedMessage;

pub mod memory;

pub use memory::InMemoryNetwork;

/// Push stream of confirmed messages for one conversation.
/// Lazy, unbounded and not restartable: once it ends, subscribe again.
pub type HistoryStream = BoxStream<'static, ConfirmedMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKind {
    Direct,
    Group,
}

/// Handle to a channel owned by the messaging client
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Conversation {
    id: String,
    kind: ConversationKind,
    members: Vec<String>,
}

impl Conversation {
    /// Called by MessagingClient implementations when they open or create a channel
    pub fn new(id: impl Into<String>, kind: ConversationKind, members: Vec<String>) -> Self {
        Conversation { id: id.into(), kind, members }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ConversationKind {
        self.kind
    }

    /// Routing ids of every participant, including the local account
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }
}

impl fmt::Debug for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.id)
    }
}

#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Whether `identity` has a messaging identity that can receive messages
    async fn can_message(&self, identity: &str) -> ChatResult<bool>;

    async fn open_direct(&self, routing_id: &str) -> ChatResult<Conversation>;

    async fn open_group(&self, routing_ids: &[String]) -> ChatResult<Conversation>;

    async fn send_on(&self, conversation: &Conversation, content: &str) -> ChatResult<()>;

    /// Full authoritative history, oldest first
    async fn fetch_history(&self, conversation: &Conversation) -> ChatResult<Vec<ConfirmedMessage>>;

    async fn subscribe(&self, conversation: &Conversation) -> ChatResult<HistoryStream>;
}
