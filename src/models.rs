use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account of the authenticated user on the messaging network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountIdentifier(String);

impl AccountIdentifier {
    pub fn new(id: impl Into<String>) -> Self {
        AccountIdentifier(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Addresses are compared without regard to hex case
    pub fn matches(&self, address: &str) -> bool {
        self.0.eq_ignore_ascii_case(address.trim())
    }
}

impl fmt::Display for AccountIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub identity: String,
    pub routing_id: String,
}

/// A message as recorded by the network's authoritative history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedMessage {
    pub id: String,
    pub content: String,
    pub sender_address: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum PendingStatus {
    Unpublished, // Transport call in flight
    Published,   // Accepted by the network, waiting for history
    Failed,      // Transport rejected it, kept for retry/cancel
}

/// Locally generated id of an optimistic send. Never reused within a session.
pub type LocalId = String;

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub local_id: LocalId,
    pub content: String,
    pub sender_address: AccountIdentifier,
    pub status: PendingStatus,
    pub created_at: DateTime<Utc>,
    // Bumped on every transport attempt so stale results can be told apart
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl PendingMessage {
    pub fn new(content: &str, sender: &AccountIdentifier) -> Self {
        PendingMessage {
            local_id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            sender_address: sender.clone(),
            status: PendingStatus::Unpublished,
            created_at: Utc::now(),
            attempt: 1,
            last_error: None,
        }
    }

    /// True when `confirmed` is the history record of this optimistic send.
    pub fn is_confirmed_by(&self, confirmed: &ConfirmedMessage) -> bool {
        confirmed.content == self.content
            && self.sender_address.matches(&confirmed.sender_address)
            && confirmed.sent_at >= self.created_at
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum DisplayStatus {
    Confirmed,
    Unpublished,
    Published,
    Failed,
}

impl From<PendingStatus> for DisplayStatus {
    fn from(status: PendingStatus) -> Self {
        match status {
            PendingStatus::Unpublished => DisplayStatus::Unpublished,
            PendingStatus::Published => DisplayStatus::Published,
            PendingStatus::Failed => DisplayStatus::Failed,
        }
    }
}

/// Merged projection rendered by the presentation layer.
///
/// `id` is the network id for confirmed entries and the local id for
/// pending ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub id: String,
    pub content: String,
    pub sender_address: String,
    pub timestamp: DateTime<Utc>,
    pub status: DisplayStatus,
}

impl DisplayMessage {
    pub fn is_pending(&self) -> bool {
        self.status != DisplayStatus::Confirmed
    }
}

impl From<&ConfirmedMessage> for DisplayMessage {
    fn from(msg: &ConfirmedMessage) -> Self {
        DisplayMessage {
            id: msg.id.clone(),
            content: msg.content.clone(),
            sender_address: msg.sender_address.clone(),
            timestamp: msg.sent_at,
            status: DisplayStatus::Confirmed,
        }
    }
}

impl From<&PendingMessage> for DisplayMessage {
    fn from(msg: &PendingMessage) -> Self {
        DisplayMessage {
            id: msg.local_id.clone(),
            content: msg.content.clone(),
            sender_address: msg.sender_address.to_string(),
            timestamp: msg.created_at,
            status: msg.status.into(),
        }
    }
}
