// Error types shared by the directory, selector and engine

use thiserror::Error;

use crate::identity::IdentityError;
use crate::models::LocalId;

/// Coarse classification used by callers to decide how to surface a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Reachability,
    Transport,
    State,
    Identity,
    Internal,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Duplicate contact: {0}")]
    DuplicateContact(String),

    #[error("Unreachable: {0} cannot receive messages")]
    Unreachable(String),

    #[error("Message content is empty")]
    EmptyContent,

    /// Same content submitted again while the first attempt is still in flight
    #[error("A send with this content is already in progress ({0})")]
    DuplicateSend(LocalId),

    #[error("Group needs at least {required} members, got {given}")]
    InsufficientMembers { required: usize, given: usize },

    #[error("Failed to create conversation: {0}")]
    ConversationCreate(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No failed message with id {0}")]
    NotFound(LocalId),

    #[error("Message {0} is not in a failed state")]
    InvalidState(LocalId),

    #[error("No active conversation")]
    NoConversation,

    #[error("Reconciliation engine has stopped")]
    EngineStopped,

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::InvalidAddress(_)
            | ChatError::DuplicateContact(_)
            | ChatError::EmptyContent
            | ChatError::DuplicateSend(_)
            | ChatError::InsufficientMembers { .. } => ErrorKind::Validation,
            ChatError::Unreachable(_) => ErrorKind::Reachability,
            ChatError::ConversationCreate(_) | ChatError::Transport(_) => ErrorKind::Transport,
            ChatError::NotFound(_) | ChatError::InvalidState(_) | ChatError::NoConversation => {
                ErrorKind::State
            }
            ChatError::Identity(_) => ErrorKind::Identity,
            ChatError::EngineStopped => ErrorKind::Internal,
        }
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
