// Conversation selector
// Turns contacts into an active conversation handle and hands it to the engine.

use log::{error, info};
use std::sync::Arc;

use crate::engine::ReconciliationEngine;
use crate::error::{ChatError, ChatResult};
use crate::models::Contact;
use crate::network::{Conversation, MessagingClient};

pub const DEFAULT_MIN_GROUP_SIZE: usize = 2;

pub struct ConversationSelector {
    client: Arc<dyn MessagingClient>,
    min_group_size: usize,
    active: Option<Conversation>,
}

impl ConversationSelector {
    pub fn new(client: Arc<dyn MessagingClient>) -> Self {
        Self::with_min_group_size(client, DEFAULT_MIN_GROUP_SIZE)
    }

    pub fn with_min_group_size(client: Arc<dyn MessagingClient>, min_group_size: usize) -> Self {
        ConversationSelector {
            client,
            min_group_size,
            active: None,
        }
    }

    /// Open (or reuse) the direct conversation with `contact`. Not retried on failure.
    pub async fn open_direct(&self, contact: &Contact) -> ChatResult<Conversation> {
        info!("Opening direct conversation with {}", contact.identity);
        self.client.open_direct(&contact.routing_id).await.map_err(|e| {
            error!("Failed to open direct conversation with {}: {}", contact.identity, e);
            as_create_error(e)
        })
    }

    /// Create a group conversation with `contacts`.
    ///
    /// Contacts sharing an identity (ignoring case) count once towards the
    /// minimum size.
    pub async fn open_group(&self, contacts: &[Contact]) -> ChatResult<Conversation> {
        let mut routing_ids: Vec<String> = Vec::with_capacity(contacts.len());
        let mut seen: Vec<String> = Vec::with_capacity(contacts.len());
        for contact in contacts {
            let key = contact.identity.to_ascii_lowercase();
            if !seen.contains(&key) {
                seen.push(key);
                routing_ids.push(contact.routing_id.clone());
            }
        }

        if routing_ids.len() < self.min_group_size {
            return Err(ChatError::InsufficientMembers {
                required: self.min_group_size,
                given: routing_ids.len(),
            });
        }

        info!("Creating group conversation with {} members", routing_ids.len());
        self.client.open_group(&routing_ids).await.map_err(|e| {
            error!("Failed to create group conversation: {}", e);
            as_create_error(e)
        })
    }

    /// Open a direct conversation and make it the engine's active one
    pub async fn select_direct(&mut self, contact: &Contact, engine: &ReconciliationEngine) -> ChatResult<Conversation> {
        let conversation = self.open_direct(contact).await?;
        self.activate(conversation, engine).await
    }

    pub async fn select_group(&mut self, contacts: &[Contact], engine: &ReconciliationEngine) -> ChatResult<Conversation> {
        let conversation = self.open_group(contacts).await?;
        self.activate(conversation, engine).await
    }

    async fn activate(&mut self, conversation: Conversation, engine: &ReconciliationEngine) -> ChatResult<Conversation> {
        engine.attach_conversation(conversation.clone()).await?;
        self.active = Some(conversation.clone());
        Ok(conversation)
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.active.as_ref()
    }

    pub fn min_group_size(&self) -> usize {
        self.min_group_size
    }
}

fn as_create_error(err: ChatError) -> ChatError {
    match err {
        ChatError::ConversationCreate(_) => err,
        other => ChatError::ConversationCreate(other.to_string()),
    }
}
