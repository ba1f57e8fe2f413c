// Contact directory
// Ordered, deduplicated list of peers the user can open conversations with.
// Every contact is validated and probed for reachability before it is added.

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use crate::error::{ChatError, ChatResult};
use crate::models::{AccountIdentifier, Contact};
use crate::network::MessagingClient;

static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("address pattern is valid"));

/// True for a 0x-prefixed, 20 byte hex chain address
pub fn is_valid_address(value: &str) -> bool {
    ADDRESS_RE.is_match(value.trim())
}

/// Maps a contact identity to the id the network routes conversations by
pub trait RoutingResolver: Send + Sync {
    fn routing_id(&self, identity: &str) -> String;
}

/// Routes by the lowercased address itself
pub struct AddressRouting;

impl RoutingResolver for AddressRouting {
    fn routing_id(&self, identity: &str) -> String {
        identity.trim().to_ascii_lowercase()
    }
}

pub struct ContactDirectory {
    owner: AccountIdentifier,
    client: Arc<dyn MessagingClient>,
    routing: Box<dyn RoutingResolver>,
    contacts: Vec<Contact>,
}

impl ContactDirectory {
    pub fn new(owner: AccountIdentifier, client: Arc<dyn MessagingClient>) -> Self {
        Self::with_routing(owner, client, Box::new(AddressRouting))
    }

    pub fn with_routing(owner: AccountIdentifier, client: Arc<dyn MessagingClient>, routing: Box<dyn RoutingResolver>) -> Self {
        ContactDirectory {
            owner,
            client,
            routing,
            contacts: Vec::new(),
        }
    }

    /// Validate, probe and append a contact.
    ///
    /// The directory is left untouched on every error path.
    pub async fn add_contact(&mut self, raw_address: &str) -> ChatResult<Contact> {
        let identity = raw_address.trim();
        if !is_valid_address(identity) {
            warn!("Rejecting malformed address '{}'", raw_address);
            return Err(ChatError::InvalidAddress(raw_address.to_string()));
        }
        if self.owner.matches(identity) {
            return Err(ChatError::InvalidAddress(format!("{} is your own account", identity)));
        }
        if self.find(identity).is_some() {
            return Err(ChatError::DuplicateContact(identity.to_string()));
        }

        let routing_id = self.routing.routing_id(identity);
        if routing_id.is_empty() {
            return Err(ChatError::InvalidAddress(format!("no routing id for {}", identity)));
        }

        debug!("Checking reachability of {}", identity);
        let reachable = self.client.can_message(identity).await?;
        if !reachable {
            info!("{} is not reachable on the messaging network", identity);
            return Err(ChatError::Unreachable(identity.to_string()));
        }

        // The probe is a suspension point; re-check in case of a concurrent add
        if self.find(identity).is_some() {
            return Err(ChatError::DuplicateContact(identity.to_string()));
        }

        let contact = Contact {
            identity: identity.to_string(),
            routing_id,
        };
        self.contacts.push(contact.clone());
        info!("Added contact {} ({} total)", contact.identity, self.contacts.len());
        Ok(contact)
    }

    pub fn list_contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn find(&self, identity: &str) -> Option<&Contact> {
        let identity = identity.trim();
        self.contacts.iter().find(|c| c.identity.eq_ignore_ascii_case(identity))
    }

    pub fn remove_contact(&mut self, identity: &str) -> Option<Contact> {
        let identity = identity.trim();
        let index = self.contacts.iter().position(|c| c.identity.eq_ignore_ascii_case(identity))?;
        let removed = self.contacts.remove(index);
        info!("Removed contact {}", removed.identity);
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
