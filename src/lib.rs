// Re-export modules for the binary and the integration tests
pub mod config;
pub mod contacts;
pub mod conversations;
pub mod engine;
pub mod error;
pub mod identity;
pub mod models;
pub mod network;

// Re-export main types for convenience
pub use contacts::ContactDirectory;
pub use conversations::ConversationSelector;
pub use engine::{EngineConfig, EngineEvent, ReconciliationEngine};
pub use error::{ChatError, ChatResult, ErrorKind};
pub use identity::{IdentityProvider, IdentitySession};
pub use models::*;
pub use network::{Conversation, ConversationKind, InMemoryNetwork, MessagingClient};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_account_matching_ignores_case() {
        let account = AccountIdentifier::new("0xAbC0000000000000000000000000000000000001");
        assert!(account.matches("0xabc0000000000000000000000000000000000001"));
        assert!(account.matches(" 0xABC0000000000000000000000000000000000001 "));
        assert!(!account.matches("0xabc0000000000000000000000000000000000002"));
        assert_eq!(account.to_string(), "0xAbC0000000000000000000000000000000000001");
    }

    #[test]
    fn test_pending_message_defaults() {
        let account = AccountIdentifier::new("0xaa");
        let first = PendingMessage::new("hello", &account);
        let second = PendingMessage::new("hello", &account);

        assert_eq!(first.status, PendingStatus::Unpublished);
        assert_eq!(first.attempt, 1);
        assert!(first.last_error.is_none());
        assert_ne!(first.local_id, second.local_id);
    }

    #[test]
    fn test_confirmation_match_rules() {
        let account = AccountIdentifier::new("0xAA");
        let pending = PendingMessage::new("hi", &account);
        let mut confirmed = ConfirmedMessage {
            id: "m1".to_string(),
            content: "hi".to_string(),
            sender_address: "0xaa".to_string(),
            sent_at: pending.created_at,
        };
        assert!(pending.is_confirmed_by(&confirmed));

        confirmed.sent_at = pending.created_at - Duration::milliseconds(1);
        assert!(!pending.is_confirmed_by(&confirmed));

        confirmed.sent_at = Utc::now() + Duration::seconds(1);
        confirmed.content = "hi!".to_string();
        assert!(!pending.is_confirmed_by(&confirmed));
    }

    #[test]
    fn test_display_projection() {
        let account = AccountIdentifier::new("0xaa");
        let mut pending = PendingMessage::new("bye", &account);
        pending.status = PendingStatus::Failed;

        let shown = DisplayMessage::from(&pending);
        assert_eq!(shown.id, pending.local_id);
        assert_eq!(shown.status, DisplayStatus::Failed);
        assert_eq!(shown.timestamp, pending.created_at);
        assert!(shown.is_pending());

        let confirmed = ConfirmedMessage {
            id: "m9".to_string(),
            content: "bye".to_string(),
            sender_address: "0xaa".to_string(),
            sent_at: Utc::now(),
        };
        let shown = DisplayMessage::from(&confirmed);
        assert_eq!(shown.status, DisplayStatus::Confirmed);
        assert!(!shown.is_pending());
    }
}
