// Common test utilities for integration tests
// Shared fixtures for driving the engine against the in-memory network
#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, LevelFilter};
use tokio::sync::mpsc;
use tokio::time::timeout;

use walletchat::{
    AccountIdentifier, Contact, Conversation, DisplayMessage, DisplayStatus, EngineConfig, EngineEvent,
    InMemoryNetwork, MessagingClient, ReconciliationEngine,
};

pub const ME: &str = "0x00000000000000000000000000000000000000aa";
pub const PEER_B: &str = "0x00000000000000000000000000000000000000bb";
pub const PEER_C: &str = "0x00000000000000000000000000000000000000cc";
pub const UNREACHABLE: &str = "0x1111111111111111111111111111111111111111";

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub fn account() -> AccountIdentifier {
    AccountIdentifier::new(ME)
}

pub fn contact(identity: &str) -> Contact {
    Contact {
        identity: identity.to_string(),
        routing_id: identity.to_ascii_lowercase(),
    }
}

/// Short intervals so real-time tests settle quickly
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        grace_window: Duration::from_secs(5),
        poll_interval: Duration::from_millis(50),
        event_buffer: 1024,
    }
}

/// A network with the usual peers registered
pub async fn network() -> InMemoryNetwork {
    let network = InMemoryNetwork::new(account());
    network.register(PEER_B).await;
    network.register(PEER_C).await;
    network
}

/// Engine attached to a direct conversation with PEER_B
pub struct Harness {
    pub network: InMemoryNetwork,
    pub engine: ReconciliationEngine,
    pub events: mpsc::Receiver<EngineEvent>,
    pub conversation: Conversation,
}

impl Harness {
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let network = network().await;
        Self::start_on(network, config).await
    }

    pub async fn start_on(network: InMemoryNetwork, config: EngineConfig) -> Result<Self> {
        let client: Arc<dyn MessagingClient> = Arc::new(network.clone());
        let conversation = client.open_direct(PEER_B).await?;
        let (engine, events) = ReconciliationEngine::spawn(account(), client, config);
        engine.attach_conversation(conversation.clone()).await?;
        Ok(Harness { network, engine, events, conversation })
    }
}

/// Poll `view()` until `predicate` holds, failing after `timeout_ms`
pub async fn wait_for_view<F>(engine: &ReconciliationEngine, timeout_ms: u64, predicate: F) -> Result<Vec<DisplayMessage>>
where
    F: Fn(&[DisplayMessage]) -> bool,
{
    let mut last = Vec::new();
    let outcome = timeout(Duration::from_millis(timeout_ms), async {
        loop {
            let view = match engine.view().await {
                Ok(view) => view,
                Err(e) => return Err(anyhow::Error::from(e)),
            };
            if predicate(&view) {
                return Ok(view);
            }
            last = view;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    match outcome {
        Ok(view) => view,
        Err(_) => Err(anyhow!("view never reached the expected state, last view: {:?}", last)),
    }
}

/// Drain events until one matches `predicate`
pub async fn wait_for_event<F>(events: &mut mpsc::Receiver<EngineEvent>, timeout_ms: u64, predicate: F) -> Result<EngineEvent>
where
    F: Fn(&EngineEvent) -> bool,
{
    timeout(Duration::from_millis(timeout_ms), async {
        while let Some(event) = events.recv().await {
            if predicate(&event) {
                return Ok(event);
            }
            debug!("Skipping event {:?}", event);
        }
        Err(anyhow!("event channel closed"))
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for event"))?
}

pub fn with_content<'a>(view: &'a [DisplayMessage], content: &str) -> Vec<&'a DisplayMessage> {
    view.iter().filter(|m| m.content == content).collect()
}

/// Exactly one entry with this content, in the given status
pub fn shows_once(view: &[DisplayMessage], content: &str, status: DisplayStatus) -> bool {
    let matching = with_content(view, content);
    matching.len() == 1 && matching[0].status == status
}
