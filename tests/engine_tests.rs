// Reconciliation engine integration tests
// Drive the engine end to end against the in-memory network

mod common;
use common::{setup_logging, fast_config, shows_once, wait_for_event, wait_for_view, with_content, Harness, PEER_B, PEER_C};

use anyhow::Result;
use log::info;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use walletchat::{
    ChatError, DisplayStatus, EngineConfig, EngineEvent, ErrorKind, MessagingClient, ReconciliationEngine,
};

/// Optimistic entry is visible straight away, then replaced by its confirmed copy
#[tokio::test]
async fn test_send_shows_optimistic_then_confirmed() -> Result<()> {
    setup_logging();
    let mut h = Harness::start(fast_config()).await?;

    h.network.hold_sends();
    let local_id = h.engine.send("hi").await?;

    let view = h.engine.view().await?;
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, local_id);
    assert_eq!(view[0].content, "hi");
    assert_eq!(view[0].status, DisplayStatus::Unpublished);

    h.network.release_sends();
    let view = wait_for_view(&h.engine, 3_000, |v| shows_once(v, "hi", DisplayStatus::Confirmed)).await?;
    assert_eq!(view.len(), 1);
    assert_ne!(view[0].id, local_id);

    let event = wait_for_event(&mut h.events, 3_000, |e| matches!(e, EngineEvent::Reconciled { .. })).await?;
    assert!(matches!(event, EngineEvent::Reconciled { local_id: ref id, .. } if *id == local_id));
    assert_eq!(h.engine.pending_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_send_can_be_cancelled() -> Result<()> {
    setup_logging();
    let mut h = Harness::start(fast_config()).await?;

    h.network.fail_next_sends(1).await;
    let local_id = h.engine.send("bye").await?;

    let view = wait_for_view(&h.engine, 3_000, |v| shows_once(v, "bye", DisplayStatus::Failed)).await?;
    assert_eq!(view[0].id, local_id);

    let event = wait_for_event(&mut h.events, 3_000, |e| matches!(e, EngineEvent::SendFailed { .. })).await?;
    info!("Got failure event: {:?}", event);

    h.engine.cancel(&local_id).await?;
    let view = h.engine.view().await?;
    assert!(with_content(&view, "bye").is_empty());
    assert_eq!(h.engine.pending_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_cancel_requires_failed_state() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    h.network.hold_sends();
    let local_id = h.engine.send("still going").await?;
    let err = h.engine.cancel(&local_id).await.unwrap_err();
    assert!(matches!(err, ChatError::InvalidState(ref id) if *id == local_id));
    assert_eq!(err.kind(), ErrorKind::State);

    let err = h.engine.cancel("no-such-id").await.unwrap_err();
    assert!(matches!(err, ChatError::InvalidState(_)));

    // Nothing was touched
    assert!(shows_once(&h.engine.view().await?, "still going", DisplayStatus::Unpublished));
    h.network.release_sends();
    Ok(())
}

/// Two sends in flight at once resolve independently, whatever order the
/// transport finishes them in
#[tokio::test]
async fn test_concurrent_sends_resolve_independently() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    h.network.set_send_delay("a", Duration::from_millis(300)).await;
    let first = h.engine.send("a").await?;
    let second = h.engine.send("b").await?;
    assert_ne!(first, second);

    let view = h.engine.view().await?;
    let pending_ids: HashSet<&str> = view.iter().filter(|m| m.is_pending()).map(|m| m.id.as_str()).collect();
    assert!(pending_ids.contains(first.as_str()));
    assert!(pending_ids.contains(second.as_str()));

    // "b" overtakes "a"
    wait_for_view(&h.engine, 3_000, |v| {
        shows_once(v, "b", DisplayStatus::Confirmed) && shows_once(v, "a", DisplayStatus::Unpublished)
    })
    .await?;

    let view = wait_for_view(&h.engine, 3_000, |v| {
        shows_once(v, "a", DisplayStatus::Confirmed) && shows_once(v, "b", DisplayStatus::Confirmed)
    })
    .await?;
    assert_eq!(view.len(), 2);
    assert_eq!(h.engine.pending_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_repeated_submission_is_rejected_while_in_flight() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    h.network.hold_sends();
    let local_id = h.engine.send("once").await?;
    let err = h.engine.send("once").await.unwrap_err();
    assert!(matches!(err, ChatError::DuplicateSend(ref id) if *id == local_id));
    assert_eq!(err.kind(), ErrorKind::Validation);
    h.network.release_sends();

    wait_for_view(&h.engine, 3_000, |v| shows_once(v, "once", DisplayStatus::Confirmed)).await?;
    assert_eq!(h.network.send_calls().await, 1);

    // Same text again is a new message once the first has gone out
    h.engine.send("once").await?;
    wait_for_view(&h.engine, 3_000, |v| {
        let copies = with_content(v, "once");
        copies.len() == 2 && copies.iter().all(|m| m.status == DisplayStatus::Confirmed)
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_blank_content_and_missing_conversation() -> Result<()> {
    setup_logging();
    let network = common::network().await;
    let client: Arc<dyn MessagingClient> = Arc::new(network.clone());
    let (engine, _events) = ReconciliationEngine::spawn(common::account(), client, fast_config());

    assert!(matches!(engine.send("   ").await, Err(ChatError::EmptyContent)));
    assert!(matches!(engine.send("hello").await, Err(ChatError::NoConversation)));
    assert!(matches!(engine.refresh().await, Err(ChatError::NoConversation)));
    assert!(engine.view().await?.is_empty());
    assert_eq!(network.send_calls().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_delivery_is_shown_once() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    let message = h.network.inject_message(&h.conversation, PEER_B, "from bob").await?;
    wait_for_view(&h.engine, 3_000, |v| shows_once(v, "from bob", DisplayStatus::Confirmed)).await?;

    // Push stream, polling and manual refreshes all deliver the same record
    for _ in 0..3 {
        h.engine.refresh().await?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let view = h.engine.view().await?;
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, message.id);
    assert_eq!(view[0].sender_address, PEER_B);
    Ok(())
}

#[tokio::test]
async fn test_failure_is_never_silently_dropped() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    h.network.fail_sends(true).await;
    let local_id = h.engine.send("doomed").await?;
    wait_for_view(&h.engine, 3_000, |v| shows_once(v, "doomed", DisplayStatus::Failed)).await?;

    // Several sync rounds later it is still there
    tokio::time::sleep(Duration::from_millis(300)).await;
    let view = h.engine.view().await?;
    assert!(shows_once(&view, "doomed", DisplayStatus::Failed));
    assert_eq!(view[0].id, local_id);
    Ok(())
}

/// A resend of the same text must not absorb the earlier failed copy
#[tokio::test]
async fn test_failed_copy_survives_successful_resend() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    h.network.fail_next_sends(1).await;
    let failed_id = h.engine.send("ok").await?;
    wait_for_view(&h.engine, 3_000, |v| shows_once(v, "ok", DisplayStatus::Failed)).await?;

    let resent_id = h.engine.send("ok").await?;
    assert_ne!(failed_id, resent_id);

    let view = wait_for_view(&h.engine, 3_000, |v| {
        let copies = with_content(v, "ok");
        copies.len() == 2
            && copies.iter().any(|m| m.status == DisplayStatus::Confirmed)
            && copies.iter().any(|m| m.status == DisplayStatus::Failed)
    })
    .await?;
    let failed: Vec<_> = view.iter().filter(|m| m.status == DisplayStatus::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, failed_id);

    // Several sync rounds later nothing has changed
    tokio::time::sleep(Duration::from_millis(300)).await;
    let later = h.engine.view().await?;
    assert_eq!(with_content(&later, "ok").len(), 2);
    assert!(later.iter().any(|m| m.id == failed_id && m.status == DisplayStatus::Failed));
    assert!(!later.iter().any(|m| m.id == resent_id));
    assert_eq!(h.engine.pending_count().await?, 1);

    h.engine.cancel(&failed_id).await?;
    assert!(shows_once(&h.engine.view().await?, "ok", DisplayStatus::Confirmed));
    Ok(())
}

#[tokio::test]
async fn test_retry_reuses_local_id() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    h.network.fail_sends(true).await;
    let local_id = h.engine.send("again").await?;
    wait_for_view(&h.engine, 3_000, |v| shows_once(v, "again", DisplayStatus::Failed)).await?;

    h.engine.retry(&local_id).await?;
    let view = wait_for_view(&h.engine, 3_000, |v| shows_once(v, "again", DisplayStatus::Failed)).await?;
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].id, local_id);
    assert_eq!(h.engine.pending_count().await?, 1);

    h.network.fail_sends(false).await;
    h.engine.retry(&local_id).await?;
    wait_for_view(&h.engine, 3_000, |v| shows_once(v, "again", DisplayStatus::Confirmed)).await?;
    assert_eq!(h.network.send_calls().await, 3);
    assert_eq!(h.engine.pending_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_retry_requires_failed_entry() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    let err = h.engine.retry("missing").await.unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));

    h.network.hold_sends();
    let local_id = h.engine.send("in flight").await?;
    assert!(matches!(h.engine.retry(&local_id).await, Err(ChatError::NotFound(_))));
    h.network.release_sends();
    Ok(())
}

/// A published message that never reaches history is dropped after the grace window
#[tokio::test(start_paused = true)]
async fn test_grace_window_drops_unconfirmed_message() -> Result<()> {
    setup_logging();
    let config = EngineConfig { grace_window: Duration::from_secs(30), ..EngineConfig::default() };
    let mut h = Harness::start(config).await?;

    h.network.set_publish_to_history(false).await;
    let local_id = h.engine.send("ghost").await?;
    wait_for_view(&h.engine, 1_000, |v| shows_once(v, "ghost", DisplayStatus::Published)).await?;

    // Still waiting well inside the window
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(shows_once(&h.engine.view().await?, "ghost", DisplayStatus::Published));

    let event = wait_for_event(&mut h.events, 20_000, |e| matches!(e, EngineEvent::GraceExpired { .. })).await?;
    assert_eq!(event, EngineEvent::GraceExpired { local_id });
    assert!(h.engine.view().await?.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_message_is_not_removed_by_grace_expiry() -> Result<()> {
    setup_logging();
    let config = EngineConfig { grace_window: Duration::from_secs(30), ..EngineConfig::default() };
    let h = Harness::start(config).await?;

    h.engine.send("kept").await?;
    wait_for_view(&h.engine, 10_000, |v| shows_once(v, "kept", DisplayStatus::Confirmed)).await?;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(shows_once(&h.engine.view().await?, "kept", DisplayStatus::Confirmed));
    Ok(())
}

/// Results from the previous conversation never leak into the new one
#[tokio::test]
async fn test_switching_conversation_discards_stale_results() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    h.network.hold_sends();
    h.engine.send("for bob").await?;

    let second = h.network.open_direct(PEER_C).await?;
    h.engine.attach_conversation(second.clone()).await?;
    assert!(h.engine.view().await?.is_empty());

    h.network.release_sends();
    h.network.inject_message(&h.conversation, PEER_B, "late reply").await?;
    h.network.inject_message(&second, PEER_C, "hi from carol").await?;

    let view = wait_for_view(&h.engine, 3_000, |v| shows_once(v, "hi from carol", DisplayStatus::Confirmed)).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let view_after = h.engine.view().await?;
    assert_eq!(view, view_after);
    assert!(with_content(&view_after, "for bob").is_empty());
    assert!(with_content(&view_after, "late reply").is_empty());
    assert_eq!(h.engine.pending_count().await?, 0);

    // The old send still completed on its own conversation
    let old_history = h.network.fetch_history(&h.conversation).await?;
    assert!(old_history.iter().any(|m| m.content == "for bob"));
    Ok(())
}

#[tokio::test]
async fn test_detach_clears_state() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    h.network.inject_message(&h.conversation, PEER_B, "hello").await?;
    wait_for_view(&h.engine, 3_000, |v| v.len() == 1).await?;

    h.engine.detach_conversation().await?;
    assert!(h.engine.view().await?.is_empty());
    assert!(matches!(h.engine.send("anyone?").await, Err(ChatError::NoConversation)));
    Ok(())
}

#[tokio::test]
async fn test_sync_failure_keeps_last_known_history() -> Result<()> {
    setup_logging();
    let mut h = Harness::start(fast_config()).await?;

    h.network.inject_message(&h.conversation, PEER_B, "cached").await?;
    wait_for_view(&h.engine, 3_000, |v| shows_once(v, "cached", DisplayStatus::Confirmed)).await?;

    h.network.fail_fetches(true).await;
    h.engine.refresh().await?;
    wait_for_event(&mut h.events, 3_000, |e| matches!(e, EngineEvent::SyncFailed { .. })).await?;
    assert!(shows_once(&h.engine.view().await?, "cached", DisplayStatus::Confirmed));

    // The push stream keeps working while fetches fail
    h.engine.send("meanwhile").await?;
    wait_for_view(&h.engine, 3_000, |v| shows_once(v, "meanwhile", DisplayStatus::Confirmed)).await?;
    assert!(shows_once(&h.engine.view().await?, "cached", DisplayStatus::Confirmed));
    Ok(())
}

#[tokio::test]
async fn test_pushed_messages_arrive_without_polling() -> Result<()> {
    setup_logging();
    let config = EngineConfig { poll_interval: Duration::from_secs(3_600), ..fast_config() };
    let h = Harness::start(config).await?;

    // Let the initial load finish so the subscription is in place
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.network.inject_message(&h.conversation, PEER_B, "pushed").await?;
    wait_for_view(&h.engine, 3_000, |v| shows_once(v, "pushed", DisplayStatus::Confirmed)).await?;
    Ok(())
}

#[tokio::test]
async fn test_closed_stream_falls_back_to_polling() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    h.network.close_subscriptions(&h.conversation).await;
    h.network.inject_message(&h.conversation, PEER_B, "polled").await?;
    wait_for_view(&h.engine, 3_000, |v| shows_once(v, "polled", DisplayStatus::Confirmed)).await?;

    h.engine.send("still synced").await?;
    wait_for_view(&h.engine, 3_000, |v| shows_once(v, "still synced", DisplayStatus::Confirmed)).await?;
    Ok(())
}

#[tokio::test]
async fn test_view_is_ordered_by_timestamp() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    h.network.inject_message(&h.conversation, PEER_B, "one").await?;
    h.engine.send("two").await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.network.inject_message(&h.conversation, PEER_B, "three").await?;
    h.network.hold_sends();
    h.engine.send("four").await?;

    let view = wait_for_view(&h.engine, 3_000, |v| v.len() == 4 && with_content(v, "three").len() == 1).await?;
    for pair in view.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp, "{:?} listed before {:?}", pair[0], pair[1]);
    }
    assert_eq!(view.last().map(|m| m.content.as_str()), Some("four"));
    h.network.release_sends();
    Ok(())
}

#[tokio::test]
async fn test_echo_reply_is_merged_with_own_message() -> Result<()> {
    setup_logging();
    let network = common::network().await;
    network.set_echo_replies(true).await;
    let h = Harness::start_on(network, fast_config()).await?;

    h.engine.send("ping").await?;
    let view = wait_for_view(&h.engine, 3_000, |v| {
        shows_once(v, "ping", DisplayStatus::Confirmed) && shows_once(v, "echo: ping", DisplayStatus::Confirmed)
    })
    .await?;
    assert_eq!(view.len(), 2);
    let echo = with_content(&view, "echo: ping");
    assert_eq!(echo[0].sender_address, PEER_B.to_ascii_lowercase());
    Ok(())
}

#[tokio::test]
async fn test_shutdown_stops_engine() -> Result<()> {
    setup_logging();
    let h = Harness::start(fast_config()).await?;

    h.engine.shutdown().await?;
    assert!(matches!(h.engine.send("too late").await, Err(ChatError::EngineStopped)));
    assert!(matches!(h.engine.view().await, Err(ChatError::EngineStopped)));
    Ok(())
}
