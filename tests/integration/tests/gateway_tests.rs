//! Gateway session tests against a mock gateway
//!
//! Run with: cargo test -p integration-tests --test gateway_tests

use std::time::Duration;

use chat_common::ReconnectConfig;
use chat_core::Snowflake;
use chat_gateway::protocol::{OpCode, VoiceStateUpdatePayload};
use chat_gateway::{DispatchEvent, EventKind, GatewayError, Shard, ShardState};
use integration_tests::{
    eventually, fast_reconnect, identify_queue, shard_config, AfterReady, GatewayBehavior,
    MockGateway,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WITHIN: Duration = Duration::from_secs(5);

fn command_log(gateway: &MockGateway) -> Vec<(usize, OpCode)> {
    gateway
        .commands()
        .iter()
        .map(|frame| (frame.connection, frame.op))
        .collect()
}

/// Receive until `count` events of `kind` arrived, returning all events seen
async fn collect_until(
    events: &mut mpsc::Receiver<DispatchEvent>,
    kind: EventKind,
    count: usize,
) -> Vec<DispatchEvent> {
    let mut seen = Vec::new();
    timeout(WITHIN, async {
        while let Some(event) = events.recv().await {
            let matched = event.kind == Some(kind);
            seen.push(event);
            if matched && seen.iter().filter(|e| e.kind == Some(kind)).count() >= count {
                break;
            }
        }
    })
    .await
    .expect("events did not arrive in time");
    seen
}

// ============================================================================
// Session lifecycle
// ============================================================================

#[tokio::test]
async fn test_identify_then_ready_connects() {
    let gateway = MockGateway::start(GatewayBehavior::default()).await.unwrap();
    let (events_tx, mut events) = mpsc::channel(16);
    let shard = Shard::spawn(shard_config(&gateway.url()), identify_queue(), events_tx, None);

    let seen = collect_until(&mut events, EventKind::Ready, 1).await;
    assert_eq!(seen[0].shard_id, 0);
    assert_eq!(seen[0].sequence, 1);

    let handle = shard.handle().clone();
    assert_eq!(handle.state(), ShardState::Connected);
    assert_eq!(handle.info().session_id.as_deref(), Some("session-0"));

    let identify = &gateway.frames(OpCode::Identify)[0];
    assert_eq!(identify.d["token"], "test-token");
    assert_eq!(identify.d["shard"], serde_json::json!([0, 1]));

    handle.shutdown().await.unwrap();
    timeout(WITHIN, shard.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_resume_falls_back_to_identify() {
    let gateway = MockGateway::start(GatewayBehavior {
        reject_resume: true,
        after_first_ready: Some(AfterReady::Close(4000)),
        ..GatewayBehavior::default()
    })
    .await
    .unwrap();
    let (events_tx, mut events) = mpsc::channel(16);
    let shard = Shard::spawn(shard_config(&gateway.url()), identify_queue(), events_tx, None);

    // Ready on the first connection, then again after the rejected resume
    let seen = collect_until(&mut events, EventKind::Ready, 2).await;
    assert!(seen.iter().all(|event| event.kind != Some(EventKind::Resumed)));

    let commands: Vec<(usize, OpCode)> = gateway
        .commands()
        .iter()
        .map(|frame| (frame.connection, frame.op))
        .collect();
    assert_eq!(
        commands,
        vec![(0, OpCode::Identify), (1, OpCode::Resume), (2, OpCode::Identify)]
    );

    let resume = &gateway.frames(OpCode::Resume)[0];
    assert_eq!(resume.d["session_id"], "session-0");
    assert_eq!(resume.d["seq"], 1);

    let handle = shard.handle().clone();
    assert_eq!(handle.state(), ShardState::Connected);
    assert_eq!(handle.info().session_id.as_deref(), Some("session-1"));

    handle.shutdown().await.unwrap();
    timeout(WITHIN, shard.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_missed_heartbeat_ack_reconnects_once() {
    let gateway = MockGateway::start(GatewayBehavior {
        heartbeat_interval_ms: 50,
        silent_connections: vec![0],
        ..GatewayBehavior::default()
    })
    .await
    .unwrap();
    let (events_tx, mut events) = mpsc::channel(16);
    let shard = Shard::spawn(shard_config(&gateway.url()), identify_queue(), events_tx, None);

    let seen = collect_until(&mut events, EventKind::Resumed, 1).await;
    assert_eq!(
        seen.iter().filter(|e| e.kind == Some(EventKind::Ready)).count(),
        1
    );

    // Heartbeats on the second connection are acknowledged, so it stays up
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(gateway.connection_count(), 2);
    assert!(gateway
        .frames(OpCode::Heartbeat)
        .iter()
        .any(|frame| frame.connection == 0));
    assert!(gateway
        .frames(OpCode::Heartbeat)
        .iter()
        .filter(|frame| frame.connection == 1)
        .count()
        >= 2);

    let resume = &gateway.frames(OpCode::Resume)[0];
    assert_eq!(resume.connection, 1);
    assert_eq!(resume.d["session_id"], "session-0");

    let handle = shard.handle().clone();
    assert_eq!(handle.state(), ShardState::Connected);
    assert!(handle.info().latency.is_some());

    handle.shutdown().await.unwrap();
    timeout(WITHIN, shard.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dispatches_arrive_in_order() {
    let gateway = MockGateway::start(GatewayBehavior {
        dispatches: vec![
            ("MESSAGE_CREATE".into(), serde_json::json!({"id": "1"})),
            ("TYPING_START".into(), serde_json::json!({})),
            ("MESSAGE_CREATE".into(), serde_json::json!({"id": "2"})),
        ],
        ..GatewayBehavior::default()
    })
    .await
    .unwrap();
    let (events_tx, mut events) = mpsc::channel(16);
    let shard = Shard::spawn(shard_config(&gateway.url()), identify_queue(), events_tx, None);

    let seen = collect_until(&mut events, EventKind::MessageCreate, 2).await;
    let sequences: Vec<u64> = seen.iter().map(|event| event.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
    assert_eq!(seen[3].data["id"], "2");
    assert_eq!(seen[1].name, "MESSAGE_CREATE");

    let handle = shard.handle().clone();
    handle.shutdown().await.unwrap();
    timeout(WITHIN, shard.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_authentication_failure_stops_the_shard() {
    let gateway = MockGateway::start(GatewayBehavior {
        close_on_identify: Some(4004),
        ..GatewayBehavior::default()
    })
    .await
    .unwrap();
    let (events_tx, _events) = mpsc::channel(16);
    let shard = Shard::spawn(shard_config(&gateway.url()), identify_queue(), events_tx, None);

    let err = timeout(WITHIN, shard.join()).await.unwrap().unwrap_err();
    assert_eq!(err.shard_id, 0);
    assert!(matches!(err.source, GatewayError::Closed { code: 4004, .. }));
    assert!(err.source.is_fatal());

    // Fatal closes are never retried
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.connection_count(), 1);
}

#[tokio::test]
async fn test_shutdown_while_reconnecting() {
    // Nothing listens on the discard port, so the shard keeps backing off
    let (events_tx, _events) = mpsc::channel(16);
    let shard = Shard::spawn(shard_config("ws://127.0.0.1:9"), identify_queue(), events_tx, None);
    let handle = shard.handle().clone();

    assert!(
        eventually(WITHIN, || handle.info().reconnect_attempts >= 2).await,
        "shard never retried"
    );

    handle.shutdown().await.unwrap();
    timeout(WITHIN, shard.join()).await.unwrap().unwrap();
    assert_eq!(handle.state(), ShardState::Disconnected);
}

#[tokio::test]
async fn test_resumable_invalid_session_resumes() {
    let gateway = MockGateway::start(GatewayBehavior {
        after_first_ready: Some(AfterReady::InvalidSession(true)),
        ..GatewayBehavior::default()
    })
    .await
    .unwrap();
    let (events_tx, mut events) = mpsc::channel(16);
    let shard = Shard::spawn(shard_config(&gateway.url()), identify_queue(), events_tx, None);

    collect_until(&mut events, EventKind::Resumed, 1).await;
    assert_eq!(
        command_log(&gateway),
        vec![(0, OpCode::Identify), (1, OpCode::Resume)]
    );
    assert_eq!(gateway.frames(OpCode::Identify).len(), 1);

    let resume = &gateway.frames(OpCode::Resume)[0];
    assert_eq!(resume.d["session_id"], "session-0");
    assert_eq!(resume.d["seq"], 1);

    let handle = shard.handle().clone();
    assert_eq!(handle.state(), ShardState::Connected);
    assert_eq!(handle.info().session_id.as_deref(), Some("session-0"));

    handle.shutdown().await.unwrap();
    timeout(WITHIN, shard.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_session_ending_close_codes_identify_again() {
    for code in [4007, 4009] {
        let gateway = MockGateway::start(GatewayBehavior {
            after_first_ready: Some(AfterReady::Close(code)),
            ..GatewayBehavior::default()
        })
        .await
        .unwrap();
        let (events_tx, mut events) = mpsc::channel(16);
        let shard = Shard::spawn(shard_config(&gateway.url()), identify_queue(), events_tx, None);

        let seen = collect_until(&mut events, EventKind::Ready, 2).await;
        assert!(seen.iter().all(|event| event.kind != Some(EventKind::Resumed)));
        assert_eq!(
            command_log(&gateway),
            vec![(0, OpCode::Identify), (1, OpCode::Identify)],
            "close code {code}"
        );

        let handle = shard.handle().clone();
        assert_eq!(handle.info().session_id.as_deref(), Some("session-1"));

        handle.shutdown().await.unwrap();
        timeout(WITHIN, shard.join()).await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_server_heartbeat_request_is_answered_immediately() {
    // The regular interval never fires during the test
    let gateway = MockGateway::start(GatewayBehavior {
        heartbeat_interval_ms: 3_600_000,
        after_first_ready: Some(AfterReady::RequestHeartbeat),
        ..GatewayBehavior::default()
    })
    .await
    .unwrap();
    let (events_tx, mut events) = mpsc::channel(16);
    let shard = Shard::spawn(shard_config(&gateway.url()), identify_queue(), events_tx, None);

    collect_until(&mut events, EventKind::Ready, 1).await;
    assert!(
        eventually(Duration::from_secs(2), || !gateway.frames(OpCode::Heartbeat).is_empty()).await,
        "heartbeat request went unanswered"
    );

    let heartbeats = gateway.frames(OpCode::Heartbeat);
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].connection, 0);
    assert_eq!(heartbeats[0].d, serde_json::json!(1));
    assert_eq!(gateway.connection_count(), 1);

    let handle = shard.handle().clone();
    handle.shutdown().await.unwrap();
    timeout(WITHIN, shard.join()).await.unwrap().unwrap();
}

// ============================================================================
// Commands and backpressure
// ============================================================================

#[tokio::test]
async fn test_command_sent_while_reconnecting_goes_out_after_resume() {
    let gateway = MockGateway::start(GatewayBehavior {
        after_first_ready: Some(AfterReady::Close(4000)),
        ..GatewayBehavior::default()
    })
    .await
    .unwrap();
    let config = shard_config(&gateway.url()).with_reconnect(ReconnectConfig {
        initial_delay_ms: 300,
        max_delay_ms: 300,
        jitter_ratio: 0.0,
    });
    let (events_tx, mut events) = mpsc::channel(16);
    let shard = Shard::spawn(config, identify_queue(), events_tx, None);
    let handle = shard.handle().clone();

    assert!(
        eventually(WITHIN, || handle.info().reconnect_attempts >= 1).await,
        "shard never lost its connection"
    );
    assert_ne!(handle.state(), ShardState::Connected);
    handle
        .update_voice_state(VoiceStateUpdatePayload::leave(Snowflake::new(10)))
        .await
        .unwrap();

    collect_until(&mut events, EventKind::Resumed, 1).await;
    assert!(
        eventually(WITHIN, || !gateway.frames(OpCode::VoiceStateUpdate).is_empty()).await,
        "held command was never sent"
    );
    assert_eq!(
        command_log(&gateway),
        vec![
            (0, OpCode::Identify),
            (1, OpCode::Resume),
            (1, OpCode::VoiceStateUpdate)
        ]
    );
    let update = &gateway.frames(OpCode::VoiceStateUpdate)[0];
    assert_eq!(update.d["guild_id"], "10");
    assert!(update.d["channel_id"].is_null());

    handle.shutdown().await.unwrap();
    timeout(WITHIN, shard.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unread_events_do_not_stall_heartbeats() {
    let gateway = MockGateway::start(GatewayBehavior {
        heartbeat_interval_ms: 50,
        dispatches: (1..=3)
            .map(|id| {
                (
                    "MESSAGE_CREATE".to_string(),
                    serde_json::json!({"id": id.to_string()}),
                )
            })
            .collect(),
        ..GatewayBehavior::default()
    })
    .await
    .unwrap();
    // Ready fills the channel and nothing reads it for a while
    let (events_tx, mut events) = mpsc::channel(1);
    let shard = Shard::spawn(shard_config(&gateway.url()), identify_queue(), events_tx, None);

    assert!(
        eventually(WITHIN, || gateway.frames(OpCode::Heartbeat).len() >= 8).await,
        "heartbeats stopped while events were pending"
    );
    assert_eq!(gateway.connection_count(), 1);

    let mut sequences = Vec::new();
    for _ in 0..4 {
        let event = timeout(WITHIN, events.recv()).await.unwrap().unwrap();
        sequences.push(event.sequence);
    }
    assert_eq!(sequences, vec![1, 2, 3, 4]);

    let handle = shard.handle().clone();
    assert_eq!(handle.state(), ShardState::Connected);
    handle.shutdown().await.unwrap();
    timeout(WITHIN, shard.join()).await.unwrap().unwrap();
}
