//! End-to-end client tests: REST discovery, sharding and event handlers
//!
//! Run with: cargo test -p integration-tests --test client_tests

use std::time::Duration;

use chat_client::{Client, ClientError, EventKind};
use chat_gateway::protocol::OpCode;
use integration_tests::{
    client_config, gateway_bot, message_create, GatewayBehavior, MockApi, MockGateway,
    MockResponse,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WITHIN: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_client_shards_by_gateway_advice_and_runs_handlers() {
    let gateway = MockGateway::start(GatewayBehavior {
        dispatches: vec![("MESSAGE_CREATE".into(), message_create(100, 7, "hello"))],
        ..GatewayBehavior::default()
    })
    .await
    .unwrap();
    let api = MockApi::start().await.unwrap();
    api.push("/gateway/bot", MockResponse::json(gateway_bot(&gateway.url(), 2, 2)));

    let (ready_tx, mut ready) = mpsc::unbounded_channel();
    let (message_tx, mut messages) = mpsc::unbounded_channel();

    let mut client = Client::builder(client_config(&api.base_url()))
        .identify_interval(Duration::from_millis(10))
        .on(EventKind::Ready, move |event| {
            let ready_tx = ready_tx.clone();
            async move {
                ready_tx.send(event.shard_id)?;
                anyhow::Ok(())
            }
        })
        .on(EventKind::MessageCreate, move |event| {
            let message_tx = message_tx.clone();
            async move {
                let content = event.data["content"].as_str().unwrap_or_default().to_string();
                message_tx.send((event.shard_id, content))?;
                anyhow::Ok(())
            }
        })
        .build()
        .unwrap();

    client.connect().await.unwrap();

    let mut ready_shards = Vec::new();
    let mut contents = Vec::new();
    timeout(WITHIN, async {
        while ready_shards.len() < 2 {
            ready_shards.push(ready.recv().await.unwrap());
        }
        while contents.len() < 2 {
            contents.push(messages.recv().await.unwrap());
        }
    })
    .await
    .expect("handlers did not run");

    ready_shards.sort_unstable();
    assert_eq!(ready_shards, vec![0, 1]);
    assert!(contents.iter().all(|(_, content)| content == "hello"));

    let mut identified: Vec<serde_json::Value> = gateway
        .frames(OpCode::Identify)
        .into_iter()
        .map(|frame| frame.d["shard"].clone())
        .collect();
    identified.sort_by_key(|shard| shard[0].as_u64());
    assert_eq!(
        identified,
        vec![serde_json::json!([0, 2]), serde_json::json!([1, 2])]
    );

    // Gateway advice is fetched once, with the bot token
    let lookups = api.requests_to("/gateway/bot");
    assert_eq!(lookups.len(), 1);
    assert_eq!(lookups[0].authorization.as_deref(), Some("Bot test-token"));
    assert_eq!(client.shard_info().len(), 2);

    timeout(WITHIN, client.shutdown()).await.unwrap();
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_configured_shard_count_overrides_advice() {
    let gateway = MockGateway::start(GatewayBehavior::default()).await.unwrap();
    let api = MockApi::start().await.unwrap();
    api.push("/gateway/bot", MockResponse::json(gateway_bot(&gateway.url(), 4, 1)));

    let mut config = client_config(&api.base_url());
    config.gateway.shard_count = Some(1);
    let mut client = Client::builder(config).build().unwrap();

    client.connect().await.unwrap();
    assert_eq!(client.shard_info().len(), 1);

    timeout(WITHIN, client.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_failing_handler_does_not_stop_delivery() {
    let gateway = MockGateway::start(GatewayBehavior {
        dispatches: vec![
            ("MESSAGE_CREATE".into(), message_create(1, 7, "first")),
            ("MESSAGE_CREATE".into(), message_create(2, 7, "second")),
        ],
        ..GatewayBehavior::default()
    })
    .await
    .unwrap();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();

    let mut client = Client::builder(client_config("http://127.0.0.1:9/api/v10"))
        .gateway_url(gateway.url())
        .on(EventKind::MessageCreate, |_| async {
            Err::<(), _>(anyhow::anyhow!("handler failed"))
        })
        .on(EventKind::MessageCreate, move |event| {
            let seen_tx = seen_tx.clone();
            async move {
                seen_tx.send(event.sequence)?;
                anyhow::Ok(())
            }
        })
        .build()
        .unwrap();

    client.connect().await.unwrap();

    let sequences = timeout(WITHIN, async {
        vec![seen.recv().await.unwrap(), seen.recv().await.unwrap()]
    })
    .await
    .unwrap();
    assert_eq!(sequences, vec![2, 3]);

    timeout(WITHIN, client.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_run_returns_fatal_gateway_error() {
    let gateway = MockGateway::start(GatewayBehavior {
        close_on_identify: Some(4004),
        ..GatewayBehavior::default()
    })
    .await
    .unwrap();

    let mut client = Client::builder(client_config("http://127.0.0.1:9/api/v10"))
        .gateway_url(gateway.url())
        .build()
        .unwrap();

    let err = timeout(WITHIN, client.run()).await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Authentication { .. }));
    assert!(err.is_fatal());

    timeout(WITHIN, client.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_rejected_token_fails_connect() {
    let api = MockApi::start().await.unwrap();
    api.push(
        "/gateway/bot",
        MockResponse::status(401, serde_json::json!({"code": 0, "message": "401: Unauthorized"})),
    );

    let mut client = Client::builder(client_config(&api.base_url())).build().unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::Authentication { .. }));
    assert!(!client.is_connected());
}
