//! Sessions, registry, pump and publisher working together over an
//! in-memory connection

mod common;

use common::*;
use notify_relay::{ClientRequest, ClientTransport, ConnectionCommand, RelayError, ServerEvent};
use serde_json::json;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_publish_reaches_subscriber_through_database() {
    let (multiplexer, conn) = memory_multiplexer(test_config());
    let transport = RecordingTransport::new();
    let sessions = multiplexer.session_manager(Arc::clone(&transport) as Arc<dyn ClientTransport>);

    sessions.on_connect("A", "client-a").await;
    sessions.on_connect("B", "client-b").await;
    assert_ok!(
        sessions
            .handle_request(
                "A",
                ClientRequest::Subscribe {
                    channel: "test".into()
                }
            )
            .await
    );
    assert_ok!(
        sessions
            .handle_request(
                "B",
                ClientRequest::Publish {
                    channel: "test".into(),
                    payload: Some(json!({"arg1": 123, "arg2": true})),
                },
            )
            .await
    );

    assert!(
        wait_until(DELIVERY_TIMEOUT, || !transport.notifications("A").is_empty()).await,
        "subscriber never received the event"
    );
    assert_eq!(
        transport.notifications("A"),
        vec![("test".to_string(), json!({"arg1": 123, "arg2": true}))]
    );
    assert!(transport.notifications("B").is_empty());

    // The publish went out as NOTIFY rather than straight to the sink
    assert!(conn
        .commands()
        .contains(&ConnectionCommand::notify("test", r#"{"arg1":123,"arg2":true}"#)));
    assert!(transport.events("B").contains(&ServerEvent::Published {
        channel: "test".into()
    }));

    multiplexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fifty_clients_on_separate_channels() {
    let (multiplexer, conn) = memory_multiplexer(test_config());
    let transport = RecordingTransport::new();
    let sessions = Arc::new(
        multiplexer.session_manager(Arc::clone(&transport) as Arc<dyn ClientTransport>),
    );

    let subscribers: Vec<_> = (0..50)
        .map(|i| {
            let sessions = Arc::clone(&sessions);
            tokio::spawn(async move {
                let session_id = format!("client_{i}");
                sessions.on_connect(&session_id, &session_id).await;
                sessions
                    .subscribe(&session_id, &format!("test_{i}"))
                    .await
                    .map(|_| ())
            })
        })
        .collect();
    for result in futures::future::join_all(subscribers).await {
        result.unwrap().unwrap();
    }

    for i in 0..50 {
        multiplexer
            .publisher()
            .publish(&format!("test_{i}"), Some(&json!({ "client": i })))
            .await
            .unwrap();
    }

    let all_delivered = wait_until(DELIVERY_TIMEOUT, || {
        (0..50).all(|i| !transport.notifications(&format!("client_{i}")).is_empty())
    })
    .await;
    assert!(all_delivered, "not every client received its event");

    for i in 0..50 {
        assert_eq!(
            transport.notifications(&format!("client_{i}")),
            vec![(format!("test_{i}"), json!({ "client": i }))]
        );
        assert_eq!(conn.listen_count(&format!("test_{i}")), 1);
    }

    for i in 0..50 {
        sessions.on_disconnect(&format!("client_{i}")).await.unwrap();
    }
    assert!(multiplexer.registry().channels().is_empty());
    assert!(conn.listening_channels().is_empty());
    for i in 0..50 {
        assert_eq!(conn.unlisten_count(&format!("test_{i}")), 1);
    }

    multiplexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_per_channel_order_is_preserved() {
    let (multiplexer, _conn) = memory_multiplexer(test_config());
    let transport = RecordingTransport::new();
    let sessions = multiplexer.session_manager(Arc::clone(&transport) as Arc<dyn ClientTransport>);

    sessions.on_connect("s", "c").await;
    sessions.subscribe("s", "ordered").await.unwrap();
    for n in 0..15 {
        multiplexer
            .publisher()
            .publish("ordered", Some(&json!(n)))
            .await
            .unwrap();
    }

    assert!(wait_until(DELIVERY_TIMEOUT, || transport.notifications("s").len() == 15).await);
    let received: Vec<_> = transport
        .notifications("s")
        .into_iter()
        .map(|(_, payload)| payload)
        .collect();
    let expected: Vec<_> = (0..15).map(|n| json!(n)).collect();
    assert_eq!(received, expected);

    multiplexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_notification_delivered_as_raw_text() {
    let (multiplexer, conn) = memory_multiplexer(test_config());
    let transport = RecordingTransport::new();
    let sessions = multiplexer.session_manager(Arc::clone(&transport) as Arc<dyn ClientTransport>);

    sessions.on_connect("s", "c").await;
    sessions.subscribe("s", "legacy").await.unwrap();
    assert!(conn.inject("legacy", "plain text, not json"));

    assert!(wait_until(DELIVERY_TIMEOUT, || !transport.notifications("s").is_empty()).await);
    assert_eq!(
        transport.notifications("s"),
        vec![("legacy".to_string(), json!("plain text, not json"))]
    );
    assert_eq!(multiplexer.stats().pump.malformed, 1);

    multiplexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_oversized_publish_rejected_before_notify() {
    let (multiplexer, conn) = memory_multiplexer(test_config());
    let transport = RecordingTransport::new();
    let sessions = multiplexer.session_manager(Arc::clone(&transport) as Arc<dyn ClientTransport>);

    sessions.on_connect("s", "c").await;
    let result = sessions
        .handle_request(
            "s",
            ClientRequest::Publish {
                channel: "big".into(),
                payload: Some(json!({ "blob": "x".repeat(8_500) })),
            },
        )
        .await;
    assert!(matches!(result, Err(RelayError::PayloadTooLarge { .. })));
    assert_eq!(conn.notify_count(), 0);
    assert_eq!(
        transport.errors("s"),
        vec!["Tried to publish payload with size greater than 8000 bytes".to_string()]
    );

    multiplexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribed_session_stops_receiving() {
    let (multiplexer, conn) = memory_multiplexer(test_config());
    let transport = RecordingTransport::new();
    let sessions = multiplexer.session_manager(Arc::clone(&transport) as Arc<dyn ClientTransport>);

    sessions.on_connect("stays", "c").await;
    sessions.on_connect("leaves", "c").await;
    sessions.subscribe("stays", "news").await.unwrap();
    sessions.subscribe("leaves", "news").await.unwrap();

    sessions.unsubscribe("leaves", "news").await.unwrap();
    assert_eq!(conn.unlisten_count("news"), 0);

    multiplexer
        .publisher()
        .publish("news", Some(&json!({"headline": 1})))
        .await
        .unwrap();
    assert!(wait_until(DELIVERY_TIMEOUT, || !transport.notifications("stays").is_empty()).await);
    assert!(transport.notifications("leaves").is_empty());

    multiplexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_slow_client_does_not_stall_others() {
    let config = test_config().with_sink_capacity(2);
    let (multiplexer, _conn) = memory_multiplexer(config);
    let transport = RecordingTransport::new();
    let sessions = multiplexer.session_manager(Arc::clone(&transport) as Arc<dyn ClientTransport>);

    sessions.on_connect("gone", "c").await;
    sessions.on_connect("live", "c").await;
    sessions.subscribe("gone", "feed").await.unwrap();
    sessions.subscribe("live", "feed").await.unwrap();
    transport.disconnect("gone");

    for n in 0..10 {
        multiplexer
            .publisher()
            .publish("feed", Some(&json!(n)))
            .await
            .unwrap();
        assert!(
            wait_until(DELIVERY_TIMEOUT, || transport.notifications("live").len() == n + 1).await
        );
    }
    assert_eq!(transport.notifications("live").len(), 10);
    assert!(transport.notifications("gone").is_empty());

    multiplexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_operations_fail_fast_after_connection_loss() {
    let (multiplexer, conn) = memory_multiplexer(test_config());
    let transport = RecordingTransport::new();
    let sessions = multiplexer.session_manager(Arc::clone(&transport) as Arc<dyn ClientTransport>);
    sessions.on_connect("s", "c").await;

    conn.sever();
    within(multiplexer.closed()).await;

    let err = assert_err!(sessions.subscribe("s", "news").await);
    assert!(err.is_connection_fatal());
    assert_err!(multiplexer.publisher().publish("news", None).await);

    // Teardown still completes locally
    sessions.on_disconnect("s").await.unwrap();
    assert_eq!(sessions.session_count(), 0);
}
