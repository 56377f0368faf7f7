use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncReadExt;

use teamserver_core::crypto::curve::StaticKeypair;
use teamserver_core::wire::topics;
use teamserverd::{BusPublisher, BusSecurity, BusSubscriber};

use crate::*;

async fn subscriber(server: &TeamServer, topic: &str) -> BusSubscriber {
    let security = match server.bus_public_key() {
        Some(server_public) => BusSecurity::Curve { server_public },
        None => BusSecurity::Insecure,
    };
    let mut sub = BusSubscriber::connect(server.bus_endpoints().publish, security)
        .await
        .unwrap();
    sub.subscribe(topic).await.unwrap();
    // Let the server see the subscription before anything is published.
    tokio::time::sleep(Duration::from_millis(100)).await;
    sub
}

async fn recv(sub: &mut BusSubscriber) -> (String, serde_json::Value) {
    tokio::time::timeout(RECV_TIMEOUT, sub.recv())
        .await
        .expect("timed out waiting for bus message")
        .unwrap()
        .expect("bus closed")
}

#[tokio::test]
async fn remote_subscriber_sees_lifecycle_events_over_noise() {
    let server = start(test_config()).await;
    assert!(server.bus_public_key().is_some());
    let mut connected = subscriber(&server, topics::CLIENT_CONNECTED).await;

    let agent = Agent::connect(&server).await.unwrap();
    let (topic, payload) = recv(&mut connected).await;
    assert_eq!(topic, "client_connected");
    assert_eq!(payload["session_id"], agent.session_id.as_str());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn insecure_bus_still_delivers() {
    let mut config = test_config();
    config.bus.secure = false;
    let server = start(config).await;
    assert!(server.bus_public_key().is_none());
    let mut sub = subscriber(&server, "operator_note").await;

    server.bus().publish("operator_note", &json!({"text": "hello"}));
    let (_, payload) = recv(&mut sub).await;
    assert_eq!(payload["text"], "hello");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn untrusted_server_key_is_refused() {
    let server = start(test_config()).await;
    let wrong = StaticKeypair::generate().public;

    let result = BusSubscriber::connect(
        server.bus_endpoints().publish,
        BusSecurity::Curve { server_public: wrong },
    )
    .await;
    assert!(result.is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn plaintext_publisher_is_ignored_by_secure_bus() {
    let (server, mut notes) = start_watching(test_config(), "operator_note").await;

    let mut publisher = BusPublisher::connect(server.bus_endpoints().subscribe, BusSecurity::Insecure)
        .await
        .unwrap();
    // The server reads this as a failed Noise handshake and drops the link.
    let _ = publisher.publish("operator_note", &json!({"text": "sneaky"})).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(notes.try_recv().is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn remote_publisher_reaches_server_subscription() {
    let (server, mut notes) = start_watching(test_config(), "operator_note").await;
    let server_public = server.bus_public_key().unwrap();

    let mut publisher = BusPublisher::connect(
        server.bus_endpoints().subscribe,
        BusSecurity::Curve { server_public },
    )
    .await
    .unwrap();
    publisher.publish("operator_note", &json!({"text": "from afar"})).await.unwrap();

    let payload = recv_event(&mut notes).await;
    assert_eq!(payload["text"], "from afar");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn local_publish_is_delivered_exactly_once() {
    let (server, mut notes) = start_watching(test_config(), "operator_note").await;

    server.bus().publish("operator_note", &json!({"n": 1}));
    assert_eq!(recv_event(&mut notes).await["n"], 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(notes.try_recv().is_err());

    // No subscriber: nothing happens, nothing breaks.
    assert!(eventually(Duration::from_secs(3), || server.is_healthy()).await);
    server.bus().publish("nobody_listens", &json!({"n": 2}));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.is_healthy());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn silent_bus_peer_is_disconnected() {
    let mut config = test_config();
    config.bus.handshake_timeout_secs = 1;
    let server = start(config).await;
    let endpoints = server.bus_endpoints();

    for addr in [endpoints.publish, endpoints.subscribe] {
        let mut silent = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(RECV_TIMEOUT, silent.read(&mut buf))
            .await
            .expect("server should drop a peer that never handshakes");
        assert!(matches!(read, Ok(0) | Err(_)), "expected EOF, got {read:?}");
    }

    // The bus keeps serving real clients.
    let mut sub = subscriber(&server, "operator_note").await;
    server.bus().publish("operator_note", &json!({"n": 1}));
    assert_eq!(recv(&mut sub).await.1["n"], 1);

    server.stop().await.unwrap();
}
