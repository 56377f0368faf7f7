use std::time::Duration;

use futures::SinkExt;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use teamserver_core::crypto::CipherSuite;
use teamserver_core::wire::{topics, HandshakeFrame};

use crate::*;

#[tokio::test]
async fn handshake_establishes_a_registered_session() {
    let server = start(test_config()).await;
    let agent = Agent::connect(&server).await.unwrap();

    assert_eq!(agent.session_id.len(), 64, "32 random bytes, hex");
    let info = server.sessions().get(&agent.session_id).expect("session registered");
    assert!(info.hostname.is_none());
    assert!(info.address.starts_with("127.0.0.1:"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn every_connection_gets_its_own_session() {
    let server = start(test_config()).await;
    let a = Agent::connect(&server).await.unwrap();
    let b = Agent::connect(&server).await.unwrap();

    assert_ne!(a.session_id, b.session_id);
    assert_eq!(server.sessions().len(), 2);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn cbc_hmac_suite_end_to_end() {
    let mut config = test_config();
    config.server.cipher_suite = CipherSuite::Aes256CbcHmacSha256;
    let server = start(config).await;

    let mut agent = Agent::connect_with(server.local_addr(), CipherSuite::Aes256CbcHmacSha256, None)
        .await
        .unwrap();
    let reply = agent
        .request(json!({"type":"checkin","hostname":"h1","username":"u1","os":"linux"}))
        .await
        .unwrap();
    assert_eq!(reply["type"], "checkin_response");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn wrong_opening_frame_is_a_protocol_violation() {
    let server = start(test_config()).await;
    let mut ws = open_ws(server.local_addr(), None).await.unwrap();

    ws.send(Message::text(json!({"type":"checkin","hostname":"h"}).to_string()))
        .await
        .unwrap();

    let first = next_text(&mut ws).await.unwrap().unwrap();
    assert!(matches!(
        serde_json::from_str::<HandshakeFrame>(&first).unwrap(),
        HandshakeFrame::KeyExchange { .. }
    ));
    let error: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await.unwrap().unwrap()).unwrap();
    assert_eq!(error["type"], "error");
    assert!(next_text(&mut ws).await.unwrap().is_none(), "connection is dropped");
    assert!(server.sessions().is_empty(), "no session for a failed handshake");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn invalid_public_key_is_rejected() {
    let server = start(test_config()).await;
    let mut ws = open_ws(server.local_addr(), None).await.unwrap();

    let frame = HandshakeFrame::KeyExchange {
        public_key: "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n".into(),
    };
    ws.send(Message::text(frame.to_json())).await.unwrap();

    let _server_key = next_text(&mut ws).await.unwrap().unwrap();
    let error: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await.unwrap().unwrap()).unwrap();
    assert_eq!(error["message"], "Invalid public key");
    assert!(next_text(&mut ws).await.unwrap().is_none());
    assert!(server.sessions().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn silent_client_times_out_without_a_session() {
    let mut config = test_config();
    config.server.handshake_timeout_secs = 1;
    let server = start(config).await;
    let mut ws = open_ws(server.local_addr(), None).await.unwrap();

    let _server_key = next_text(&mut ws).await.unwrap().unwrap();
    let started = tokio::time::Instant::now();
    assert!(next_text(&mut ws).await.unwrap().is_none(), "server hangs up");
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(server.sessions().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn required_auth_rejects_missing_and_wrong_tokens() {
    let mut config = test_config();
    config.auth.required = true;
    config.auth.tokens = vec!["s3cret".into()];
    let server = start(config).await;
    let addr = server.local_addr();

    for bearer in [None, Some("wrong")] {
        match open_ws(addr, bearer).await {
            Ok(_) => panic!("upgrade with {bearer:?} should be refused"),
            Err(e) => {
                let http = e
                    .downcast_ref::<tokio_tungstenite::tungstenite::Error>()
                    .expect("websocket error");
                match http {
                    tokio_tungstenite::tungstenite::Error::Http(resp) => {
                        assert_eq!(resp.status().as_u16(), 401)
                    }
                    other => panic!("expected HTTP 401, got {other:?}"),
                }
            }
        }
    }

    let agent = Agent::connect_with(addr, CipherSuite::Aes256Gcm, Some("s3cret"))
        .await
        .unwrap();
    assert!(server.sessions().contains(&agent.session_id));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_during_handshake_leaves_no_session() {
    let (server, mut connected) = start_watching(test_config(), topics::CLIENT_CONNECTED).await;
    let sessions = server.sessions();
    let mut ws = open_ws(server.local_addr(), None).await.unwrap();

    let first = next_text(&mut ws).await.unwrap().unwrap();
    assert!(matches!(
        serde_json::from_str::<HandshakeFrame>(&first).unwrap(),
        HandshakeFrame::KeyExchange { .. }
    ));

    // Never answer; stop waits for the connection task's cleanup.
    server.stop().await.unwrap();

    assert!(sessions.is_empty(), "no partial session survives cancellation");
    assert!(connected.try_recv().is_err(), "no client_connected was published");
    assert!(next_text(&mut ws).await.unwrap().is_none(), "connection is closed");
}

#[tokio::test]
async fn binary_frame_during_key_exchange_is_a_protocol_violation() {
    let server = start(test_config()).await;
    let mut ws = open_ws(server.local_addr(), None).await.unwrap();

    ws.send(Message::binary(vec![0x01, 0x02, 0x03])).await.unwrap();

    let first = next_text(&mut ws).await.unwrap().unwrap();
    assert!(matches!(
        serde_json::from_str::<HandshakeFrame>(&first).unwrap(),
        HandshakeFrame::KeyExchange { .. }
    ));
    let error: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await.unwrap().unwrap()).unwrap();
    assert_eq!(error, json!({"type":"error","message":"Expected key_exchange"}));
    assert!(next_text(&mut ws).await.unwrap().is_none(), "connection is dropped");
    assert!(server.sessions().is_empty());

    server.stop().await.unwrap();
}
