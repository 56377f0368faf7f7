use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;

use teamserver_core::wire::topics;

use crate::*;

/// A valid frame with one bit of its nonce flipped.
fn corrupt_nonce(agent: &mut Agent, message: &serde_json::Value) -> String {
    let frame = agent.crypto.encrypt(message.to_string().as_bytes()).unwrap();
    let mut raw = STANDARD.decode(frame).unwrap();
    raw[11] ^= 0x01;
    STANDARD.encode(raw)
}

#[tokio::test]
async fn corrupted_frame_gets_an_error_and_the_connection_stays_open() {
    let server = start(test_config()).await;
    let mut agent = Agent::connect(&server).await.unwrap();

    let bad = corrupt_nonce(&mut agent, &json!({"type":"checkin"}));
    agent.send_raw(bad).await.unwrap();
    let reply = agent.recv().await.unwrap().unwrap();
    assert_eq!(reply, json!({"type":"error","message":"Decryption failed"}));

    let reply = agent
        .request(json!({"type":"checkin","hostname":"h1","username":"u1","os":"linux"}))
        .await
        .unwrap();
    assert_eq!(reply["type"], "checkin_response");
    assert!(server.sessions().contains(&agent.session_id));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn replayed_frame_is_refused() {
    let server = start(test_config()).await;
    let mut agent = Agent::connect(&server).await.unwrap();

    let frame = agent
        .crypto
        .encrypt(json!({"type":"task_result","task_id":"t","result":1}).to_string().as_bytes())
        .unwrap();
    agent.send_raw(frame.clone()).await.unwrap();
    assert_eq!(agent.recv().await.unwrap().unwrap()["type"], "task_result_response");

    agent.send_raw(frame).await.unwrap();
    assert_eq!(agent.recv().await.unwrap().unwrap()["message"], "Decryption failed");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn garbage_text_is_answered_not_fatal() {
    let server = start(test_config()).await;
    let mut agent = Agent::connect(&server).await.unwrap();

    agent.send_raw("%%% not base64 %%%".into()).await.unwrap();
    assert_eq!(agent.recv().await.unwrap().unwrap()["type"], "error");
    assert!(server.sessions().contains(&agent.session_id));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn repeated_authentication_failures_drop_the_connection() {
    let mut config = test_config();
    config.server.max_auth_failures = 3;
    let (server, mut events) = start_watching(config, topics::CLIENT_DISCONNECTED).await;
    let mut agent = Agent::connect(&server).await.unwrap();
    let id = agent.session_id.clone();

    for _ in 0..3 {
        let bad = corrupt_nonce(&mut agent, &json!({"type":"checkin"}));
        agent.send_raw(bad).await.unwrap();
        assert_eq!(agent.recv().await.unwrap().unwrap()["message"], "Decryption failed");
    }
    assert!(agent.recv().await.unwrap().is_none(), "third failure closes");

    let event = recv_event(&mut events).await;
    assert_eq!(event["session_id"], id.as_str());
    assert_eq!(event["reason"], "authentication_failures");
    assert!(server.sessions().get(&id).is_none());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn a_good_frame_resets_the_failure_count() {
    let mut config = test_config();
    config.server.max_auth_failures = 2;
    let server = start(config).await;
    let mut agent = Agent::connect(&server).await.unwrap();

    for _ in 0..3 {
        let bad = corrupt_nonce(&mut agent, &json!({"type":"checkin"}));
        agent.send_raw(bad).await.unwrap();
        assert_eq!(agent.recv().await.unwrap().unwrap()["type"], "error");
        let reply = agent
            .request(json!({"type":"error","error_type":"x","message":"y"}))
            .await
            .unwrap();
        assert_eq!(reply["type"], "error_response");
    }
    assert!(server.sessions().contains(&agent.session_id));

    server.stop().await.unwrap();
}
