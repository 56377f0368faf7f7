use std::time::Duration;

use serde_json::json;

use teamserver_core::wire::topics;

use crate::*;

#[tokio::test]
async fn idle_session_expires_with_one_disconnect_event() {
    let mut config = test_config();
    config.server.session_timeout_secs = 1;
    config.server.sweep_interval_secs = 1;
    let (server, mut events) = start_watching(config, topics::CLIENT_DISCONNECTED).await;

    let mut agent = Agent::connect(&server).await.unwrap();
    let id = agent.session_id.clone();

    let event = recv_event(&mut events).await;
    assert_eq!(event["session_id"], id.as_str());
    assert_eq!(event["reason"], "expired");
    assert!(server.sessions().get(&id).is_none());
    assert!(server.sessions().snapshot().iter().all(|s| s.id != id));

    // The transport is closed too, and the connection task does not
    // announce the same session a second time.
    assert!(agent.recv().await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn active_session_is_not_expired() {
    let mut config = test_config();
    config.server.session_timeout_secs = 2;
    config.server.sweep_interval_secs = 1;
    let server = start(config).await;
    let mut agent = Agent::connect(&server).await.unwrap();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(700)).await;
        let reply = agent
            .request(json!({"type":"checkin","hostname":"h","username":"u","os":"o"}))
            .await
            .unwrap();
        assert_eq!(reply["type"], "checkin_response");
    }
    assert!(server.sessions().contains(&agent.session_id));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn closing_the_transport_removes_the_session() {
    let (server, mut events) = start_watching(test_config(), topics::CLIENT_DISCONNECTED).await;
    let mut agent = Agent::connect(&server).await.unwrap();
    let id = agent.session_id.clone();

    agent.ws.close(None).await.unwrap();

    let event = recv_event(&mut events).await;
    assert_eq!(event["session_id"], id.as_str());
    assert_eq!(event["reason"], "transport_closed");
    let sessions = server.sessions();
    assert!(eventually(Duration::from_secs(2), || !sessions.contains(&id)).await);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn connect_event_carries_session_and_address() {
    let (server, mut events) = start_watching(test_config(), topics::CLIENT_CONNECTED).await;
    let agent = Agent::connect(&server).await.unwrap();

    let event = recv_event(&mut events).await;
    assert_eq!(event["session_id"], agent.session_id.as_str());
    assert!(event["address"].as_str().unwrap().starts_with("127.0.0.1:"));
    assert!(event["timestamp"].as_u64().unwrap() > 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_closes_live_sessions() {
    let (server, mut events) = start_watching(test_config(), topics::CLIENT_DISCONNECTED).await;
    let mut agent = Agent::connect(&server).await.unwrap();
    let sessions = server.sessions();

    server.stop().await.unwrap();

    assert!(sessions.is_empty(), "stop waits for connection cleanup");
    assert!(agent.recv().await.unwrap().is_none());
    // The bus may already be gone when the connection announces its
    // shutdown, so the event is best-effort here.
    let _ = events.try_recv();
}
