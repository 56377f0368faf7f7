use std::time::Duration;

use futures::SinkExt;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use crate::*;

#[tokio::test]
async fn checkin_updates_session_and_echoes_id() {
    let server = start(test_config()).await;
    let mut agent = Agent::connect(&server).await.unwrap();
    let sessions = server.sessions();
    let before = sessions.last_active(&agent.session_id).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let reply = agent
        .request(json!({"type":"checkin","hostname":"h1","username":"u1","os":"linux"}))
        .await
        .unwrap();

    assert_eq!(
        reply,
        json!({"type":"checkin_response","status":"success","session_id": agent.session_id})
    );
    let info = sessions.get(&agent.session_id).unwrap();
    assert_eq!(info.hostname.as_deref(), Some("h1"));
    assert_eq!(info.username.as_deref(), Some("u1"));
    assert_eq!(info.os.as_deref(), Some("linux"));
    assert!(info.last_checkin.is_some());
    assert!(sessions.last_active(&agent.session_id).unwrap() > before);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn task_result_and_error_reports_are_acknowledged() {
    let server = start(test_config()).await;
    let mut agent = Agent::connect(&server).await.unwrap();

    let reply = agent
        .request(json!({"type":"task_result","task_id":"t-7","result":"done"}))
        .await
        .unwrap();
    assert_eq!(
        reply,
        json!({"type":"task_result_response","status":"received","task_id":"t-7"})
    );

    let reply = agent
        .request(json!({"type":"error","error_type":"io","message":"disk full"}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"type":"error_response","status":"received"}));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_type_gets_an_error_and_the_session_survives() {
    let server = start(test_config()).await;
    let mut agent = Agent::connect(&server).await.unwrap();

    let reply = agent.request(json!({"type":"bogus"})).await.unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Unknown message type: bogus");

    let reply = agent
        .request(json!({"type":"checkin","hostname":"h","username":"u","os":"o"}))
        .await
        .unwrap();
    assert_eq!(reply["type"], "checkin_response");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn non_object_plaintext_is_an_invalid_message() {
    let server = start(test_config()).await;
    let mut agent = Agent::connect(&server).await.unwrap();

    let frame = agent.crypto.encrypt(b"[1,2,3]").unwrap();
    agent.send_raw(frame).await.unwrap();
    let reply = agent.recv().await.unwrap().unwrap();
    assert_eq!(reply, json!({"type":"error","message":"Invalid message"}));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn messages_are_answered_in_arrival_order() {
    let server = start(test_config()).await;
    let mut agent = Agent::connect(&server).await.unwrap();

    for i in 0..20 {
        agent
            .send(&json!({"type":"task_result","task_id": format!("t-{i}"),"result": i}))
            .await
            .unwrap();
    }
    for i in 0..20 {
        let reply = agent.recv().await.unwrap().unwrap();
        assert_eq!(reply["task_id"], format!("t-{i}"));
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn broadcast_reaches_every_session() {
    let server = start(test_config()).await;
    let mut a = Agent::connect(&server).await.unwrap();
    let mut b = Agent::connect(&server).await.unwrap();

    let delivered = server.sessions().broadcast(&json!({"type":"task","cmd":"whoami"})).await;
    assert_eq!(delivered, 2);

    for agent in [&mut a, &mut b] {
        let message = agent.recv().await.unwrap().unwrap();
        assert_eq!(message["cmd"], "whoami");
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn binary_frame_in_session_is_an_invalid_message() {
    let server = start(test_config()).await;
    let mut agent = Agent::connect(&server).await.unwrap();

    agent.ws.send(Message::binary(vec![0xde, 0xad])).await.unwrap();
    let reply = agent.recv().await.unwrap().expect("server answers");
    assert_eq!(reply, json!({"type":"error","message":"Invalid message"}));

    let reply = agent
        .request(json!({"type":"checkin","hostname":"h1","username":"u1","os":"linux"}))
        .await
        .unwrap();
    assert_eq!(reply["type"], "checkin_response");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn task_results_are_kept_until_the_session_closes() {
    let server = start(test_config()).await;
    let mut agent = Agent::connect(&server).await.unwrap();
    let mut other = Agent::connect(&server).await.unwrap();

    agent
        .request(json!({"type":"task_result","task_id":"t-1","result":"uid=0(root)"}))
        .await
        .unwrap();
    other
        .request(json!({"type":"task_result","task_id":"t-2","result":"ok"}))
        .await
        .unwrap();

    let results = server.task_results();
    let mine = results.for_session(&agent.session_id);
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].task_id, "t-1");
    assert_eq!(mine[0].result, json!("uid=0(root)"));

    let resp = reqwest::get(format!(
        "http://{}/api/sessions/{}/results",
        server.local_addr(),
        agent.session_id
    ))
    .await
    .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body[0]["task_id"], "t-1");

    let closed_id = agent.session_id.clone();
    drop(agent);
    assert!(
        eventually(Duration::from_secs(3), || results.for_session(&closed_id).is_empty()).await,
        "results go away with their session"
    );
    assert_eq!(results.for_session(&other.session_id).len(), 1);

    server.stop().await.unwrap();
}
