use std::time::Duration;

use serde_json::{json, Value};

use crate::*;

async fn api_get(server: &TeamServer, path: &str) -> (u16, Value) {
    let resp = reqwest::get(format!("http://{}/api{}", server.local_addr(), path))
        .await
        .expect("status API reachable");
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap();
    (status, serde_json::from_str(&body).unwrap_or(Value::String(body)))
}

#[tokio::test]
async fn health_turns_true_once_both_loops_run() {
    let server = start(test_config()).await;
    assert!(eventually(Duration::from_secs(3), || server.is_healthy()).await);

    let (status, body) = api_get(&server, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["active_sessions"], 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn sessions_endpoint_reflects_checkins() {
    let server = start(test_config()).await;
    let mut agent = Agent::connect(&server).await.unwrap();
    agent
        .request(json!({"type":"checkin","hostname":"web-01","username":"svc","os":"linux"}))
        .await
        .unwrap();

    let (status, body) = api_get(&server, "/sessions").await;
    assert_eq!(status, 200);
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], agent.session_id.as_str());
    assert_eq!(list[0]["hostname"], "web-01");

    let (status, one) = api_get(&server, &format!("/sessions/{}", agent.session_id)).await;
    assert_eq!(status, 200);
    assert_eq!(one["username"], "svc");

    let (status, _) = api_get(&server, "/sessions/does-not-exist").await;
    assert_eq!(status, 404);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn lifecycle_counters_follow_connects_and_disconnects() {
    let server = start(test_config()).await;
    let agent = Agent::connect(&server).await.unwrap();
    drop(agent);

    let mut counted = false;
    for _ in 0..100 {
        let (_, body) = api_get(&server, "/health").await;
        if body["connects"] == 1 && body["disconnects"] == 1 {
            counted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert!(counted, "connect and disconnect were both counted");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn stopped_server_releases_its_listener() {
    let server = start(test_config()).await;
    assert!(eventually(Duration::from_secs(3), || server.is_healthy()).await);
    let addr = server.local_addr();
    server.stop().await.unwrap();

    assert!(reqwest::get(format!("http://{addr}/api/health")).await.is_err());
}

#[tokio::test]
async fn panicking_subscription_does_not_make_the_server_unhealthy() {
    let server = TeamServer::builder(test_config())
        .subscribe(
            "operator_note",
            std::sync::Arc::new(FnTopicHandler(|payload: Value| async move {
                if payload["boom"] == true {
                    panic!("subscriber bug");
                }
            })),
        )
        .start()
        .await
        .unwrap();
    assert!(eventually(Duration::from_secs(3), || server.is_healthy()).await);

    server.bus().publish("operator_note", &json!({"boom": true}));
    // Two health intervals: a dead bus would have flipped the flag by now.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(server.is_healthy());

    // Lifecycle subscriptions still run on the same bus.
    let agent = Agent::connect(&server).await.unwrap();
    drop(agent);
    let mut counted = false;
    for _ in 0..100 {
        let (_, body) = api_get(&server, "/health").await;
        if body["healthy"] == true && body["connects"] == 1 && body["disconnects"] == 1 {
            counted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert!(counted, "bus kept dispatching after the panic");

    server.stop().await.unwrap();
}
