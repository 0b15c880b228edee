//! End-to-end tests against a live gateway: HTTP session lifecycle plus the
//! WebSocket log stream.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use shadowbox::config::Config;
use shadowbox::gateway::{router, AppState};
use shadowbox::runner::ExecutionResult;

const TOKEN: &str = "integration-test-token";

async fn spawn_server(mutate: impl FnOnce(&mut Config)) -> String {
    let mut config = Config::default();
    config.runner.cleanup_grace_secs = 0;
    mutate(&mut config);

    let state = AppState::new(config);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn post(addr: &str, path: &str, body: Value) -> (u16, Value) {
    let response = client()
        .post(format!("http://{}{}", addr, path))
        .header("X-Shadow-Token", TOKEN)
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

async fn get(addr: &str, path: &str) -> (u16, Value) {
    let response = client()
        .get(format!("http://{}{}", addr, path))
        .header("X-Shadow-Token", TOKEN)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

async fn init_session(addr: &str) -> String {
    let (status, body) = post(
        addr,
        "/api/v1/session/init",
        json!({"workspace_path": "/tmp/ws", "metadata": {"client": "test"}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], json!(true));
    body["data"]["session_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn requests_without_a_token_are_unauthorized() {
    let addr = spawn_server(|_| {}).await;

    let response = client()
        .get(format!("http://{}/api/v1/session/list", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["error"], json!("Missing auth token"));
}

#[tokio::test]
async fn short_tokens_are_rejected() {
    let addr = spawn_server(|_| {}).await;

    let response = client()
        .get(format!("http://{}/api/v1/session/list", addr))
        .header("X-Shadow-Token", "short")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn init_sync_get_round_trip() {
    let addr = spawn_server(|_| {}).await;
    let session_id = init_session(&addr).await;

    let (status, body) = post(
        &addr,
        "/api/v1/session/sync",
        json!({"session_id": session_id.clone(), "snapshot": {"a.txt": "1"}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], json!("synced"));

    let (status, body) = get(&addr, &format!("/api/v1/session/{}", session_id)).await;
    assert_eq!(status, 200);
    let session = &body["data"];
    assert_eq!(session["state"]["a.txt"], json!("1"));
    assert_eq!(session["version"], json!(2));
    assert_eq!(session["status"], json!("synced"));
    assert_eq!(session["metadata"]["client"], json!("test"));

    let (status, body) = get(&addr, "/api/v1/session/list").await;
    assert_eq!(status, 200);
    let expected_id = json!(session_id);
    let sessions = body["data"]["sessions"].as_array().unwrap();
    assert!(sessions.iter().any(|s| s["id"] == expected_id));
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let addr = spawn_server(|_| {}).await;

    let (status, body) = get(&addr, "/api/v1/session/deadbeef").await;
    assert_eq!(status, 404);
    assert_eq!(body["success"], json!(false));

    let (status, _) = post(
        &addr,
        "/api/v1/session/execute",
        json!({"session_id": "deadbeef", "command": "true"}),
    )
    .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn malformed_bodies_are_bad_requests() {
    let addr = spawn_server(|_| {}).await;

    let response = client()
        .post(format!("http://{}/api/v1/session/sync", addr))
        .header("X-Shadow-Token", TOKEN)
        .header("Content-Type", "application/json")
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn queued_sync_is_applied_by_the_worker_pool() {
    let addr = spawn_server(|_| {}).await;
    let session_id = init_session(&addr).await;

    let (status, body) = post(
        &addr,
        "/api/v1/session/sync",
        json!({"session_id": session_id.clone(), "delta": {"queued.txt": "yes"}, "queued": true}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], json!("queued"));

    for _ in 0..50 {
        let (_, body) = get(&addr, &format!("/api/v1/session/{}", session_id)).await;
        if body["data"]["state"]["queued.txt"] == json!("yes") {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("queued sync was never applied");
}

#[tokio::test]
async fn stale_expected_version_is_a_conflict() {
    let addr = spawn_server(|_| {}).await;
    let session_id = init_session(&addr).await;

    let (status, _) = post(
        &addr,
        "/api/v1/session/sync",
        json!({"session_id": session_id.clone(), "delta": {"a.txt": "1"}, "expected_version": 1}),
    )
    .await;
    assert_eq!(status, 200);

    let (status, body) = post(
        &addr,
        "/api/v1/session/sync",
        json!({"session_id": session_id.clone(), "delta": {"a.txt": "2"}, "expected_version": 1}),
    )
    .await;
    assert_eq!(status, 409);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn execute_streams_an_execution_result_over_websocket() {
    let addr = spawn_server(|_| {}).await;
    let session_id = init_session(&addr).await;

    let (status, _) = post(
        &addr,
        "/api/v1/session/sync",
        json!({"session_id": session_id.clone(), "snapshot": {"note.txt": "hello"}}),
    )
    .await;
    assert_eq!(status, 200);

    // Attach before requesting execution so nothing is missed (no replay).
    let (mut socket, _) = connect_async(format!("ws://{}/ws/logs/{}", addr, session_id))
        .await
        .unwrap();

    let (status, body) = post(
        &addr,
        "/api/v1/session/execute",
        json!({"session_id": session_id.clone(), "command": "cat note.txt; exit 7"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], json!("executing"));

    let result = timeout(Duration::from_secs(15), async {
        loop {
            let frame = socket.next().await.expect("stream ended").unwrap();
            let Message::Text(text) = frame else { continue };
            let entry: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(entry["session_id"].as_str(), Some(session_id.as_str()));
            let message = entry["message"].as_str().unwrap();
            if let Ok(result) = serde_json::from_str::<ExecutionResult>(message) {
                break result;
            }
        }
    })
    .await
    .expect("no execution result observed");

    assert_eq!(result.exit_code, 7);
    assert!(result.output.contains("hello"));
}

#[tokio::test]
async fn admission_ceiling_is_a_conflict() {
    let addr = spawn_server(|config| config.runner.max_concurrent = 1).await;
    let first = init_session(&addr).await;
    let second = init_session(&addr).await;

    let (status, _) = post(
        &addr,
        "/api/v1/session/execute",
        json!({"session_id": first, "command": "sleep 5"}),
    )
    .await;
    assert_eq!(status, 200);

    let (status, body) = post(
        &addr,
        "/api/v1/session/execute",
        json!({"session_id": second, "command": "true"}),
    )
    .await;
    assert_eq!(status, 409);
    assert_eq!(body["success"], json!(false));
}
