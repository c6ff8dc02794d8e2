use std::sync::Arc;

use axum_test::TestServer;
use deepdive_api::routes::{CALLER_HEADER, build_router};
use deepdive_api::state::AppState;
use deepdive_core::{
    DriverSettings, DynKnowledgeStore, InMemoryKnowledgeStore, Providers, ResearchService,
    StepDriver,
};
use serde_json::{Value, json};

fn server() -> TestServer {
    let store: DynKnowledgeStore = Arc::new(InMemoryKnowledgeStore::new());
    let driver = StepDriver::new(store, Providers::stub(), DriverSettings::default());
    let state = AppState::new(ResearchService::new(driver, "stub-model"));
    TestServer::new(build_router(state)).unwrap()
}

async fn create(server: &TestServer, user: &str, topic: &str) -> String {
    let response = server
        .post("/api/sessions")
        .add_header(CALLER_HEADER, user)
        .json(&json!({ "topic": topic }))
        .await;
    assert_eq!(response.status_code(), 201);
    response.json::<Value>()["session_id"]
        .as_str()
        .expect("session id missing")
        .to_string()
}

#[tokio::test]
async fn liveness_probe_answers_without_identity() {
    let server = server();
    let response = server.get("/health/live").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["status"], "ok");
}

#[tokio::test]
async fn requests_without_caller_header_are_rejected() {
    let server = server();
    let response = server
        .post("/api/sessions")
        .json(&json!({ "topic": "tidal power" }))
        .await;
    assert_eq!(response.status_code(), 401);
    assert!(response.json::<Value>()["error"].is_string());
}

#[tokio::test]
async fn blank_topic_is_a_bad_request() {
    let server = server();
    let response = server
        .post("/api/sessions")
        .add_header(CALLER_HEADER, "u1")
        .json(&json!({ "topic": "   " }))
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn triggering_until_completion_yields_a_report() {
    let server = server();
    let id = create(&server, "u1", "tidal power").await;
    let advance_path = format!("/api/sessions/{id}/advance");

    let mut last = Value::Null;
    for _ in 0..20 {
        let response = server
            .post(&advance_path)
            .add_header(CALLER_HEADER, "u1")
            .await;
        assert_eq!(response.status_code(), 200);
        last = response.json::<Value>();
        if last["outcome"] != "continue" {
            break;
        }
    }
    assert_eq!(last["outcome"], "completed");

    let view = server
        .get(&format!("/api/sessions/{id}"))
        .add_header(CALLER_HEADER, "u1")
        .await
        .json::<Value>();
    assert_eq!(view["status"], "completed");
    assert!(view["final_report"].as_str().unwrap().contains("tidal power"));
    assert_eq!(view["plan"].as_array().unwrap().len(), 3);

    let citations = server
        .get(&format!("/api/sessions/{id}/citations"))
        .add_header(CALLER_HEADER, "u1")
        .await
        .json::<Value>();
    let citations = citations["citations"].as_array().unwrap();
    assert_eq!(citations.len(), 9);
    assert_eq!(citations[0]["index"], 1);
}

#[tokio::test]
async fn other_users_cannot_read_or_advance_a_session() {
    let server = server();
    let id = create(&server, "u1", "tidal power").await;

    let response = server
        .get(&format!("/api/sessions/{id}"))
        .add_header(CALLER_HEADER, "u2")
        .await;
    assert_eq!(response.status_code(), 403);

    let response = server
        .post(&format!("/api/sessions/{id}/advance"))
        .add_header(CALLER_HEADER, "u2")
        .await;
    assert_eq!(response.status_code(), 403);

    let response = server
        .get("/api/sessions/does-not-exist")
        .add_header(CALLER_HEADER, "u1")
        .await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn canceled_session_skips_further_steps() {
    let server = server();
    let id = create(&server, "u1", "tidal power").await;

    let response = server
        .post(&format!("/api/sessions/{id}/cancel"))
        .add_header(CALLER_HEADER, "u1")
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["status"], "canceled");

    let response = server
        .post(&format!("/api/sessions/{id}/advance"))
        .add_header(CALLER_HEADER, "u1")
        .await
        .json::<Value>();
    assert_eq!(response["outcome"], "skipped");
    assert_eq!(response["reason"], "terminal");
}
