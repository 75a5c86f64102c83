//! HTTP admin surface, driven through the router with `tower::oneshot`.

mod common;

use common::{ASSESS_SIMPLE, registry_with_replies, test_config};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::Value;
use taskweft::gateway::StaticModel;
use taskweft::memory::InMemoryRecallIndex;
use taskweft::storage::{InMemoryArchive, InMemoryDurableLog};
use taskweft::transport::{SessionRegistry, SharedServices, router};
use tower::ServiceExt;

async fn send(app: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn session_crud_flow() {
    let registry = registry_with_replies(&[ASSESS_SIMPLE, "pong"]);
    let app = router(registry);

    // Create.
    let (status, created) = send(
        app.clone(),
        post_json("/api/sessions", serde_json::json!({"title": "demo"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["title"], "demo");
    assert_eq!(created["messageCount"], 0);
    let session_id = created["sessionId"].as_str().unwrap().to_string();

    // List and fetch.
    let (status, listed) = send(app.clone(), get("/api/sessions")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);
    let (status, fetched) = send(app.clone(), get(&format!("/api/sessions/{session_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["sessionId"], session_id.as_str());

    // Rename.
    let (status, _) = send(
        app.clone(),
        Request::builder()
            .method("PATCH")
            .uri(format!("/api/sessions/{session_id}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"title": "renamed"}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Delete, then 404.
    let (status, _) = send(
        app.clone(),
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/sessions/{session_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(app, get(&format!("/api/sessions/{session_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chat_and_history_round_trip() {
    let registry = registry_with_replies(&[ASSESS_SIMPLE, "pong"]);
    let app = router(registry);

    let (status, reply) = send(
        app.clone(),
        post_json(
            "/api/chat?session_id=sess_http",
            serde_json::json!({"message": "ping"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["response"], "pong");

    let (status, history) = send(app, get("/api/history?session_id=sess_http")).await;
    assert_eq!(status, StatusCode::OK);
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["content"], "ping");
    assert_eq!(messages[1]["content"], "pong");
}

#[tokio::test]
async fn missing_session_id_is_a_400() {
    let registry = registry_with_replies(&[ASSESS_SIMPLE]);
    let app = router(registry);
    let (status, body) = send(
        app,
        post_json("/api/chat", serde_json::json!({"message": "hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("session id"));
}

#[tokio::test]
async fn header_session_id_wins_over_query() {
    let registry = registry_with_replies(&[ASSESS_SIMPLE, "pong"]);
    let app = router(registry.clone());
    let (status, _) = send(
        app,
        Request::builder()
            .method("POST")
            .uri("/api/chat?session_id=from_query")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-session-id", "from_header")
            .body(Body::from(r#"{"message": "hello"}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(registry.get("from_header").await.is_some());
    assert!(registry.get("from_query").await.is_none());
}

#[tokio::test]
async fn auth_is_enforced_when_configured() {
    let mut config = test_config();
    config.api_key = Some("secret-token".to_string());
    let registry = SessionRegistry::new(SharedServices {
        config,
        provider: Arc::new(StaticModel::always("ok")),
        archive: Arc::new(InMemoryArchive::new()),
        log: Arc::new(InMemoryDurableLog::new()),
        index: Arc::new(InMemoryRecallIndex::new()),
    });
    let app = router(registry);

    let (status, _) = send(app.clone(), get("/api/sessions")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        app.clone(),
        Request::builder()
            .uri("/api/sessions")
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        app,
        Request::builder()
            .uri("/api/sessions")
            .header(header::AUTHORIZATION, "Bearer secret-token")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn status_reports_coordinator_and_breaker() {
    let registry = registry_with_replies(&[ASSESS_SIMPLE, "pong"]);
    let app = router(registry);

    let (_, _) = send(
        app.clone(),
        post_json(
            "/api/chat?session_id=sess_diag",
            serde_json::json!({"message": "ping"}),
        ),
    )
    .await;

    let (status, diagnostics) = send(app, get("/api/status?session_id=sess_diag")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(diagnostics["circuitBreaker"], "closed");
    assert!(diagnostics["coordinator"]["layers"].is_array());
    assert!(diagnostics["board"].is_null());
    assert!(diagnostics["events"]["capacity"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn memory_stats_and_clear() {
    let registry = registry_with_replies(&[ASSESS_SIMPLE, "pong"]);
    let app = router(registry.clone());

    let (_, _) = send(
        app.clone(),
        post_json(
            "/api/chat?session_id=sess_mem",
            serde_json::json!({"message": "remember the database password policy"}),
        ),
    )
    .await;
    // Force the fan-out so the memory tier has both messages.
    let (status, _) = send(app.clone(), post_json("/api/sync?session_id=sess_mem", serde_json::json!({}))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, stats) = send(app.clone(), get("/api/memory/stats?session_id=sess_mem")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["sessionMemories"], 2);
    assert_eq!(stats["totalMemories"], 2);

    let (status, search) = send(
        app.clone(),
        post_json(
            "/api/memory/search?session_id=sess_mem",
            serde_json::json!({"query": "remember the database password policy", "topK": 2}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!search["results"].as_array().unwrap().is_empty());

    let (status, cleared) = send(
        app.clone(),
        post_json("/api/clear?session_id=sess_mem", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["ok"], true);

    let (_, stats) = send(app, get("/api/memory/stats?session_id=sess_mem")).await;
    assert_eq!(stats["totalMemories"], 0);
}

#[tokio::test]
async fn tasks_status_suggests_new_without_a_board() {
    let registry = registry_with_replies(&[ASSESS_SIMPLE]);
    let app = router(registry);
    let (status, context) = send(app, get("/api/tasks/status?session_id=sess_t")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(context["hasActiveBoard"], false);
    assert_eq!(context["suggestedAction"], "new");
}
