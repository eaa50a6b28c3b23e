//! Integration tests for the API layer.
//!
//! These tests spin up a real HTTP server on a random port, backed by the
//! in-memory stores, the keyword extractor and the hashing embedder.

use std::sync::Arc;

use homecare_api::{build_coordinator, create_router, AppState, ServiceConfig};
use serde_json::{json, Value};

/// Spin up a test server on a random port and return the base URL.
async fn start_test_server() -> String {
    let mut config = ServiceConfig::default();
    config.llm.provider = "keyword".to_string();
    config.embedding.provider = "hashing".to_string();
    config.embedding.dimension = 128;
    config.memory.embedding_dimension = 128;

    let coordinator = build_coordinator(&config).await.unwrap();
    let state = Arc::new(AppState::new(Arc::new(coordinator)));
    let router = create_router(state, &[]);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    format!("http://{}", addr)
}

/// Helper to GET a URL and return (status, body).
async fn get(base: &str, path: &str) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .get(format!("{}{}", base, path))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let body = resp.json().await.unwrap_or(Value::Null);
    (status, body)
}

/// Helper to send JSON with any method and return (status, body).
async fn send_json(method: reqwest::Method, base: &str, path: &str, body: &Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .request(method, format!("{}{}", base, path))
        .json(body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    let body = resp.json().await.unwrap_or(Value::Null);
    (status, body)
}

async fn post_json(base: &str, path: &str, body: Value) -> (u16, Value) {
    send_json(reqwest::Method::POST, base, path, &body).await
}

async fn ingest(base: &str, patient_id: &str, conversation: &[&str]) -> Value {
    let (status, body) = post_json(
        base,
        "/api/v1/memories",
        json!({"patient_id": patient_id, "conversation": conversation}),
    )
    .await;
    assert_eq!(status, 201, "{body}");
    body
}

// ============================================================================
// Health endpoint
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let base = start_test_server().await;
    let (status, body) = get(&base, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "homecare-memory");
}

// ============================================================================
// Ingest and search
// ============================================================================

#[tokio::test]
async fn test_ingest_then_reingest_updates() {
    let base = start_test_server().await;

    let first = ingest(&base, "P1", &["Patient is allergic to penicillin"]).await;
    assert_eq!(first["memories_created"], 1);
    assert_eq!(first["memories_updated"], 0);
    let id = first["memory_ids"][0].as_str().unwrap().to_string();

    let second = ingest(&base, "P1", &["Patient is allergic to penicillin"]).await;
    assert_eq!(second["memories_created"], 0);
    assert_eq!(second["memories_updated"], 1);
    assert_eq!(second["memory_ids"][0], id.as_str());

    let (status, memory) = get(&base, &format!("/api/v1/memories/{id}")).await;
    assert_eq!(status, 200);
    assert_eq!(memory["category"], "allergy");
    assert_eq!(memory["priority"], "critical");
}

#[tokio::test]
async fn test_search_returns_critical_first() {
    let base = start_test_server().await;
    ingest(
        &base,
        "P1",
        &[
            "Allergic to penicillin",
            "Likes penicillin shaped cookies",
            "Enjoys the garden in spring",
        ],
    )
    .await;

    let (status, body) = post_json(
        &base,
        "/api/v1/memories/search",
        json!({"patient_id": "P1", "query": "penicillin"}),
    )
    .await;
    assert_eq!(status, 200);
    let results = body["results"].as_array().unwrap();
    assert_eq!(body["total"], results.len());
    assert!(!results.is_empty() && results.len() <= 3);
    assert_eq!(results[0]["memory"]["category"], "allergy");
    assert!(results[0]["relevance_score"].as_f64().unwrap() <= 1.0);
}

#[tokio::test]
async fn test_search_category_filter_and_isolation() {
    let base = start_test_server().await;
    ingest(&base, "P1", &["Prefers decaf coffee", "Allergic to shellfish"]).await;
    ingest(&base, "P2", &["Prefers decaf coffee"]).await;

    let (status, body) = post_json(
        &base,
        "/api/v1/memories/search",
        json!({"patient_id": "P1", "query": "decaf coffee", "limit": 10, "category_filter": "preference"}),
    )
    .await;
    assert_eq!(status, 200);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["memory"]["patient_id"], "P1");
    assert_eq!(results[0]["memory"]["category"], "preference");
}

// ============================================================================
// Validation and errors
// ============================================================================

#[tokio::test]
async fn test_validation_errors() {
    let base = start_test_server().await;

    let (status, body) = post_json(
        &base,
        "/api/v1/memories",
        json!({"patient_id": "", "conversation": ["hello"]}),
    )
    .await;
    assert_eq!(status, 422);
    assert_eq!(body["code"], "VALIDATION_FAILURE");

    let (status, _) = post_json(
        &base,
        "/api/v1/memories/search",
        json!({"patient_id": "P1", "query": "x", "limit": 11}),
    )
    .await;
    assert_eq!(status, 422);

    let (status, body) = post_json(
        &base,
        "/api/v1/memories/search",
        json!({"patient_id": "P1", "query": "x", "category_filter": "hobby"}),
    )
    .await;
    assert_eq!(status, 422);
    assert_eq!(body["code"], "VALIDATION_FAILURE");

    let (status, _) = get(&base, "/api/v1/memories/not-a-uuid").await;
    assert_eq!(status, 422);
}

#[tokio::test]
async fn test_content_bounds_in_conversation() {
    let base = start_test_server().await;
    let exact = "a".repeat(2000);
    let over = "b".repeat(2001);

    let body = ingest(&base, "P1", &[exact.as_str(), over.as_str()]).await;
    assert_eq!(body["memories_created"], 1);
    let failures = body["failures"].as_array().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["index"], 1);
    assert_eq!(failures[0]["code"], "VALIDATION_FAILURE");
}

#[tokio::test]
async fn test_unknown_memory_is_not_found() {
    let base = start_test_server().await;
    let id = uuid::Uuid::new_v4();

    let (status, body) = get(&base, &format!("/api/v1/memories/{id}")).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send_json(
        reqwest::Method::DELETE,
        &base,
        &format!("/api/v1/memories/{id}"),
        &Value::Null,
    )
    .await;
    assert_eq!(status, 404);
}

// ============================================================================
// Update, delete and summary
// ============================================================================

#[tokio::test]
async fn test_update_delete_and_summary() {
    let base = start_test_server().await;
    let body = ingest(
        &base,
        "P1",
        &["Takes 10mg lisinopril every morning", "Seemed tired after lunch"],
    )
    .await;
    let medication = body["memory_ids"][0].as_str().unwrap().to_string();
    let observation = body["memory_ids"][1].as_str().unwrap().to_string();

    let (status, updated) = send_json(
        reqwest::Method::PATCH,
        &base,
        &format!("/api/v1/memories/{medication}"),
        &json!({"content": "Takes 20mg lisinopril every morning", "metadata": {"prescriber": "Dr. Osei"}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(updated["content"], "Takes 20mg lisinopril every morning");
    assert_eq!(updated["metadata"]["prescriber"], "Dr. Osei");

    let (status, summary) = get(&base, "/api/v1/patients/P1/summary").await;
    assert_eq!(status, 200);
    assert_eq!(summary["total_memories"], 2);
    assert_eq!(summary["critical_memories"], 1);
    assert_eq!(summary["memories_by_category"]["medication"], 1);
    assert_eq!(summary["memories_by_category"]["allergy"], 0);
    assert_eq!(summary["recent_observations"].as_array().unwrap().len(), 1);

    let (status, _) = send_json(
        reqwest::Method::DELETE,
        &base,
        &format!("/api/v1/memories/{observation}"),
        &Value::Null,
    )
    .await;
    assert_eq!(status, 204);

    // idempotent
    let (status, _) = send_json(
        reqwest::Method::DELETE,
        &base,
        &format!("/api/v1/memories/{observation}"),
        &Value::Null,
    )
    .await;
    assert_eq!(status, 204);

    let (status, _) = get(&base, &format!("/api/v1/memories/{observation}")).await;
    assert_eq!(status, 404);

    let (_, summary) = get(&base, "/api/v1/patients/P1/summary").await;
    assert_eq!(summary["total_memories"], 1);
    assert!(summary["recent_observations"].as_array().unwrap().is_empty());
}
