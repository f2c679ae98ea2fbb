//! HTTP surface smoke tests against the mock backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use lg_domain::config::{Config, EngineOptions, ModelConfig};
use lg_domain::function::FunctionMap;
use lg_domain::sampling::SamplingParams;
use lg_gateway::api;
use lg_gateway::bootstrap;
use lg_runtime::mock::MockRuntime;

fn test_router(dir: &Path) -> axum::Router {
    let file = dir.join("m.gguf");
    std::fs::write(&file, b"weights").unwrap();

    let mut config = Config::default();
    config.pool.models_dir = Some(dir.to_path_buf());
    config.models.insert(
        "m".into(),
        ModelConfig {
            file,
            url: None,
            context_size: 2048,
            engine: EngineOptions::default(),
            grammars: HashMap::new(),
            preload: None,
            completion_defaults: SamplingParams::default(),
            functions: FunctionMap::new(),
        },
    );

    let state = bootstrap::build_app_state(Arc::new(config), Arc::new(MockRuntime::new())).unwrap();
    api::router(state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn chat_round_trips_json() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "m",
                "messages": [{ "role": "user", "content": "ping" }]
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["content"], "echo: ping");
    assert_eq!(body["finish_reason"], "eogToken");
    assert!(body["usage"]["prompt_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn unknown_model_maps_to_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "ghost",
                "messages": [{ "role": "user", "content": "ping" }]
            })
            .to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn completion_round_trips_json() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/completion")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "model": "m", "prompt": "tell me a story" }).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["text"], "mock completion");
}

#[tokio::test]
async fn embeddings_accept_heterogeneous_input() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let request = Request::builder()
        .method("POST")
        .uri("/v1/embeddings")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "model": "m", "input": ["hello world", 7, "bye"] }).to_string(),
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["embeddings"].as_array().unwrap().len(), 2);
    assert_eq!(body["usage"]["prompt_tokens"], 3);
}

#[tokio::test]
async fn status_reports_slots_after_a_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let chat = Request::builder()
        .method("POST")
        .uri("/v1/chat")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "model": "m",
                "messages": [{ "role": "user", "content": "warm me up" }]
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(chat).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let status = Request::builder()
        .method("GET")
        .uri("/v1/status")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(status).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["queue_depth"], 0);
    assert_eq!(body["in_flight"], 0);
    let slots = body["models"]["m"].as_array().unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0]["state"], "idle");
    assert!(slots[0]["fingerprint"].is_string());
}
