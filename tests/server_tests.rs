mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use batchload::server::router;
use batchload::storage::memory::MemoryStore;
use batchload::storage::ConfigStore;
use common::*;
use std::sync::Arc;
use tower::ServiceExt;

async fn app(max_entries: u32) -> Router {
    let store = Arc::new(MemoryStore::new());
    store
        .put(&load_config(max_entries, vec![destination("db", "events")]))
        .await
        .unwrap();
    router(handler_with(
        store,
        ScriptedExecutor::default(),
        RecordingNotifier::default(),
        fast_retry(10),
    ))
}

fn event_body(key: &str, event_name: &str) -> Body {
    Body::from(
        serde_json::to_vec(&serde_json::json!({
            "Records": [{
                "eventSource": "aws:s3",
                "eventName": event_name,
                "s3": {
                    "s3SchemaVersion": "1.0",
                    "bucket": { "name": "bucket" },
                    "object": { "key": key }
                }
            }]
        }))
        .unwrap(),
    )
}

fn post_event(key: &str, event_name: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/events")
        .header("content-type", "application/json")
        .body(event_body(key, event_name))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = app(10).await;
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["status"], "ok");
}

#[tokio::test]
async fn test_event_is_accepted_and_visible_as_open_batch() {
    let app = app(10).await;

    let response = app
        .clone()
        .oneshot(post_event("in/a.csv", "ObjectCreated:Put"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["disposition"], "accepted");
    assert_eq!(body["file_id"], "bucket/in/a.csv");
    assert_eq!(body["flush"]["outcome"], "not_due");

    let response = app.clone().oneshot(get("/batches?status=open")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["batches"].as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(get("/batches/batch-0?prefix=bucket%2Fin"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["status"], "open");
    assert_eq!(body["entries"][0], "bucket/in/a.csv");

    let response = app
        .oneshot(get("/batches/missing?prefix=bucket%2Fin"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unsupported_event_is_bad_request() {
    let app = app(10).await;
    let response = app
        .oneshot(post_event("in/a.csv", "ObjectRemoved:Delete"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    assert!(body["error"].as_str().unwrap().contains("ObjectRemoved:Delete"));
}

#[tokio::test]
async fn test_unknown_status_filter_is_bad_request() {
    let app = app(10).await;
    let response = app.oneshot(get("/batches?status=closed")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_flush_endpoint() {
    let app = app(10).await;

    let flush = |prefix: &str| {
        Request::builder()
            .method("POST")
            .uri(format!("/prefixes/{}/flush", prefix))
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(flush("bucket%2Fin")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["outcome"], "no_batch");

    let response = app.oneshot(flush("bucket%2Fother")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
