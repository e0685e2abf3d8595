//! HTTP contract: status codes, error bodies and owner resolution.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::auth::StaticTokenVerifier;
use crate::config::{AuthConfig, TokenEntry};
use crate::web::{router, SharedState};

use super::support::{create_service, DIMS};

const ALICE: &str = "alice-token";
const BOB: &str = "bob-token";

fn create_router() -> (Router, tempfile::TempDir) {
    let (service, _embedder, tmp) = create_service();
    let verifier = StaticTokenVerifier::new(&AuthConfig {
        tokens: vec![
            TokenEntry {
                token: ALICE.to_string(),
                owner_id: "alice".to_string(),
            },
            TokenEntry {
                token: BOB.to_string(),
                owner_id: "bob".to_string(),
            },
        ],
    });
    let state = SharedState::new(Arc::new(service), Arc::new(verifier));
    (router(state), tmp)
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn register(app: &Router, token: &str, id: &str, title: &str) {
    let (status, _) = call(
        app,
        "POST",
        "/api/sources",
        Some(token),
        Some(json!({
            "id": id,
            "title": title,
            "url": format!("https://example.com/{id}"),
            "metadata": { "kind": "webPage" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_requires_valid_bearer_token() {
    let (app, _tmp) = create_router();

    let (status, body) = call(&app, "GET", "/api/stats", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _) = call(&app, "GET", "/api/stats", Some("wrong"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(&app, "GET", "/api/stats", Some(ALICE), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_generate_and_search() {
    let (app, _tmp) = create_router();
    register(&app, ALICE, "s1", "Squat guide").await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/embeddings",
        Some(ALICE),
        Some(json!({ "sourceRefId": "s1", "content": "squat depth and knee position" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sourceRefId"], "s1");
    assert_eq!(body["dimensions"], DIMS);
    assert!(body["embeddingId"].is_string());
    assert!(body["duplicates"].is_null());

    let (status, body) = call(
        &app,
        "POST",
        "/api/search",
        Some(ALICE),
        Some(json!({ "query": "squat depth", "similarityThreshold": 0.5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["sourceRefId"], "s1");
    assert_eq!(body["results"][0]["title"], "Squat guide");
    assert!(body["results"][0].get("content").is_none());
    assert_eq!(body["metadata"]["totalResults"], 1);
    assert!(body["metadata"]["timings"]["embeddingMs"].is_u64());

    // bob sees none of alice's content
    let (status, body) = call(
        &app,
        "POST",
        "/api/search",
        Some(BOB),
        Some(json!({ "query": "squat depth", "similarityThreshold": 0.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"].as_array().unwrap().len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_generate_errors() {
    let (app, _tmp) = create_router();
    register(&app, ALICE, "s1", "Squat guide").await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/embeddings",
        Some(ALICE),
        Some(json!({ "sourceRefId": "s1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "content is required");

    let (status, _) = call(
        &app,
        "POST",
        "/api/embeddings",
        Some(BOB),
        Some(json!({ "sourceRefId": "s1", "content": "squat" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(
        &app,
        "POST",
        "/api/embeddings",
        Some(ALICE),
        Some(json!({ "sourceRefId": "s1", "content": "squat", "taskType": "NOT_A_TASK" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_range_checks() {
    let (app, _tmp) = create_router();

    for payload in [
        json!({ "query": "squat", "similarityThreshold": 1.2 }),
        json!({ "query": "squat", "maxResults": 0 }),
        json!({ "query": "squat", "maxResults": 51 }),
        json!({ "query": "" }),
    ] {
        let (status, body) = call(&app, "POST", "/api/search", Some(ALICE), Some(payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_and_duplicates() {
    let (app, _tmp) = create_router();
    register(&app, ALICE, "s1", "one").await;
    register(&app, ALICE, "s2", "two").await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/embeddings/batch",
        Some(ALICE),
        Some(json!({ "items": [
            { "sourceRefId": "s1", "content": "deadlift form guide" },
            { "sourceRefId": "s2", "content": "deadlift form guide", "checkDuplicates": true },
            { "sourceRefId": "s3", "content": "nope" }
        ]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["status"], "ok");
    assert_eq!(results[1]["status"], "ok");
    assert_eq!(results[2]["status"], "error");

    let (status, body) = call(
        &app,
        "POST",
        "/api/duplicates",
        Some(ALICE),
        Some(json!({ "content": "deadlift form guide" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let dups = body.as_array().unwrap();
    assert_eq!(dups.len(), 2);
    assert!(dups.iter().all(|d| d["isExactDuplicate"] == true));

    let (status, _) = call(
        &app,
        "POST",
        "/api/embeddings/batch",
        Some(ALICE),
        Some(json!({ "items": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cluster_and_deletes() {
    let (app, _tmp) = create_router();
    register(&app, ALICE, "s1", "one").await;
    register(&app, ALICE, "s2", "two").await;
    for (id, content) in [("s1", "squat"), ("s2", "bread")] {
        let (status, _) = call(
            &app,
            "POST",
            "/api/embeddings",
            Some(ALICE),
            Some(json!({ "sourceRefId": id, "content": content })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = call(&app, "POST", "/api/cluster", Some(ALICE), Some(json!({ "k": 3 }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].is_string());

    let (status, body) = call(&app, "POST", "/api/cluster", Some(ALICE), Some(json!({ "k": 2 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, body) = call(&app, "DELETE", "/api/embeddings/s2", Some(ALICE), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["embeddingsRemoved"], 1);

    let (status, _) = call(&app, "DELETE", "/api/sources/s1", Some(BOB), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, "DELETE", "/api/sources/s1", Some(ALICE), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["embeddingsRemoved"], 1);

    let (_, body) = call(&app, "GET", "/api/stats", Some(ALICE), None).await;
    assert_eq!(body["count"], 0);

    let (status, body) = call(&app, "GET", "/api/sources", Some(ALICE), None).await;
    assert_eq!(status, StatusCode::OK);
    let remaining = body.as_array().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0]["id"], "s2");
    assert_eq!(remaining[0]["metadata"]["kind"], "webPage");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_source_rejected() {
    let (app, _tmp) = create_router();
    let (status, body) = call(
        &app,
        "POST",
        "/api/sources",
        Some(ALICE),
        Some(json!({ "title": "x", "url": "not a url" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid url"));
}
