//! Tests for the operator HTTP endpoints.

use axum::http::StatusCode;
use axum_test::TestServer;
use integration_tests::fixtures::{self, keys};
use integration_tests::setup::TestContext;

/// Test /health endpoint returns proper structure
#[tokio::test]
async fn test_health_endpoint_structure() {
    let ctx = TestContext::new().await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    let status = body["status"].as_str().unwrap_or("");
    assert!(
        status == "healthy" || status == "degraded" || status == "unhealthy",
        "unexpected status '{}'",
        status
    );
    assert_eq!(body["nats_connected"], true);
    assert_eq!(body["tables"], 1);

    let components: Vec<&str> = body["components"]
        .as_array()
        .expect("components should be an array")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert_eq!(components, vec!["nats", "streaming"]);

    ctx.shutdown().await;
}

/// Test /ready answers with 200 or 503 and /live always with 200
#[tokio::test]
async fn test_probes() {
    let ctx = TestContext::without_views().await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let ready = server.get("/ready").await.status_code();
    assert!(
        ready == StatusCode::OK || ready == StatusCode::SERVICE_UNAVAILABLE,
        "Ready endpoint should return 200 or 503, got {}",
        ready
    );

    server.get("/live").await.assert_status_ok();

    ctx.shutdown().await;
}

/// Test /metrics exposes the engine counters
#[tokio::test]
async fn test_metrics_endpoint() {
    let ctx = TestContext::without_views().await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server.get("/metrics").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    for field in ["connection_attempts", "messages_received", "streaming_passes", "backoff_ms"] {
        assert!(body.get(field).is_some(), "metrics should have '{}'", field);
    }
    assert!(body["connection_attempts"].as_u64().unwrap_or(0) >= 1);

    ctx.shutdown().await;
}

/// Test /tables lists every table with its consumers
#[tokio::test]
async fn test_tables_status() {
    let ctx = TestContext::with_settings(fixtures::settings("events.>, audit", 3), false).await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server.get("/tables").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    let tables = body.as_array().expect("tables should be an array");
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0]["table"], "default.queue");
    assert_eq!(tables[0]["queue_group"], "default.queue");
    assert_eq!(tables[0]["subjects"], serde_json::json!(["events.>", "audit"]));
    assert_eq!(tables[0]["consumers_created"], 3);
    assert_eq!(tables[0]["connection"], "connected");

    let response = server.get("/tables/default/queue").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["shutdown"], false);

    ctx.shutdown().await;
}

/// Test unknown tables answer 404
#[tokio::test]
async fn test_unknown_table() {
    let ctx = TestContext::without_views().await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server.get("/tables/default/missing").await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "UNKNOWN_TABLE");

    let response = server
        .post("/tables/default/missing/insert")
        .json(&fixtures::insert_payload(&[(1, "a")]))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);

    ctx.shutdown().await;
}

/// Test inserted rows are published and come back through the view
#[tokio::test]
async fn test_insert_loops_back_into_view() {
    let ctx = TestContext::with_settings(fixtures::settings("events", 1), true).await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server
        .post("/tables/default/queue/insert")
        .json(&fixtures::insert_payload(&[(1, "a"), (2, "b"), (3, "c")]))
        .await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["received"], 3);
    assert_eq!(body["published"], 3);

    let published = ctx.broker.published();
    assert_eq!(published.len(), 3);
    assert!(published.iter().all(|(subject, _)| subject == "events"));

    assert_eq!(ctx.wait_for_rows(3).await, 3);
    assert_eq!(keys(&ctx.target_rows()), vec![1, 2, 3]);

    ctx.shutdown().await;
}

/// Test inserts with the wrong columns are rejected
#[tokio::test]
async fn test_insert_column_mismatch() {
    let ctx = TestContext::without_views().await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");

    let response = server
        .post("/tables/default/queue/insert")
        .json(&serde_json::json!({ "columns": ["value"], "rows": [["a"]] }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "BAD_ARGUMENTS");
    assert!(ctx.broker.published().is_empty());

    ctx.shutdown().await;
}

/// Test an insert that publishes nothing answers 503
#[tokio::test]
async fn test_insert_publish_failure() {
    let ctx = TestContext::without_views().await;
    let server = TestServer::new(ctx.router.clone()).expect("Failed to create test server");
    ctx.broker.set_fail_publishes(true);

    let response = server
        .post("/tables/default/queue/insert")
        .json(&fixtures::insert_payload(&[(1, "a"), (2, "b")]))
        .await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);

    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "TRANSPORT_ERROR");
    assert!(ctx.broker.published().is_empty());

    ctx.shutdown().await;
}
