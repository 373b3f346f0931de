//! Direct reads from a table without views.

use engine_core::{QueryContext, Value};
use integration_tests::fixtures;
use integration_tests::setup::{wait_until, TestContext};
use std::time::Duration;
use storage_nats::StorageNats;

/// Reads until `expected` rows arrived, opening new sources as the old ones
/// finish on an empty queue.
async fn read_rows(storage: &StorageNats, columns: &[&str], expected: usize) -> Vec<Vec<Value>> {
    let mut rows = Vec::new();
    for _ in 0..200 {
        let mut sources = storage
            .read(columns, &QueryContext::allow_direct_select())
            .await
            .expect("read failed");
        for source in &mut sources {
            while let Some(block) = source.generate().await.expect("generate failed") {
                assert_eq!(block.columns, columns);
                rows.extend(block.rows);
            }
        }
        if rows.len() >= expected {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    rows
}

/// Direct select is refused unless the session allows it.
#[tokio::test]
async fn test_direct_select_requires_setting() {
    let ctx = TestContext::without_views().await;

    let err = ctx
        .storage
        .read(&["key"], &QueryContext::default())
        .await
        .err()
        .expect("read should be refused");
    assert_eq!(err.code(), "QUERY_NOT_ALLOWED");
    assert!(err.to_string().contains("stream_like_engine_allow_direct_select"));

    ctx.shutdown().await;
}

/// Rows come back in the requested column order, with the subject.
#[tokio::test]
async fn test_direct_read_projects_columns() {
    let ctx = TestContext::without_views().await;
    ctx.broker.inject("events.a", fixtures::json_message(1, "x"));
    ctx.broker.inject("events.b", fixtures::json_message(2, "y"));

    let mut rows = read_rows(&ctx.storage, &["_subject", "key"], 2).await;
    rows.sort_by_key(|row| row[0].as_str().map(str::to_string));

    assert_eq!(
        rows,
        vec![
            vec![Value::String("events.a".into()), Value::UInt(1)],
            vec![Value::String("events.b".into()), Value::UInt(2)],
        ]
    );
    assert_eq!(ctx.storage.context().readers(), 0);

    ctx.shutdown().await;
}

/// Unknown columns are rejected before any consumer is leased.
#[tokio::test]
async fn test_direct_read_unknown_column() {
    let ctx = TestContext::without_views().await;

    let err = ctx
        .storage
        .read(&["missing"], &QueryContext::allow_direct_select())
        .await
        .err()
        .expect("read should fail");
    assert_eq!(err.code(), "BAD_ARGUMENTS");
    assert_eq!(ctx.storage.pool().free(), 1);

    ctx.shutdown().await;
}

/// A read on a lost connection reconnects, or fails when the server
/// refuses.
#[tokio::test]
async fn test_direct_read_reconnects() {
    let ctx = TestContext::without_views().await;

    ctx.broker.set_refuse_connections(true);
    ctx.broker.drop_connection();

    let err = ctx
        .storage
        .read(&["key"], &QueryContext::allow_direct_select())
        .await
        .err()
        .expect("read should fail while disconnected");
    assert_eq!(err.code(), "CANNOT_CONNECT_NATS");

    ctx.broker.set_refuse_connections(false);
    ctx.broker.inject("events.a", fixtures::json_message(5, "back"));

    let rows = read_rows(&ctx.storage, &["key", "value"], 1).await;
    assert_eq!(rows, vec![vec![Value::UInt(5), Value::String("back".into())]]);
    assert!(ctx.storage.connection().is_connected());

    ctx.shutdown().await;
}

/// The loop started for direct reads keeps running while any reader is
/// alive and stops after the last one is dropped.
#[tokio::test]
async fn test_loop_stops_after_last_reader() {
    let ctx = TestContext::with_settings(fixtures::settings("events.>", 2), false).await;

    let mut sources = ctx
        .storage
        .read(&["key"], &QueryContext::allow_direct_select())
        .await
        .expect("read failed");
    assert_eq!(sources.len(), 2);
    assert_eq!(ctx.storage.context().readers(), 2);

    let handler = ctx.storage.context().handler();
    assert!(wait_until(Duration::from_secs(10), || handler.loop_running()).await);

    drop(sources.pop());
    assert_eq!(ctx.storage.context().readers(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(handler.loop_running());

    drop(sources);
    assert_eq!(ctx.storage.context().readers(), 0);
    assert!(wait_until(Duration::from_secs(10), || !handler.loop_running()).await);

    ctx.shutdown().await;
}
