//! Messages flowing from the broker into materialized views.

use engine_core::Value;
use integration_tests::fixtures::{self, keys};
use integration_tests::setup::TestContext;

/// Messages on matching subjects reach the view with their subject.
#[tokio::test]
async fn test_messages_reach_view() {
    let ctx = TestContext::new().await;

    ctx.inject_all("events.click", &fixtures::json_messages(3));
    ctx.inject_all("events.view", &[fixtures::json_message(3, "value-3")]);

    assert_eq!(ctx.wait_for_rows(4).await, 4);

    let rows = ctx.target_rows();
    assert_eq!(keys(&rows), vec![0, 1, 2, 3]);
    assert!(rows.contains(&vec![
        Value::UInt(3),
        Value::String("value-3".into()),
        Value::String("events.view".into()),
    ]));

    // Everything inserted is acknowledged once the loop runs again.
    assert_eq!(ctx.wait_for_acks(4).await, 4);
    assert_eq!(ctx.broker.in_flight_count(), 0);
    assert!(ctx.storage.status().streaming_passes > 0);

    ctx.shutdown().await;
}

/// Subjects outside the table's wildcard are never consumed.
#[tokio::test]
async fn test_unmatched_subjects_are_ignored() {
    let ctx = TestContext::new().await;

    assert_eq!(ctx.broker.inject("other.click", fixtures::json_message(1, "x")), 0);
    ctx.broker.inject("events.click", fixtures::json_message(2, "y"));

    assert_eq!(ctx.wait_for_rows(1).await, 1);
    assert_eq!(keys(&ctx.target_rows()), vec![2]);

    ctx.shutdown().await;
}

/// Consumers of one table share a queue group, so each message is
/// delivered to a single consumer.
#[tokio::test]
async fn test_queue_group_delivers_once() {
    let ctx = TestContext::with_settings(fixtures::settings("events.>", 4), true).await;
    assert_eq!(ctx.storage.num_created_consumers(), 4);
    assert_eq!(ctx.broker.subscription_count(), 4);

    ctx.inject_all("events.a", &fixtures::json_messages(20));

    assert_eq!(ctx.wait_for_rows(20).await, 20);
    assert_eq!(ctx.wait_for_acks(20).await, 20);
    assert_eq!(keys(&ctx.target_rows()), (0..20).collect::<Vec<_>>());

    ctx.shutdown().await;
}

/// Broken messages within the tolerance are skipped, the rest inserted.
#[tokio::test]
async fn test_broken_messages_skipped() {
    let mut settings = fixtures::settings("events.>", 1);
    settings.nats_skip_broken_messages = 5;
    let ctx = TestContext::with_settings(settings, true).await;

    ctx.broker.inject("events.a", fixtures::json_message(1, "ok"));
    ctx.broker.inject("events.a", "not json at all");
    ctx.broker.inject("events.a", fixtures::json_message(2, "ok"));

    assert_eq!(ctx.wait_for_rows(2).await, 2);
    assert_eq!(keys(&ctx.target_rows()), vec![1, 2]);

    // The broken message is consumed along with its block.
    assert_eq!(ctx.wait_for_acks(3).await, 3);

    ctx.shutdown().await;
}

/// Messages in flight when the connection drops are redelivered after
/// the table reconnects.
#[tokio::test]
async fn test_redelivery_after_connection_drop() {
    let ctx = TestContext::new().await;

    ctx.inject_all("events.a", &fixtures::json_messages(5));
    ctx.broker.drop_connection();

    assert!(ctx.wait_for_rows(5).await >= 5);

    let mut seen = keys(&ctx.target_rows());
    seen.dedup();
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    assert!(ctx.storage.connection().is_connected());
    assert!(ctx.broker.connection_count() >= 2);

    ctx.shutdown().await;
}

/// A view whose target is missing holds messages back.
#[tokio::test]
async fn test_detached_target_holds_messages() {
    let ctx = TestContext::new().await;
    ctx.database.drop_table(&fixtures::id(fixtures::TARGET));

    ctx.broker.inject("events.a", fixtures::json_message(1, "x"));
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    assert_eq!(ctx.broker.acked_count(), 0);

    ctx.database.create_table(fixtures::id(fixtures::TARGET));
    assert_eq!(ctx.wait_for_rows(1).await, 1);

    ctx.shutdown().await;
}

/// A pass that fails to insert leaves its messages unacknowledged, and
/// they reach the view once inserts succeed, without a reconnect.
#[tokio::test]
async fn test_failed_insert_redelivered() {
    let ctx = TestContext::with_settings(fixtures::settings("events.>", 1), true).await;
    ctx.database.set_fail_inserts(true);

    ctx.inject_all("events.a", &fixtures::json_messages(3));
    let failed = integration_tests::setup::wait_until(std::time::Duration::from_secs(20), || {
        ctx.storage.status().streaming_errors > 0
    })
    .await;
    assert!(failed, "streaming never attempted the insert");
    assert_eq!(ctx.broker.acked_count(), 0);

    ctx.database.set_fail_inserts(false);
    assert_eq!(ctx.wait_for_rows(3).await, 3);
    assert_eq!(keys(&ctx.target_rows()), vec![0, 1, 2]);
    assert_eq!(ctx.wait_for_acks(3).await, 3);
    assert_eq!(ctx.broker.connection_count(), 1);

    ctx.shutdown().await;
}
