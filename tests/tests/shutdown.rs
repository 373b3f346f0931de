//! Table lifecycle: attach without a server, background reconnect and
//! ordered shutdown.

use std::sync::Arc;
use std::time::Duration;

use engine_core::QueryContext;
use integration_tests::fixtures::{self, id, QUEUE};
use integration_tests::mocks::{Call, RecordingTransport};
use integration_tests::setup::{engine, wait_until, TestContext};
use nats_broker::{ConnectionState, MemoryBroker};
use storage_nats::{create_table, CreateTableArgs, MemoryDatabase};

fn table_args(is_attach: bool) -> CreateTableArgs {
    CreateTableArgs {
        id: id(QUEUE),
        columns: fixtures::columns(),
        settings: fixtures::settings("events.>", 1),
        is_attach,
    }
}

/// Shutdown unsubscribes every consumer and stops streaming.
#[tokio::test]
async fn test_shutdown_stops_consuming() {
    let ctx = TestContext::new().await;
    ctx.broker.inject("events.a", fixtures::json_message(1, "x"));
    assert_eq!(ctx.wait_for_rows(1).await, 1);

    ctx.shutdown().await;

    let status = ctx.storage.status();
    assert!(status.shutdown);
    assert!(!status.loop_running);
    assert_eq!(status.connection, ConnectionState::Disconnected);
    assert_eq!(ctx.broker.subscription_count(), 0);

    // Nobody is subscribed any more.
    assert_eq!(ctx.broker.inject("events.a", fixtures::json_message(2, "y")), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ctx.target_rows().len(), 1);
}

/// Shutting down twice is harmless.
#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let ctx = TestContext::without_views().await;

    ctx.shutdown().await;
    ctx.shutdown().await;

    assert_eq!(ctx.storage.num_created_consumers(), 0);
    assert_eq!(ctx.storage.status().readers, 0);
}

/// Messages never read are not acknowledged on the way out.
#[tokio::test]
async fn test_shutdown_acks_nothing_unread() {
    let ctx = TestContext::without_views().await;
    ctx.inject_all("events.a", &fixtures::json_messages(3));

    ctx.shutdown().await;

    assert_eq!(ctx.broker.acked_count(), 0);
}

/// An attached table whose server is down starts anyway and connects
/// once the server comes back.
#[tokio::test]
async fn test_attached_table_connects_in_background() {
    let database = MemoryDatabase::new();
    let broker = Arc::new(MemoryBroker::new());
    broker.set_refuse_connections(true);

    let args = CreateTableArgs {
        id: id(QUEUE),
        columns: fixtures::columns(),
        settings: fixtures::settings("events.>", 1),
        is_attach: true,
    };
    let storage = create_table(args, &engine(&database), broker.clone())
        .await
        .expect("attach should not fail on a refused connection");
    assert_eq!(storage.connection().state(), ConnectionState::Disconnected);

    broker.set_refuse_connections(false);
    let connected = wait_until(Duration::from_secs(10), || {
        storage.connection().state() == ConnectionState::Connected
    })
    .await;
    assert!(connected);

    storage.shutdown().await;
    assert_eq!(storage.connection().state(), ConnectionState::Disconnected);
}

/// Creating a table on a refused connection fails outright.
#[tokio::test]
async fn test_create_fails_without_server() {
    let database = MemoryDatabase::new();
    let broker = Arc::new(MemoryBroker::new());
    broker.set_refuse_connections(true);

    let args = CreateTableArgs {
        id: id(QUEUE),
        columns: fixtures::columns(),
        settings: fixtures::settings("events.>", 1),
        is_attach: false,
    };
    let err = create_table(args, &engine(&database), broker)
        .await
        .err()
        .expect("create should fail");
    assert_eq!(err.code(), "CANNOT_CONNECT_NATS");
}

/// A table shut down while its server is away stays disconnected when the
/// server comes back.
#[tokio::test]
async fn test_no_reconnect_after_shutdown() {
    let database = MemoryDatabase::new();
    let broker = Arc::new(MemoryBroker::new());
    broker.set_refuse_connections(true);

    let storage = create_table(table_args(true), &engine(&database), broker.clone())
        .await
        .expect("attach should not fail on a refused connection");
    storage.shutdown().await;

    broker.set_refuse_connections(false);
    // Several reconnect periods.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(broker.connection_count(), 0);
    assert_eq!(storage.connection().state(), ConnectionState::Disconnected);
    assert_eq!(broker.subscription_count(), 0);
}

/// The event loop is stopped before any subscription is removed, so it
/// never polls a consumer that is being torn down.
#[tokio::test]
async fn test_loop_stops_before_unsubscribe() {
    let database = MemoryDatabase::new();
    let transport = RecordingTransport::new(Arc::new(MemoryBroker::new()));
    let mut args = table_args(false);
    args.settings = fixtures::settings("events.>", 2);
    let storage = create_table(args, &engine(&database), Arc::new(transport.clone()))
        .await
        .expect("Failed to create table");

    // An open direct read keeps the loop running.
    let sources = storage
        .read(&["key"], &QueryContext::allow_direct_select())
        .await
        .expect("read failed");
    let running = wait_until(Duration::from_secs(10), || {
        storage.context().handler().loop_running()
    })
    .await;
    assert!(running);
    assert!(wait_until(Duration::from_secs(10), || transport.calls().contains(&Call::Poll)).await);

    storage.shutdown().await;
    assert!(!storage.context().handler().loop_running());

    let after = transport
        .calls_after(Call::Unsubscribe)
        .expect("consumers were never unsubscribed");
    assert!(!after.contains(&Call::Poll), "polled after unsubscribing: {:?}", after);
    assert_eq!(
        transport.calls().iter().filter(|c| **c == Call::Unsubscribe).count(),
        2
    );
    assert_eq!(after.last(), Some(&Call::Close));
    assert_eq!(transport.broker.subscription_count(), 0);

    drop(sources);
    assert_eq!(storage.context().readers(), 0);
}
