//! Common test setup functions.

use std::sync::Arc;
use std::time::Duration;

use api::{router, AppState};
use axum::Router;
use engine_core::{GlobalSettings, NatsSettings, Row};
use nats_broker::MemoryBroker;
use storage_nats::{create_table, CreateTableArgs, EngineContext, MemoryDatabase, StorageNats};
use worker::BackgroundSchedulePool;

use crate::fixtures::{self, id, QUEUE, TARGET, VIEW};

/// One NATS table wired to an in-process broker and database.
///
/// The router serves the same state the daemon builds, so HTTP tests go
/// through the production handlers.
pub struct TestContext {
    pub broker: Arc<MemoryBroker>,
    pub database: MemoryDatabase,
    pub storage: Arc<StorageNats>,
    pub router: Router,
}

impl TestContext {
    /// Table `default.queue` on `events.>` with a view selecting
    /// `key, value, _subject` into `default.events`.
    pub async fn new() -> Self {
        Self::with_settings(fixtures::settings("events.>", 2), true).await
    }

    /// Table `default.queue` on `events.>` with nothing reading from it.
    pub async fn without_views() -> Self {
        Self::with_settings(fixtures::settings("events.>", 1), false).await
    }

    pub async fn with_settings(settings: NatsSettings, with_view: bool) -> Self {
        telemetry::init_test_tracing();

        let database = MemoryDatabase::new();
        if with_view {
            database.create_table(id(TARGET));
            database.create_materialized_view(
                id(VIEW),
                id(QUEUE),
                id(TARGET),
                &["key", "value", "_subject"],
            );
        }

        let engine = engine(&database);
        let broker = Arc::new(MemoryBroker::new());
        let args = CreateTableArgs {
            id: id(QUEUE),
            columns: fixtures::columns(),
            settings,
            is_attach: false,
        };
        let storage = create_table(args, &engine, broker.clone())
            .await
            .expect("Failed to create table");

        let router = router(AppState::new(vec![storage.clone()]));

        Self {
            broker,
            database,
            storage,
            router,
        }
    }

    /// Publishes every payload on `subject` as another client would.
    pub fn inject_all(&self, subject: &str, payloads: &[String]) {
        for payload in payloads {
            self.broker.inject(subject, payload.clone());
        }
    }

    pub fn target_rows(&self) -> Vec<Row> {
        self.database.rows(&id(TARGET))
    }

    /// Waits until the view target holds at least `rows` rows.
    ///
    /// Streaming backs off while the queues are empty, so this allows for
    /// a few reschedules before giving up.
    pub async fn wait_for_rows(&self, rows: usize) -> usize {
        wait_until(Duration::from_secs(20), || self.database.row_count(&id(TARGET)) >= rows).await;
        self.database.row_count(&id(TARGET))
    }

    /// Waits until the broker has seen `count` acknowledgements.
    pub async fn wait_for_acks(&self, count: u64) -> u64 {
        wait_until(Duration::from_secs(20), || self.broker.acked_count() >= count).await;
        self.broker.acked_count()
    }

    pub async fn shutdown(&self) {
        self.storage.shutdown().await;
    }
}

/// Engine context backed by `database`, with a small schedule pool.
pub fn engine(database: &MemoryDatabase) -> EngineContext {
    EngineContext {
        global: GlobalSettings::default(),
        schedule_pool: BackgroundSchedulePool::new(4),
        catalog: Arc::new(database.clone()),
        interpreter: Arc::new(database.clone()),
    }
}

/// Polls `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
