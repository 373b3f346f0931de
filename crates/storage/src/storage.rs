//! The NATS table: connection, consumers and background tasks of one table.
//!
//! Three tasks of the shared schedule pool drive a table:
//! - `NATSConnectionManagerTask` restores a lost connection, retrying every
//!   [`RESCHEDULE`] until it succeeds.
//! - `NATSLoopingTask` runs the event loop until it is told to stop.
//! - `NATSStreamingTask` pushes received messages into dependent views (see
//!   `streaming.rs`).
//!
//! Shutdown deactivates them in exactly that order before the consumers are
//! unsubscribed.

use std::sync::{Arc, Weak};
use std::time::Duration;

use engine_core::{
    get_format, parse_list, virtual_columns, ColumnDescription, Error, FormatSettings,
    GlobalSettings, Macros, NatsSettings, QueryContext, Result, RowFormat, StorageId,
    SUBJECT_COLUMN,
};
use nats_broker::health::verify_subjects;
use nats_broker::{
    ConnectionManager, ConnectionState, ConsumerBuffer, ConsumerBufferPool, LoopState,
    NatsConfiguration, Transport, MIN_QUEUE_SIZE,
};
use serde::Serialize;
use telemetry::metrics;
use tracing::{debug, error, info, warn};
use worker::{Backoff, BackgroundSchedulePool, TaskHolder};

use crate::catalog::ViewCatalog;
use crate::context::TableContext;
use crate::pipeline::InsertInterpreter;
use crate::sink::NatsSink;
use crate::source::{NatsSource, SourceOptions};

/// Delay between connection attempts and base delay of the streaming task.
pub const RESCHEDULE: Duration = Duration::from_millis(500);

/// Server-wide collaborators shared by every table.
#[derive(Clone)]
pub struct EngineContext {
    pub global: GlobalSettings,
    pub schedule_pool: BackgroundSchedulePool,
    pub catalog: Arc<dyn ViewCatalog>,
    pub interpreter: Arc<dyn InsertInterpreter>,
}

/// Definition of a table being created or attached.
#[derive(Debug, Clone)]
pub struct CreateTableArgs {
    pub id: StorageId,
    pub columns: Vec<ColumnDescription>,
    pub settings: NatsSettings,
    /// Attaching existing metadata on server start. Connection and consumer
    /// failures are logged instead of failing the table.
    pub is_attach: bool,
}

/// Point-in-time view of a table for operators.
#[derive(Debug, Clone, Serialize)]
pub struct TableStatus {
    pub table: String,
    pub connection: ConnectionState,
    pub subjects: Vec<String>,
    pub queue_group: String,
    pub consumers_created: usize,
    pub free_buffers: usize,
    pub leased_buffers: usize,
    pub readers: usize,
    pub loop_running: bool,
    pub mv_attached: bool,
    pub backoff_ms: u64,
    pub streaming_passes: u64,
    pub streaming_errors: u64,
    pub shutdown: bool,
}

pub struct StorageNats {
    pub(crate) id: StorageId,
    pub(crate) columns: Vec<ColumnDescription>,
    pub(crate) subjects: Vec<String>,
    pub(crate) queue_group: String,
    pub(crate) format: Arc<dyn RowFormat>,
    pub(crate) row_delimiter: Option<char>,
    pub(crate) skip_broken_messages: u64,
    pub(crate) num_consumers: usize,
    pub(crate) max_block_size: usize,
    pub(crate) queue_size: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) is_attach: bool,

    pub(crate) connection: Arc<ConnectionManager>,
    pub(crate) context: Arc<TableContext>,
    pub(crate) pool: Arc<ConsumerBufferPool>,
    pub(crate) catalog: Arc<dyn ViewCatalog>,
    pub(crate) interpreter: Arc<dyn InsertInterpreter>,

    pub(crate) connection_task: TaskHolder,
    pub(crate) looping_task: TaskHolder,
    pub(crate) streaming_task: TaskHolder,
    /// Serializes task deactivation.
    task_mutex: tokio::sync::Mutex<()>,
}

/// Creates a table and starts it up.
pub async fn create_table(
    args: CreateTableArgs,
    engine: &EngineContext,
    transport: Arc<dyn Transport>,
) -> Result<Arc<StorageNats>> {
    let storage = StorageNats::create(args, engine, transport).await?;
    if let Err(e) = storage.startup().await {
        storage.shutdown().await;
        return Err(e);
    }
    Ok(storage)
}

impl StorageNats {
    /// Validates the definition, connects and creates the background tasks.
    /// Nothing runs until [`StorageNats::startup`].
    pub async fn create(
        args: CreateTableArgs,
        engine: &EngineContext,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let CreateTableArgs {
            id,
            columns,
            settings,
            is_attach,
        } = args;

        settings.check()?;

        if columns.is_empty() {
            return Err(Error::bad_arguments(format!(
                "Table {} must have at least one column",
                id
            )));
        }
        if let Some(column) = columns.iter().find(|c| c.name == SUBJECT_COLUMN) {
            return Err(Error::bad_arguments(format!(
                "Column {} clashes with a virtual column of the NATS engine",
                column.name
            )));
        }

        let macros = Macros::for_table(&engine.global.macros, &id);

        let subjects = parse_list(&macros.expand(&settings.nats_subjects)?);
        if subjects.is_empty() || subjects.iter().any(String::is_empty) {
            return Err(Error::bad_arguments("Empty subjects list"));
        }
        let invalid = verify_subjects(&subjects);
        if !invalid.is_empty() {
            return Err(Error::bad_arguments(format!(
                "Invalid subjects: {}",
                invalid.join(", ")
            )));
        }

        let format_name = macros.expand(&settings.nats_format)?;
        let schema = macros.expand(&settings.nats_schema)?;
        let format = get_format(&format_name, FormatSettings::from_table(&settings, &schema))?;

        let or_global = |value: &str, fallback: &str| -> Result<String> {
            let value = macros.expand(value)?;
            Ok(if value.is_empty() {
                fallback.to_string()
            } else {
                value
            })
        };

        let configuration = NatsConfiguration {
            url: macros.expand(&settings.nats_url)?,
            servers: parse_list(&macros.expand(&settings.nats_server_list)?),
            username: or_global(&settings.nats_username, &engine.global.nats.username)?,
            password: or_global(&settings.nats_password, &engine.global.nats.password)?,
            token: or_global(&settings.nats_token, &engine.global.nats.token)?,
            max_reconnect: settings.nats_max_reconnect,
            reconnect_wait_ms: settings.nats_reconnect_wait,
            secure: settings.nats_secure,
        };
        // Rejects an unusable address before any connection attempt.
        configuration.connect_options()?;

        let connection = Arc::new(ConnectionManager::new(configuration, transport));
        if !connection.connect().await {
            if !is_attach {
                return Err(Error::cannot_connect(format!(
                    "Cannot connect to {}",
                    connection.connection_info_for_log()
                )));
            }
            error!(
                table = %id,
                connection = %connection.connection_info_for_log(),
                "Cannot connect to NATS, will retry in background"
            );
        }

        let queue_group = match &settings.nats_queue_group {
            Some(group) if !group.is_empty() => macros.expand(group)?,
            _ => id.full_name(),
        };

        let num_consumers = settings.nats_num_consumers as usize;
        let max_block_size = settings
            .nats_max_block_size
            .unwrap_or(engine.global.max_insert_block_size / num_consumers)
            .max(1);
        let flush_interval = Duration::from_millis(
            settings
                .nats_flush_interval_ms
                .unwrap_or(engine.global.stream_flush_interval_ms),
        );

        let context = Arc::new(TableContext::new(
            connection.handler().clone(),
            Backoff::new(RESCHEDULE, worker::DEFAULT_CEILING),
        ));

        let schedule_pool = &engine.schedule_pool;
        let storage = Arc::new_cyclic(|this: &Weak<Self>| {
            let connection_task = {
                let this = this.clone();
                schedule_pool.create_task("NATSConnectionManagerTask", move || {
                    let this = this.clone();
                    async move {
                        if let Some(storage) = this.upgrade() {
                            storage.connection_func().await;
                        }
                    }
                })
            };
            let looping_task = {
                let this = this.clone();
                schedule_pool.create_task("NATSLoopingTask", move || {
                    let this = this.clone();
                    async move {
                        if let Some(storage) = this.upgrade() {
                            storage.looping_func().await;
                        }
                    }
                })
            };
            let streaming_task = {
                let this = this.clone();
                schedule_pool.create_task("NATSStreamingTask", move || {
                    let this = this.clone();
                    async move {
                        if let Some(storage) = this.upgrade() {
                            storage.streaming_to_views_func().await;
                        }
                    }
                })
            };

            Self {
                id,
                columns,
                subjects,
                queue_group,
                format,
                row_delimiter: settings.nats_row_delimiter,
                skip_broken_messages: settings.nats_skip_broken_messages,
                num_consumers,
                max_block_size,
                queue_size: MIN_QUEUE_SIZE.max(max_block_size),
                flush_interval,
                is_attach,
                connection,
                context,
                pool: Arc::new(ConsumerBufferPool::new(num_consumers)),
                catalog: engine.catalog.clone(),
                interpreter: engine.interpreter.clone(),
                connection_task,
                looping_task,
                streaming_task,
                task_mutex: tokio::sync::Mutex::new(()),
            }
        });

        debug!(
            table = %storage.id,
            subjects = ?storage.subjects,
            queue_group = %storage.queue_group,
            num_consumers,
            max_block_size,
            "Created NATS table"
        );

        Ok(storage)
    }

    pub fn id(&self) -> &StorageId {
        &self.id
    }

    pub fn columns(&self) -> &[ColumnDescription] {
        &self.columns
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    pub fn queue_group(&self) -> &str {
        &self.queue_group
    }

    pub fn num_consumers(&self) -> usize {
        self.num_consumers
    }

    pub fn num_created_consumers(&self) -> usize {
        self.pool.created()
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn context(&self) -> &Arc<TableContext> {
        &self.context
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn pool(&self) -> &Arc<ConsumerBufferPool> {
        &self.pool
    }

    /// Starts the background tasks and creates the consumers.
    pub async fn startup(&self) -> Result<()> {
        if !self.connection.is_connected() {
            self.connection_task.activate_and_schedule();
        }

        self.create_consumers().await?;
        self.streaming_task.activate_and_schedule();

        info!(
            table = %self.id,
            consumers = self.pool.created(),
            "NATS table started"
        );
        Ok(())
    }

    pub(crate) async fn create_consumers(&self) -> Result<()> {
        for _ in 0..self.num_consumers {
            let buffer = ConsumerBuffer::new(
                self.connection.transport().clone(),
                self.subjects.clone(),
                self.queue_group.clone(),
                self.queue_size,
                self.context.shutdown_flag(),
            )
            .await;

            match buffer {
                Ok(buffer) => self.pool.add(buffer)?,
                Err(e) if self.is_attach => {
                    error!(table = %self.id, error = %e, "Failed to create consumer");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stops the table. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.context.signal_shutdown() {
            return;
        }
        info!(table = %self.id, "Shutting down NATS table");

        // Connection first, then streaming, then the loop.
        self.deactivate_task(&self.connection_task, true, false).await;
        self.deactivate_task(&self.streaming_task, true, false).await;
        self.deactivate_task(&self.looping_task, true, true).await;

        if self.context.handler().loop_running() {
            self.context.stop_loop();
        }

        for mut buffer in self.pool.drain().await {
            if let Err(e) = buffer.unsubscribe().await {
                warn!(table = %self.id, error = %e, "Failed to unsubscribe consumer");
            }
        }

        self.connection.disconnect().await;
        debug!(table = %self.id, "NATS table stopped");
    }

    /// Deactivates `task`. Only waits for a concurrent deactivation when
    /// `wait` is set, so a task deactivating a peer never deadlocks.
    pub(crate) async fn deactivate_task(&self, task: &TaskHolder, wait: bool, stop_loop: bool) {
        if stop_loop {
            self.context.stop_loop();
        }

        if let Ok(_guard) = self.task_mutex.try_lock() {
            task.deactivate().await;
        } else if wait {
            let _guard = self.task_mutex.lock().await;
            task.deactivate().await;
        }
    }

    pub(crate) fn start_loop(&self) {
        if self.context.is_shutdown() {
            return;
        }
        self.context.handler().update_loop_state(LoopState::Run);
        self.looping_task.activate_and_schedule();
    }

    async fn looping_func(&self) {
        if self.connection.is_connected() {
            debug!(table = %self.id, "Starting event loop");
            self.context.handler().start_loop().await;
        }
    }

    async fn connection_func(&self) {
        if !self.connection.reconnect().await {
            self.connection_task.schedule_after(RESCHEDULE);
        }
    }

    fn source_options(&self, auto_ack: bool) -> SourceOptions {
        SourceOptions {
            max_block_size: self.max_block_size,
            time_limit: Some(self.flush_interval),
            acquire_timeout: self.flush_interval,
            skip_broken_messages: self.skip_broken_messages,
            row_delimiter: self.row_delimiter,
            auto_ack,
        }
    }

    pub(crate) fn new_source(
        &self,
        header: &[ColumnDescription],
        auto_ack: bool,
        counts_as_reader: bool,
    ) -> Result<NatsSource> {
        NatsSource::new(
            self.context.clone(),
            self.pool.clone(),
            self.format.clone(),
            self.columns.clone(),
            header,
            self.source_options(auto_ack),
            counts_as_reader,
        )
    }

    /// Resolves column names against physical and virtual columns.
    fn header_for(&self, column_names: &[&str]) -> Result<Vec<ColumnDescription>> {
        let virtuals = virtual_columns();
        column_names
            .iter()
            .map(|name| {
                self.columns
                    .iter()
                    .chain(virtuals.iter())
                    .find(|c| c.name == *name)
                    .cloned()
                    .ok_or_else(|| {
                        Error::bad_arguments(format!("There is no column {} in table {}", name, self.id))
                    })
            })
            .collect()
    }

    /// Direct select: one source per created consumer.
    pub async fn read(&self, column_names: &[&str], query: &QueryContext) -> Result<Vec<NatsSource>> {
        if self.pool.created() == 0 {
            return Ok(Vec::new());
        }

        if !query.settings.stream_like_engine_allow_direct_select {
            return Err(Error::query_not_allowed(
                "Direct select is not allowed. To enable use setting `stream_like_engine_allow_direct_select`",
            ));
        }

        if self.context.mv_attached() {
            return Err(Error::query_not_allowed(
                "Cannot read from StorageNATS with attached materialized views",
            ));
        }

        let header = self.header_for(column_names)?;

        if !self.connection.is_connected() {
            if self.context.handler().loop_running() {
                self.deactivate_task(&self.looping_task, false, true).await;
            }
            if !self.connection.reconnect().await {
                return Err(Error::cannot_connect(format!(
                    "No connection to {}",
                    self.connection.connection_info_for_log()
                )));
            }
        }

        let sources = (0..self.pool.created())
            .map(|_| self.new_source(&header, true, true))
            .collect::<Result<Vec<_>>>()?;

        if !self.context.handler().loop_running() && self.connection.is_connected() {
            self.start_loop();
        }

        metrics().direct_reads.inc();
        debug!(table = %self.id, streams = sources.len(), "Starting reading streams");
        Ok(sources)
    }

    /// A sink publishing to the first subject.
    pub fn write(&self) -> NatsSink {
        NatsSink::new(
            self.connection.clone(),
            &self.subjects[0],
            self.row_delimiter,
            self.format.clone(),
            self.columns.clone(),
        )
    }

    pub fn status(&self) -> TableStatus {
        TableStatus {
            table: self.id.full_name(),
            connection: self.connection.state(),
            subjects: self.subjects.clone(),
            queue_group: self.queue_group.clone(),
            consumers_created: self.pool.created(),
            free_buffers: self.pool.free(),
            leased_buffers: self.pool.leased(),
            readers: self.context.readers(),
            loop_running: self.context.handler().loop_running(),
            mv_attached: self.context.mv_attached(),
            backoff_ms: self.context.backoff().delay().as_millis() as u64,
            streaming_passes: self.context.streaming_passes(),
            streaming_errors: self.context.streaming_errors(),
            shutdown: self.context.is_shutdown(),
        }
    }
}
