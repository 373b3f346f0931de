//! NATS Bridge
//!
//! Streams NATS subjects into materialized views:
//! - One `StorageNats` table per configured definition, each with its own
//!   broker connection, consumer pool and background tasks
//! - Views wired from the tables into target tables of the in-process database
//! - Operator HTTP surface for health, metrics and table status

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};

use api::{router, AppState};
use engine_core::{ColumnDescription, GlobalSettings, NatsSettings, StorageId};
use nats_broker::{MemoryBroker, NatsClient, Transport};
use storage_nats::{create_table, CreateTableArgs, EngineContext, MemoryDatabase, StorageNats};
use telemetry::{init_tracing, TracingConfig};
use worker::BackgroundSchedulePool;

/// Broker each table connects through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TransportKind {
    /// A NATS server at the table's `nats_url`
    #[default]
    Nats,
    /// An in-process broker; for local runs without a server
    Memory,
}

impl TransportKind {
    fn connect(self) -> Arc<dyn Transport> {
        match self {
            Self::Nats => Arc::new(NatsClient::new()),
            Self::Memory => Arc::new(MemoryBroker::new()),
        }
    }
}

/// A NATS table (`[[tables]]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableDefinition {
    #[serde(default = "default_database")]
    database: String,
    name: String,
    columns: Vec<ColumnDescription>,
    #[serde(default)]
    settings: NatsSettings,
    /// Treat the table as attached from existing metadata
    #[serde(default)]
    attach: bool,
}

/// A materialized view reading from a NATS table (`[[views]]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ViewDefinition {
    #[serde(default = "default_database")]
    database: String,
    name: String,
    /// Source table, in the same database
    source: String,
    /// Target table, created if missing
    target: String,
    /// Columns selected from the source, virtual ones included
    columns: Vec<String>,
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Config {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,

    #[serde(default)]
    transport: TransportKind,

    #[serde(default)]
    logging: TracingConfig,

    #[serde(default)]
    global: GlobalSettings,

    #[serde(default)]
    tables: Vec<TableDefinition>,

    #[serde(default)]
    views: Vec<ViewDefinition>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_database() -> String {
    "default".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportKind::default(),
            logging: TracingConfig::default(),
            global: GlobalSettings::default(),
            tables: Vec::new(),
            views: Vec::new(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = load_config()?;

    init_tracing(&config.logging).context("Failed to initialize tracing")?;

    info!("Starting NATS Bridge v{}", env!("CARGO_PKG_VERSION"));

    let database = MemoryDatabase::new();
    create_views(&database, &config.views);

    let engine = EngineContext {
        global: config.global.clone(),
        schedule_pool: BackgroundSchedulePool::new(config.global.message_broker_schedule_pool_size),
        catalog: Arc::new(database.clone()),
        interpreter: Arc::new(database.clone()),
    };

    let tables = create_tables(&config.tables, &engine, config.transport).await?;
    info!(tables = tables.len(), views = config.views.len(), "Tables started");

    let state = AppState::new(tables.clone());
    let app = router(state);

    // Start HTTP server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid server address")?;

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    // Run server with graceful shutdown
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    info!("Shutting down...");

    for table in &tables {
        table.shutdown().await;
    }

    info!("Shutdown complete");
    served
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        // Start with defaults
        .add_source(config::Config::try_from(&Config::default())?)
        // Load from config file if exists
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        // Override with environment variables
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("NATS_BRIDGE")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

fn create_views(database: &MemoryDatabase, views: &[ViewDefinition]) {
    for view in views {
        let target = StorageId::new(&view.database, &view.target);
        let columns: Vec<&str> = view.columns.iter().map(String::as_str).collect();

        database.create_table(target.clone());
        database.create_materialized_view(
            StorageId::new(&view.database, &view.name),
            StorageId::new(&view.database, &view.source),
            target,
            &columns,
        );
        info!(view = %view.name, source = %view.source, target = %view.target, "View created");
    }
}

/// Creates and starts every table. A table failing to start stops the
/// ones already running.
async fn create_tables(
    definitions: &[TableDefinition],
    engine: &EngineContext,
    transport: TransportKind,
) -> Result<Vec<Arc<StorageNats>>> {
    let mut tables = Vec::with_capacity(definitions.len());

    for definition in definitions {
        let args = CreateTableArgs {
            id: StorageId::new(&definition.database, &definition.name),
            columns: definition.columns.clone(),
            settings: definition.settings.clone(),
            is_attach: definition.attach,
        };

        // Each table owns one client connection
        match create_table(args, engine, transport.connect()).await {
            Ok(table) => tables.push(table),
            Err(e) => {
                error!(table = %definition.name, error = %e, "Failed to create table");
                for table in &tables {
                    table.shutdown().await;
                }
                return Err(e).with_context(|| format!("Failed to create table {}", definition.name));
            }
        }
    }

    if tables.is_empty() {
        warn!("No tables configured");
    } else if transport == TransportKind::Memory {
        warn!("Tables use the in-process broker, nothing outside this process reaches them");
    }

    Ok(tables)
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
