//! Table status and insert endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use engine_core::Block;
use std::time::Instant;
use storage_nats::TableStatus;
use tracing::{debug, warn};

use crate::response::{ApiError, InsertResponse};
use crate::state::AppState;

/// Largest accepted insert, in rows.
pub const MAX_INSERT_ROWS: usize = 100_000;

/// GET /tables - Status of every table.
pub async fn list_handler(State(state): State<AppState>) -> Json<Vec<TableStatus>> {
    Json(state.tables.iter().map(|t| t.status()).collect())
}

/// GET /tables/:database/:table
pub async fn status_handler(
    State(state): State<AppState>,
    Path((database, table)): Path<(String, String)>,
) -> Result<Json<TableStatus>, ApiError> {
    let storage = state
        .table(&database, &table)
        .ok_or_else(|| ApiError::not_found(format!("Table {}.{} doesn't exist", database, table)))?;
    Ok(Json(storage.status()))
}

/// POST /tables/:database/:table/insert - Publish rows to the table's subject.
///
/// The body is a block: `{"columns": [...], "rows": [[...], ...]}` with the
/// table's columns in definition order.
pub async fn insert_handler(
    State(state): State<AppState>,
    Path((database, table)): Path<(String, String)>,
    Json(block): Json<Block>,
) -> Result<Json<InsertResponse>, ApiError> {
    let start = Instant::now();
    let storage = state
        .table(&database, &table)
        .ok_or_else(|| ApiError::not_found(format!("Table {}.{} doesn't exist", database, table)))?;

    if block.num_rows() > MAX_INSERT_ROWS {
        return Err(ApiError::bad_request(format!(
            "Insert has {} rows, exceeds {} limit",
            block.num_rows(),
            MAX_INSERT_ROWS
        )));
    }

    let mut sink = storage.write();
    sink.write(&block)?;
    let result = sink.finish().await?;

    if !result.errors.is_empty() {
        warn!(
            table = %storage.id(),
            failed = result.errors.len(),
            "Some rows were not published"
        );
    }
    debug!(
        table = %storage.id(),
        subject = %sink.subject(),
        rows = block.num_rows(),
        latency_ms = start.elapsed().as_millis() as u64,
        "Inserted rows"
    );

    Ok(Json(InsertResponse::new(
        block.num_rows(),
        result.messages_sent,
        result.errors,
    )))
}
