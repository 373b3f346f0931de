//! Application state shared across handlers.

use std::sync::Arc;

use storage_nats::StorageNats;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Tables served by this process
    pub tables: Arc<Vec<Arc<StorageNats>>>,
}

impl AppState {
    pub fn new(tables: Vec<Arc<StorageNats>>) -> Self {
        Self {
            tables: Arc::new(tables),
        }
    }

    /// Looks a table up by database and name.
    pub fn table(&self, database: &str, table: &str) -> Option<&Arc<StorageNats>> {
        self.tables
            .iter()
            .find(|t| t.id().database == database && t.id().table == table)
    }
}
