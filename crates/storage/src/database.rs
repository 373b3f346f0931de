//! In-process database holding target tables and materialized views.
//!
//! Stands in for the query engine: it answers catalog lookups and executes
//! inserts into views, projecting the view columns out of the inserted
//! blocks and cascading through nested views.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use engine_core::{Block, ColumnDescription, Error, Result, Row, StorageId};
use parking_lot::RwLock;
use tracing::debug;

use crate::catalog::{CatalogEntry, ViewCatalog};
use crate::pipeline::{InsertInterpreter, ViewWriter};

#[derive(Debug, Clone)]
struct ViewDefinition {
    source: StorageId,
    target: StorageId,
    columns: Vec<String>,
}

#[derive(Default)]
struct DatabaseState {
    tables: BTreeMap<StorageId, Vec<Row>>,
    views: BTreeMap<StorageId, ViewDefinition>,
    fail_inserts: bool,
}

impl DatabaseState {
    fn views_reading(&self, source: &StorageId) -> Vec<StorageId> {
        self.views
            .iter()
            .filter(|(_, view)| &view.source == source)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Computes every row each target table receives for an insert into
    /// `table`, without touching the tables.
    fn plan_insert(
        &self,
        table: &StorageId,
        header: &[String],
        rows: &[Row],
    ) -> Result<Vec<(StorageId, Vec<Row>)>> {
        let mut planned = Vec::new();
        let mut fired = HashSet::new();
        let mut work = vec![(table.clone(), header.to_vec(), rows.to_vec())];

        while let Some((source, header, rows)) = work.pop() {
            for view_id in self.views_reading(&source) {
                if !fired.insert(view_id.clone()) {
                    continue;
                }
                let view = &self.views[&view_id];

                let positions = view
                    .columns
                    .iter()
                    .map(|column| {
                        header.iter().position(|h| h == column).ok_or_else(|| {
                            Error::logical(format!(
                                "Missing column {} in block inserted into view {}",
                                column, view_id
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;

                if !self.tables.contains_key(&view.target) {
                    return Err(Error::logical(format!(
                        "Target table {} of view {} doesn't exist",
                        view.target, view_id
                    )));
                }

                let projected: Vec<Row> = rows
                    .iter()
                    .map(|row| positions.iter().map(|&p| row[p].clone()).collect())
                    .collect();

                planned.push((view.target.clone(), projected.clone()));
                work.push((view.target.clone(), view.columns.clone(), projected));
            }
        }

        Ok(planned)
    }
}

/// In-process database. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<RwLock<DatabaseState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty plain table.
    pub fn create_table(&self, id: StorageId) {
        self.state.write().tables.entry(id).or_default();
    }

    pub fn drop_table(&self, id: &StorageId) -> bool {
        self.state.write().tables.remove(id).is_some()
    }

    /// Creates a view selecting `columns` from `source` into `target`.
    pub fn create_materialized_view(
        &self,
        view: StorageId,
        source: StorageId,
        target: StorageId,
        columns: &[&str],
    ) {
        self.state.write().views.insert(
            view,
            ViewDefinition {
                source,
                target,
                columns: columns.iter().map(|c| c.to_string()).collect(),
            },
        );
    }

    pub fn drop_view(&self, view: &StorageId) -> bool {
        self.state.write().views.remove(view).is_some()
    }

    pub fn rows(&self, table: &StorageId) -> Vec<Row> {
        self.state
            .read()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &StorageId) -> usize {
        self.state.read().tables.get(table).map_or(0, Vec::len)
    }

    /// Makes every following insert fail.
    pub fn set_fail_inserts(&self, fail: bool) {
        self.state.write().fail_inserts = fail;
    }
}

impl ViewCatalog for MemoryDatabase {
    fn dependencies(&self, id: &StorageId) -> Vec<StorageId> {
        let state = self.state.read();
        match state.views.get(id) {
            Some(view) => {
                let mut nested = state.views_reading(id);
                nested.extend(state.views_reading(&view.target));
                nested
            }
            None => state.views_reading(id),
        }
    }

    fn table(&self, id: &StorageId) -> Option<CatalogEntry> {
        let state = self.state.read();
        if let Some(view) = state.views.get(id) {
            return Some(CatalogEntry::MaterializedView {
                target_attached: state.tables.contains_key(&view.target),
            });
        }
        state.tables.contains_key(id).then_some(CatalogEntry::Table)
    }
}

impl InsertInterpreter for MemoryDatabase {
    fn insert_into_views(
        &self,
        table: &StorageId,
        header: &[ColumnDescription],
    ) -> Result<Box<dyn ViewWriter>> {
        Ok(Box::new(MemoryViewWriter {
            database: self.clone(),
            table: table.clone(),
            header: header.iter().map(|c| c.name.clone()).collect(),
            rows: Vec::new(),
        }))
    }
}

struct MemoryViewWriter {
    database: MemoryDatabase,
    table: StorageId,
    header: Vec<String>,
    rows: Vec<Row>,
}

#[async_trait]
impl ViewWriter for MemoryViewWriter {
    async fn write(&mut self, block: Block) -> Result<()> {
        if block.columns != self.header {
            return Err(Error::logical(format!(
                "Block structure mismatch: expected {:?}, got {:?}",
                self.header, block.columns
            )));
        }
        self.rows.extend(block.rows);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let rows = std::mem::take(&mut self.rows);
        if rows.is_empty() {
            return Ok(());
        }

        let mut state = self.database.state.write();
        if state.fail_inserts {
            return Err(Error::internal(format!(
                "insert into views of {} failed",
                self.table
            )));
        }

        let planned = state.plan_insert(&self.table, &self.header, &rows)?;
        for (target, rows) in planned {
            if let Some(table) = state.tables.get_mut(&target) {
                table.extend(rows);
            }
        }

        debug!(table = %self.table, rows = rows.len(), "Inserted into views");
        Ok(())
    }
}
