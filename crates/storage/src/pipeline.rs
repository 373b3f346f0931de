//! Insert pipeline seam.
//!
//! Streaming builds one insert per pass that targets only the views
//! depending on the table, never the table itself.

use async_trait::async_trait;
use engine_core::{Block, ColumnDescription, Result, StorageId};

/// Receives the blocks of one streaming pass.
#[async_trait]
pub trait ViewWriter: Send {
    async fn write(&mut self, block: Block) -> Result<()>;

    /// Commits everything written so far.
    async fn finish(&mut self) -> Result<()>;
}

/// Builds inserts into the dependent views of a table.
pub trait InsertInterpreter: Send + Sync {
    /// `header` lists the columns of the written blocks, virtual ones included.
    fn insert_into_views(
        &self,
        table: &StorageId,
        header: &[ColumnDescription],
    ) -> Result<Box<dyn ViewWriter>>;
}
