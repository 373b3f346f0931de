//! Row sink publishing inserted rows to the first subject of a table.

use std::sync::Arc;

use engine_core::{Block, ColumnDescription, Error, Result, RowFormat};
use nats_broker::{ConnectionManager, Producer, SendResult};
use tracing::debug;

pub struct NatsSink {
    producer: Producer,
    format: Arc<dyn RowFormat>,
    columns: Vec<ColumnDescription>,
}

impl NatsSink {
    pub fn new(
        connection: Arc<ConnectionManager>,
        subject: &str,
        row_delimiter: Option<char>,
        format: Arc<dyn RowFormat>,
        columns: Vec<ColumnDescription>,
    ) -> Self {
        Self {
            producer: Producer::new(connection, subject, row_delimiter),
            format,
            columns,
        }
    }

    pub fn subject(&self) -> &str {
        self.producer.subject()
    }

    /// Serializes every row of `block` into its own message.
    pub fn write(&mut self, block: &Block) -> Result<()> {
        let expected: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        if block.columns.iter().map(String::as_str).ne(expected.iter().copied()) {
            return Err(Error::bad_arguments(format!(
                "Inserted block has columns {:?}, table has {:?}",
                block.columns, expected
            )));
        }

        for row in &block.rows {
            let mut payload = Vec::new();
            self.format.serialize(row, &self.columns, &mut payload)?;
            self.producer.push_row(payload);
        }
        Ok(())
    }

    /// Publishes everything written so far.
    pub async fn finish(&mut self) -> Result<SendResult> {
        let pending = self.producer.pending();
        let result = self.producer.flush().await?;
        debug!(
            subject = %self.producer.subject(),
            pending,
            sent = result.messages_sent,
            "Sink finished"
        );
        Ok(result)
    }
}
