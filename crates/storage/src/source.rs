//! Row source reading from one leased consumer buffer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_core::{
    Block, ColumnDescription, Error, Result, Row, RowFormat, Value, SUBJECT_COLUMN,
};
use nats_broker::{ConsumerBuffer, ConsumerBufferPool, Message};
use telemetry::metrics;
use tracing::{trace, warn};

use crate::context::TableContext;

#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Rows per produced block
    pub max_block_size: usize,
    /// Stop producing once this much time has passed since creation
    pub time_limit: Option<Duration>,
    /// How long to wait for a free buffer
    pub acquire_timeout: Duration,
    /// Broken messages tolerated per block
    pub skip_broken_messages: u64,
    pub row_delimiter: Option<char>,
    /// Acknowledge every produced block right away
    pub auto_ack: bool,
}

#[derive(Debug, Clone, Copy)]
enum ColumnSource {
    Physical(usize),
    Subject,
}

/// Produces blocks from the messages of one consumer.
///
/// The buffer is leased lazily on the first [`NatsSource::generate`] and
/// returned to the pool when the source is dropped.
pub struct NatsSource {
    context: Arc<TableContext>,
    pool: Arc<ConsumerBufferPool>,
    buffer: Option<ConsumerBuffer>,
    format: Arc<dyn RowFormat>,
    physical: Vec<ColumnDescription>,
    header: Vec<String>,
    mapping: Vec<ColumnSource>,
    options: SourceOptions,
    created: Instant,
    counts_as_reader: bool,
    finished: bool,
}

impl NatsSource {
    /// `physical` are the table columns the format parses; `header` the
    /// columns of produced blocks, which may include virtual ones.
    pub fn new(
        context: Arc<TableContext>,
        pool: Arc<ConsumerBufferPool>,
        format: Arc<dyn RowFormat>,
        physical: Vec<ColumnDescription>,
        header: &[ColumnDescription],
        options: SourceOptions,
        counts_as_reader: bool,
    ) -> Result<Self> {
        let mapping = header
            .iter()
            .map(|column| {
                if column.name == SUBJECT_COLUMN {
                    return Ok(ColumnSource::Subject);
                }
                physical
                    .iter()
                    .position(|c| c.name == column.name)
                    .map(ColumnSource::Physical)
                    .ok_or_else(|| {
                        Error::bad_arguments(format!(
                            "There is no column {} in table",
                            column.name
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        if counts_as_reader {
            context.increment_reader();
        }

        Ok(Self {
            context,
            pool,
            buffer: None,
            format,
            physical,
            header: header.iter().map(|c| c.name.clone()).collect(),
            mapping,
            options,
            created: Instant::now(),
            counts_as_reader,
            finished: false,
        })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// True when no buffer is held or the held buffer has nothing queued.
    pub fn queue_empty(&self) -> bool {
        self.buffer.as_ref().map_or(true, ConsumerBuffer::queue_empty)
    }

    /// Acknowledges every message consumed so far.
    pub fn ack(&mut self) -> usize {
        self.buffer.as_mut().map_or(0, ConsumerBuffer::ack)
    }

    /// Hands every unacknowledged message back for redelivery.
    pub fn discard_acks(&mut self) -> usize {
        self.buffer.as_mut().map_or(0, ConsumerBuffer::discard_acks)
    }

    fn time_limit_exceeded(&self) -> bool {
        self.options
            .time_limit
            .is_some_and(|limit| self.created.elapsed() >= limit)
    }

    fn project(&self, parsed: Row, message: &Message) -> Row {
        self.mapping
            .iter()
            .map(|source| match source {
                ColumnSource::Physical(i) => parsed.get(*i).cloned().unwrap_or(Value::Null),
                ColumnSource::Subject => Value::String(message.subject.clone()),
            })
            .collect()
    }

    fn parse(&self, message: &Message) -> Result<Vec<Row>> {
        let mut payload = &message.payload[..];
        if let Some(delimiter) = self.options.row_delimiter {
            let mut encoded = [0u8; 4];
            let delimiter = delimiter.encode_utf8(&mut encoded).as_bytes();
            if let Some(stripped) = payload.strip_suffix(delimiter) {
                payload = stripped;
            }
        }
        self.format.parse(payload, &self.physical)
    }

    /// Produces the next block, or `None` once the queue is drained, the
    /// time limit passed or the table shuts down.
    pub async fn generate(&mut self) -> Result<Option<Block>> {
        if self.finished || self.context.is_shutdown() || self.time_limit_exceeded() {
            return Ok(None);
        }

        if self.buffer.is_none() {
            self.buffer = self.pool.acquire(Some(self.options.acquire_timeout)).await;
            if self.buffer.is_none() {
                trace!("No free consumer buffer, source finished");
                self.finished = true;
                return Ok(None);
            }
        }

        let mut block = Block::new(self.header.clone());
        let mut broken = 0u64;

        loop {
            if block.num_rows() >= self.options.max_block_size
                || self.context.is_shutdown()
                || self.time_limit_exceeded()
            {
                break;
            }

            let Some(message) = self.buffer.as_mut().and_then(ConsumerBuffer::next_message)
            else {
                break;
            };

            match self.parse(&message) {
                Ok(rows) => {
                    for row in rows {
                        let row = self.project(row, &message);
                        block.push(row);
                    }
                }
                Err(e) => {
                    broken += 1;
                    if broken > self.options.skip_broken_messages {
                        return Err(Error::incorrect_data(format!(
                            "Cannot parse message on subject {}: {}",
                            message.subject, e
                        )));
                    }
                    metrics().broken_messages_skipped.inc();
                    warn!(subject = %message.subject, error = %e, "Skipping broken message");
                }
            }
        }

        if block.is_empty() {
            self.finished = true;
            return Ok(None);
        }

        if self.options.auto_ack {
            self.ack();
        }

        Ok(Some(block))
    }
}

impl Drop for NatsSource {
    fn drop(&mut self) {
        if self.counts_as_reader {
            self.context.decrement_reader();
        }
        if let Some(mut buffer) = self.buffer.take() {
            // Unacknowledged messages go back to the broker.
            buffer.discard_acks();
            self.pool.release(buffer);
        }
    }
}
