//! Write buffer publishing rows to a subject.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use engine_core::{Error, Result};
use telemetry::metrics;
use tracing::{debug, error};

use crate::connection::ConnectionManager;

/// Result of publishing buffered messages.
#[derive(Debug, Default)]
pub struct SendResult {
    pub messages_sent: usize,
    pub errors: Vec<String>,
}

/// Buffers one message per row and publishes them on flush.
pub struct Producer {
    connection: Arc<ConnectionManager>,
    subject: String,
    row_delimiter: Option<char>,
    pending: Vec<Bytes>,
}

impl Producer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        subject: impl Into<String>,
        row_delimiter: Option<char>,
    ) -> Self {
        Self {
            connection,
            subject: subject.into(),
            row_delimiter,
            pending: Vec::new(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queues one serialized row as its own message.
    pub fn push_row(&mut self, mut payload: Vec<u8>) {
        if let Some(delimiter) = self.row_delimiter {
            let mut encoded = [0u8; 4];
            payload.extend_from_slice(delimiter.encode_utf8(&mut encoded).as_bytes());
        }
        self.pending.push(Bytes::from(payload));
    }

    /// Publishes every queued message while holding the event loop. Fails
    /// when not a single message got through; partial failures are
    /// reported in the [`SendResult`].
    pub async fn flush(&mut self) -> Result<SendResult> {
        if self.pending.is_empty() {
            return Ok(SendResult::default());
        }

        let _lease = self.connection.handler().lock_loop().await?;

        if !self.connection.is_connected() && !self.connection.reconnect().await {
            return Err(Error::cannot_connect(format!(
                "Cannot connect to {}",
                self.connection.connection_info_for_log()
            )));
        }

        let start = Instant::now();
        let transport = self.connection.transport().clone();
        let mut result = SendResult::default();

        for payload in self.pending.drain(..) {
            match transport.publish(&self.subject, payload).await {
                Ok(()) => {
                    result.messages_sent += 1;
                    metrics().messages_published.inc();
                }
                Err(e) => {
                    metrics().publish_errors.inc();
                    error!(subject = %self.subject, error = %e, "Failed to publish message");
                    result.errors.push(e.to_string());
                }
            }
        }

        let elapsed = start.elapsed();
        metrics()
            .publish_latency_ms
            .observe(elapsed.as_millis() as u64);
        debug!(
            subject = %self.subject,
            count = result.messages_sent,
            latency_ms = %elapsed.as_millis(),
            "Published messages to NATS"
        );

        if result.messages_sent == 0 {
            return Err(Error::transport(format!(
                "Failed to publish {} messages to {}: {}",
                result.errors.len(),
                self.subject,
                result.errors.first().map_or("", String::as_str)
            )));
        }

        Ok(result)
    }
}
