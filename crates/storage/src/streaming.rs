//! Streaming received messages into dependent materialized views.

use std::time::{Duration, Instant};

use engine_core::{virtual_columns, Error, Result};
use telemetry::{health, metrics};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, trace};

use crate::catalog::{check_dependencies, DependencyCheck};
use crate::source::NatsSource;
use crate::storage::StorageNats;

/// Longest a streaming cycle keeps its worker before rescheduling.
const MAX_THREAD_WORK_DURATION: Duration = Duration::from_secs(60);

const BLOCK_QUEUE_SIZE: usize = 16;

impl StorageNats {
    /// Body of `NATSStreamingTask`. Always reschedules itself unless the
    /// table is shutting down.
    pub(crate) async fn streaming_to_views_func(&self) {
        if let Err(e) = self.streaming_cycle().await {
            error!(table = %self.id, error = %e, "Error while streaming to views");
            self.context.record_streaming_error();
            health().streaming.set_unhealthy(e.to_string());
            let delay = self.context.backoff().increase();
            metrics().backoff_ms.set(delay.as_millis() as u64);
        }

        self.context.set_mv_attached(false);

        // A direct read may have started the loop; leave it to the reader.
        if self.context.handler().loop_running() {
            self.context.stop_loop_if_no_readers();
        }

        if !self.context.is_shutdown() {
            self.streaming_task.schedule_after(self.context.backoff().delay());
        }
    }

    async fn streaming_cycle(&self) -> Result<()> {
        let dependencies = self.catalog.dependencies(&self.id).len();
        if dependencies == 0 {
            return Ok(());
        }
        if !self.connection.is_connected() && !self.connection.reconnect().await {
            return Ok(());
        }

        let start = Instant::now();
        self.context.set_mv_attached(true);

        while !self.context.is_shutdown() && self.pool.created() > 0 {
            match check_dependencies(self.catalog.as_ref(), &self.id) {
                DependencyCheck::Ready => {}
                DependencyCheck::NotReady(view) => {
                    trace!(table = %self.id, view = %view, "Dependency is not ready");
                    break;
                }
                DependencyCheck::Cycle(view) => {
                    error!(table = %self.id, view = %view, "Cyclic view dependency");
                    break;
                }
            }

            debug!(table = %self.id, views = dependencies, "Started streaming to attached views");

            let pass_start = Instant::now();
            let back_off = self.stream_to_views().await?;
            self.context.record_streaming_pass();
            metrics()
                .stream_pass_latency_ms
                .observe(pass_start.elapsed().as_millis() as u64);
            health().streaming.set_healthy();

            if back_off {
                let delay = self.context.backoff().increase();
                metrics().backoff_ms.set(delay.as_millis() as u64);
                self.context.stop_loop_if_no_readers();
                break;
            }
            self.context.backoff().reset();
            metrics().backoff_ms.set(self.context.backoff().delay().as_millis() as u64);

            if start.elapsed() > MAX_THREAD_WORK_DURATION {
                self.context.stop_loop_if_no_readers();
                trace!(table = %self.id, "Reschedule streaming. Thread work duration limit exceeded");
                break;
            }

            tokio::task::yield_now().await;
        }

        Ok(())
    }

    /// One streaming pass. Returns true when the caller should back off:
    /// every queue was empty or the connection could not be restored.
    pub async fn stream_to_views(&self) -> Result<bool> {
        let mut header = self.columns.clone();
        header.extend(virtual_columns());

        let mut writer = self.interpreter.insert_into_views(&self.id, &header)?;

        let sources = (0..self.pool.created())
            .map(|_| self.new_source(&header, false, false))
            .collect::<Result<Vec<_>>>()?;

        if !self.context.handler().loop_running() {
            self.start_loop();
        }

        let (blocks, mut received) = mpsc::channel(BLOCK_QUEUE_SIZE);
        let mut tasks = JoinSet::new();
        for mut source in sources {
            let blocks = blocks.clone();
            tasks.spawn(async move {
                while let Some(block) = source.generate().await? {
                    if blocks.send(block).await.is_err() {
                        break;
                    }
                }
                Ok::<NatsSource, Error>(source)
            });
        }
        drop(blocks);

        let mut rows = 0;
        while let Some(block) = received.recv().await {
            rows += block.num_rows();
            metrics().blocks_streamed.inc();
            writer.write(block).await?;
        }

        let mut sources = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let source = joined.map_err(|e| Error::internal(format!("streaming source failed: {}", e)))??;
            sources.push(source);
        }

        writer.finish().await?;
        metrics().rows_streamed.inc_by(rows as u64);

        // Acknowledge only with the loop stopped.
        self.deactivate_task(&self.looping_task, false, true).await;

        if !self.connection.is_connected() {
            if self.context.is_shutdown() {
                return Ok(true);
            }

            // Messages pulled on the lost connection are redelivered.
            for source in &mut sources {
                source.discard_acks();
            }

            if self.connection.reconnect().await {
                debug!(table = %self.id, "Connection restored");
            } else {
                trace!(table = %self.id, "Reschedule streaming. Unable to restore connection");
                return Ok(true);
            }
        } else {
            let mut queue_empty = 0;
            for source in &mut sources {
                source.ack();
                if source.queue_empty() {
                    queue_empty += 1;
                }
                self.context.handler().iterate_loop().await;
            }

            if queue_empty == self.pool.created() {
                trace!(table = %self.id, rows, "Reschedule streaming. Queues are empty");
                return Ok(true);
            }
        }

        self.start_loop();
        Ok(false)
    }
}
