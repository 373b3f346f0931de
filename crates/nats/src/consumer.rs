//! Consumer read handles.
//!
//! A [`ConsumerBuffer`] wraps the subscriptions of one consumer (one per
//! subject, all in the same queue group) and the bounded queue the event
//! loop delivers into. Messages pulled from it are acknowledged in bulk
//! with [`ConsumerBuffer::ack`] once they have been processed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use engine_core::Result;
use telemetry::metrics;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::transport::{Ack, Message, SubscriptionId, Transport};

/// Lower bound of the per-consumer queue capacity.
pub const MIN_QUEUE_SIZE: usize = 100_000;

/// One consumer of a table.
pub struct ConsumerBuffer {
    transport: Arc<dyn Transport>,
    subjects: Vec<String>,
    queue_group: String,
    subscriptions: Vec<SubscriptionId>,
    // Kept so the queue stays open while subscriptions exist.
    _sender: mpsc::Sender<Message>,
    receiver: mpsc::Receiver<Message>,
    pending_acks: Vec<Ack>,
    shutdown: Arc<AtomicBool>,
}

impl ConsumerBuffer {
    /// Subscribes to every subject. On failure the subscriptions made so far
    /// are removed again.
    pub async fn new(
        transport: Arc<dyn Transport>,
        subjects: Vec<String>,
        queue_group: String,
        queue_size: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(queue_size.max(MIN_QUEUE_SIZE));

        let mut subscriptions = Vec::with_capacity(subjects.len());
        for subject in &subjects {
            match transport.subscribe(subject, &queue_group, sender.clone()).await {
                Ok(id) => subscriptions.push(id),
                Err(e) => {
                    for id in subscriptions {
                        let _ = transport.unsubscribe(id).await;
                    }
                    return Err(e);
                }
            }
        }

        debug!(subjects = ?subjects, queue_group = %queue_group, "Consumer subscribed");

        Ok(Self {
            transport,
            subjects,
            queue_group,
            subscriptions,
            _sender: sender,
            receiver,
            pending_acks: Vec::new(),
            shutdown,
        })
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    pub fn queue_group(&self) -> &str {
        &self.queue_group
    }

    pub fn queue_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_consumer_stopped(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Pops the next delivered message without waiting. The message is
    /// acknowledged by the next [`ConsumerBuffer::ack`].
    pub fn next_message(&mut self) -> Option<Message> {
        if self.is_consumer_stopped() {
            return None;
        }

        let message = self.receiver.try_recv().ok()?;
        self.pending_acks.push(message.ack());
        metrics().messages_received.inc();
        Some(message)
    }

    /// Hands the acknowledgements of every pulled message to the transport.
    pub fn ack(&mut self) -> usize {
        if self.pending_acks.is_empty() {
            return 0;
        }

        let acks = std::mem::take(&mut self.pending_acks);
        let count = acks.len();
        self.transport.ack(acks);
        metrics().messages_acked.inc_by(count as u64);
        count
    }

    /// Returns every pulled message to the broker unacknowledged so it is
    /// delivered again.
    pub fn discard_acks(&mut self) -> usize {
        if self.pending_acks.is_empty() {
            return 0;
        }

        let acks = std::mem::take(&mut self.pending_acks);
        let count = acks.len();
        self.transport.nack(acks);
        metrics().messages_requeued.inc_by(count as u64);
        count
    }

    pub fn pending_acks(&self) -> usize {
        self.pending_acks.len()
    }

    /// Removes every subscription. Only called during shutdown.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        for id in std::mem::take(&mut self.subscriptions) {
            if let Err(e) = self.transport.unsubscribe(id).await {
                warn!(subscription = id, error = %e, "Failed to unsubscribe");
            }
        }
        Ok(())
    }
}
