//! Transport wrappers for testing.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use engine_core::Result;
use nats_broker::{Ack, ConnectOptions, MemoryBroker, Message, SubscriptionId, Transport};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Calls seen by a [`RecordingTransport`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Connect,
    Close,
    Subscribe,
    Unsubscribe,
    Poll,
}

/// Forwards to a [`MemoryBroker`] and records every call that touches the
/// connection or its subscriptions.
#[derive(Clone)]
pub struct RecordingTransport {
    pub broker: Arc<MemoryBroker>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl RecordingTransport {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Calls recorded after the first `call`, or `None` if it never happened.
    pub fn calls_after(&self, call: Call) -> Option<Vec<Call>> {
        let calls = self.calls();
        let first = calls.iter().position(|c| *c == call)?;
        Some(calls[first + 1..].to_vec())
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<()> {
        self.record(Call::Connect);
        self.broker.connect(options).await
    }

    fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    async fn close(&self) {
        self.record(Call::Close);
        self.broker.close().await
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        delivery: mpsc::Sender<Message>,
    ) -> Result<SubscriptionId> {
        self.record(Call::Subscribe);
        self.broker.subscribe(subject, queue_group, delivery).await
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<()> {
        self.record(Call::Unsubscribe);
        self.broker.unsubscribe(subscription).await
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.broker.publish(subject, payload).await
    }

    fn ack(&self, acks: Vec<Ack>) {
        self.broker.ack(acks)
    }

    fn nack(&self, acks: Vec<Ack>) {
        self.broker.nack(acks)
    }

    async fn poll(&self) -> Result<usize> {
        self.record(Call::Poll);
        self.broker.poll().await
    }
}
