//! Broker transport seam.
//!
//! The wire protocol lives behind [`Transport`]. Everything above it
//! (connection management, the event loop, consumers and producers) only
//! talks to this trait, so the [`NatsClient`](crate::client::NatsClient)
//! or the in-process [`MemoryBroker`](crate::memory::MemoryBroker) can be
//! plugged in.
//!
//! The in-process broker is cooperative: deliveries into subscriber queues
//! and pending acknowledgements are only processed inside
//! [`Transport::poll`], which the event loop calls. A client library
//! driving its own I/O may deliver at any time and treat `poll` as a
//! liveness check.

use async_trait::async_trait;
use bytes::Bytes;
use engine_core::Result;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifier of one subscription on a connection.
pub type SubscriptionId = u64;

/// A message received on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
    pub subscription: SubscriptionId,
    /// Delivery sequence, unique per transport
    pub sequence: u64,
}

impl Message {
    pub fn ack(&self) -> Ack {
        Ack {
            subscription: self.subscription,
            sequence: self.sequence,
        }
    }
}

/// Acknowledgement of one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ack {
    pub subscription: SubscriptionId,
    pub sequence: u64,
}

/// Authentication handed to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user_password: Option<(String, String)>,
    pub token: Option<String>,
}

/// Everything a transport needs to establish a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub servers: Vec<String>,
    pub credentials: Credentials,
    pub secure: bool,
    /// Reconnect attempts of the client library itself
    pub max_reconnect: u32,
    pub reconnect_wait: Duration,
}

/// A broker connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens the connection. Does not retry.
    async fn connect(&self, options: &ConnectOptions) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Closes the connection. Unacknowledged deliveries become pending again.
    async fn close(&self);

    /// Subscribes to `subject` within `queue_group`. Messages are pushed into
    /// `delivery` by [`Transport::poll`]; a full queue leaves them pending.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        delivery: mpsc::Sender<Message>,
    ) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<()>;

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Queues acknowledgements; they are sent by the next [`Transport::poll`].
    fn ack(&self, acks: Vec<Ack>);

    /// Hands delivered messages back unprocessed so they are delivered
    /// again, ahead of anything routed since. Sequences that are no longer
    /// in flight are ignored.
    fn nack(&self, acks: Vec<Ack>);

    /// One non-blocking pass over pending I/O. Returns the number of
    /// deliveries and acknowledgements processed.
    async fn poll(&self) -> Result<usize>;
}
