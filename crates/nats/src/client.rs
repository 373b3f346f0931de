//! NATS server transport built on `async-nats`.
//!
//! Core NATS delivers at most once: the server keeps nothing after a
//! message is handed out, so acknowledgements have nobody to go to and a
//! message lost with the connection is not redelivered. Queue groups,
//! subject wildcards and reconnects are the server's and the client
//! library's.
//!
//! The client library drives its own I/O. Each subscription gets a
//! forwarding task pushing messages into the consumer queue; a full queue
//! holds the task back, which in turn leaves messages with the client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::connection::State;
use async_trait::async_trait;
use bytes::Bytes;
use engine_core::{Error, Result};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::transport::{Ack, ConnectOptions, Message, SubscriptionId, Transport};

/// Upper bound of the delay between two reconnect attempts of the client.
const MAX_RECONNECT_WAIT: Duration = Duration::from_secs(30);

/// Connection to a NATS server.
#[derive(Default)]
pub struct NatsClient {
    client: RwLock<Option<async_nats::Client>>,
    subscriptions: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
    next_subscription: AtomicU64,
    next_sequence: Arc<AtomicU64>,
}

impl NatsClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<async_nats::Client> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| Error::transport("not connected"))
    }

    fn client_options(options: &ConnectOptions) -> async_nats::ConnectOptions {
        let wait = options.reconnect_wait;
        let mut client_options = async_nats::ConnectOptions::new()
            .require_tls(options.secure)
            .max_reconnects(Some(options.max_reconnect as usize))
            .reconnect_delay_callback(move |attempts| {
                wait.saturating_mul(attempts.max(1) as u32).min(MAX_RECONNECT_WAIT)
            });

        if let Some((user, password)) = &options.credentials.user_password {
            client_options = client_options.user_and_password(user.clone(), password.clone());
        }
        if let Some(token) = &options.credentials.token {
            client_options = client_options.token(token.clone());
        }
        client_options
    }
}

#[async_trait]
impl Transport for NatsClient {
    async fn connect(&self, options: &ConnectOptions) -> Result<()> {
        if options.servers.is_empty() {
            return Err(Error::bad_arguments("no servers to connect to"));
        }

        let servers = options.servers.join(",");
        let client = Self::client_options(options)
            .connect(servers.as_str())
            .await
            .map_err(|e| Error::cannot_connect(format!("{}: {}", servers, e)))?;

        info!(servers = %servers, secure = options.secure, "Connected to NATS server");
        *self.client.write() = Some(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client
            .read()
            .as_ref()
            .is_some_and(|client| client.connection_state() == State::Connected)
    }

    async fn close(&self) {
        for (_, forwarder) in self.subscriptions.lock().drain() {
            forwarder.abort();
        }

        let client = self.client.write().take();
        if let Some(client) = client {
            if let Err(e) = client.flush().await {
                debug!(error = %e, "Flush on close failed");
            }
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        delivery: mpsc::Sender<Message>,
    ) -> Result<SubscriptionId> {
        let client = self.client()?;
        let subscribed = if queue_group.is_empty() {
            client.subscribe(subject.to_string()).await
        } else {
            client
                .queue_subscribe(subject.to_string(), queue_group.to_string())
                .await
        };
        let mut subscriber = subscribed
            .map_err(|e| Error::transport(format!("cannot subscribe to {}: {}", subject, e)))?;

        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
        let sequence = self.next_sequence.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(received) = subscriber.next().await {
                let message = Message {
                    subject: received.subject.to_string(),
                    payload: received.payload,
                    subscription: id,
                    sequence: sequence.fetch_add(1, Ordering::SeqCst) + 1,
                };
                if delivery.send(message).await.is_err() {
                    break;
                }
            }
            trace!(subscription = id, "Subscription forwarder finished");
        });

        self.subscriptions.lock().insert(id, forwarder);
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<()> {
        // Dropping the subscriber with its task unsubscribes on the server.
        if let Some(forwarder) = self.subscriptions.lock().remove(&subscription) {
            forwarder.abort();
        }
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client()?
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| Error::transport(format!("cannot publish to {}: {}", subject, e)))
    }

    fn ack(&self, acks: Vec<Ack>) {
        trace!(count = acks.len(), "Core NATS has no acknowledgements");
    }

    fn nack(&self, acks: Vec<Ack>) {
        if !acks.is_empty() {
            warn!(
                count = acks.len(),
                "Unprocessed messages cannot be returned to a core NATS server"
            );
        }
    }

    async fn poll(&self) -> Result<usize> {
        if !self.is_connected() {
            return Err(Error::transport("not connected"));
        }
        Ok(0)
    }
}
