//! In-process broker implementing [`Transport`].
//!
//! Behaves like a NATS server with at-least-once delivery: published messages
//! are routed to matching subscriptions (one member per queue group), handed
//! to subscriber queues by [`Transport::poll`], and kept in flight until
//! acknowledged. Dropping the connection puts in-flight messages back in
//! front of the pending ones so they are redelivered after reconnect.

use async_trait::async_trait;
use bytes::Bytes;
use engine_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::transport::{Ack, ConnectOptions, Message, SubscriptionId, Transport};

struct Subscriber {
    subject: String,
    queue_group: String,
    delivery: mpsc::Sender<Message>,
    pending: VecDeque<Message>,
    in_flight: BTreeMap<u64, Message>,
}

#[derive(Default)]
struct BrokerState {
    next_subscription: SubscriptionId,
    next_sequence: u64,
    subscriptions: BTreeMap<SubscriptionId, Subscriber>,
    group_cursors: HashMap<String, usize>,
    pending_acks: Vec<Ack>,
    acked: u64,
    published: Vec<(String, Bytes)>,
    last_options: Option<ConnectOptions>,
}

impl BrokerState {
    fn route(&mut self, subject: &str, payload: &Bytes) -> usize {
        let mut groups: BTreeMap<String, Vec<SubscriptionId>> = BTreeMap::new();
        for (id, sub) in &self.subscriptions {
            if subject_matches(&sub.subject, subject) {
                groups.entry(sub.queue_group.clone()).or_default().push(*id);
            }
        }

        let mut targets = Vec::new();
        for (group, members) in groups {
            if group.is_empty() {
                targets.extend(members);
            } else {
                let cursor = self.group_cursors.entry(group).or_insert(0);
                targets.push(members[*cursor % members.len()]);
                *cursor = cursor.wrapping_add(1);
            }
        }

        for id in &targets {
            self.next_sequence += 1;
            let message = Message {
                subject: subject.to_string(),
                payload: payload.clone(),
                subscription: *id,
                sequence: self.next_sequence,
            };
            if let Some(sub) = self.subscriptions.get_mut(id) {
                sub.pending.push_back(message);
            }
        }

        targets.len()
    }

    fn requeue_in_flight(&mut self) {
        for sub in self.subscriptions.values_mut() {
            let in_flight = std::mem::take(&mut sub.in_flight);
            for (_, message) in in_flight.into_iter().rev() {
                sub.pending.push_front(message);
            }
        }
        self.pending_acks.clear();
    }

    fn requeue(&mut self, acks: &[Ack]) -> usize {
        let mut returned: BTreeMap<SubscriptionId, Vec<Message>> = BTreeMap::new();
        for ack in acks {
            if let Some(message) = self
                .subscriptions
                .get_mut(&ack.subscription)
                .and_then(|sub| sub.in_flight.remove(&ack.sequence))
            {
                returned.entry(ack.subscription).or_default().push(message);
            }
        }

        let mut count = 0;
        for (id, mut messages) in returned {
            messages.sort_by_key(|m| m.sequence);
            count += messages.len();
            if let Some(sub) = self.subscriptions.get_mut(&id) {
                for message in messages.into_iter().rev() {
                    sub.pending.push_front(message);
                }
            }
        }
        count
    }
}

/// NATS subject matching with `*` (one token) and `>` (the rest) wildcards.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// In-process broker.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    connected: AtomicBool,
    refuse_connections: AtomicBool,
    fail_publishes: AtomicBool,
    connections: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes as another client would, regardless of our connection.
    pub fn inject(&self, subject: &str, payload: impl Into<Bytes>) -> usize {
        self.state.lock().route(subject, &payload.into())
    }

    /// Makes subsequent connects fail (or succeed again).
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Makes publishes fail while the connection stays up.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Simulates a lost connection.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.state.lock().requeue_in_flight();
        debug!("Memory broker connection dropped");
    }

    /// Messages published through [`Transport::publish`].
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.state.lock().published.clone()
    }

    /// Messages routed but not yet handed to a subscriber queue.
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .subscriptions
            .values()
            .map(|s| s.pending.len())
            .sum()
    }

    /// Messages delivered and awaiting acknowledgement.
    pub fn in_flight_count(&self) -> usize {
        self.state
            .lock()
            .subscriptions
            .values()
            .map(|s| s.in_flight.len())
            .sum()
    }

    pub fn acked_count(&self) -> u64 {
        self.state.lock().acked
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Number of successful connects so far.
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn last_connect_options(&self) -> Option<ConnectOptions> {
        self.state.lock().last_options.clone()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, options: &ConnectOptions) -> Result<()> {
        if options.servers.is_empty() {
            return Err(Error::bad_arguments("no servers to connect to"));
        }
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(Error::cannot_connect(format!(
                "connection refused by {}",
                options.servers.join(", ")
            )));
        }

        self.state.lock().last_options = Some(options.clone());
        self.connected.store(true, Ordering::SeqCst);
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.drop_connection();
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        delivery: mpsc::Sender<Message>,
    ) -> Result<SubscriptionId> {
        if !self.is_connected() {
            return Err(Error::transport("cannot subscribe: not connected"));
        }

        let mut state = self.state.lock();
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscriptions.insert(
            id,
            Subscriber {
                subject: subject.to_string(),
                queue_group: queue_group.to_string(),
                delivery,
                pending: VecDeque::new(),
                in_flight: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<()> {
        self.state.lock().subscriptions.remove(&subscription);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::transport("cannot publish: not connected"));
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(Error::transport(format!("publish to {} rejected", subject)));
        }

        let mut state = self.state.lock();
        state.route(subject, &payload);
        state.published.push((subject.to_string(), payload));
        Ok(())
    }

    fn ack(&self, acks: Vec<Ack>) {
        self.state.lock().pending_acks.extend(acks);
    }

    fn nack(&self, acks: Vec<Ack>) {
        let requeued = self.state.lock().requeue(&acks);
        trace!(requeued, "Returned unprocessed deliveries");
    }

    async fn poll(&self) -> Result<usize> {
        if !self.is_connected() {
            return Err(Error::transport("not connected"));
        }

        let mut state = self.state.lock();
        let mut processed = 0;

        for ack in std::mem::take(&mut state.pending_acks) {
            let removed = state
                .subscriptions
                .get_mut(&ack.subscription)
                .and_then(|sub| sub.in_flight.remove(&ack.sequence))
                .is_some();
            if removed {
                state.acked += 1;
                processed += 1;
            }
        }

        let mut closed = Vec::new();
        for (id, sub) in state.subscriptions.iter_mut() {
            while let Some(message) = sub.pending.pop_front() {
                let copy = message.clone();
                match sub.delivery.try_send(message) {
                    Ok(()) => {
                        sub.in_flight.insert(copy.sequence, copy);
                        processed += 1;
                    }
                    Err(TrySendError::Full(message)) => {
                        sub.pending.push_front(message);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        closed.push(*id);
                        break;
                    }
                }
            }
        }

        for id in closed {
            trace!(subscription = id, "Dropping subscription with closed queue");
            state.subscriptions.remove(&id);
        }

        Ok(processed)
    }
}
