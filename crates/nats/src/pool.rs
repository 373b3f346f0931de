//! Pool of leasable consumer buffers.
//!
//! Free buffers sit in a bounded channel: acquiring receives one (optionally
//! with a timeout), releasing sends it back. A buffer is therefore either in
//! the channel or held by exactly one reader.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use engine_core::{Error, Result};
use telemetry::metrics;
use tokio::sync::{mpsc, Mutex};
use tracing::error;

use crate::consumer::ConsumerBuffer;

pub struct ConsumerBufferPool {
    sender: mpsc::Sender<ConsumerBuffer>,
    receiver: Mutex<mpsc::Receiver<ConsumerBuffer>>,
    created: AtomicUsize,
}

impl ConsumerBufferPool {
    /// A pool able to hold up to `max_buffers` buffers.
    pub fn new(max_buffers: usize) -> Self {
        let (sender, receiver) = mpsc::channel(max_buffers.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
            created: AtomicUsize::new(0),
        }
    }

    /// Adds a newly created buffer.
    pub fn add(&self, buffer: ConsumerBuffer) -> Result<()> {
        self.sender
            .try_send(buffer)
            .map_err(|_| Error::logical("consumer buffer pool is full"))?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Leases a free buffer.
    ///
    /// `None` waits indefinitely, a zero timeout never waits, anything else
    /// waits at most that long.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Option<ConsumerBuffer> {
        let buffer = match timeout {
            None => self.receiver.lock().await.recv().await,
            Some(timeout) if timeout.is_zero() => match self.receiver.try_lock() {
                Ok(mut receiver) => receiver.try_recv().ok(),
                Err(_) => None,
            },
            Some(timeout) => tokio::time::timeout(timeout, async {
                self.receiver.lock().await.recv().await
            })
            .await
            .ok()
            .flatten(),
        }?;

        metrics().leased_buffers.inc();
        Some(buffer)
    }

    /// Returns a leased buffer. Never blocks.
    pub fn release(&self, buffer: ConsumerBuffer) {
        metrics().leased_buffers.dec();
        if self.sender.try_send(buffer).is_err() {
            error!("Consumer buffer released into a full pool");
        }
    }

    /// Takes every buffer out of the pool for teardown, waiting for leased
    /// ones to come back. The pool is empty afterwards.
    pub async fn drain(&self) -> Vec<ConsumerBuffer> {
        let mut buffers = Vec::new();
        let mut receiver = self.receiver.lock().await;
        while self.created.load(Ordering::SeqCst) > 0 {
            match receiver.recv().await {
                Some(buffer) => {
                    self.created.fetch_sub(1, Ordering::SeqCst);
                    buffers.push(buffer);
                }
                None => break,
            }
        }
        buffers
    }

    /// Number of buffers created for this pool (leased + free).
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Buffers held by readers. Derived from the free count, so a buffer in
    /// the middle of an acquire or release is never counted twice.
    pub fn leased(&self) -> usize {
        self.created().saturating_sub(self.free())
    }

    pub fn free(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}
