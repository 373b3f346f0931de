//! Per-table state shared by background tasks, sources and sinks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use nats_broker::{EventLoopHandler, LoopState};
use parking_lot::Mutex;
use telemetry::metrics;
use worker::Backoff;

pub struct TableContext {
    shutdown: Arc<AtomicBool>,
    mv_attached: AtomicBool,
    /// Active direct readers; also serializes loop stop decisions.
    readers: Mutex<usize>,
    handler: EventLoopHandler,
    backoff: Backoff,
    streaming_passes: AtomicU64,
    streaming_errors: AtomicU64,
}

impl TableContext {
    pub fn new(handler: EventLoopHandler, backoff: Backoff) -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            mv_attached: AtomicBool::new(false),
            readers: Mutex::new(0),
            handler,
            backoff,
            streaming_passes: AtomicU64::new(0),
            streaming_errors: AtomicU64::new(0),
        }
    }

    /// Flag shared with consumer buffers.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Returns true if shutdown was already signaled.
    pub fn signal_shutdown(&self) -> bool {
        self.shutdown.swap(true, Ordering::SeqCst)
    }

    pub fn mv_attached(&self) -> bool {
        self.mv_attached.load(Ordering::SeqCst)
    }

    pub fn set_mv_attached(&self, attached: bool) {
        self.mv_attached.store(attached, Ordering::SeqCst);
    }

    pub fn handler(&self) -> &EventLoopHandler {
        &self.handler
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn readers(&self) -> usize {
        *self.readers.lock()
    }

    pub fn increment_reader(&self) {
        *self.readers.lock() += 1;
        metrics().active_readers.inc();
    }

    /// The last reader stops the loop unless views are being streamed to.
    pub fn decrement_reader(&self) {
        let mut readers = self.readers.lock();
        *readers = readers.saturating_sub(1);
        metrics().active_readers.dec();
        if *readers == 0 && !self.mv_attached() {
            self.handler.update_loop_state(LoopState::Stop);
        }
    }

    pub fn stop_loop(&self) {
        self.handler.update_loop_state(LoopState::Stop);
    }

    pub fn stop_loop_if_no_readers(&self) {
        let readers = self.readers.lock();
        if *readers > 0 {
            return;
        }
        self.handler.update_loop_state(LoopState::Stop);
    }

    pub fn record_streaming_pass(&self) {
        self.streaming_passes.fetch_add(1, Ordering::SeqCst);
        metrics().streaming_passes.inc();
    }

    pub fn streaming_passes(&self) -> u64 {
        self.streaming_passes.load(Ordering::SeqCst)
    }

    pub fn record_streaming_error(&self) {
        self.streaming_errors.fetch_add(1, Ordering::SeqCst);
        metrics().streaming_errors.inc();
    }

    pub fn streaming_errors(&self) -> u64 {
        self.streaming_errors.load(Ordering::SeqCst)
    }
}
