//! Event loop of one broker connection.
//!
//! The loop is owned by a single task that receives commands over a channel.
//! Whoever runs the loop, steps it once or leases it exclusively talks to
//! that task, so only one party is ever inside the loop. While the loop is
//! running it polls the transport every tick and still serves leases, which
//! pause polling until the lease is dropped.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use engine_core::{Error, Result};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace};

use crate::transport::Transport;

/// Interval between transport polls while the loop runs.
pub const DEFAULT_LOOP_TICK: Duration = Duration::from_millis(5);

const COMMAND_QUEUE_SIZE: usize = 64;

/// Requested state of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Run = 1,
    Stop = 2,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        if value == Self::Run as u8 {
            Self::Run
        } else {
            Self::Stop
        }
    }
}

enum Command {
    Run {
        done: oneshot::Sender<()>,
    },
    Iterate {
        done: oneshot::Sender<usize>,
    },
    Lease {
        granted: oneshot::Sender<()>,
        released: oneshot::Receiver<()>,
    },
}

struct Shared {
    loop_state: AtomicU8,
    loop_running: AtomicBool,
    connection_running: AtomicBool,
    state_changed: Notify,
}

/// Exclusive access to the loop; the loop stays paused until this is dropped.
#[must_use = "the lease is released as soon as the guard is dropped"]
pub struct LoopGuard {
    _release: oneshot::Sender<()>,
}

/// Handle to the event loop. Cheap to clone.
#[derive(Clone)]
pub struct EventLoopHandler {
    commands: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl EventLoopHandler {
    /// Spawns the loop owner on the current runtime.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_tick(transport, DEFAULT_LOOP_TICK)
    }

    pub fn with_tick(transport: Arc<dyn Transport>, tick: Duration) -> Self {
        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let shared = Arc::new(Shared {
            loop_state: AtomicU8::new(LoopState::Run as u8),
            loop_running: AtomicBool::new(false),
            connection_running: AtomicBool::new(false),
            state_changed: Notify::new(),
        });

        let owner = LoopOwner {
            transport,
            commands: receiver,
            shared: shared.clone(),
            tick,
        };
        tokio::spawn(owner.serve());

        Self { commands, shared }
    }

    /// Runs the loop until its state becomes [`LoopState::Stop`].
    ///
    /// Returns immediately if another caller is already running it.
    pub async fn start_loop(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Run { done }).await.is_ok() {
            let _ = finished.await;
        }
    }

    /// One non-blocking pass over pending I/O. Does nothing while the loop
    /// runs elsewhere.
    pub async fn iterate_loop(&self) -> usize {
        if self.loop_running() {
            return 0;
        }

        let (done, result) = oneshot::channel();
        if self.commands.send(Command::Iterate { done }).await.is_err() {
            return 0;
        }
        result.await.unwrap_or(0)
    }

    /// Leases the loop for direct use of the connection, e.g. a synchronous send.
    pub async fn lock_loop(&self) -> Result<LoopGuard> {
        let (granted, on_granted) = oneshot::channel();
        let (release, released) = oneshot::channel();

        self.commands
            .send(Command::Lease { granted, released })
            .await
            .map_err(|_| Error::logical("event loop owner has stopped"))?;
        on_granted
            .await
            .map_err(|_| Error::logical("event loop owner has stopped"))?;

        Ok(LoopGuard { _release: release })
    }

    pub fn stop_loop(&self) {
        self.update_loop_state(LoopState::Stop);
    }

    pub fn update_loop_state(&self, state: LoopState) {
        self.shared.loop_state.store(state as u8, Ordering::SeqCst);
        self.shared.state_changed.notify_one();
    }

    pub fn loop_state(&self) -> LoopState {
        LoopState::from_u8(self.shared.loop_state.load(Ordering::SeqCst))
    }

    pub fn loop_running(&self) -> bool {
        self.shared.loop_running.load(Ordering::SeqCst)
    }

    pub fn change_connection_status(&self, running: bool) {
        self.shared.connection_running.store(running, Ordering::SeqCst);
    }

    pub fn connection_running(&self) -> bool {
        self.shared.connection_running.load(Ordering::SeqCst)
    }
}

struct LoopOwner {
    transport: Arc<dyn Transport>,
    commands: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    tick: Duration,
}

impl LoopOwner {
    async fn serve(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Run { done } => {
                    self.run().await;
                    let _ = done.send(());
                }
                Command::Iterate { done } => {
                    let processed = self.step().await;
                    let _ = done.send(processed);
                }
                Command::Lease { granted, released } => {
                    if granted.send(()).is_ok() {
                        let _ = released.await;
                    }
                }
            }
        }
        trace!("Event loop owner finished");
    }

    async fn run(&mut self) {
        self.shared.loop_running.store(true, Ordering::SeqCst);
        debug!("Event loop started");

        while self.state() == LoopState::Run {
            self.step().await;

            tokio::select! {
                biased;
                _ = self.shared.state_changed.notified() => {}
                command = self.commands.recv() => match command {
                    Some(Command::Run { done }) => {
                        let _ = done.send(());
                    }
                    Some(Command::Iterate { done }) => {
                        let _ = done.send(0);
                    }
                    Some(Command::Lease { granted, released }) => {
                        if granted.send(()).is_ok() {
                            let _ = released.await;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep(self.tick) => {}
            }
        }

        self.shared.loop_running.store(false, Ordering::SeqCst);
        debug!("Event loop stopped");
    }

    async fn step(&self) -> usize {
        match self.transport.poll().await {
            Ok(processed) => processed,
            Err(e) => {
                trace!(error = %e, "Event loop pass failed");
                0
            }
        }
    }

    fn state(&self) -> LoopState {
        LoopState::from_u8(self.shared.loop_state.load(Ordering::SeqCst))
    }
}
