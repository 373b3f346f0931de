//! Broker connection ownership.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use telemetry::{health, metrics};
use tracing::{debug, error, info};

use crate::config::NatsConfiguration;
use crate::handler::EventLoopHandler;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Owns the connection of one table and the event loop bound to it.
///
/// Connect, reconnect and disconnect are serialized; none of them retries.
pub struct ConnectionManager {
    configuration: NatsConfiguration,
    transport: Arc<dyn Transport>,
    handler: EventLoopHandler,
    state: Mutex<ConnectionState>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Creates the manager and spawns the loop owner. Does not connect.
    pub fn new(configuration: NatsConfiguration, transport: Arc<dyn Transport>) -> Self {
        let handler = EventLoopHandler::new(transport.clone());
        Self {
            configuration,
            transport,
            handler,
            state: Mutex::new(ConnectionState::Disconnected),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn handler(&self) -> &EventLoopHandler {
        &self.handler
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn configuration(&self) -> &NatsConfiguration {
        &self.configuration
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        let connected = self.transport.is_connected() && self.handler.connection_running();
        if !connected {
            let mut state = self.state.lock();
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                health().nats.set_unhealthy("connection lost");
            }
        }
        connected
    }

    pub fn connection_info_for_log(&self) -> String {
        self.configuration.connection_info_for_log()
    }

    /// Initial connection attempt.
    pub async fn connect(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        self.connect_impl().await
    }

    /// Reconnects unless already connected, in which case this is a no-op.
    pub async fn reconnect(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return true;
        }

        debug!(connection = %self.connection_info_for_log(), "Trying to restore connection to NATS");
        metrics().reconnects.inc();
        self.disconnect_impl().await;
        self.connect_impl().await
    }

    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.disconnect_impl().await;
    }

    async fn connect_impl(&self) -> bool {
        *self.state.lock() = ConnectionState::Connecting;
        metrics().connection_attempts.inc();
        let start = Instant::now();

        let result = match self.configuration.connect_options() {
            Ok(options) => self.transport.connect(&options).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                *self.state.lock() = ConnectionState::Connected;
                self.handler.change_connection_status(true);
                metrics().active_connections.inc();
                health().nats.set_healthy();
                info!(
                    connection = %self.connection_info_for_log(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Connected to NATS"
                );
                true
            }
            Err(e) => {
                *self.state.lock() = ConnectionState::Disconnected;
                self.handler.change_connection_status(false);
                metrics().connection_failures.inc();
                health().nats.set_unhealthy(e.to_string());
                error!(
                    connection = %self.connection_info_for_log(),
                    error = %e,
                    "Cannot connect to NATS"
                );
                false
            }
        }
    }

    async fn disconnect_impl(&self) {
        let was_connected = {
            let mut state = self.state.lock();
            let was = *state == ConnectionState::Connected || self.handler.connection_running();
            *state = ConnectionState::Disconnected;
            was
        };
        if !was_connected && !self.transport.is_connected() {
            return;
        }

        self.transport.close().await;
        self.handler.change_connection_status(false);
        metrics().active_connections.dec();
        debug!(connection = %self.connection_info_for_log(), "Disconnected from NATS");
    }
}
