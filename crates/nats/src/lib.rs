//! NATS connectivity for the ingestion engine: connection management, the
//! event loop, consumer buffers and the write path.

pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod handler;
pub mod health;
pub mod memory;
pub mod pool;
pub mod producer;
pub mod transport;

pub use client::NatsClient;
pub use config::*;
pub use connection::*;
pub use consumer::*;
pub use handler::*;
pub use memory::MemoryBroker;
pub use pool::*;
pub use producer::*;
pub use transport::*;
