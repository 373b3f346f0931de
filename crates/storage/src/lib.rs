//! NATS table engine.
//!
//! A [`StorageNats`] table keeps a connection to NATS, owns a pool of
//! consumers and streams received messages into the materialized views
//! that depend on it. Direct reads and writes go through [`NatsSource`]
//! and [`NatsSink`].

pub mod catalog;
pub mod context;
pub mod database;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod storage;
mod streaming;

pub use catalog::*;
pub use context::TableContext;
pub use database::MemoryDatabase;
pub use pipeline::*;
pub use sink::NatsSink;
pub use source::{NatsSource, SourceOptions};
pub use storage::*;
