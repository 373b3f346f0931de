//! Shared helpers for the end-to-end scenarios.
//!
//! Tables run against the in-process [`nats_broker::MemoryBroker`] and
//! [`storage_nats::MemoryDatabase`], so no server is needed.

pub mod fixtures;
pub mod mocks;
pub mod setup;
