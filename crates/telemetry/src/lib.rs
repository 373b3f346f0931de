//! Internal telemetry for the NATS ingestion engine.
//!
//! Metrics and component health live in process-wide registries that the
//! HTTP layer reports on.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
