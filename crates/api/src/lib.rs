//! HTTP surface for operators of the NATS ingestion engine.

pub mod response;
pub mod routes;
pub mod state;

pub use routes::router;
pub use state::AppState;
