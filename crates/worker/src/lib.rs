//! Background task scheduling for the ingestion engine.
//!
//! - [`BackgroundSchedulePool`] runs named tasks that can be scheduled,
//!   delayed and deactivated
//! - [`Backoff`] grows the reschedule delay of idle recurring tasks

pub mod backoff;
pub mod scheduler;

pub use backoff::*;
pub use scheduler::*;
