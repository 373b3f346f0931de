//! Core types, settings and row formats for the NATS ingestion engine.

pub mod block;
pub mod error;
pub mod format;
pub mod macros;
pub mod settings;
pub mod table;

pub use block::*;
pub use error::{Error, Result};
pub use format::{get_format, FormatSettings, RowFormat};
pub use macros::Macros;
pub use settings::*;
pub use table::*;
