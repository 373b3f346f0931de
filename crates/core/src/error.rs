//! Unified error types for the NATS ingestion engine.
//!
//! Every variant carries a stable code string so that callers outside the
//! process (operators, the HTTP surface, logs) can match on it:
//! - QUERY_NOT_ALLOWED: direct select rejected
//! - CANNOT_CONNECT_NATS: broker unreachable
//! - BAD_ARGUMENTS / NUMBER_OF_ARGUMENTS_DOESNT_MATCH: table definition errors
//! - INCORRECT_DATA: a message payload could not be parsed

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the ingestion engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("[QUERY_NOT_ALLOWED] {0}")]
    QueryNotAllowed(String),

    #[error("[CANNOT_CONNECT_NATS] {0}")]
    CannotConnect(String),

    #[error("[BAD_ARGUMENTS] {0}")]
    BadArguments(String),

    /// A required table setting is missing.
    #[error("[NUMBER_OF_ARGUMENTS_DOESNT_MATCH] {0}")]
    MissingSetting(String),

    #[error("[INCORRECT_DATA] {0}")]
    IncorrectData(String),

    #[error("[TRANSPORT_ERROR] {0}")]
    Transport(String),

    #[error("[VALIDATION_ERROR] {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("[LOGICAL_ERROR] {0}")]
    Logical(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn query_not_allowed(msg: impl Into<String>) -> Self {
        Self::QueryNotAllowed(msg.into())
    }

    pub fn cannot_connect(msg: impl Into<String>) -> Self {
        Self::CannotConnect(msg.into())
    }

    pub fn bad_arguments(msg: impl Into<String>) -> Self {
        Self::BadArguments(msg.into())
    }

    pub fn missing_setting(msg: impl Into<String>) -> Self {
        Self::MissingSetting(msg.into())
    }

    pub fn incorrect_data(msg: impl Into<String>) -> Self {
        Self::IncorrectData(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn logical(msg: impl Into<String>) -> Self {
        Self::Logical(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get the stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueryNotAllowed(_) => "QUERY_NOT_ALLOWED",
            Self::CannotConnect(_) => "CANNOT_CONNECT_NATS",
            Self::BadArguments(_) => "BAD_ARGUMENTS",
            Self::MissingSetting(_) => "NUMBER_OF_ARGUMENTS_DOESNT_MATCH",
            Self::IncorrectData(_) => "INCORRECT_DATA",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Serialization(_) => "INCORRECT_DATA",
            Self::Logical(_) => "LOGICAL_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error comes from a lost or refused broker connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::CannotConnect(_) | Self::Transport(_))
    }
}
