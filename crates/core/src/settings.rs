//! Table, server and query settings.
//!
//! [`NatsSettings`] are the options given in a table definition. Values are
//! strings subject to macro expansion (see [`crate::macros`]) until the table
//! is created. [`GlobalSettings`] hold server-wide defaults and
//! [`QuerySettings`] the per-session knobs consulted by direct reads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::error::{Error, Result};

/// Options of a NATS table.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NatsSettings {
    /// Single server URL, e.g. `nats://localhost:4222`
    pub nats_url: String,
    /// Comma-separated server list, used when `nats_url` is empty
    pub nats_server_list: String,
    /// Comma-separated subject list
    pub nats_subjects: String,
    /// Row format of message payloads
    pub nats_format: String,
    /// Schema name handed to schema-based formats
    pub nats_schema: String,
    /// Number of consumers (subscriptions) per table
    #[validate(range(min = 1, max = 64))]
    pub nats_num_consumers: u32,
    /// Queue group; defaults to `database.table`
    pub nats_queue_group: Option<String>,
    /// Use TLS
    pub nats_secure: bool,
    /// Maximum reconnect attempts of the client library
    pub nats_max_reconnect: u32,
    /// Wait between client library reconnect attempts, in milliseconds
    pub nats_reconnect_wait: u64,
    pub nats_username: String,
    pub nats_password: String,
    pub nats_token: String,
    /// Delimiter appended to every produced row
    pub nats_row_delimiter: Option<char>,
    /// Rows per block pushed into views
    #[validate(range(min = 1))]
    pub nats_max_block_size: Option<usize>,
    /// Time limit of one streaming pass, in milliseconds
    #[validate(range(min = 1))]
    pub nats_flush_interval_ms: Option<u64>,
    /// Broken messages tolerated per block
    pub nats_skip_broken_messages: u64,

    // Non-NATS settings forwarded to the format layer.
    pub format_csv_delimiter: char,
    pub format_csv_allow_cr_end_of_line: bool,
    pub input_format_skip_unknown_fields: bool,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            nats_url: String::new(),
            nats_server_list: String::new(),
            nats_subjects: String::new(),
            nats_format: String::new(),
            nats_schema: String::new(),
            nats_num_consumers: 1,
            nats_queue_group: None,
            nats_secure: false,
            nats_max_reconnect: 5,
            nats_reconnect_wait: 2000,
            nats_username: String::new(),
            nats_password: String::new(),
            nats_token: String::new(),
            nats_row_delimiter: None,
            nats_max_block_size: None,
            nats_flush_interval_ms: None,
            nats_skip_broken_messages: 0,
            format_csv_delimiter: ',',
            format_csv_allow_cr_end_of_line: false,
            input_format_skip_unknown_fields: true,
        }
    }
}

impl NatsSettings {
    /// Checks required options and value ranges.
    pub fn check(&self) -> Result<()> {
        if self.nats_url.is_empty() && self.nats_server_list.is_empty() {
            return Err(Error::missing_setting(
                "You must specify either `nats_url` or `nats_server_list` settings",
            ));
        }

        if self.nats_format.is_empty() {
            return Err(Error::missing_setting("You must specify `nats_format` setting"));
        }

        self.validate()
            .map_err(|e| Error::validation(format!("nats settings: {}", e)))
    }
}

/// Split a comma-separated list and trim every item.
pub fn parse_list(list: &str) -> Vec<String> {
    if list.is_empty() {
        return Vec::new();
    }
    list.split(',').map(|item| item.trim().to_string()).collect()
}

/// Server-wide fallback credentials (`nats.*` in server config).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsDefaults {
    pub username: String,
    pub password: String,
    pub token: String,
}

/// Server-wide settings shared by every table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub max_insert_block_size: usize,
    pub stream_flush_interval_ms: u64,
    pub message_broker_schedule_pool_size: usize,
    pub nats: NatsDefaults,
    pub macros: BTreeMap<String, String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            max_insert_block_size: 1_048_576,
            stream_flush_interval_ms: 7500,
            message_broker_schedule_pool_size: 16,
            nats: NatsDefaults::default(),
            macros: BTreeMap::new(),
        }
    }
}

/// Session settings of a query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub stream_like_engine_allow_direct_select: bool,
}

/// Context a query runs with.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub settings: QuerySettings,
}

impl QueryContext {
    pub fn new(settings: QuerySettings) -> Self {
        Self { settings }
    }

    /// A context with direct select from stream-like engines enabled.
    pub fn allow_direct_select() -> Self {
        Self::new(QuerySettings {
            stream_like_engine_allow_direct_select: true,
        })
    }
}
