//! Table definitions and message generators.

use engine_core::{Block, ColumnDescription, DataType, NatsSettings, StorageId, Value};

pub const DATABASE: &str = "default";
pub const QUEUE: &str = "queue";
pub const TARGET: &str = "events";
pub const VIEW: &str = "events_mv";

pub fn id(table: &str) -> StorageId {
    StorageId::new(DATABASE, table)
}

/// `key UInt64, value String`
pub fn columns() -> Vec<ColumnDescription> {
    vec![
        ColumnDescription::new("key", DataType::UInt64),
        ColumnDescription::new("value", DataType::String),
    ]
}

/// JSONEachRow table settings with a short flush interval.
pub fn settings(subjects: &str, num_consumers: u32) -> NatsSettings {
    NatsSettings {
        nats_url: "nats://localhost:4222".into(),
        nats_subjects: subjects.into(),
        nats_format: "JSONEachRow".into(),
        nats_num_consumers: num_consumers,
        nats_flush_interval_ms: Some(100),
        ..Default::default()
    }
}

/// One JSONEachRow message.
pub fn json_message(key: u64, value: &str) -> String {
    serde_json::json!({ "key": key, "value": value }).to_string()
}

/// `n` messages with keys `0..n`.
pub fn json_messages(n: u64) -> Vec<String> {
    (0..n).map(|key| json_message(key, &format!("value-{}", key))).collect()
}

/// A block matching [`columns`].
pub fn block(rows: &[(u64, &str)]) -> Block {
    Block::with_rows(
        vec!["key".into(), "value".into()],
        rows.iter()
            .map(|(key, value)| vec![Value::UInt(*key), Value::String(value.to_string())])
            .collect(),
    )
}

/// Insert body for `POST /tables/:database/:table/insert`.
pub fn insert_payload(rows: &[(u64, &str)]) -> serde_json::Value {
    serde_json::json!({
        "columns": ["key", "value"],
        "rows": rows.iter().map(|(key, value)| serde_json::json!([key, value])).collect::<Vec<_>>(),
    })
}

/// Sorted keys of target rows whose first column is the key.
pub fn keys(rows: &[Vec<Value>]) -> Vec<u64> {
    let mut keys: Vec<u64> = rows
        .iter()
        .filter_map(|row| match row.first() {
            Some(Value::UInt(key)) => Some(*key),
            Some(Value::Int(key)) => u64::try_from(*key).ok(),
            _ => None,
        })
        .collect();
    keys.sort_unstable();
    keys
}
