//! Row formats turning message payloads into rows and back.
//!
//! A format is chosen by name when a table is created and shared by every
//! source and sink of that table.

mod csv;
mod json;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::block::{Row, Value};
use crate::error::{Error, Result};
use crate::settings::NatsSettings;
use crate::table::ColumnDescription;

pub use self::csv::CsvFormat;
pub use self::json::JsonEachRowFormat;

/// Format options derived from the table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatSettings {
    pub csv_delimiter: char,
    pub csv_allow_cr_end_of_line: bool,
    pub skip_unknown_fields: bool,
    /// Schema name for schema-based formats
    pub schema: Option<String>,
}

impl Default for FormatSettings {
    fn default() -> Self {
        Self {
            csv_delimiter: ',',
            csv_allow_cr_end_of_line: false,
            skip_unknown_fields: true,
            schema: None,
        }
    }
}

impl FormatSettings {
    pub fn from_table(settings: &NatsSettings, schema: &str) -> Self {
        Self {
            csv_delimiter: settings.format_csv_delimiter,
            csv_allow_cr_end_of_line: settings.format_csv_allow_cr_end_of_line,
            skip_unknown_fields: settings.input_format_skip_unknown_fields,
            schema: (!schema.is_empty()).then(|| schema.to_string()),
        }
    }
}

/// Text serialization of rows.
pub trait RowFormat: Send + Sync {
    fn name(&self) -> &'static str;

    /// Parses every row contained in one payload.
    fn parse(&self, payload: &[u8], columns: &[ColumnDescription]) -> Result<Vec<Row>>;

    /// Appends one serialized row, including its line terminator.
    fn serialize(&self, row: &[Value], columns: &[ColumnDescription], out: &mut Vec<u8>)
        -> Result<()>;
}

/// Looks up a format by name.
pub fn get_format(name: &str, settings: FormatSettings) -> Result<Arc<dyn RowFormat>> {
    match name {
        "CSV" => Ok(Arc::new(CsvFormat::new(settings)?)),
        "JSONEachRow" => Ok(Arc::new(JsonEachRowFormat::new(settings))),
        other => Err(Error::bad_arguments(format!("Unknown format {}", other))),
    }
}

fn check_width(row_len: usize, columns: &[ColumnDescription]) -> Result<()> {
    if row_len != columns.len() {
        return Err(Error::incorrect_data(format!(
            "expected {} fields, found {}",
            columns.len(),
            row_len
        )));
    }
    Ok(())
}
