use serde_json::Map;

use crate::block::{Row, Value};
use crate::error::{Error, Result};
use crate::table::{ColumnDescription, DataType};

use super::{check_width, FormatSettings, RowFormat};

/// One JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonEachRowFormat {
    skip_unknown_fields: bool,
}

impl JsonEachRowFormat {
    pub fn new(settings: FormatSettings) -> Self {
        Self {
            skip_unknown_fields: settings.skip_unknown_fields,
        }
    }
}

fn convert(value: &serde_json::Value, column: &ColumnDescription) -> Result<Value> {
    use serde_json::Value as Json;

    let mismatch = || {
        Error::incorrect_data(format!(
            "cannot read {} from {} for column {}",
            column.data_type.name(),
            value,
            column.name
        ))
    };

    Ok(match (column.data_type, value) {
        (_, Json::Null) => Value::Null,
        (DataType::String, Json::String(s)) => Value::String(s.clone()),
        (DataType::String, other) => Value::String(other.to_string()),
        (DataType::Int64, Json::Number(n)) => Value::Int(n.as_i64().ok_or_else(mismatch)?),
        (DataType::UInt64, Json::Number(n)) => Value::UInt(n.as_u64().ok_or_else(mismatch)?),
        (DataType::Float64, Json::Number(n)) => Value::Float(n.as_f64().ok_or_else(mismatch)?),
        (DataType::Bool, Json::Bool(b)) => Value::Bool(*b),
        (DataType::Bool, Json::Number(n)) => Value::Bool(n.as_u64().ok_or_else(mismatch)? != 0),
        (data_type, Json::String(s)) => data_type.parse_text(s)?,
        _ => return Err(mismatch()),
    })
}

impl RowFormat for JsonEachRowFormat {
    fn name(&self) -> &'static str {
        "JSONEachRow"
    }

    fn parse(&self, payload: &[u8], columns: &[ColumnDescription]) -> Result<Vec<Row>> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| Error::incorrect_data(format!("invalid UTF-8 payload: {}", e)))?;

        let mut rows = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let object: Map<String, serde_json::Value> = serde_json::from_str(line)
                .map_err(|e| Error::incorrect_data(format!("invalid JSON row: {}", e)))?;

            if !self.skip_unknown_fields {
                if let Some(unknown) = object
                    .keys()
                    .find(|key| !columns.iter().any(|c| &c.name == *key))
                {
                    return Err(Error::incorrect_data(format!(
                        "Unknown field found while parsing JSONEachRow format: {}",
                        unknown
                    )));
                }
            }

            let row = columns
                .iter()
                .map(|column| match object.get(&column.name) {
                    Some(value) => convert(value, column),
                    None => Ok(column.data_type.default_value()),
                })
                .collect::<Result<Row>>()?;
            rows.push(row);
        }

        Ok(rows)
    }

    fn serialize(
        &self,
        row: &[Value],
        columns: &[ColumnDescription],
        out: &mut Vec<u8>,
    ) -> Result<()> {
        check_width(row.len(), columns)?;

        let mut object = Map::with_capacity(columns.len());
        for (column, value) in columns.iter().zip(row) {
            object.insert(column.name.clone(), serde_json::to_value(value)?);
        }
        serde_json::to_writer(&mut *out, &object)?;
        out.push(b'\n');
        Ok(())
    }
}
