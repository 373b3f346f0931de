//! Table identity, column descriptions and virtual columns.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::block::Value;
use crate::error::{Error, Result};

/// Name of the virtual column carrying the originating subject of a row.
pub const SUBJECT_COLUMN: &str = "_subject";

/// Fully qualified table identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageId {
    pub database: String,
    pub table: String,
}

impl StorageId {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }

    /// `database.table`, used as the default queue group.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`.`{}`", self.database, self.table)
    }
}

/// Column data types understood by the row formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    String,
    Int64,
    UInt64,
    Float64,
    Bool,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Int64 => "Int64",
            Self::UInt64 => "UInt64",
            Self::Float64 => "Float64",
            Self::Bool => "Bool",
        }
    }

    /// Value used when a field is absent from the input.
    pub fn default_value(&self) -> Value {
        match self {
            Self::String => Value::String(String::new()),
            Self::Int64 => Value::Int(0),
            Self::UInt64 => Value::UInt(0),
            Self::Float64 => Value::Float(0.0),
            Self::Bool => Value::Bool(false),
        }
    }

    /// Parses the textual representation of a field.
    pub fn parse_text(&self, text: &str) -> Result<Value> {
        let bad = || Error::incorrect_data(format!("cannot parse '{}' as {}", text, self.name()));
        Ok(match self {
            Self::String => Value::String(text.to_string()),
            Self::Int64 => Value::Int(text.trim().parse().map_err(|_| bad())?),
            Self::UInt64 => Value::UInt(text.trim().parse().map_err(|_| bad())?),
            Self::Float64 => Value::Float(text.trim().parse().map_err(|_| bad())?),
            Self::Bool => match text.trim() {
                "1" | "true" | "TRUE" | "True" => Value::Bool(true),
                "0" | "false" | "FALSE" | "False" => Value::Bool(false),
                _ => {
                    return Err(Error::incorrect_data(format!(
                        "cannot parse '{}' as Bool",
                        text
                    )))
                }
            },
        })
    }
}

impl std::str::FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "String" => Ok(Self::String),
            "Int64" => Ok(Self::Int64),
            "UInt64" => Ok(Self::UInt64),
            "Float64" => Ok(Self::Float64),
            "Bool" => Ok(Self::Bool),
            other => Err(Error::bad_arguments(format!("unknown data type {}", other))),
        }
    }
}

/// A physical column of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

impl ColumnDescription {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Virtual columns exposed by NATS tables.
pub fn virtual_columns() -> Vec<ColumnDescription> {
    vec![ColumnDescription::new(SUBJECT_COLUMN, DataType::String)]
}

pub fn is_virtual_column(name: &str) -> bool {
    name == SUBJECT_COLUMN
}
