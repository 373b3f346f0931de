//! `{name}` substitution in table settings.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::table::StorageId;

static MACRO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid macro regex"));

/// Macro values available to one table.
#[derive(Debug, Clone, Default)]
pub struct Macros {
    values: BTreeMap<String, String>,
}

impl Macros {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    /// Server macros plus `{database}` and `{table}` of the given table.
    pub fn for_table(server: &BTreeMap<String, String>, table_id: &StorageId) -> Self {
        let mut values = server.clone();
        values.insert("database".into(), table_id.database.clone());
        values.insert("table".into(), table_id.table.clone());
        Self { values }
    }

    /// Replaces every `{name}` occurrence. Unknown macros are an error.
    pub fn expand(&self, input: &str) -> Result<String> {
        let mut missing = None;
        let expanded = MACRO.replace_all(input, |caps: &Captures<'_>| {
            let name = &caps[1];
            match self.values.get(name) {
                Some(value) => value.clone(),
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        });

        match missing {
            Some(name) => Err(Error::bad_arguments(format!(
                "No macro '{}' in config while processing '{}'",
                name, input
            ))),
            None => Ok(expanded.into_owned()),
        }
    }
}
