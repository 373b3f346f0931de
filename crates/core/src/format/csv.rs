use crate::block::{Row, Value};
use crate::error::{Error, Result};
use crate::table::ColumnDescription;

use super::{check_width, FormatSettings, RowFormat};

const BAD_DELIMITERS: &str = " \t\"'.UL";

/// Comma separated values with `""` quote escaping.
#[derive(Debug, Clone)]
pub struct CsvFormat {
    delimiter: u8,
    allow_cr_end_of_line: bool,
}

impl CsvFormat {
    pub fn new(settings: FormatSettings) -> Result<Self> {
        let delimiter = settings.csv_delimiter;
        if !delimiter.is_ascii() || BAD_DELIMITERS.contains(delimiter) {
            return Err(Error::bad_arguments(format!(
                "CSV format may not work correctly with delimiter '{}'",
                delimiter
            )));
        }

        Ok(Self {
            delimiter: delimiter as u8,
            allow_cr_end_of_line: settings.csv_allow_cr_end_of_line,
        })
    }

    fn read_row(&self, input: &[u8], mut pos: usize) -> Result<(Vec<String>, usize)> {
        let mut fields = Vec::new();

        loop {
            pos = skip_whitespace(input, pos);
            let (field, next) = self.read_field(input, pos)?;
            fields.push(field);
            pos = skip_whitespace(input, next);

            if pos < input.len() && input[pos] == self.delimiter {
                pos += 1;
                // Trailing delimiter before the end of line.
                let after = skip_whitespace(input, pos);
                if after == input.len() || input[after] == b'\n' || input[after] == b'\r' {
                    pos = after;
                    break;
                }
                continue;
            }
            break;
        }

        Ok((fields, self.skip_end_of_line(input, pos)?))
    }

    fn read_field(&self, input: &[u8], mut pos: usize) -> Result<(String, usize)> {
        let mut field = Vec::new();

        if pos < input.len() && input[pos] == b'"' {
            pos += 1;
            loop {
                match input[pos..].iter().position(|&b| b == b'"') {
                    None => return Err(Error::incorrect_data("unterminated quoted field")),
                    Some(offset) => {
                        field.extend_from_slice(&input[pos..pos + offset]);
                        pos += offset + 1;
                        if pos < input.len() && input[pos] == b'"' {
                            field.push(b'"');
                            pos += 1;
                        } else {
                            break;
                        }
                    }
                }
            }
        } else {
            let end = input[pos..]
                .iter()
                .position(|&b| b == self.delimiter || b == b'\n' || b == b'\r')
                .map_or(input.len(), |offset| pos + offset);
            field.extend_from_slice(&input[pos..end]);
            pos = end;
        }

        let field = String::from_utf8(field)
            .map_err(|e| Error::incorrect_data(format!("invalid UTF-8 in field: {}", e)))?;
        Ok((field, pos))
    }

    /// `\n`, `\r\n` and `\n\r` end a line; a lone `\r` only when allowed.
    fn skip_end_of_line(&self, input: &[u8], mut pos: usize) -> Result<usize> {
        if pos == input.len() {
            return Ok(pos);
        }

        match input[pos] {
            b'\n' => {
                pos += 1;
                if pos < input.len() && input[pos] == b'\r' {
                    pos += 1;
                }
                Ok(pos)
            }
            b'\r' => {
                pos += 1;
                if pos < input.len() && input[pos] == b'\n' {
                    Ok(pos + 1)
                } else if self.allow_cr_end_of_line {
                    Ok(pos)
                } else {
                    Err(Error::incorrect_data(
                        "Cannot parse CSV format: found \\r (CR) not followed by \\n (LF)",
                    ))
                }
            }
            other => Err(Error::incorrect_data(format!(
                "Expected end of line, found '{}'",
                other as char
            ))),
        }
    }
}

fn skip_whitespace(input: &[u8], mut pos: usize) -> usize {
    while pos < input.len() && (input[pos] == b' ' || input[pos] == b'\t') {
        pos += 1;
    }
    pos
}

impl RowFormat for CsvFormat {
    fn name(&self) -> &'static str {
        "CSV"
    }

    fn parse(&self, payload: &[u8], columns: &[ColumnDescription]) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        let mut pos = 0;

        while pos < payload.len() {
            if payload[pos] == b'\n' || payload[pos] == b'\r' {
                pos += 1;
                continue;
            }

            let (fields, next) = self.read_row(payload, pos)?;
            pos = next;

            check_width(fields.len(), columns)?;
            let row = fields
                .iter()
                .zip(columns)
                .map(|(field, column)| {
                    if field == "\\N" {
                        Ok(Value::Null)
                    } else {
                        column.data_type.parse_text(field)
                    }
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

        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push(self.delimiter);
            }
            match value {
                Value::String(s) => {
                    out.push(b'"');
                    for b in s.bytes() {
                        if b == b'"' {
                            out.push(b'"');
                        }
                        out.push(b);
                    }
                    out.push(b'"');
                }
                other => out.extend_from_slice(other.to_string().as_bytes()),
            }
        }
        out.push(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::DataType;

    fn columns() -> Vec<ColumnDescription> {
        vec![
            ColumnDescription::new("id", DataType::UInt64),
            ColumnDescription::new("name", DataType::String),
        ]
    }

    fn format() -> CsvFormat {
        CsvFormat::new(FormatSettings::default()).unwrap()
    }

    #[test]
    fn test_parse_quoted_fields() {
        let rows = format()
            .parse(b"1,\"a \"\"quoted\"\", b\"\n2, plain\r\n", &columns())
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], Value::String("a \"quoted\", b".into()));
        assert_eq!(rows[1], vec![Value::UInt(2), Value::String("plain".into())]);
    }

    #[test]
    fn test_trailing_delimiter_and_null() {
        let rows = format().parse(b"7,\\N,\n", &columns()).unwrap();
        assert_eq!(rows[0], vec![Value::UInt(7), Value::Null]);
    }

    #[test]
    fn test_lone_cr() {
        assert!(format().parse(b"1,a\r2,b", &columns()).is_err());

        let permissive = CsvFormat::new(FormatSettings {
            csv_allow_cr_end_of_line: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(permissive.parse(b"1,a\r2,b", &columns()).unwrap().len(), 2);
    }

    #[test]
    fn test_width_mismatch() {
        let err = format().parse(b"1,a,extra\n", &columns()).unwrap_err();
        assert_eq!(err.code(), "INCORRECT_DATA");
    }

    #[test]
    fn test_bad_delimiter() {
        let err = CsvFormat::new(FormatSettings {
            csv_delimiter: '.',
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.code(), "BAD_ARGUMENTS");
    }

    #[test]
    fn test_serialize_quotes_strings() {
        let mut out = Vec::new();
        format()
            .serialize(
                &[Value::UInt(3), Value::String("say \"hi\"".into())],
                &columns(),
                &mut out,
            )
            .unwrap();
        assert_eq!(out, b"3,\"say \"\"hi\"\"\"\n");
    }

    #[test]
    fn test_custom_delimiter() {
        let format = CsvFormat::new(FormatSettings {
            csv_delimiter: ';',
            ..Default::default()
        })
        .unwrap();
        let rows = format.parse(b"5;x", &columns()).unwrap();
        assert_eq!(rows[0][0], Value::UInt(5));
    }
}
