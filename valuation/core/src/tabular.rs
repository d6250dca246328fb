//! Header-first CSV reader for the reference dataset and labelled evaluation files.
//!
//! Supports double-quoted fields with `""` escapes; no multi-line fields.

use std::{fs, path::Path};

use thiserror::Error;

use crate::records::{FeatureRecord, FeatureValue};

/// Parsed CSV table with a header row.
#[derive(Debug, Clone, Default)]
pub struct Table {
    /// Column names in file order.
    pub headers: Vec<String>,
    /// Raw cell text, one vector per data row.
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Reads and parses a CSV file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, TabularError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parses CSV text. A leading UTF-8 byte order mark is ignored.
    pub fn parse(contents: &str) -> Result<Self, TabularError> {
        let contents = contents.strip_prefix('\u{feff}').unwrap_or(contents);
        let mut lines = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty());
        let (_, header_line) = lines.next().ok_or(TabularError::Empty)?;
        let headers: Vec<String> = split_line(header_line)
            .into_iter()
            .map(|cell| cell.trim().to_string())
            .collect();
        let mut rows = Vec::new();
        for (idx, line) in lines {
            let cells = split_line(line);
            if cells.len() != headers.len() {
                return Err(TabularError::Ragged {
                    line: idx + 1,
                    expected: headers.len(),
                    found: cells.len(),
                });
            }
            rows.push(cells);
        }
        Ok(Self { headers, rows })
    }

    /// Position of a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    /// Converts every row into a record. Columns listed in `text_columns` stay verbatim text.
    #[must_use]
    pub fn records(&self, text_columns: &[&str]) -> Vec<FeatureRecord> {
        self.rows
            .iter()
            .map(|row| {
                self.headers
                    .iter()
                    .zip(row)
                    .map(|(header, raw)| {
                        let value = if text_columns.contains(&header.as_str()) {
                            text_cell(raw)
                        } else {
                            parse_cell(raw)
                        };
                        (header.clone(), value)
                    })
                    .collect()
            })
            .collect()
    }
}

/// Infers a scalar from cell text: integer, then float, otherwise text. Empty cells are null.
#[must_use]
pub fn parse_cell(raw: &str) -> FeatureValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return FeatureValue::Null;
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return FeatureValue::Int(int);
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        return FeatureValue::Float(float);
    }
    FeatureValue::Text(trimmed.to_string())
}

fn text_cell(raw: &str) -> FeatureValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        FeatureValue::Null
    } else {
        FeatureValue::Text(trimmed.to_string())
    }
}

fn split_line(line: &str) -> Vec<String> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => cells.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    cells.push(current);
    cells
}

/// Errors raised while reading tabular files.
#[derive(Debug, Error)]
pub enum TabularError {
    /// File has no header row.
    #[error("csv input is empty")]
    Empty,
    /// A row has a different number of cells than the header.
    #[error("line {line}: expected {expected} cells, found {found}")]
    Ragged {
        /// 1-based line number.
        line: usize,
        /// Header width.
        expected: usize,
        /// Cells found on the line.
        found: usize,
    },
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_cells_and_types() {
        let table = Table::parse(
            "zipcode,name,pop\r\n\"00501\",\"Holtsville, NY\",12\n98103,\"say \"\"hi\"\"\",3.5\n",
        )
        .unwrap();
        assert_eq!(table.headers, vec!["zipcode", "name", "pop"]);
        assert_eq!(table.rows[0][1], "Holtsville, NY");
        assert_eq!(table.rows[1][1], "say \"hi\"");

        let records = table.records(&["zipcode"]);
        assert_eq!(records[0]["zipcode"], FeatureValue::Text("00501".into()));
        assert_eq!(records[0]["pop"], FeatureValue::Int(12));
        assert_eq!(records[1]["pop"], FeatureValue::Float(3.5));
    }

    #[test]
    fn rejects_ragged_rows_and_empty_input() {
        assert!(matches!(Table::parse("   \n"), Err(TabularError::Empty)));
        let err = Table::parse("a,b\n1,2\n3\n").unwrap_err();
        assert!(matches!(
            err,
            TabularError::Ragged {
                line: 3,
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn empty_cells_become_null() {
        let table = Table::parse("a,b\n,7\n").unwrap();
        let records = table.records(&[]);
        assert!(records[0]["a"].is_null());
        assert_eq!(table.column("b"), Some(1));
    }

    #[test]
    fn byte_order_mark_is_not_part_of_the_first_header() {
        let table = Table::parse("\u{feff}zipcode,ppltn_qty\n00501,12\n").unwrap();
        assert_eq!(table.headers, vec!["zipcode", "ppltn_qty"]);
        assert_eq!(table.column("zipcode"), Some(0));
        let records = table.records(&["zipcode"]);
        assert_eq!(records[0]["zipcode"], FeatureValue::Text("00501".into()));
    }
}
