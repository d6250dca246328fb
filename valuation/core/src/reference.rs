use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    records::FeatureRecord,
    tabular::{Table, TabularError},
};

/// Immutable per-region attributes keyed by region code.
///
/// Built once before any request is served; read-only afterwards, so shared
/// references need no synchronisation.
#[derive(Debug, Clone)]
pub struct ReferenceTable {
    key_column: String,
    columns: Vec<String>,
    rows: HashMap<String, FeatureRecord>,
    duplicates: usize,
    skipped: usize,
}

impl ReferenceTable {
    /// Loads a CSV reference dataset indexed by `key_column` (kept as text).
    pub fn load(path: impl AsRef<Path>, key_column: &str) -> Result<Self, ReferenceDataError> {
        let path = path.as_ref();
        let table = Table::read(path).map_err(|source| ReferenceDataError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_table(&table, key_column).map_err(|err| match err {
            ReferenceDataError::MissingKeyColumn { column, .. } => {
                ReferenceDataError::MissingKeyColumn {
                    column,
                    path: Some(path.to_path_buf()),
                }
            }
            other => other,
        })
    }

    /// Indexes an already parsed table. The first row for a region code wins.
    pub fn from_table(table: &Table, key_column: &str) -> Result<Self, ReferenceDataError> {
        if table.column(key_column).is_none() {
            return Err(ReferenceDataError::MissingKeyColumn {
                column: key_column.to_string(),
                path: None,
            });
        }
        let columns = table
            .headers
            .iter()
            .filter(|header| header.as_str() != key_column)
            .cloned()
            .collect();
        let mut rows = HashMap::with_capacity(table.rows.len());
        let mut duplicates = 0;
        let mut skipped = 0;
        for mut record in table.records(&[key_column]) {
            let Some(code) = record.shift_remove(key_column).and_then(|v| v.as_key()) else {
                skipped += 1;
                continue;
            };
            if rows.contains_key(&code) {
                duplicates += 1;
                continue;
            }
            rows.insert(code, record);
        }
        Ok(Self {
            key_column: key_column.to_string(),
            columns,
            rows,
            duplicates,
            skipped,
        })
    }

    /// Attributes for a region code, if known.
    #[must_use]
    pub fn get(&self, code: &str) -> Option<&FeatureRecord> {
        self.rows.get(code)
    }

    /// Join-key column name.
    #[must_use]
    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    /// Attribute column names (join key excluded) in file order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of indexed regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when no region is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows dropped because their region code repeated an earlier row.
    #[must_use]
    pub const fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Rows dropped because the region code cell was empty.
    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Errors raised while loading reference data. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ReferenceDataError {
    /// Source could not be read or parsed.
    #[error("reading reference data {}: {source}", .path.display())]
    Read {
        /// Source file.
        path: PathBuf,
        /// Underlying error.
        source: TabularError,
    },
    /// Join-key column absent from the header.
    #[error("reference data{} has no `{column}` column", describe(.path))]
    MissingKeyColumn {
        /// Expected key column.
        column: String,
        /// Source file, when loaded from disk.
        path: Option<PathBuf>,
    },
}

fn describe(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|path| format!(" {}", path.display()))
        .unwrap_or_default()
}
