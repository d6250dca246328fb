//! Turns heterogeneous request records into the exact column layout the model expects.
//!
//! Records are left-joined against the reference table on the region code,
//! projected onto the persisted feature order, and any feature the merged
//! record lacks is filled with `0.0`. The zero fill is a compatibility
//! fallback kept so optional attributes never abort inference; it is not an
//! imputation strategy.

use std::{collections::HashSet, fs, path::Path, sync::Arc};

use ndarray::{Array2, ArrayView1};
use thiserror::Error;

use crate::{
    records::{FeatureRecord, FeatureValue},
    reference::ReferenceTable,
};

/// Ordered column names the fitted regressor expects. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureOrder(Arc<[String]>);

impl FeatureOrder {
    /// Builds an order, rejecting empty lists and duplicate names.
    pub fn new<I, S>(names: I) -> Result<Self, FeatureOrderError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(FeatureOrderError::Empty);
        }
        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(FeatureOrderError::Duplicate(name.clone()));
            }
        }
        Ok(Self(names.into()))
    }

    /// Loads the JSON array of names persisted beside the model.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FeatureOrderError> {
        let contents = fs::read_to_string(path)?;
        let names: Vec<String> = serde_json::from_str(&contents)?;
        Self::new(names)
    }

    /// Names in model order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.0
    }

    /// Number of model columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; an order is never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Column position of `name`.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|candidate| candidate == name)
    }

    /// Whether the model consumes `name` directly.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }
}

/// Errors raised while loading a feature order.
#[derive(Debug, Error)]
pub enum FeatureOrderError {
    /// The order lists no columns.
    #[error("feature order is empty")]
    Empty,
    /// A column is listed twice.
    #[error("feature `{0}` listed more than once")]
    Duplicate(String),
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON parsing failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Row-major feature table whose columns match a [`FeatureOrder`] exactly.
#[derive(Debug, Clone)]
pub struct AlignedBatch {
    order: FeatureOrder,
    values: Array2<f64>,
    unmatched_rows: Vec<usize>,
    defaulted_cells: usize,
}

impl AlignedBatch {
    /// The 2-D numeric table, one row per input record.
    #[must_use]
    pub const fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Column layout of the table.
    #[must_use]
    pub const fn order(&self) -> &FeatureOrder {
        &self.order
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.values.nrows()
    }

    /// Number of columns; always equals the feature order length.
    #[must_use]
    pub fn width(&self) -> usize {
        self.values.ncols()
    }

    /// One aligned vector.
    #[must_use]
    pub fn row(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.row(index)
    }

    /// Cell lookup by row and feature name.
    #[must_use]
    pub fn value(&self, row: usize, feature: &str) -> Option<f64> {
        let column = self.order.position(feature)?;
        self.values.get((row, column)).copied()
    }

    /// Rows whose region code had no reference entry.
    #[must_use]
    pub fn unmatched_rows(&self) -> &[usize] {
        &self.unmatched_rows
    }

    /// Cells filled with the zero default.
    #[must_use]
    pub const fn defaulted_cells(&self) -> usize {
        self.defaulted_cells
    }
}

/// Batch-level alignment failures; any of them rejects the whole batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlignError {
    /// A record lacks the region code needed for the reference join.
    #[error("record {row}: `{column}` is required for the reference data join")]
    MissingJoinKey {
        /// Index of the offending record.
        row: usize,
        /// Join-key column.
        column: String,
    },
    /// A model column holds a value that is not a finite number.
    #[error("record {row}: feature `{column}` is not numeric ({value:?})")]
    NonNumeric {
        /// Index of the offending record.
        row: usize,
        /// Feature name.
        column: String,
        /// Offending value.
        value: FeatureValue,
    },
}

/// Joins, reorders and default-fills a batch of records.
pub fn align(
    records: &[FeatureRecord],
    order: &FeatureOrder,
    reference: &ReferenceTable,
) -> Result<AlignedBatch, AlignError> {
    let key = reference.key_column();
    let mut codes = Vec::with_capacity(records.len());
    for (row, record) in records.iter().enumerate() {
        let code = record
            .get(key)
            .and_then(FeatureValue::as_key)
            .ok_or_else(|| AlignError::MissingJoinKey {
                row,
                column: key.to_string(),
            })?;
        codes.push(code);
    }

    let mut values = Array2::zeros((records.len(), order.len()));
    let mut unmatched_rows = Vec::new();
    let mut defaulted_cells = 0;
    for (row, (record, code)) in records.iter().zip(&codes).enumerate() {
        let region = reference.get(code);
        if region.is_none() {
            unmatched_rows.push(row);
        }
        for (column, name) in order.names().iter().enumerate() {
            let merged = present(record.get(name))
                .or_else(|| present(region.and_then(|attrs| attrs.get(name))));
            let Some(value) = merged else {
                defaulted_cells += 1;
                continue;
            };
            let number = value
                .as_number()
                .filter(|number| number.is_finite())
                .ok_or_else(|| AlignError::NonNumeric {
                    row,
                    column: name.clone(),
                    value: value.clone(),
                })?;
            values[[row, column]] = number;
        }
    }

    Ok(AlignedBatch {
        order: order.clone(),
        values,
        unmatched_rows,
        defaulted_cells,
    })
}

fn present(value: Option<&FeatureValue>) -> Option<&FeatureValue> {
    value.filter(|value| !value.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tabular::Table;
    use indexmap::indexmap;
    use tempfile::tempdir;

    const FULL_ORDER: [&str; 18] = [
        "bedrooms",
        "bathrooms",
        "sqft_living",
        "sqft_lot",
        "floors",
        "sqft_above",
        "sqft_basement",
        "waterfront",
        "view",
        "ppltn_qty",
        "urbn_ppltn_qty",
        "medn_hshld_incm_amt",
        "hous_val_amt",
        "per_bchlr",
        "condition",
        "grade",
        "yr_built",
        "lat",
    ];

    fn reference() -> ReferenceTable {
        let table = Table::parse(
            "ppltn_qty,urbn_ppltn_qty,medn_hshld_incm_amt,hous_val_amt,per_bchlr,zipcode\n\
             45000,44000,71000,420000,41,98103\n\
             1200,0,52000,210000,12,00501\n",
        )
        .unwrap();
        ReferenceTable::from_table(&table, "zipcode").unwrap()
    }

    fn minimal(zipcode: FeatureValue) -> FeatureRecord {
        indexmap! {
            "bedrooms".to_string() => FeatureValue::Int(3),
            "bathrooms".to_string() => FeatureValue::Float(2.0),
            "sqft_living".to_string() => FeatureValue::Int(1500),
            "sqft_lot".to_string() => FeatureValue::Int(5000),
            "floors".to_string() => FeatureValue::Float(1.0),
            "sqft_above".to_string() => FeatureValue::Int(1500),
            "sqft_basement".to_string() => FeatureValue::Int(0),
            "zipcode".to_string() => zipcode,
        }
    }

    #[test]
    fn minimal_record_fills_known_positions_and_defaults_the_rest() {
        let order = FeatureOrder::new(FULL_ORDER).unwrap();
        let batch = align(&[minimal("98103".into())], &order, &reference()).unwrap();

        assert_eq!(batch.rows(), 1);
        assert_eq!(batch.width(), 18);
        assert_eq!(batch.value(0, "bedrooms"), Some(3.0));
        assert_eq!(batch.value(0, "bathrooms"), Some(2.0));
        assert_eq!(batch.value(0, "sqft_living"), Some(1500.0));
        assert_eq!(batch.value(0, "sqft_lot"), Some(5000.0));
        assert_eq!(batch.value(0, "floors"), Some(1.0));
        assert_eq!(batch.value(0, "sqft_above"), Some(1500.0));
        assert_eq!(batch.value(0, "sqft_basement"), Some(0.0));
        assert_eq!(batch.value(0, "ppltn_qty"), Some(45000.0));
        assert_eq!(batch.value(0, "per_bchlr"), Some(41.0));
        for name in [
            "waterfront",
            "view",
            "condition",
            "grade",
            "yr_built",
            "lat",
        ] {
            assert_eq!(
                batch.value(0, name),
                Some(0.0),
                "{name} should default to zero"
            );
        }
        assert_eq!(batch.defaulted_cells(), 6);
        assert!(batch.unmatched_rows().is_empty());
        assert!(batch.value(0, "zipcode").is_none());
    }

    #[test]
    fn width_and_order_follow_feature_order_regardless_of_input_shape() {
        let order = FeatureOrder::new(["sqft_living", "ppltn_qty", "bedrooms"]).unwrap();
        let mut extra = minimal("98103".into());
        extra.insert("not_a_feature".into(), FeatureValue::Int(99));
        extra.insert("grade".into(), FeatureValue::Int(7));
        let batch = align(&[extra, minimal("00501".into())], &order, &reference()).unwrap();
        assert_eq!(batch.values().shape(), &[2, 3]);
        assert_eq!(batch.row(0).to_vec(), vec![1500.0, 45000.0, 3.0]);
        assert_eq!(batch.row(1).to_vec(), vec![1500.0, 1200.0, 3.0]);
    }

    #[test]
    fn unknown_region_code_defaults_region_fields() {
        let order = FeatureOrder::new(FULL_ORDER).unwrap();
        let batch = align(&[minimal("99999".into())], &order, &reference()).unwrap();
        assert_eq!(batch.width(), 18);
        assert_eq!(batch.unmatched_rows(), [0]);
        for name in [
            "ppltn_qty",
            "urbn_ppltn_qty",
            "medn_hshld_incm_amt",
            "hous_val_amt",
            "per_bchlr",
        ] {
            assert_eq!(batch.value(0, name), Some(0.0));
        }
        assert_eq!(batch.value(0, "bedrooms"), Some(3.0));
    }

    #[test]
    fn missing_region_code_rejects_whole_batch() {
        let order = FeatureOrder::new(FULL_ORDER).unwrap();
        let mut keyless = minimal("98103".into());
        keyless.shift_remove("zipcode");
        let err = align(&[minimal("98103".into()), keyless], &order, &reference()).unwrap_err();
        assert_eq!(
            err,
            AlignError::MissingJoinKey {
                row: 1,
                column: "zipcode".into()
            }
        );
        let null_key = align(&[minimal(FeatureValue::Null)], &order, &reference());
        assert!(matches!(null_key, Err(AlignError::MissingJoinKey { row: 0, .. })));
    }

    #[test]
    fn region_code_is_kept_when_the_model_consumes_it() {
        let order = FeatureOrder::new(["zipcode", "bedrooms"]).unwrap();
        let batch = align(&[minimal("00501".into())], &order, &reference()).unwrap();
        assert_eq!(batch.row(0).to_vec(), vec![501.0, 3.0]);
    }

    #[test]
    fn request_values_win_over_region_attributes() {
        let order = FeatureOrder::new(["ppltn_qty"]).unwrap();
        let mut record = minimal("98103".into());
        record.insert("ppltn_qty".into(), FeatureValue::Int(7));
        let batch = align(&[record], &order, &reference()).unwrap();
        assert_eq!(batch.value(0, "ppltn_qty"), Some(7.0));
    }

    #[test]
    fn non_numeric_model_column_fails() {
        let order = FeatureOrder::new(["bedrooms"]).unwrap();
        let mut record = minimal("98103".into());
        record.insert("bedrooms".into(), FeatureValue::Text("three".into()));
        let err = align(&[record], &order, &reference()).unwrap_err();
        assert!(matches!(err, AlignError::NonNumeric { row: 0, .. }));
    }

    #[test]
    fn feature_order_rejects_duplicates_and_loads_json() {
        assert!(matches!(
            FeatureOrder::new(["a", "b", "a"]),
            Err(FeatureOrderError::Duplicate(name)) if name == "a"
        ));
        assert!(matches!(
            FeatureOrder::new(Vec::<String>::new()),
            Err(FeatureOrderError::Empty)
        ));
        let dir = tempdir().unwrap();
        let path = dir.path().join("model_features.json");
        fs::write(&path, r#"["bedrooms","ppltn_qty"]"#).unwrap();
        let order = FeatureOrder::load(&path).unwrap();
        assert_eq!(order.names(), ["bedrooms", "ppltn_qty"]);
        assert_eq!(order.position("ppltn_qty"), Some(1));
    }
}
