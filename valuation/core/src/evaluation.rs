use std::path::{Path, PathBuf};

use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    metrics::{compute_metrics, MetricsSnapshot},
    records::FeatureRecord,
    service::{PredictionError, ValuationService},
    tabular::{Table, TabularError},
};

/// Scores a labelled CSV through the serving pipeline and returns its metrics.
///
/// The region-code column stays text so codes with leading zeros still join.
/// Nothing is written to the prediction ledger.
pub fn evaluate_dataset(
    service: &ValuationService,
    path: impl AsRef<Path>,
    target: &str,
) -> Result<MetricsSnapshot, EvaluationError> {
    let path = path.as_ref();
    let table = Table::read(path).map_err(|source| EvaluationError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if table.column(target).is_none() {
        return Err(EvaluationError::MissingTarget(target.to_string()));
    }

    let key = service.reference().key_column();
    let mut records: Vec<FeatureRecord> = table.records(&[key]);
    let mut labels = Vec::with_capacity(records.len());
    for (row, record) in records.iter_mut().enumerate() {
        let label = record
            .shift_remove(target)
            .and_then(|value| value.as_number())
            .filter(|value| value.is_finite())
            .ok_or(EvaluationError::MissingLabel { row })?;
        labels.push(label);
    }

    let predictions = service.score(&records)?;
    let snapshot = compute_metrics(&predictions, &labels).ok_or(EvaluationError::Empty)?;
    service.telemetry().emit(
        LogLevel::Info,
        "evaluation.completed",
        json!({
            "path": path.display().to_string(),
            "rows": labels.len(),
            "rmse": snapshot.rmse,
            "r2": snapshot.r2,
        }),
    );
    Ok(snapshot)
}

/// Errors raised by dataset evaluation.
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// Dataset could not be read or parsed.
    #[error("reading dataset {}: {source}", .path.display())]
    Read {
        /// Dataset file.
        path: PathBuf,
        /// Underlying error.
        source: TabularError,
    },
    /// Target column absent from the header.
    #[error("dataset has no `{0}` target column")]
    MissingTarget(String),
    /// A row has an empty or non-numeric target.
    #[error("row {row} has no numeric target value")]
    MissingLabel {
        /// 0-based data row.
        row: usize,
    },
    /// Dataset has a header but no rows.
    #[error("dataset has no rows")]
    Empty,
    /// Alignment failed.
    #[error(transparent)]
    Prediction(#[from] PredictionError),
}
