use std::{fmt::Write as _, fs, path::Path};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::{LedgerError, PredictionLedger, PredictionLedgerEntry};

/// Metrics compared between development and production, in report order.
pub const COMPARED_METRICS: [&str; 3] = ["mse", "rmse", "r2"];

/// Regression quality metrics. Development files usually omit `sample_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Mean squared error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mse: Option<f64>,
    /// Root mean squared error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rmse: Option<f64>,
    /// Coefficient of determination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r2: Option<f64>,
    /// Number of scored samples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<usize>,
}

impl MetricsSnapshot {
    /// Reads a snapshot from a JSON file such as `metrics.json`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MetricsError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Value of a metric by name (`mse`, `rmse` or `r2`).
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<f64> {
        match name {
            "mse" => self.mse,
            "rmse" => self.rmse,
            "r2" => self.r2,
            _ => None,
        }
    }
}

/// Computes MSE, RMSE and R² for paired predictions and ground truth.
///
/// Returns `None` for empty or mismatched inputs. R² needs at least two
/// samples; with constant ground truth it is 1.0 for a perfect fit, else 0.0.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compute_metrics(predicted: &[f64], actual: &[f64]) -> Option<MetricsSnapshot> {
    if predicted.is_empty() || predicted.len() != actual.len() {
        return None;
    }
    let n = actual.len() as f64;
    let ss_res: f64 = predicted
        .iter()
        .zip(actual)
        .map(|(p, y)| (y - p).powi(2))
        .sum();
    let mse = ss_res / n;
    let r2 = (actual.len() >= 2).then(|| {
        let mean = actual.iter().sum::<f64>() / n;
        let ss_tot: f64 = actual.iter().map(|y| (y - mean).powi(2)).sum();
        if ss_tot == 0.0 {
            if ss_res == 0.0 {
                1.0
            } else {
                0.0
            }
        } else {
            1.0 - ss_res / ss_tot
        }
    });
    Some(MetricsSnapshot {
        mse: Some(mse),
        rmse: Some(mse.sqrt()),
        r2,
        sample_size: Some(actual.len()),
    })
}

/// Development vs production values for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricDelta {
    /// Development value.
    pub development: f64,
    /// Production value.
    pub production: f64,
    /// `production - development`.
    pub delta: f64,
    /// Delta as a percentage of development; absent when development is zero.
    pub relative_delta_pct: Option<f64>,
}

/// Full comparison between development and production metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    /// Metrics recorded at training time.
    pub development: MetricsSnapshot,
    /// Metrics computed from ledger entries with ground truth.
    pub production: MetricsSnapshot,
    /// Per-metric deltas for metrics present in both snapshots.
    pub deltas: IndexMap<String, MetricDelta>,
}

impl ComparisonReport {
    /// Human-readable rendering for terminals.
    #[must_use]
    pub fn render(&self) -> String {
        let rule = "=".repeat(50);
        let mut out = String::new();
        let _ = writeln!(out, "{rule}\nMETRICS COMPARISON\n{rule}");
        for (name, delta) in &self.deltas {
            let _ = writeln!(out, "\n{}:", name.to_uppercase());
            let _ = writeln!(out, "  Development: {:.6}", delta.development);
            let _ = writeln!(out, "  Production:  {:.6}", delta.production);
            let _ = writeln!(out, "  Delta:       {:+.6}", delta.delta);
            if let Some(pct) = delta.relative_delta_pct {
                let _ = writeln!(out, "  Change:      {pct:+.2}%");
            }
        }
        let _ = writeln!(out, "\nSummary:");
        match self.development.sample_size {
            Some(n) => {
                let _ = writeln!(out, "  Development sample: {n} held-out rows");
            }
            None => {
                let _ = writeln!(out, "  Development sample: Test split from training data");
            }
        }
        let _ = writeln!(
            out,
            "  Production sample:  {} predictions with ground truth",
            self.production.sample_size.unwrap_or_default()
        );
        out
    }
}

/// Result of a comparison run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ComparisonOutcome {
    /// No production metrics could be computed.
    Unavailable {
        /// Why.
        reason: String,
    },
    /// Both snapshots were available.
    Report(ComparisonReport),
}

/// Compares development metrics with production metrics derived from ledger entries.
///
/// Only entries carrying ground truth are scored. Read-only.
#[must_use]
pub fn compare(
    development: &MetricsSnapshot,
    entries: &[PredictionLedgerEntry],
) -> ComparisonOutcome {
    let (predicted, actual): (Vec<f64>, Vec<f64>) = entries
        .iter()
        .filter_map(|entry| entry.price_gt.map(|gt| (entry.price_prediction, gt)))
        .unzip();
    let Some(production) = compute_metrics(&predicted, &actual) else {
        return ComparisonOutcome::Unavailable {
            reason: "no production metrics available: no ledger entries carry ground truth".into(),
        };
    };

    let mut deltas = IndexMap::new();
    for name in COMPARED_METRICS {
        if let (Some(dev), Some(prod)) = (development.metric(name), production.metric(name)) {
            let delta = prod - dev;
            deltas.insert(
                name.to_string(),
                MetricDelta {
                    development: dev,
                    production: prod,
                    delta,
                    relative_delta_pct: (dev != 0.0).then(|| delta / dev * 100.0),
                },
            );
        }
    }
    ComparisonOutcome::Report(ComparisonReport {
        development: *development,
        production,
        deltas,
    })
}

/// Like [`compare`], reading entries from `ledger`; a missing ledger file is `Unavailable`.
pub fn compare_ledger(
    development: &MetricsSnapshot,
    ledger: &PredictionLedger,
) -> Result<ComparisonOutcome, MetricsError> {
    if !ledger.exists() {
        return Ok(ComparisonOutcome::Unavailable {
            reason: format!("predictions file not found: {}", ledger.path().display()),
        });
    }
    Ok(compare(development, &ledger.load()?))
}

/// Errors raised while reading comparator inputs.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Ledger could not be read.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{EndpointType, FeatureRecord};
    use tempfile::tempdir;

    fn entry(prediction: f64, ground_truth: Option<f64>) -> PredictionLedgerEntry {
        let mut entry =
            PredictionLedgerEntry::new(FeatureRecord::new(), prediction, EndpointType::Full);
        entry.price_gt = ground_truth;
        entry
    }

    fn assert_close(left: f64, right: f64) {
        assert!((left - right).abs() < 1e-9, "{left} != {right}");
    }

    #[test]
    fn metrics_follow_regression_formulas() {
        let snapshot = compute_metrics(&[2.0, 4.0, 6.0], &[1.0, 4.0, 7.0]).unwrap();
        assert_close(snapshot.mse.unwrap(), 2.0 / 3.0);
        assert_close(snapshot.rmse.unwrap(), (2.0_f64 / 3.0).sqrt());
        assert_close(snapshot.r2.unwrap(), 1.0 - 2.0 / 18.0);
        assert_eq!(snapshot.sample_size, Some(3));

        let single = compute_metrics(&[1.0], &[2.0]).unwrap();
        assert_eq!(single.r2, None);
        let perfect = compute_metrics(&[5.0, 5.0], &[5.0, 5.0]).unwrap();
        assert_eq!(perfect.r2, Some(1.0));
        let constant = compute_metrics(&[4.0, 6.0], &[5.0, 5.0]).unwrap();
        assert_eq!(constant.r2, Some(0.0));
        assert!(compute_metrics(&[], &[]).is_none());
    }

    #[test]
    fn deltas_are_production_minus_development() {
        let development = MetricsSnapshot {
            mse: Some(100.0),
            rmse: Some(10.0),
            r2: Some(0.0),
            sample_size: None,
        };
        // residuals 11 and -11 around a spread of 40: mse 121, rmse 11
        let entries = [
            entry(111.0, Some(100.0)),
            entry(129.0, Some(140.0)),
            entry(1.0, None),
        ];
        let ComparisonOutcome::Report(report) = compare(&development, &entries) else {
            panic!("expected a report");
        };
        assert_eq!(report.production.sample_size, Some(2));
        let mse = report.deltas["mse"];
        assert_close(mse.delta, 21.0);
        assert_close(mse.relative_delta_pct.unwrap(), 21.0);
        let rmse = report.deltas["rmse"];
        assert_close(rmse.delta, 1.0);
        assert_close(rmse.relative_delta_pct.unwrap(), 10.0);
        assert_eq!(report.deltas["r2"].relative_delta_pct, None);

        let text = report.render();
        assert!(text.contains("METRICS COMPARISON"));
        assert!(text.contains("  Delta:       +21.000000"));
        assert!(text.contains("  Change:      +21.00%"));
        assert!(text.contains("2 predictions with ground truth"));
    }

    #[test]
    fn missing_ground_truth_is_unavailable() {
        let development = MetricsSnapshot::default();
        assert!(matches!(
            compare(&development, &[entry(1.0, None)]),
            ComparisonOutcome::Unavailable { .. }
        ));

        let dir = tempdir().unwrap();
        let ledger = PredictionLedger::new(dir.path().join("absent.jsonl"));
        let outcome = compare_ledger(&development, &ledger).unwrap();
        assert!(matches!(
            outcome,
            ComparisonOutcome::Unavailable { reason } if reason.contains("not found")
        ));
    }

    #[test]
    fn development_file_omits_sample_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        fs::write(&path, r#"{"mse": 1.5e10, "rmse": 122474.48, "r2": 0.73}"#).unwrap();
        let snapshot = MetricsSnapshot::load(&path).unwrap();
        assert_eq!(snapshot.r2, Some(0.73));
        assert_eq!(snapshot.sample_size, None);
        assert!(!serde_json::to_string(&snapshot).unwrap().contains("sample_size"));
    }
}
