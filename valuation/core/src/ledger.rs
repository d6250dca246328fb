//! Append-only prediction ledger.
//!
//! One JSON object per line, appended under a single-writer lock so
//! concurrent requests never drop each other's entries. Files written as a
//! single JSON array by earlier deployments are still readable and are
//! converted to JSON lines on the first append.
//!
//! The lock is per process. Rewrites from another process (the `valctl`
//! backfill) must not run while a server is appending.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::records::{EndpointType, FeatureRecord};

/// One served prediction: the input as received plus prediction metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionLedgerEntry {
    /// Input fields exactly as received.
    #[serde(flatten)]
    pub features: FeatureRecord,
    /// Predicted price.
    pub price_prediction: f64,
    /// Ground-truth price, filled out-of-band.
    #[serde(default)]
    pub price_gt: Option<f64>,
    /// When the prediction was served (UTC).
    pub prediction_timestamp: DateTime<Utc>,
    /// Endpoint variant used.
    pub endpoint_type: EndpointType,
}

impl PredictionLedgerEntry {
    /// Creates an entry without ground truth, stamped now.
    #[must_use]
    pub fn new(
        features: FeatureRecord,
        price_prediction: f64,
        endpoint_type: EndpointType,
    ) -> Self {
        Self {
            features,
            price_prediction,
            price_gt: None,
            prediction_timestamp: Utc::now(),
            endpoint_type,
        }
    }
}

/// File-backed, append-only prediction ledger.
#[derive(Debug)]
pub struct PredictionLedger {
    path: PathBuf,
    writer: Mutex<()>,
}

impl PredictionLedger {
    /// Creates a ledger handle. Nothing touches the filesystem until the first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    /// Ledger location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the ledger file exists yet.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Appends one entry per (record, prediction) pair and returns how many were written.
    ///
    /// The whole batch is validated and serialized before the file is
    /// opened; a rejected batch leaves the ledger untouched. Non-finite
    /// predictions are rejected because JSON cannot carry them.
    pub fn append(
        &self,
        records: &[FeatureRecord],
        predictions: &[f64],
        endpoint_type: EndpointType,
    ) -> Result<usize, LedgerError> {
        if records.len() != predictions.len() {
            return Err(LedgerError::LengthMismatch {
                records: records.len(),
                predictions: predictions.len(),
            });
        }
        if let Some((row, value)) = predictions
            .iter()
            .enumerate()
            .find(|(_, value)| !value.is_finite())
        {
            return Err(LedgerError::NonFinite { row, value: *value });
        }
        let mut buffer = Vec::new();
        for (record, prediction) in records.iter().zip(predictions) {
            let entry = PredictionLedgerEntry::new(record.clone(), *prediction, endpoint_type);
            serde_json::to_writer(&mut buffer, &entry)?;
            buffer.push(b'\n');
        }
        if buffer.is_empty() {
            return Ok(0);
        }

        let _guard = self.writer.lock();
        self.ensure_parent()?;
        if self.is_legacy_array()? {
            let existing = self.read_entries()?;
            self.write_all_entries(&existing)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&buffer)?;
        file.flush()?;
        Ok(records.len())
    }

    /// Reads every entry; a missing file is an empty ledger.
    pub fn load(&self) -> Result<Vec<PredictionLedgerEntry>, LedgerError> {
        let _guard = self.writer.lock();
        self.read_entries()
    }

    /// Returns the latest `limit` entries, oldest first.
    pub fn tail(&self, limit: usize) -> Result<Vec<PredictionLedgerEntry>, LedgerError> {
        let mut entries = self.load()?;
        if entries.len() > limit {
            entries.drain(0..entries.len() - limit);
        }
        Ok(entries)
    }

    /// Replaces the ledger contents (out-of-band ground-truth backfill only).
    pub fn rewrite(&self, entries: &[PredictionLedgerEntry]) -> Result<(), LedgerError> {
        let _guard = self.writer.lock();
        self.ensure_parent()?;
        self.write_all_entries(entries)
    }

    fn ensure_parent(&self) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn is_legacy_array(&self) -> Result<bool, LedgerError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        for byte in BufReader::new(file).bytes() {
            let byte = byte?;
            if !byte.is_ascii_whitespace() {
                return Ok(byte == b'[');
            }
        }
        Ok(false)
    }

    fn read_entries(&self) -> Result<Vec<PredictionLedgerEntry>, LedgerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim_start().starts_with('[') {
            return Ok(serde_json::from_str(&contents)?);
        }
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|source| LedgerError::Corrupt {
                    line: idx + 1,
                    source,
                })
            })
            .collect()
    }

    fn write_all_entries(&self, entries: &[PredictionLedgerEntry]) -> Result<(), LedgerError> {
        let mut buffer = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buffer, entry)?;
            buffer.push(b'\n');
        }
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        fs::write(&staging, &buffer)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

/// Errors raised by the ledger. On the prediction path they are logged, never propagated.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Caller passed mismatched batch lengths.
    #[error("{records} records but {predictions} predictions")]
    LengthMismatch {
        /// Input records.
        records: usize,
        /// Predictions.
        predictions: usize,
    },
    /// A prediction is NaN or infinite and has no JSON representation.
    #[error("prediction {row} is not a finite number ({value})")]
    NonFinite {
        /// Index within the batch.
        row: usize,
        /// Offending value.
        value: f64,
    },
    /// Backfill noise amplitude is NaN or infinite.
    #[error("noise amplitude must be a finite number, got {0}")]
    InvalidNoise(f64),
    /// A ledger line is not a valid entry.
    #[error("ledger line {line} is corrupt: {source}")]
    Corrupt {
        /// 1-based line number.
        line: usize,
        /// Parse error.
        source: serde_json::Error,
    },
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Synthetic ground-truth generation settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackfillOptions {
    /// Relative noise amplitude; `0.2` perturbs prices by up to ±20 %.
    pub noise_amplitude: f64,
    /// RNG seed for reproducible runs.
    pub seed: u64,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            noise_amplitude: 0.2,
            seed: 42,
        }
    }
}

/// Overwrites `price_gt` on every entry with a noise-perturbed copy of its prediction.
///
/// Ground truth is floored at 10 % of the prediction and rounded to cents.
/// Returns the number of entries updated; a non-finite amplitude is
/// rejected before any entry changes.
pub fn backfill_ground_truth(
    entries: &mut [PredictionLedgerEntry],
    options: BackfillOptions,
) -> Result<usize, LedgerError> {
    if !options.noise_amplitude.is_finite() {
        return Err(LedgerError::InvalidNoise(options.noise_amplitude));
    }
    let amplitude = options.noise_amplitude.abs();
    let mut rng = SmallRng::seed_from_u64(options.seed);
    for entry in entries.iter_mut() {
        let factor: f64 = rng.gen_range(-amplitude..=amplitude);
        let prediction = entry.price_prediction;
        let ground_truth = (prediction * (1.0 + factor)).max(prediction * 0.1);
        entry.price_gt = Some((ground_truth * 100.0).round() / 100.0);
    }
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::FeatureValue;
    use indexmap::indexmap;
    use serde_json::{json, Value};
    use std::{sync::Arc, thread};
    use tempfile::tempdir;

    fn record(zipcode: &str) -> FeatureRecord {
        indexmap! {
            "bedrooms".to_string() => FeatureValue::Int(3),
            "bathrooms".to_string() => FeatureValue::Float(2.0),
            "zipcode".to_string() => FeatureValue::Text(zipcode.into()),
        }
    }

    #[test]
    fn appends_grow_ledger_by_batch_size() {
        let dir = tempdir().unwrap();
        let ledger = PredictionLedger::new(dir.path().join("model/model_predictions.jsonl"));
        assert!(ledger.load().unwrap().is_empty());

        let written = ledger
            .append(
                &[record("98103"), record("00501")],
                &[510_000.0, 320_000.0],
                EndpointType::Full,
            )
            .unwrap();
        assert_eq!(written, 2);
        ledger
            .append(&[record("98042")], &[415_000.0], EndpointType::Minimal)
            .unwrap();

        let entries = ledger.load().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|entry| entry.price_gt.is_none()));
        assert_eq!(
            entries[1].features["zipcode"],
            FeatureValue::Text("00501".into())
        );
        assert_eq!(entries[2].endpoint_type, EndpointType::Minimal);
        assert!(entries[0].prediction_timestamp <= Utc::now());
    }

    #[test]
    fn entries_serialize_as_flat_objects_with_null_ground_truth() {
        let dir = tempdir().unwrap();
        let ledger = PredictionLedger::new(dir.path().join("ledger.jsonl"));
        ledger
            .append(&[record("98103")], &[1.5], EndpointType::Full)
            .unwrap();
        let raw = fs::read_to_string(ledger.path()).unwrap();
        let line: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(line["zipcode"], "98103");
        assert_eq!(line["price_prediction"], 1.5);
        assert_eq!(line["price_gt"], Value::Null);
        assert_eq!(line["endpoint_type"], "full");
        let stamp = line["prediction_timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[test]
    fn legacy_array_files_are_read_and_converted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model_predictions.json");
        let legacy = json!([{
            "bedrooms": 2,
            "zipcode": "98001",
            "price_prediction": 250000.0,
            "price_gt": 260000.0,
            "prediction_timestamp": "2025-09-01T10:00:00.123456+00:00",
            "endpoint_type": "minimal"
        }]);
        fs::write(&path, serde_json::to_string_pretty(&legacy).unwrap()).unwrap();
        let ledger = PredictionLedger::new(&path);
        assert_eq!(ledger.load().unwrap()[0].price_gt, Some(260_000.0));

        ledger
            .append(&[record("98103")], &[1.0], EndpointType::Full)
            .unwrap();
        let entries = ledger.load().unwrap();
        assert_eq!(entries.len(), 2);
        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(!rewritten.trim_start().starts_with('['));
    }

    #[test]
    fn rejects_mismatched_batches_and_unwritable_paths() {
        let dir = tempdir().unwrap();
        let ledger = PredictionLedger::new(dir.path().join("ledger.jsonl"));
        assert!(matches!(
            ledger.append(&[record("1")], &[], EndpointType::Full),
            Err(LedgerError::LengthMismatch {
                records: 1,
                predictions: 0
            })
        ));

        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"file").unwrap();
        let unwritable = PredictionLedger::new(blocker.join("ledger.jsonl"));
        assert!(matches!(
            unwritable.append(&[record("1")], &[1.0], EndpointType::Full),
            Err(LedgerError::Io(_))
        ));
    }

    #[test]
    fn non_finite_predictions_never_reach_the_file() {
        let dir = tempdir().unwrap();
        let ledger = PredictionLedger::new(dir.path().join("ledger.jsonl"));
        ledger
            .append(&[record("98103")], &[1.0], EndpointType::Full)
            .unwrap();

        let err = ledger
            .append(
                &[record("98103"), record("00501")],
                &[2.0, f64::INFINITY],
                EndpointType::Full,
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::NonFinite { row: 1, .. }));
        assert!(matches!(
            ledger.append(&[record("98103")], &[f64::NAN], EndpointType::Minimal),
            Err(LedgerError::NonFinite { row: 0, .. })
        ));

        ledger
            .append(&[record("98103")], &[3.0], EndpointType::Full)
            .unwrap();
        let prices: Vec<f64> = ledger
            .load()
            .unwrap()
            .iter()
            .map(|entry| entry.price_prediction)
            .collect();
        assert_eq!(prices, vec![1.0, 3.0]);
    }

    #[test]
    fn corrupt_lines_are_reported_with_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = PredictionLedger::new(&path);
        ledger
            .append(&[record("98103")], &[1.0], EndpointType::Full)
            .unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{not json}\n").unwrap();
        assert!(matches!(
            ledger.load(),
            Err(LedgerError::Corrupt { line: 2, .. })
        ));
    }

    #[test]
    fn concurrent_appends_keep_every_entry() {
        let dir = tempdir().unwrap();
        let ledger = Arc::new(PredictionLedger::new(dir.path().join("ledger.jsonl")));
        let workers: Vec<_> = (0..8_u32)
            .map(|worker| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for batch in 0..25_u32 {
                        let price = f64::from(worker * 100 + batch);
                        ledger
                            .append(&[record("98103")], &[price], EndpointType::Full)
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let entries = ledger.load().unwrap();
        assert_eq!(entries.len(), 8 * 25);
        let mut prices: Vec<f64> = entries.iter().map(|entry| entry.price_prediction).collect();
        prices.sort_by(f64::total_cmp);
        prices.dedup();
        assert_eq!(prices.len(), 8 * 25);
    }

    #[test]
    fn backfill_is_seeded_bounded_and_rounded() {
        let mut entries: Vec<_> = [100_000.0, 250_000.0, 999_999.99]
            .into_iter()
            .map(|price| PredictionLedgerEntry::new(record("98103"), price, EndpointType::Full))
            .collect();
        let mut replay = entries.clone();
        let options = BackfillOptions {
            noise_amplitude: 0.2,
            seed: 7,
        };

        assert_eq!(backfill_ground_truth(&mut entries, options).unwrap(), 3);
        backfill_ground_truth(&mut replay, options).unwrap();
        for (entry, again) in entries.iter().zip(&replay) {
            let truth = entry.price_gt.unwrap();
            assert_eq!(Some(truth), again.price_gt);
            assert!(truth >= entry.price_prediction * 0.8 - 0.01);
            assert!(truth <= entry.price_prediction * 1.2 + 0.01);
            assert!(((truth * 100.0).round() - truth * 100.0).abs() < 1e-6);
        }

        let dir = tempdir().unwrap();
        let ledger = PredictionLedger::new(dir.path().join("ledger.jsonl"));
        ledger.rewrite(&entries).unwrap();
        assert_eq!(ledger.tail(2).unwrap().len(), 2);
        assert_eq!(ledger.load().unwrap(), entries);
    }

    #[test]
    fn backfill_rejects_non_finite_noise() {
        let mut entries = vec![PredictionLedgerEntry::new(
            record("98103"),
            100_000.0,
            EndpointType::Full,
        )];
        for amplitude in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let options = BackfillOptions {
                noise_amplitude: amplitude,
                seed: 1,
            };
            assert!(matches!(
                backfill_ground_truth(&mut entries, options),
                Err(LedgerError::InvalidNoise(_))
            ));
        }
        assert!(entries[0].price_gt.is_none());
    }
}
