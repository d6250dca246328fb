use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::Settings,
    features::{align, AlignError, FeatureOrder},
    ledger::PredictionLedger,
    model::InferenceEngine,
    records::{EndpointType, FeatureRecord, HousePayload},
    reference::ReferenceTable,
    telemetry::ValuationTelemetry,
};

/// Everything a prediction needs, loaded once and shared read-only.
///
/// Wrap it in an `Arc` to hand it to request handlers; the only mutable
/// state is the ledger file, which serializes its own writers.
#[derive(Debug)]
pub struct ValuationService {
    reference: ReferenceTable,
    engine: InferenceEngine,
    ledger: PredictionLedger,
    telemetry: ValuationTelemetry,
    model_name: String,
}

impl ValuationService {
    /// Assembles a service from already loaded parts.
    #[must_use]
    pub fn new(
        reference: ReferenceTable,
        engine: InferenceEngine,
        ledger: PredictionLedger,
        telemetry: ValuationTelemetry,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            reference,
            engine,
            ledger,
            telemetry,
            model_name: model_name.into(),
        }
    }

    /// Loads feature order, model artifact and reference data named by `settings`.
    ///
    /// Any failure here is fatal: the service never starts half-loaded.
    pub fn from_settings(settings: &Settings, telemetry: ValuationTelemetry) -> Result<Self> {
        let features_path = settings.features_path();
        let order = FeatureOrder::load(&features_path)
            .with_context(|| format!("loading feature order {}", features_path.display()))?;
        let model_path = settings.model_path();
        let engine = InferenceEngine::load(&model_path, order)
            .with_context(|| format!("loading model {}", model_path.display()))?;
        let reference = ReferenceTable::load(&settings.demographics_csv, &settings.region_key)?;
        let ledger = PredictionLedger::new(settings.ledger_path());

        telemetry.emit(
            LogLevel::Info,
            "service.loaded",
            json!({
                "model": settings.model_name,
                "features": engine.order().len(),
                "regions": reference.len(),
                "duplicate_regions": reference.duplicates(),
                "skipped_regions": reference.skipped(),
                "ledger": ledger.path().display().to_string(),
            }),
        );
        if reference.duplicates() > 0 {
            telemetry.emit(
                LogLevel::Warn,
                "reference.duplicates",
                json!({
                    "dropped_rows": reference.duplicates(),
                    "key": reference.key_column(),
                }),
            );
        }
        Ok(Self::new(
            reference,
            engine,
            ledger,
            telemetry,
            settings.model_name.clone(),
        ))
    }

    /// Aligns, predicts and records a batch. Predictions come back in input order.
    ///
    /// A batch with any NaN or infinite prediction is rejected whole and not
    /// recorded. Ledger failures are logged and never reach the caller.
    pub fn predict(
        &self,
        records: &[FeatureRecord],
        endpoint_type: EndpointType,
    ) -> Result<Vec<f64>, PredictionError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let batch_id = Uuid::new_v4();
        let started = Instant::now();

        let batch = match align(records, self.engine.order(), &self.reference) {
            Ok(batch) => batch,
            Err(err) => {
                self.telemetry.emit(
                    LogLevel::Warn,
                    "predict.rejected",
                    json!({
                        "batch_id": batch_id,
                        "endpoint": endpoint_type,
                        "error": err.to_string(),
                    }),
                );
                return Err(err.into());
            }
        };
        if !batch.unmatched_rows().is_empty() {
            self.telemetry.emit(
                LogLevel::Warn,
                "predict.unmatched_region",
                json!({
                    "batch_id": batch_id,
                    "rows": batch.unmatched_rows(),
                    "key": self.reference.key_column(),
                }),
            );
        }

        let predictions = match finite(self.engine.predict(&batch)) {
            Ok(predictions) => predictions,
            Err(err) => {
                self.telemetry.emit(
                    LogLevel::Warn,
                    "predict.non_finite",
                    json!({
                        "batch_id": batch_id,
                        "endpoint": endpoint_type,
                        "error": err.to_string(),
                    }),
                );
                return Err(err);
            }
        };

        if let Err(err) = self.ledger.append(records, &predictions, endpoint_type) {
            self.telemetry.emit(
                LogLevel::Error,
                "ledger.append_failed",
                json!({
                    "batch_id": batch_id,
                    "path": self.ledger.path().display().to_string(),
                    "error": err.to_string(),
                }),
            );
        }

        self.telemetry.emit(
            LogLevel::Info,
            "predict.completed",
            json!({
                "batch_id": batch_id,
                "endpoint": endpoint_type,
                "rows": predictions.len(),
                "defaulted_cells": batch.defaulted_cells(),
                "elapsed_ms": started.elapsed().as_secs_f64() * 1000.0,
            }),
        );
        Ok(predictions)
    }

    /// Predicts a batch of typed request payloads.
    pub fn predict_payloads<P: HousePayload>(
        &self,
        payloads: Vec<P>,
    ) -> Result<Vec<f64>, PredictionError> {
        let records: Vec<FeatureRecord> = payloads.into_iter().map(Into::into).collect();
        self.predict(&records, P::ENDPOINT)
    }

    /// Reference table used for the join.
    #[must_use]
    pub const fn reference(&self) -> &ReferenceTable {
        &self.reference
    }

    /// Feature order consumed by the model.
    #[must_use]
    pub const fn order(&self) -> &FeatureOrder {
        self.engine.order()
    }

    /// Prediction ledger.
    #[must_use]
    pub const fn ledger(&self) -> &PredictionLedger {
        &self.ledger
    }

    /// Telemetry handle.
    #[must_use]
    pub const fn telemetry(&self) -> &ValuationTelemetry {
        &self.telemetry
    }

    /// Model label reported to clients.
    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Runs the aligner and engine without touching the ledger.
    pub(crate) fn score(&self, records: &[FeatureRecord]) -> Result<Vec<f64>, PredictionError> {
        let batch = align(records, self.engine.order(), &self.reference)?;
        finite(self.engine.predict(&batch))
    }
}

fn finite(predictions: Vec<f64>) -> Result<Vec<f64>, PredictionError> {
    match predictions.iter().position(|value| !value.is_finite()) {
        Some(row) => Err(PredictionError::NonFinite {
            row,
            value: predictions[row],
        }),
        None => Ok(predictions),
    }
}

/// Request-level prediction failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredictionError {
    /// The batch could not be aligned to the model's feature order.
    #[error(transparent)]
    Align(#[from] AlignError),
    /// The model produced NaN or an infinite price for a row.
    #[error("model produced a non-finite prediction for row {row} ({value})")]
    NonFinite {
        /// Index within the batch.
        row: usize,
        /// Offending value.
        value: f64,
    },
}
