#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]
#![allow(clippy::module_name_repetitions)]

//! Housing valuation core: reference-data join, feature alignment, inference,
//! prediction ledger, and development-vs-production metrics reconciliation.

/// Layered service settings (defaults, TOML file, environment).
pub mod config;

/// Telemetry handle wrapping the shared JSON logger.
pub mod telemetry;

/// Request record shapes and scalar feature values.
pub mod records;

/// Minimal CSV reader used by the reference store and dataset evaluation.
pub mod tabular;

/// Immutable per-region reference attributes keyed by region code.
pub mod reference;

/// Feature order loading and record-to-vector alignment.
pub mod features;

/// Serialized regressors and the inference engine.
pub mod model;

/// Append-only prediction ledger and ground-truth backfill.
pub mod ledger;

/// Regression metrics and development-vs-production comparison.
pub mod metrics;

/// Labelled-dataset evaluation through the serving pipeline.
pub mod evaluation;

/// Immutable service context tying the pipeline together.
pub mod service;

pub use config::{ApiSettings, Settings};
pub use evaluation::{evaluate_dataset, EvaluationError};
pub use features::{align, AlignError, AlignedBatch, FeatureOrder};
pub use ledger::{
    backfill_ground_truth, BackfillOptions, LedgerError, PredictionLedger, PredictionLedgerEntry,
};
pub use metrics::{
    compare, compare_ledger, compute_metrics, ComparisonOutcome, ComparisonReport, MetricDelta,
    MetricsSnapshot,
};
pub use model::{InferenceEngine, ModelArtifact, Regressor};
pub use records::{
    EndpointType, FeatureRecord, FeatureValue, FullHouseFeatures, HousePayload,
    MinimalHouseFeatures,
};
pub use reference::ReferenceTable;
pub use service::{PredictionError, ValuationService};
pub use telemetry::{ValuationTelemetry, ValuationTelemetryBuilder};
