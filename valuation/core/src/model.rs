use std::{cmp::Ordering, fmt, fs, path::Path};

use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::{AlignedBatch, FeatureOrder};

/// Opaque pre-fitted regression function: one scalar per feature row.
pub trait Regressor: Send + Sync + fmt::Debug {
    /// Number of columns each row must carry.
    fn n_features(&self) -> usize;

    /// Predicts one value per row, in row order.
    fn predict(&self, rows: ArrayView2<'_, f64>) -> Vec<f64>;
}

/// Per-feature robust scaling: `(x - median) / iqr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustScaler {
    /// Per-feature centre (median).
    pub center: Vec<f64>,
    /// Per-feature scale (interquartile range). Zero scales are treated as one.
    pub scale: Vec<f64>,
}

impl RobustScaler {
    fn transform(&self, row: ArrayView1<'_, f64>) -> Vec<f64> {
        row.iter()
            .zip(self.center.iter().zip(&self.scale))
            .map(|(value, (center, scale))| {
                let scale = if *scale == 0.0 { 1.0 } else { *scale };
                (value - center) / scale
            })
            .collect()
    }
}

/// Neighbour weighting scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeighborWeights {
    /// Plain average of the neighbours' targets.
    #[default]
    Uniform,
    /// Inverse-distance weighted average.
    Distance,
}

/// k-nearest-neighbours regressor over (optionally) robust-scaled features.
///
/// `fit_x` holds training rows already in the scaled space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KNeighborsRegressor {
    /// Optional preprocessing applied to query rows.
    #[serde(default)]
    pub scaler: Option<RobustScaler>,
    /// Neighbours consulted per prediction.
    #[serde(default = "default_neighbors")]
    pub n_neighbors: usize,
    /// Weighting scheme.
    #[serde(default)]
    pub weights: NeighborWeights,
    /// Training rows.
    pub fit_x: Vec<Vec<f64>>,
    /// Training targets.
    pub fit_y: Vec<f64>,
}

const fn default_neighbors() -> usize {
    5
}

impl KNeighborsRegressor {
    #[allow(clippy::cast_precision_loss)]
    fn predict_row(&self, query: &[f64]) -> f64 {
        let mut distances: Vec<(f64, f64)> = self
            .fit_x
            .iter()
            .zip(&self.fit_y)
            .map(|(sample, target)| {
                let squared: f64 = sample
                    .iter()
                    .zip(query)
                    .map(|(a, b)| (a - b).powi(2))
                    .sum();
                (squared.sqrt(), *target)
            })
            .collect();
        let k = self.n_neighbors.min(distances.len());
        let by_distance =
            |a: &(f64, f64), b: &(f64, f64)| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal);
        if k < distances.len() {
            distances.select_nth_unstable_by(k - 1, by_distance);
            distances.truncate(k);
        }
        match self.weights {
            NeighborWeights::Uniform => distances.iter().map(|(_, y)| y).sum::<f64>() / k as f64,
            NeighborWeights::Distance => {
                let exact: Vec<f64> = distances
                    .iter()
                    .filter(|(d, _)| *d == 0.0)
                    .map(|(_, y)| *y)
                    .collect();
                if !exact.is_empty() {
                    return exact.iter().sum::<f64>() / exact.len() as f64;
                }
                let weighted: f64 = distances.iter().map(|(d, y)| y / d).sum();
                let total: f64 = distances.iter().map(|(d, _)| 1.0 / d).sum();
                weighted / total
            }
        }
    }
}

impl Regressor for KNeighborsRegressor {
    fn n_features(&self) -> usize {
        self.fit_x.first().map_or(0, Vec::len)
    }

    fn predict(&self, rows: ArrayView2<'_, f64>) -> Vec<f64> {
        rows.outer_iter()
            .map(|row| match &self.scaler {
                Some(scaler) => self.predict_row(&scaler.transform(row)),
                None => self.predict_row(&row.to_vec()),
            })
            .collect()
    }
}

/// Linear regression model with bias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRegressor {
    /// Optional preprocessing applied to query rows.
    #[serde(default)]
    pub scaler: Option<RobustScaler>,
    /// One weight per feature.
    pub weights: Vec<f64>,
    /// Intercept.
    pub bias: f64,
}

impl Regressor for LinearRegressor {
    fn n_features(&self) -> usize {
        self.weights.len()
    }

    fn predict(&self, rows: ArrayView2<'_, f64>) -> Vec<f64> {
        rows.outer_iter()
            .map(|row| {
                let features = match &self.scaler {
                    Some(scaler) => scaler.transform(row),
                    None => row.to_vec(),
                };
                features
                    .iter()
                    .zip(&self.weights)
                    .map(|(feature, weight)| feature * weight)
                    .sum::<f64>()
                    + self.bias
            })
            .collect()
    }
}

/// Serialized regressor artifact (`model.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    /// k-nearest-neighbours model.
    KNeighbors(KNeighborsRegressor),
    /// Linear model.
    Linear(LinearRegressor),
}

impl ModelArtifact {
    /// Reads and validates an artifact.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let contents = fs::read_to_string(path)?;
        let artifact: Self = serde_json::from_str(&contents)?;
        artifact.validate()?;
        Ok(artifact)
    }

    /// Checks internal shape consistency.
    pub fn validate(&self) -> Result<(), ModelError> {
        match self {
            Self::KNeighbors(model) => {
                let width = model.n_features();
                if model.fit_x.is_empty() {
                    return Err(ModelError::Invalid(
                        "k-neighbours model has no training rows".into(),
                    ));
                }
                if model.fit_x.len() != model.fit_y.len() {
                    return Err(ModelError::Invalid(format!(
                        "{} training rows but {} targets",
                        model.fit_x.len(),
                        model.fit_y.len()
                    )));
                }
                if model.fit_x.iter().any(|row| row.len() != width) {
                    return Err(ModelError::Invalid("training rows have mixed widths".into()));
                }
                if model.n_neighbors == 0 {
                    return Err(ModelError::Invalid("n_neighbors must be positive".into()));
                }
                check_scaler(model.scaler.as_ref(), width)
            }
            Self::Linear(model) => check_scaler(model.scaler.as_ref(), model.n_features()),
        }
    }

    /// Boxes the artifact as a regressor.
    #[must_use]
    pub fn into_regressor(self) -> Box<dyn Regressor> {
        match self {
            Self::KNeighbors(model) => Box::new(model),
            Self::Linear(model) => Box::new(model),
        }
    }
}

fn check_scaler(scaler: Option<&RobustScaler>, width: usize) -> Result<(), ModelError> {
    match scaler {
        Some(scaler) if scaler.center.len() != width || scaler.scale.len() != width => {
            Err(ModelError::Invalid(format!(
                "scaler covers {}/{} features, model expects {width}",
                scaler.center.len(),
                scaler.scale.len()
            )))
        }
        _ => Ok(()),
    }
}

/// Errors raised while loading the model. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Artifact is internally inconsistent.
    #[error("invalid model artifact: {0}")]
    Invalid(String),
    /// Artifact width disagrees with the persisted feature order.
    #[error("model expects {expected} features but feature order lists {found}")]
    WidthMismatch {
        /// Width the regressor was fitted on.
        expected: usize,
        /// Width of the feature order.
        found: usize,
    },
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON parsing failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fitted regressor bound to the feature order it was trained with.
#[derive(Debug)]
pub struct InferenceEngine {
    model: Box<dyn Regressor>,
    order: FeatureOrder,
}

impl InferenceEngine {
    /// Binds a regressor to a feature order, checking widths agree.
    pub fn new(model: Box<dyn Regressor>, order: FeatureOrder) -> Result<Self, ModelError> {
        if model.n_features() != order.len() {
            return Err(ModelError::WidthMismatch {
                expected: model.n_features(),
                found: order.len(),
            });
        }
        Ok(Self { model, order })
    }

    /// Loads an artifact from disk and binds it to `order`.
    pub fn load(path: impl AsRef<Path>, order: FeatureOrder) -> Result<Self, ModelError> {
        Self::new(ModelArtifact::load(path)?.into_regressor(), order)
    }

    /// Feature order the engine consumes.
    #[must_use]
    pub const fn order(&self) -> &FeatureOrder {
        &self.order
    }

    /// One prediction per aligned row, in row order.
    ///
    /// # Panics
    /// When the batch was aligned against a different feature order; aligner
    /// and engine share one order, so this is a programming error.
    #[must_use]
    pub fn predict(&self, batch: &AlignedBatch) -> Vec<f64> {
        assert_eq!(
            batch.order(),
            &self.order,
            "aligned batch does not match the model feature order"
        );
        if batch.rows() == 0 {
            return Vec::new();
        }
        let predictions = self.model.predict(batch.values().view());
        debug_assert_eq!(predictions.len(), batch.rows());
        predictions
    }
}
