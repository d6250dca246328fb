#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! HTTP surface of the valuation service: a liveness probe plus the full and
//! minimal batch prediction endpoints.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, FromRequest, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;
use valuation_core::{
    FullHouseFeatures, HousePayload, MinimalHouseFeatures, PredictionError, ValuationService,
};

/// State shared by every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Loaded valuation pipeline.
    pub service: Arc<ValuationService>,
}

impl AppState {
    /// Wraps a loaded service.
    #[must_use]
    pub fn new(service: ValuationService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

/// One priced record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    /// Predicted price in USD.
    pub prediction: f64,
    /// Configured model label.
    pub model: String,
    /// Always `success`.
    pub status: String,
    /// Human readable unit note.
    pub message: String,
    /// When the batch was priced.
    pub datetime: DateTime<Utc>,
}

/// Health probe body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok` while the process serves requests.
    pub status: String,
}

/// JSON body extractor whose rejections use the `{"detail": ..}` error shape.
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// Handler failures mapped to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request body is not a valid batch for the endpoint.
    #[error("{}", .0.body_text())]
    Body(#[from] JsonRejection),
    /// The batch was rejected by the pipeline.
    #[error(transparent)]
    Prediction(#[from] PredictionError),
    /// The blocking prediction task panicked or was cancelled.
    #[error("prediction worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Body(rejection) => rejection.status(),
            Self::Prediction(_) => StatusCode::BAD_REQUEST,
            Self::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Builds the router. Prediction routes live under `prefix` (e.g. `/api/v1`).
pub fn router(state: AppState, prefix: &str) -> Router {
    let prefix = prefix.trim_end_matches('/');
    Router::new()
        .route("/health", get(health))
        .route(&format!("{prefix}/predict"), post(predict_full))
        .route(&format!("{prefix}/predict/minimal"), post(predict_minimal))
        .with_state(state)
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
    })
}

/// POST {prefix}/predict
pub async fn predict_full(
    State(state): State<AppState>,
    ApiJson(items): ApiJson<Vec<FullHouseFeatures>>,
) -> Result<Json<Vec<PredictionResponse>>, ApiError> {
    price(&state, items).await.map(Json)
}

/// POST {prefix}/predict/minimal
pub async fn predict_minimal(
    State(state): State<AppState>,
    ApiJson(items): ApiJson<Vec<MinimalHouseFeatures>>,
) -> Result<Json<Vec<PredictionResponse>>, ApiError> {
    price(&state, items).await.map(Json)
}

async fn price<P>(state: &AppState, items: Vec<P>) -> Result<Vec<PredictionResponse>, ApiError>
where
    P: HousePayload + Send + 'static,
{
    let service = Arc::clone(&state.service);
    service.telemetry().emit(
        LogLevel::Info,
        "predict.received",
        json!({ "endpoint": P::ENDPOINT, "rows": items.len() }),
    );
    let worker = Arc::clone(&service);
    let outcome = tokio::task::spawn_blocking(move || worker.predict_payloads(items)).await?;
    let predictions = match outcome {
        Ok(predictions) => predictions,
        Err(err) => {
            service.telemetry().emit(
                LogLevel::Error,
                "predict.failed",
                json!({ "endpoint": P::ENDPOINT, "error": err.to_string() }),
            );
            return Err(err.into());
        }
    };
    let now = Utc::now();
    Ok(predictions
        .into_iter()
        .map(|prediction| PredictionResponse {
            prediction,
            model: service.model_name().to_string(),
            status: "success".into(),
            message: "Predicted Value in USD".into(),
            datetime: now,
        })
        .collect())
}
