//! HTTP routes and handlers

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics::counter;
use serde_json::json;
use std::sync::Arc;

use crate::error::ServiceError;
use crate::feedback::FeedbackLog;
use crate::service::PredictionService;
use crate::types::{
    BatchItem, BatchItemOutcome, BatchPredictRequest, BatchPredictResponse, ErrorBody,
    FeedbackEntry, FeedbackRequest, PredictRequest, PredictResponse,
};

#[derive(Clone)]
pub struct AppState {
    service: Arc<PredictionService>,
    feedback: Arc<FeedbackLog>,
}

impl AppState {
    pub fn new(service: Arc<PredictionService>, feedback: Arc<FeedbackLog>) -> Self {
        Self { service, feedback }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/health", get(health_check))
        .route("/predict", post(predict_handler))
        .route("/predict/batch", post(predict_batch_handler))
        .route("/history", get(history_handler))
        .route("/history/all", get(full_history_handler))
        .route("/feedback", post(feedback_handler))
        .with_state(state)
}

async fn home() -> Json<serde_json::Value> {
    Json(json!({ "message": "Suicide Ideation Detection API running." }))
}

async fn health_check() -> &'static str {
    "OK"
}

#[tracing::instrument(skip(state, request), fields(chars = request.text.chars().count()))]
async fn predict_handler(
    State(state): State<AppState>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, ServiceError> {
    counter!("prediction_requests_total").increment(1);
    let record = state.service.predict(&request.text).await?;
    Ok(Json(PredictResponse::from(&record)))
}

#[tracing::instrument(skip(state, request), fields(input_count = request.texts.len()))]
async fn predict_batch_handler(
    State(state): State<AppState>,
    Json(request): Json<BatchPredictRequest>,
) -> Json<BatchPredictResponse> {
    counter!("prediction_requests_total").increment(1);
    let outcomes = state.service.predict_batch(request.texts).await;

    let results = outcomes
        .into_iter()
        .map(|outcome| BatchItem {
            index: outcome.index,
            text: outcome.text,
            outcome: match outcome.result {
                Ok(record) => BatchItemOutcome::Ok {
                    prediction: PredictResponse::from(&record),
                },
                Err(err) => BatchItemOutcome::Error {
                    error: err.public_detail().to_string(),
                },
            },
        })
        .collect();

    Json(BatchPredictResponse {
        id: format!("batch-{}", uuid::Uuid::new_v4().simple()),
        results,
    })
}

async fn history_handler(State(state): State<AppState>) -> Json<Vec<PredictResponse>> {
    let history = state.service.history();
    let records = history.recent(history.capacity());
    Json(records.iter().map(PredictResponse::from).collect())
}

async fn full_history_handler(State(state): State<AppState>) -> Response {
    let service = Arc::clone(&state.service);
    let records = tokio::task::spawn_blocking(move || {
        service
            .history()
            .all()
            .map(|reader| reader.map(|record| PredictResponse::from(&record)).collect::<Vec<_>>())
    })
    .await;

    match records {
        Ok(Ok(records)) => Json(records).into_response(),
        Ok(Err(err)) => {
            tracing::error!(error = %format!("{err:#}"), "Failed to read prediction log");
            internal_error()
        }
        Err(err) => {
            tracing::error!(error = %err, "History reader task failed");
            internal_error()
        }
    }
}

#[tracing::instrument(skip(state, request))]
async fn feedback_handler(
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<(StatusCode, Json<FeedbackEntry>), Response> {
    counter!("feedback_submissions_total").increment(1);
    let feedback = Arc::clone(&state.feedback);
    let submitted = tokio::task::spawn_blocking(move || feedback.submit(&request.feedback)).await;
    let submitted = submitted.map_err(|err| {
        tracing::error!(error = %err, "Feedback writer task failed");
        internal_error()
    })?;

    match submitted {
        Ok(entry) => Ok((StatusCode::CREATED, Json(entry))),
        Err(ServiceError::InvalidInput) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                detail: "Please enter some feedback.".to_string(),
            }),
        )
            .into_response()),
        Err(err) => {
            tracing::error!(error = %err, "Failed to record feedback");
            Err(err.into_response())
        }
    }
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            detail: "Internal server error.".to_string(),
        }),
    )
        .into_response()
}
