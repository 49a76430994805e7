use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::path::PathBuf;

use crate::types::ErrorBody;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Empty or whitespace-only text
    #[error("input text is empty")]
    InvalidInput,

    /// Model or tokenizer artifact could not be loaded
    #[error("failed to load model")]
    ModelLoad(#[source] anyhow::Error),

    /// Unexpected failure while encoding, scoring or classifying
    #[error("prediction failed")]
    PredictionFailed(#[source] anyhow::Error),

    /// An append-only log could not be written
    #[error("failed to append to {}", .path.display())]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to a caller; internals stay in the logs.
    pub fn public_detail(&self) -> &'static str {
        match self {
            Self::InvalidInput => "Input text is empty.",
            Self::PredictionFailed(_) => "Prediction failed.",
            Self::ModelLoad(_) | Self::StoreWrite { .. } => "Internal server error.",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            detail: self.public_detail().to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
