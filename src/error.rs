use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::model::{InferenceMode, ModelFamily};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("{mode} mode unavailable: no usable {family} model loaded")]
    ModelUnavailable {
        mode: InferenceMode,
        family: ModelFamily,
    },
    #[error("{model}: expected {expected} {what}, got {actual}")]
    ShapeMismatch {
        model: String,
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("numeric anomaly in {0} output")]
    NumericAnomaly(String),
    #[error("label vocabulary is empty")]
    EmptyVocabulary,
    #[error("invalid model manifest: {0}")]
    InvalidManifest(String),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    /// Stable tag naming the failure kind, used in every error body.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Decode(_) => "decode_error",
            ServiceError::ModelUnavailable {
                mode: InferenceMode::Ensemble,
                ..
            } => "ensemble_unavailable",
            ServiceError::ModelUnavailable { .. } => "model_unavailable",
            ServiceError::ShapeMismatch { .. } => "shape_mismatch",
            ServiceError::NumericAnomaly(_) => "numeric_anomaly",
            ServiceError::EmptyVocabulary => "empty_vocabulary",
            ServiceError::InvalidManifest(_) => "invalid_manifest",
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::Inference(_) => "inference_error",
            ServiceError::Io(_) => "io_error",
            ServiceError::Other(_) => "other",
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ServiceError::ModelUnavailable { .. })
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Decode(_) | ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::ModelUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::NumericAnomaly(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::ShapeMismatch { .. }
            | ServiceError::EmptyVocabulary
            | ServiceError::InvalidManifest(_)
            | ServiceError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
