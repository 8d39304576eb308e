use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    routing::{get, post},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    catalog::{VarietyCatalog, VarietyInfo},
    config::AppConfig,
    error::ServiceError,
    evaluation::{EvaluationReport, load_samples_from_path, run_benchmark},
    model::{InferenceMode, ModeAvailability, ModelMetadata, ModelRegistry},
    pipeline::InferenceService,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub service: Arc<InferenceService>,
    pub catalog: Arc<VarietyCatalog>,
    pub evaluation: Arc<RwLock<Option<EvaluationReport>>>,
}

#[derive(Debug, Deserialize)]
struct PredictParams {
    mode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub predicted_variety: String,
    pub class_index: usize,
    pub confidence: f32,
    pub mode: InferenceMode,
    pub rice_info: String,
    pub message: String,
}

#[derive(Serialize)]
struct MetadataResponse {
    vocabulary_size: usize,
    models: Vec<ModelMetadata>,
    modes: Vec<ModeAvailability>,
    evaluation: Option<EvaluationReport>,
}

#[derive(Serialize)]
struct ReloadResponse {
    available_modes: Vec<InferenceMode>,
}

pub fn build_router(
    config: Arc<AppConfig>,
    registry: Arc<ModelRegistry>,
    catalog: Arc<VarietyCatalog>,
) -> Router {
    let body_limit = config.max_upload_bytes;
    let state = AppState {
        service: Arc::new(InferenceService::new(registry)),
        evaluation: Arc::new(RwLock::new(None)),
        catalog,
        config,
    };

    Router::new()
        .route("/health", get(health))
        .route("/predict", post(predict))
        .route("/metadata", get(metadata))
        .route("/varieties", get(varieties))
        .route("/evaluate", post(run_evaluation))
        .route("/reload", post(reload))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn predict(
    State(state): State<AppState>,
    Query(params): Query<PredictParams>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, ServiceError> {
    let mut image = None;
    let mut model_type = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::BadRequest(e.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("rice_image") => {
                image = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ServiceError::BadRequest(e.to_string()))?,
                );
            }
            Some("model_type") => {
                model_type = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ServiceError::BadRequest(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let bytes = image.ok_or_else(|| ServiceError::BadRequest("No image provided".into()))?;
    let mode = match model_type.or(params.mode) {
        Some(raw) => raw.parse::<InferenceMode>()?,
        None => InferenceMode::default(),
    };

    let service = state.service.clone();
    let prediction = task::spawn_blocking(move || service.predict(&bytes, mode))
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))??;

    let rice_info = state
        .catalog
        .describe_or_default(&prediction.label)
        .to_string();
    let message = format!(
        "Predicted Rice Variety: {}\nInfo: {rice_info}",
        prediction.label
    );

    Ok(Json(PredictResponse {
        predicted_variety: prediction.label,
        class_index: prediction.class_index,
        confidence: prediction.confidence,
        mode: prediction.mode,
        rice_info,
        message,
    }))
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    let registry = state.service.registry();
    let evaluation = state.evaluation.read().clone();

    Json(MetadataResponse {
        vocabulary_size: registry.vocabulary().len(),
        models: registry.metadata(),
        modes: registry.availability(),
        evaluation,
    })
}

async fn varieties(State(state): State<AppState>) -> Json<Vec<VarietyInfo>> {
    let vocabulary = state.service.registry().vocabulary();
    Json(state.catalog.list(&vocabulary))
}

async fn run_evaluation(
    State(state): State<AppState>,
) -> Result<Json<EvaluationReport>, ServiceError> {
    let path = state
        .config
        .eval_samples_path
        .as_ref()
        .ok_or_else(|| ServiceError::BadRequest("EVAL_SAMPLES_PATH is not configured".into()))?;
    let samples = load_samples_from_path(path)?;

    info!(count = samples.len(), "running evaluation benchmark");

    let report = run_benchmark(state.service.clone(), samples).await?;
    state.evaluation.write().replace(report.clone());

    Ok(Json(report))
}

async fn reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, ServiceError> {
    let registry = state.service.registry().clone();
    let available_modes = task::spawn_blocking(move || registry.reload())
        .await
        .map_err(|err| ServiceError::Inference(format!("reload task failed: {err}")))??;
    Ok(Json(ReloadResponse { available_modes }))
}
