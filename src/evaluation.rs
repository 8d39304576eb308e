use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::warn;

use crate::{error::ServiceError, model::InferenceMode, pipeline::InferenceService};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledSample {
    pub image_path: PathBuf,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeOutcome {
    pub mode: InferenceMode,
    pub predicted: Option<String>,
    pub confidence: Option<f32>,
    pub correct: bool,
    pub latency_ms: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleReport {
    pub image_path: PathBuf,
    pub label: String,
    pub outcomes: Vec<ModeOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeMetrics {
    pub mode: InferenceMode,
    pub evaluated: usize,
    pub failures: usize,
    pub accuracy: f64,
    pub avg_confidence: Option<f64>,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub samples: Vec<SampleReport>,
    pub aggregate: Vec<ModeMetrics>,
}

/// Runs every sample through every mode that is currently available.
pub async fn run_benchmark(
    service: Arc<InferenceService>,
    samples: Vec<LabeledSample>,
) -> Result<EvaluationReport, ServiceError> {
    if samples.is_empty() {
        return Err(ServiceError::BadRequest(
            "at least one labeled sample is required".into(),
        ));
    }

    let vocabulary = service.registry().vocabulary();
    if let Some(sample) = samples.iter().find(|s| vocabulary.index_of(&s.label).is_none()) {
        return Err(ServiceError::BadRequest(format!(
            "sample {} has unknown label '{}'",
            sample.image_path.display(),
            sample.label
        )));
    }

    let modes = service.registry().snapshot().available_modes();
    if modes.is_empty() {
        return Err(ServiceError::ModelUnavailable {
            mode: InferenceMode::default(),
            family: InferenceMode::default().required_families()[0],
        });
    }

    let mut reports = Vec::with_capacity(samples.len());
    for sample in samples {
        let bytes = match fs::read(&sample.image_path) {
            Ok(bytes) => Arc::new(bytes),
            Err(err) => {
                warn!(
                    path = %sample.image_path.display(),
                    error = %err,
                    "evaluation sample unreadable"
                );
                let err = ServiceError::from(err);
                reports.push(SampleReport {
                    outcomes: modes.iter().map(|&mode| failed(mode, &err, 0.0)).collect(),
                    image_path: sample.image_path,
                    label: sample.label,
                });
                continue;
            }
        };
        let mut outcomes = Vec::with_capacity(modes.len());
        for &mode in &modes {
            let service = service.clone();
            let bytes = bytes.clone();
            let (result, elapsed) = task::spawn_blocking(move || {
                let start = Instant::now();
                let result = service.predict(&bytes, mode);
                (result, start.elapsed())
            })
            .await
            .map_err(|err| ServiceError::Inference(format!("evaluation task failed: {err}")))?;

            let outcome = match result {
                Ok(prediction) => ModeOutcome {
                    mode,
                    correct: prediction.label == sample.label,
                    predicted: Some(prediction.label),
                    confidence: Some(prediction.confidence),
                    latency_ms: elapsed.as_secs_f64() * 1000.0,
                    error: None,
                },
                Err(err) => failed(mode, &err, elapsed.as_secs_f64() * 1000.0),
            };
            outcomes.push(outcome);
        }
        reports.push(SampleReport {
            image_path: sample.image_path,
            label: sample.label,
            outcomes,
        });
    }

    let aggregate = modes.iter().map(|&mode| summarize(&reports, mode)).collect();
    Ok(EvaluationReport {
        samples: reports,
        aggregate,
    })
}

fn failed(mode: InferenceMode, err: &ServiceError, latency_ms: f64) -> ModeOutcome {
    ModeOutcome {
        mode,
        predicted: None,
        confidence: None,
        correct: false,
        latency_ms,
        error: Some(format!("{}: {err}", err.kind())),
    }
}

/// JSON array of `{"image_path", "label"}`; relative paths are resolved
/// against the file's directory.
pub fn load_samples_from_path(path: &Path) -> Result<Vec<LabeledSample>, ServiceError> {
    let raw = fs::read_to_string(path)?;
    let mut samples: Vec<LabeledSample> = serde_json::from_str(&raw)
        .map_err(|e| ServiceError::BadRequest(format!("invalid samples file: {e}")))?;
    if let Some(base) = path.parent() {
        for sample in &mut samples {
            if sample.image_path.is_relative() {
                sample.image_path = base.join(&sample.image_path);
            }
        }
    }
    Ok(samples)
}

fn summarize(reports: &[SampleReport], mode: InferenceMode) -> ModeMetrics {
    let outcomes: Vec<&ModeOutcome> = reports
        .iter()
        .flat_map(|r| r.outcomes.iter())
        .filter(|o| o.mode == mode)
        .collect();
    let evaluated = outcomes.len();
    let failures = outcomes.iter().filter(|o| o.error.is_some()).count();
    let correct = outcomes.iter().filter(|o| o.correct).count();
    let confidences: Vec<f64> = outcomes
        .iter()
        .filter_map(|o| o.confidence.map(f64::from))
        .collect();

    ModeMetrics {
        mode,
        evaluated,
        failures,
        accuracy: if evaluated == 0 {
            0.0
        } else {
            correct as f64 / evaluated as f64
        },
        avg_confidence: if confidences.is_empty() {
            None
        } else {
            Some(mean(confidences))
        },
        avg_latency_ms: mean(outcomes.iter().map(|o| o.latency_ms)),
    }
}

fn mean<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let mut count = 0usize;
    let mut acc = 0.0;
    for value in values {
        count += 1;
        acc += value;
    }
    if count == 0 { 0.0 } else { acc / count as f64 }
}
