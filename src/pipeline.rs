//! Ensembling dispatcher: routes one image through the models a mode needs
//! and reconciles their outputs into a single prediction.

use std::sync::Arc;

use image::RgbImage;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    error::ServiceError,
    model::{
        EnsembleParts, ImageClassifier, InferenceMode, ModelRegistry, ModelSet, Prediction,
        ScoreKind, Slot, Vocabulary, decide, ensure_finite, to_probabilities,
    },
    preprocess::decode_image,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Idle,
    Preprocessing,
    Inferring,
    Aggregating,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    fn can_advance_to(self, next: Stage) -> bool {
        match (self, next) {
            (from, Stage::Failed) => !from.is_terminal(),
            (Stage::Idle, Stage::Preprocessing)
            | (Stage::Preprocessing, Stage::Inferring)
            | (Stage::Inferring, Stage::Aggregating)
            | (Stage::Inferring, Stage::Done)
            | (Stage::Aggregating, Stage::Done) => true,
            _ => false,
        }
    }
}

struct StageTracker {
    mode: InferenceMode,
    history: Vec<Stage>,
}

impl StageTracker {
    fn new(mode: InferenceMode) -> Self {
        Self {
            mode,
            history: vec![Stage::Idle],
        }
    }

    fn current(&self) -> Stage {
        self.history.last().copied().unwrap_or(Stage::Idle)
    }

    fn advance(&mut self, next: Stage) {
        let from = self.current();
        debug_assert!(from.can_advance_to(next), "{from:?} -> {next:?}");
        debug!(mode = %self.mode, ?from, to = ?next, "dispatch stage");
        self.history.push(next);
    }
}

/// Result of one dispatch plus the stages it went through.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub result: Result<Prediction, ServiceError>,
    pub stages: Vec<Stage>,
}

/// Synchronous inference entry point handed to request handlers.
pub struct InferenceService {
    registry: Arc<ModelRegistry>,
}

impl InferenceService {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn predict(&self, bytes: &[u8], mode: InferenceMode) -> Result<Prediction, ServiceError> {
        self.dispatch(bytes, mode).result
    }

    /// Runs one request against a single snapshot of the loaded models.
    /// Never retries and never substitutes another mode.
    pub fn dispatch(&self, bytes: &[u8], mode: InferenceMode) -> DispatchOutcome {
        let models = self.registry.snapshot();
        let mut tracker = StageTracker::new(mode);
        tracker.advance(Stage::Preprocessing);
        let result = models
            .require(mode)
            .and_then(|()| decode_image(bytes))
            .and_then(|image| infer(&models, &image, mode, &mut tracker));
        finish(result, tracker)
    }
}

fn finish(result: Result<Prediction, ServiceError>, mut tracker: StageTracker) -> DispatchOutcome {
    match &result {
        Ok(prediction) => {
            tracker.advance(Stage::Done);
            debug!(
                mode = %prediction.mode,
                label = %prediction.label,
                confidence = prediction.confidence,
                "prediction ready"
            );
        }
        Err(err) => {
            tracker.advance(Stage::Failed);
            warn!(mode = %tracker.mode, kind = err.kind(), error = %err, "prediction failed");
        }
    }
    DispatchOutcome {
        result,
        stages: tracker.history,
    }
}

fn infer(
    models: &ModelSet,
    image: &RgbImage,
    mode: InferenceMode,
    tracker: &mut StageTracker,
) -> Result<Prediction, ServiceError> {
    let vocabulary = models.vocabulary();
    match mode {
        InferenceMode::Single => classify(models.single()?, image, vocabulary, mode, tracker),
        InferenceMode::Transformer => {
            classify(models.transformer()?, image, vocabulary, mode, tracker)
        }
        InferenceMode::Ensemble => stack(models.ensemble()?, image, vocabulary, tracker),
    }
}

fn classify(
    slot: &Slot<dyn ImageClassifier>,
    image: &RgbImage,
    vocabulary: &Vocabulary,
    mode: InferenceMode,
    tracker: &mut StageTracker,
) -> Result<Prediction, ServiceError> {
    let input = slot.preprocessor.prepare(image);
    tracker.advance(Stage::Inferring);
    let raw = slot.model.forward(&input)?;
    let probabilities = to_probabilities(raw, slot.model.score_kind(), slot.model.name())?;
    build(&probabilities, vocabulary, slot.model.name(), mode)
}

fn stack(
    parts: EnsembleParts<'_>,
    image: &RgbImage,
    vocabulary: &Vocabulary,
    tracker: &mut StageTracker,
) -> Result<Prediction, ServiceError> {
    let vgg_input = parts.vgg.preprocessor.prepare(image);
    let mobilenet_input = parts.mobilenet.preprocessor.prepare(image);
    tracker.advance(Stage::Inferring);

    // concatenation order is fixed by how the meta model was trained
    let mut features =
        Vec::with_capacity(parts.vgg.model.embedding_dim() + parts.mobilenet.model.embedding_dim());
    for (slot, input) in [(parts.vgg, &vgg_input), (parts.mobilenet, &mobilenet_input)] {
        let embedding = slot.model.embed(input)?;
        if embedding.len() != slot.model.embedding_dim() {
            return Err(ServiceError::ShapeMismatch {
                model: slot.model.name().to_string(),
                what: "embedding values",
                expected: slot.model.embedding_dim(),
                actual: embedding.len(),
            });
        }
        ensure_finite(&embedding, slot.model.name())?;
        features.extend(embedding);
    }

    tracker.advance(Stage::Aggregating);
    let raw = parts.meta.predict_proba(&features)?;
    let probabilities = to_probabilities(raw, ScoreKind::Probabilities, parts.meta.name())?;
    build(
        &probabilities,
        vocabulary,
        parts.meta.name(),
        InferenceMode::Ensemble,
    )
}

fn build(
    probabilities: &[f32],
    vocabulary: &Vocabulary,
    source: &str,
    mode: InferenceMode,
) -> Result<Prediction, ServiceError> {
    if probabilities.len() != vocabulary.len() {
        return Err(ServiceError::ShapeMismatch {
            model: source.to_string(),
            what: "classes",
            expected: vocabulary.len(),
            actual: probabilities.len(),
        });
    }
    let (class_index, confidence) = decide(probabilities, source)?;
    let label = vocabulary
        .label(class_index)
        .ok_or_else(|| ServiceError::Inference(format!("{source}: class {class_index} has no label")))?
        .to_string();
    Ok(Prediction {
        class_index,
        label,
        confidence,
        mode,
    })
}
