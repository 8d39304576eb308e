#![allow(dead_code)]

use std::{
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use rice_variety_service::{
    ServiceError,
    model::{
        FeatureClassifier, FeatureExtractor, ImageClassifier, ModelFamily, ModelSet, ScoreKind,
        Vocabulary,
    },
    preprocess::{ImageTensor, Preprocessor, VggNormalization},
};

/// Returns the same output for every input.
pub struct FixedClassifier {
    pub name: String,
    pub output: Vec<f32>,
    pub kind: ScoreKind,
    pub calls: AtomicUsize,
}

impl FixedClassifier {
    pub fn probabilities(name: &str, output: &[f32]) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            output: output.to_vec(),
            kind: ScoreKind::Probabilities,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn logits(name: &str, output: &[f32]) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            output: output.to_vec(),
            kind: ScoreKind::Logits,
            calls: AtomicUsize::new(0),
        })
    }
}

impl ImageClassifier for FixedClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_classes(&self) -> usize {
        self.output.len()
    }

    fn score_kind(&self) -> ScoreKind {
        self.kind
    }

    fn forward(&self, _input: &ImageTensor) -> Result<Vec<f32>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

/// Scores classes from the mean input value, so outputs depend on pixels.
pub struct MeanSensitiveClassifier {
    pub classes: usize,
}

impl ImageClassifier for MeanSensitiveClassifier {
    fn name(&self) -> &str {
        "mean-sensitive"
    }

    fn num_classes(&self) -> usize {
        self.classes
    }

    fn score_kind(&self) -> ScoreKind {
        ScoreKind::Logits
    }

    fn forward(&self, input: &ImageTensor) -> Result<Vec<f32>, ServiceError> {
        let values = input.as_hwc();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        Ok((0..self.classes).map(|c| mean * c as f32).collect())
    }
}

/// Embedding filled with one value.
pub struct ConstantExtractor {
    pub name: String,
    pub value: f32,
    pub dim: usize,
}

impl ConstantExtractor {
    pub fn new(name: &str, value: f32, dim: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            value,
            dim,
        })
    }
}

impl FeatureExtractor for ConstantExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn embedding_dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, _input: &ImageTensor) -> Result<Vec<f32>, ServiceError> {
        Ok(vec![self.value; self.dim])
    }
}

/// Meta model that records every feature vector it is given.
pub struct RecordingMeta {
    pub num_features: usize,
    pub output: Vec<f32>,
    pub seen: Mutex<Vec<Vec<f32>>>,
}

impl RecordingMeta {
    pub fn new(num_features: usize, output: &[f32]) -> Arc<Self> {
        Arc::new(Self {
            num_features,
            output: output.to_vec(),
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl FeatureClassifier for RecordingMeta {
    fn name(&self) -> &str {
        "recording-meta"
    }

    fn num_features(&self) -> usize {
        self.num_features
    }

    fn num_classes(&self) -> usize {
        self.output.len()
    }

    fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>, ServiceError> {
        self.seen.lock().push(features.to_vec());
        Ok(self.output.clone())
    }
}

pub fn abc() -> Arc<Vocabulary> {
    Arc::new(Vocabulary::new(["A", "B", "C"]).unwrap())
}

pub fn vgg() -> Preprocessor {
    Preprocessor::vgg(VggNormalization::Unit)
}

/// Vocabulary ["A", "B", "C"] with every mode wired to mocks.
pub fn full_set(meta: Arc<RecordingMeta>) -> ModelSet {
    let mut models = ModelSet::new(abc());
    models
        .set_single(FixedClassifier::probabilities("vgg16", &[0.1, 0.7, 0.2]), vgg())
        .unwrap();
    models
        .set_extractor(
            ModelFamily::VggFeatures,
            ConstantExtractor::new("vgg16-gap", 1.0, 4),
            vgg(),
        )
        .unwrap();
    models
        .set_extractor(
            ModelFamily::MobileNetFeatures,
            ConstantExtractor::new("mobilenetv2-gap", 2.0, 3),
            Preprocessor::mobilenet(),
        )
        .unwrap();
    models.set_meta(meta).unwrap();
    models
        .set_transformer(
            FixedClassifier::logits("vit", &[0.0, 1.0, 3.0]),
            Preprocessor::transformer(),
        )
        .unwrap();
    models
}

pub fn png_bytes(width: u32, height: u32, value: u8) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([value, value / 2, 255 - value]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}
