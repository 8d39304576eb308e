//! Seams between the dispatcher and the concrete networks. Implementations
//! hold read-only weights, so every method takes `&self` and the trait
//! objects are shared across concurrent requests without locking.

use crate::{error::ServiceError, model::ScoreKind, preprocess::ImageTensor};

/// A network mapping an image tensor directly to class scores.
pub trait ImageClassifier: Send + Sync {
    fn name(&self) -> &str;

    /// Width of the output vector.
    fn num_classes(&self) -> usize;

    /// Whether `forward` yields softmax probabilities or raw logits.
    fn score_kind(&self) -> ScoreKind;

    fn forward(&self, input: &ImageTensor) -> Result<Vec<f32>, ServiceError>;
}

/// A headless backbone followed by global average pooling.
pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn embedding_dim(&self) -> usize;

    fn embed(&self, input: &ImageTensor) -> Result<Vec<f32>, ServiceError>;
}

/// A classifier over a flat, pre-computed feature vector.
pub trait FeatureClassifier: Send + Sync {
    fn name(&self) -> &str;

    fn num_features(&self) -> usize;

    fn num_classes(&self) -> usize;

    /// Class probabilities for one feature vector.
    fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>, ServiceError>;
}
