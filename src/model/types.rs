use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Architecture family of a trained artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    /// VGG16 backbone with its dense softmax head.
    SingleBackbone,
    /// VGG16 backbone without head, pooled to an embedding.
    VggFeatures,
    /// MobileNetV2 backbone without head, pooled to an embedding.
    #[serde(rename = "mobilenet-features")]
    MobileNetFeatures,
    /// Gradient-boosted trees over the concatenated embeddings.
    MetaStack,
    /// Vision transformer producing logits.
    Transformer,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 5] = [
        ModelFamily::SingleBackbone,
        ModelFamily::VggFeatures,
        ModelFamily::MobileNetFeatures,
        ModelFamily::MetaStack,
        ModelFamily::Transformer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::SingleBackbone => "single-backbone",
            ModelFamily::VggFeatures => "vgg-features",
            ModelFamily::MobileNetFeatures => "mobilenet-features",
            ModelFamily::MetaStack => "meta-stack",
            ModelFamily::Transformer => "transformer",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prediction strategy selected per request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceMode {
    #[default]
    Single,
    Ensemble,
    Transformer,
}

impl InferenceMode {
    pub const ALL: [InferenceMode; 3] = [
        InferenceMode::Single,
        InferenceMode::Ensemble,
        InferenceMode::Transformer,
    ];

    /// Families that must all be loaded for this mode to run. For the
    /// ensemble the order is also the embedding concatenation order.
    pub fn required_families(self) -> &'static [ModelFamily] {
        match self {
            InferenceMode::Single => &[ModelFamily::SingleBackbone],
            InferenceMode::Ensemble => &[
                ModelFamily::VggFeatures,
                ModelFamily::MobileNetFeatures,
                ModelFamily::MetaStack,
            ],
            InferenceMode::Transformer => &[ModelFamily::Transformer],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InferenceMode::Single => "single",
            InferenceMode::Ensemble => "ensemble",
            InferenceMode::Transformer => "transformer",
        }
    }
}

impl fmt::Display for InferenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InferenceMode {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "default" | "single" => Ok(InferenceMode::Single),
            "ensemble" => Ok(InferenceMode::Ensemble),
            "transformer" | "vit" => Ok(InferenceMode::Transformer),
            other => Err(ServiceError::BadRequest(format!(
                "unknown model type '{other}', expected one of default, ensemble, transformer"
            ))),
        }
    }
}

/// Final decision of one inference call. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    /// Percentage in [0, 100].
    pub confidence: f32,
    pub mode: InferenceMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub family: ModelFamily,
    pub path: String,
    pub size_bytes: u64,
    pub output_dim: usize,
}
