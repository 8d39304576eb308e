mod boosted;
mod manifest;
mod registry;
mod scores;
mod traits;
mod types;
mod vocabulary;

#[cfg(feature = "tch-backend")]
pub mod loader;

pub use boosted::BoostedTreeEnsemble;
pub use manifest::{ArtifactManifest, ArtifactRef};
pub use registry::{EnsembleParts, ModeAvailability, ModelRegistry, ModelSet, Slot};
pub use scores::{ScoreKind, argmax, decide, ensure_finite, softmax, to_probabilities};
pub use traits::{FeatureClassifier, FeatureExtractor, ImageClassifier};
pub use types::{InferenceMode, ModelFamily, ModelMetadata, Prediction};
pub use vocabulary::Vocabulary;
