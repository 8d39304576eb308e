use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        ArtifactManifest, ArtifactRef, BoostedTreeEnsemble, FeatureClassifier, FeatureExtractor,
        ImageClassifier, InferenceMode, ModelFamily, ModelMetadata, Vocabulary,
    },
    preprocess::Preprocessor,
};

/// A loaded network together with the input recipe its weights expect.
pub struct Slot<T: ?Sized> {
    pub model: Arc<T>,
    pub preprocessor: Preprocessor,
}

impl<T: ?Sized> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            preprocessor: self.preprocessor,
        }
    }
}

/// Everything the ensemble mode needs, borrowed from one snapshot.
pub struct EnsembleParts<'a> {
    pub vgg: &'a Slot<dyn FeatureExtractor>,
    pub mobilenet: &'a Slot<dyn FeatureExtractor>,
    pub meta: &'a Arc<dyn FeatureClassifier>,
}

/// Immutable set of usable models sharing one vocabulary. A model only
/// enters the set after its output width has been checked.
pub struct ModelSet {
    vocabulary: Arc<Vocabulary>,
    single: Option<Slot<dyn ImageClassifier>>,
    vgg_features: Option<Slot<dyn FeatureExtractor>>,
    mobilenet_features: Option<Slot<dyn FeatureExtractor>>,
    meta: Option<Arc<dyn FeatureClassifier>>,
    transformer: Option<Slot<dyn ImageClassifier>>,
    metadata: Vec<ModelMetadata>,
}

impl ModelSet {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self {
        Self {
            vocabulary,
            single: None,
            vgg_features: None,
            mobilenet_features: None,
            meta: None,
            transformer: None,
            metadata: Vec::new(),
        }
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }

    pub fn metadata(&self) -> &[ModelMetadata] {
        &self.metadata
    }

    pub fn record(&mut self, metadata: ModelMetadata) {
        self.metadata.push(metadata);
    }

    fn check_classes(&self, model: &str, actual: usize) -> Result<(), ServiceError> {
        let expected = self.vocabulary.len();
        if actual != expected {
            return Err(ServiceError::ShapeMismatch {
                model: model.to_string(),
                what: "classes",
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn check_meta_width(&self) -> Result<(), ServiceError> {
        if let (Some(vgg), Some(mobilenet), Some(meta)) =
            (&self.vgg_features, &self.mobilenet_features, &self.meta)
        {
            let concatenated = vgg.model.embedding_dim() + mobilenet.model.embedding_dim();
            if concatenated != meta.num_features() {
                return Err(ServiceError::ShapeMismatch {
                    model: meta.name().to_string(),
                    what: "features",
                    expected: meta.num_features(),
                    actual: concatenated,
                });
            }
        }
        Ok(())
    }

    pub fn set_single(
        &mut self,
        model: Arc<dyn ImageClassifier>,
        preprocessor: Preprocessor,
    ) -> Result<(), ServiceError> {
        self.check_classes(model.name(), model.num_classes())?;
        self.single = Some(Slot {
            model,
            preprocessor,
        });
        Ok(())
    }

    pub fn set_transformer(
        &mut self,
        model: Arc<dyn ImageClassifier>,
        preprocessor: Preprocessor,
    ) -> Result<(), ServiceError> {
        self.check_classes(model.name(), model.num_classes())?;
        self.transformer = Some(Slot {
            model,
            preprocessor,
        });
        Ok(())
    }

    /// `family` must be one of the two extractor families.
    pub fn set_extractor(
        &mut self,
        family: ModelFamily,
        model: Arc<dyn FeatureExtractor>,
        preprocessor: Preprocessor,
    ) -> Result<(), ServiceError> {
        let slot = Some(Slot {
            model,
            preprocessor,
        });
        let previous = match family {
            ModelFamily::VggFeatures => std::mem::replace(&mut self.vgg_features, slot),
            ModelFamily::MobileNetFeatures => {
                std::mem::replace(&mut self.mobilenet_features, slot)
            }
            other => {
                return Err(ServiceError::Other(format!(
                    "{other} is not a feature extractor family"
                )));
            }
        };
        if let Err(err) = self.check_meta_width() {
            match family {
                ModelFamily::VggFeatures => self.vgg_features = previous,
                _ => self.mobilenet_features = previous,
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn set_meta(&mut self, model: Arc<dyn FeatureClassifier>) -> Result<(), ServiceError> {
        self.check_classes(model.name(), model.num_classes())?;
        let previous = self.meta.replace(model);
        if let Err(err) = self.check_meta_width() {
            self.meta = previous;
            return Err(err);
        }
        Ok(())
    }

    pub fn single(&self) -> Result<&Slot<dyn ImageClassifier>, ServiceError> {
        self.single.as_ref().ok_or(ServiceError::ModelUnavailable {
            mode: InferenceMode::Single,
            family: ModelFamily::SingleBackbone,
        })
    }

    pub fn transformer(&self) -> Result<&Slot<dyn ImageClassifier>, ServiceError> {
        self.transformer.as_ref().ok_or(ServiceError::ModelUnavailable {
            mode: InferenceMode::Transformer,
            family: ModelFamily::Transformer,
        })
    }

    /// All three ensemble members, or the first one missing.
    pub fn ensemble(&self) -> Result<EnsembleParts<'_>, ServiceError> {
        let missing = |family| ServiceError::ModelUnavailable {
            mode: InferenceMode::Ensemble,
            family,
        };
        Ok(EnsembleParts {
            vgg: self
                .vgg_features
                .as_ref()
                .ok_or_else(|| missing(ModelFamily::VggFeatures))?,
            mobilenet: self
                .mobilenet_features
                .as_ref()
                .ok_or_else(|| missing(ModelFamily::MobileNetFeatures))?,
            meta: self
                .meta
                .as_ref()
                .ok_or_else(|| missing(ModelFamily::MetaStack))?,
        })
    }

    pub fn require(&self, mode: InferenceMode) -> Result<(), ServiceError> {
        match mode {
            InferenceMode::Single => self.single().map(|_| ()),
            InferenceMode::Ensemble => self.ensemble().map(|_| ()),
            InferenceMode::Transformer => self.transformer().map(|_| ()),
        }
    }

    pub fn is_available(&self, mode: InferenceMode) -> bool {
        self.require(mode).is_ok()
    }

    pub fn available_modes(&self) -> Vec<InferenceMode> {
        InferenceMode::ALL
            .into_iter()
            .filter(|&mode| self.is_available(mode))
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModeAvailability {
    pub mode: InferenceMode,
    pub available: bool,
    pub reason: Option<String>,
}

/// Owns the active manifest and the currently loaded model set. Requests
/// take one snapshot and keep it for their whole lifetime, so a reload never
/// changes models under an in-flight request.
pub struct ModelRegistry {
    config: Option<AppConfig>,
    vocabulary: Arc<Vocabulary>,
    manifest: RwLock<Arc<ArtifactManifest>>,
    current: RwLock<Arc<ModelSet>>,
}

impl ModelRegistry {
    /// Fails only on an unusable vocabulary or malformed manifest; missing
    /// or mismatched artifacts just disable their modes.
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        let vocabulary = match config.vocabulary_path.as_deref() {
            Some(path) => Arc::new(Vocabulary::from_path(path)?),
            None => Vocabulary::rice62(),
        };
        info!(classes = vocabulary.len(), "label vocabulary ready");

        let manifest = Arc::new(read_manifest(config)?);
        let models = load_models(&manifest, vocabulary.clone(), config);

        Ok(Self {
            config: Some(config.clone()),
            vocabulary,
            manifest: RwLock::new(manifest),
            current: RwLock::new(Arc::new(models)),
        })
    }

    /// Registry over an already assembled model set; `reload` is a no-op.
    pub fn from_models(models: ModelSet) -> Self {
        Self {
            config: None,
            vocabulary: models.vocabulary().clone(),
            manifest: RwLock::new(Arc::new(ArtifactManifest::default())),
            current: RwLock::new(Arc::new(models)),
        }
    }

    pub fn snapshot(&self) -> Arc<ModelSet> {
        self.current.read().clone()
    }

    pub fn vocabulary(&self) -> Arc<Vocabulary> {
        self.vocabulary.clone()
    }

    pub fn resolve_active(
        &self,
        family: ModelFamily,
        mode: InferenceMode,
    ) -> Result<ArtifactRef, ServiceError> {
        self.manifest.read().resolve_active(family, mode).cloned()
    }

    /// Swaps in a new model set; in-flight requests keep their snapshot.
    pub fn replace(&self, models: ModelSet) {
        *self.current.write() = Arc::new(models);
    }

    /// Re-reads the manifest and loads the artifacts it marks active.
    pub fn reload(&self) -> Result<Vec<InferenceMode>, ServiceError> {
        let Some(config) = self.config.as_ref() else {
            return Ok(self.snapshot().available_modes());
        };
        let manifest = Arc::new(read_manifest(config)?);
        let models = load_models(&manifest, self.vocabulary.clone(), config);
        let available = models.available_modes();
        *self.manifest.write() = manifest;
        self.replace(models);
        info!(?available, "model set reloaded");
        Ok(available)
    }

    pub fn metadata(&self) -> Vec<ModelMetadata> {
        self.snapshot().metadata().to_vec()
    }

    pub fn availability(&self) -> Vec<ModeAvailability> {
        let models = self.snapshot();
        InferenceMode::ALL
            .into_iter()
            .map(|mode| match models.require(mode) {
                Ok(()) => ModeAvailability {
                    mode,
                    available: true,
                    reason: None,
                },
                Err(err) => ModeAvailability {
                    mode,
                    available: false,
                    reason: Some(err.to_string()),
                },
            })
            .collect()
    }
}

fn read_manifest(config: &AppConfig) -> Result<ArtifactManifest, ServiceError> {
    let path = config.manifest_path.as_path();
    if !path.exists() {
        warn!(path = %path.display(), "model manifest not found, no modes available");
        return Ok(ArtifactManifest::default());
    }
    ArtifactManifest::from_path(path)
}

fn load_models(manifest: &ArtifactManifest, vocabulary: Arc<Vocabulary>, config: &AppConfig) -> ModelSet {
    let mut models = ModelSet::new(vocabulary);

    // extractors before the meta model so its feature width can be checked
    let order = [
        (ModelFamily::SingleBackbone, InferenceMode::Single),
        (ModelFamily::VggFeatures, InferenceMode::Ensemble),
        (ModelFamily::MobileNetFeatures, InferenceMode::Ensemble),
        (ModelFamily::MetaStack, InferenceMode::Ensemble),
        (ModelFamily::Transformer, InferenceMode::Transformer),
    ];
    for (family, mode) in order {
        let artifact = match manifest.resolve_active(family, mode) {
            Ok(artifact) => artifact,
            Err(_) => {
                warn!(%family, "no active artifact");
                continue;
            }
        };
        match load_artifact(&mut models, artifact, config) {
            Ok(()) => info!(%family, name = %artifact.name, "model ready"),
            Err(err) => error!(
                %family,
                name = %artifact.name,
                kind = err.kind(),
                error = %err,
                "model not usable"
            ),
        }
    }
    models
}

fn load_artifact(
    models: &mut ModelSet,
    artifact: &ArtifactRef,
    config: &AppConfig,
) -> Result<(), ServiceError> {
    if artifact.family == ModelFamily::MetaStack {
        let meta = BoostedTreeEnsemble::from_path(&artifact.name, &artifact.path)?;
        let metadata = ModelMetadata {
            name: artifact.name.clone(),
            family: artifact.family,
            path: artifact.path.display().to_string(),
            size_bytes: std::fs::metadata(&artifact.path)?.len(),
            output_dim: meta.num_classes(),
        };
        models.set_meta(Arc::new(meta))?;
        models.record(metadata);
        return Ok(());
    }
    let preprocessor = artifact
        .preprocess
        .or_else(|| Preprocessor::for_family(artifact.family, config.vgg_normalization))
        .ok_or_else(|| {
            ServiceError::Other(format!("{} has no input preprocessing", artifact.family))
        })?;
    load_network(models, artifact, preprocessor, config)
}

#[cfg(feature = "tch-backend")]
fn load_network(
    models: &mut ModelSet,
    artifact: &ArtifactRef,
    preprocessor: Preprocessor,
    config: &AppConfig,
) -> Result<(), ServiceError> {
    use crate::model::{
        ScoreKind,
        loader::{TorchFeatureExtractor, TorchImageClassifier},
    };

    let layout = preprocessor.layout;
    match artifact.family {
        ModelFamily::SingleBackbone | ModelFamily::Transformer => {
            let kind = if artifact.family == ModelFamily::Transformer {
                ScoreKind::Logits
            } else {
                ScoreKind::Probabilities
            };
            let classifier = TorchImageClassifier::load(artifact, config.device, kind, layout)?;
            let metadata = classifier.metadata();
            if artifact.family == ModelFamily::Transformer {
                models.set_transformer(Arc::new(classifier), preprocessor)?;
            } else {
                models.set_single(Arc::new(classifier), preprocessor)?;
            }
            models.record(metadata);
        }
        ModelFamily::VggFeatures | ModelFamily::MobileNetFeatures => {
            let extractor = TorchFeatureExtractor::load(artifact, config.device, layout)?;
            let metadata = extractor.metadata();
            models.set_extractor(artifact.family, Arc::new(extractor), preprocessor)?;
            models.record(metadata);
        }
        ModelFamily::MetaStack => {
            return Err(ServiceError::Other(
                "meta model is not a torch export".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(not(feature = "tch-backend"))]
fn load_network(
    _models: &mut ModelSet,
    artifact: &ArtifactRef,
    _preprocessor: Preprocessor,
    _config: &AppConfig,
) -> Result<(), ServiceError> {
    Err(ServiceError::Other(format!(
        "{} needs the tch-backend feature",
        artifact.family
    )))
}
