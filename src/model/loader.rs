//! libtorch-backed classifiers and extractors loaded from TorchScript exports.

use std::fs;

use tch::{Device, IValue, Kind, Tensor, no_grad};

use crate::{
    error::ServiceError,
    model::{ArtifactRef, FeatureExtractor, ImageClassifier, ModelMetadata, ScoreKind},
    preprocess::{ImageTensor, TensorLayout},
};

struct TorchModule {
    name: String,
    device: Device,
    module: tch::CModule,
}

impl TorchModule {
    fn load(artifact: &ArtifactRef, device: Device) -> Result<(Self, u64), ServiceError> {
        let path = artifact.path.as_path();
        if !path.exists() {
            return Err(ServiceError::Other(format!(
                "model artifact missing: {}",
                path.display()
            )));
        }
        let size_bytes = fs::metadata(path)?.len();
        let mut module = tch::CModule::load_on_device(path, device)
            .map_err(|e| ServiceError::Inference(format!("{}: {e}", artifact.name)))?;
        // disables dropout and freezes batch-norm statistics
        module.set_eval();

        Ok((
            Self {
                name: artifact.name.clone(),
                device,
                module,
            },
            size_bytes,
        ))
    }

    fn run(&self, input: &ImageTensor) -> Result<Tensor, ServiceError> {
        no_grad(|| {
            let tensor = Tensor::from_slice(&input.to_layout_vec())
                .reshape(input.batched_shape())
                .to(self.device);

            let output = self
                .module
                .forward_is(&[IValue::Tensor(tensor)])
                .map_err(|e| ServiceError::Inference(format!("{}: {e}", self.name)))?;

            // exports may return a bare tensor or a tuple led by it
            let output = match output {
                IValue::Tensor(t) => t,
                IValue::Tuple(ref items) if !items.is_empty() => match &items[0] {
                    IValue::Tensor(t) => t.shallow_clone(),
                    _ => {
                        return Err(ServiceError::Inference(format!(
                            "{}: expected tensor as first tuple element",
                            self.name
                        )));
                    }
                },
                _ => {
                    return Err(ServiceError::Inference(format!(
                        "{}: unexpected model output format",
                        self.name
                    )));
                }
            };

            Ok(output.to_kind(Kind::Float).to(Device::Cpu))
        })
    }
}

fn to_vec(tensor: &Tensor, name: &str) -> Result<Vec<f32>, ServiceError> {
    Vec::<f32>::try_from(&tensor.flatten(0, -1))
        .map_err(|e| ServiceError::Inference(format!("{name}: {e}")))
}

/// Single-backbone softmax network or transformer logit network.
pub struct TorchImageClassifier {
    inner: TorchModule,
    kind: ScoreKind,
    num_classes: usize,
    metadata: ModelMetadata,
}

impl TorchImageClassifier {
    /// Loads the export and probes it once to learn its output width.
    pub fn load(
        artifact: &ArtifactRef,
        device: Device,
        kind: ScoreKind,
        layout: TensorLayout,
    ) -> Result<Self, ServiceError> {
        let (inner, size_bytes) = TorchModule::load(artifact, device)?;
        let probe = inner.run(&ImageTensor::zeros(layout))?;
        let num_classes = to_vec(&probe, &inner.name)?.len();
        Ok(Self {
            metadata: ModelMetadata {
                name: artifact.name.clone(),
                family: artifact.family,
                path: artifact.path.display().to_string(),
                size_bytes,
                output_dim: num_classes,
            },
            inner,
            kind,
            num_classes,
        })
    }

    pub fn metadata(&self) -> ModelMetadata {
        self.metadata.clone()
    }
}

impl ImageClassifier for TorchImageClassifier {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn score_kind(&self) -> ScoreKind {
        self.kind
    }

    fn forward(&self, input: &ImageTensor) -> Result<Vec<f32>, ServiceError> {
        let output = self.inner.run(input)?;
        to_vec(&output, &self.inner.name)
    }
}

/// Headless backbone; 4-D feature maps are reduced by global average pooling.
pub struct TorchFeatureExtractor {
    inner: TorchModule,
    embedding_dim: usize,
    metadata: ModelMetadata,
}

impl TorchFeatureExtractor {
    pub fn load(
        artifact: &ArtifactRef,
        device: Device,
        layout: TensorLayout,
    ) -> Result<Self, ServiceError> {
        let (inner, size_bytes) = TorchModule::load(artifact, device)?;
        let probe = pool(inner.run(&ImageTensor::zeros(layout))?, layout, &inner.name)?;
        let embedding_dim = to_vec(&probe, &inner.name)?.len();
        Ok(Self {
            metadata: ModelMetadata {
                name: artifact.name.clone(),
                family: artifact.family,
                path: artifact.path.display().to_string(),
                size_bytes,
                output_dim: embedding_dim,
            },
            inner,
            embedding_dim,
        })
    }

    pub fn metadata(&self) -> ModelMetadata {
        self.metadata.clone()
    }
}

fn pool(features: Tensor, layout: TensorLayout, name: &str) -> Result<Tensor, ServiceError> {
    match features.dim() {
        2 => Ok(features),
        4 => {
            let spatial: [i64; 2] = match layout {
                TensorLayout::Nhwc => [1, 2],
                TensorLayout::Nchw => [2, 3],
            };
            Ok(features.mean_dim(spatial.as_slice(), false, Kind::Float))
        }
        other => Err(ServiceError::Inference(format!(
            "{name}: cannot pool a {other}-d feature map"
        ))),
    }
}

impl FeatureExtractor for TorchFeatureExtractor {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn embed(&self, input: &ImageTensor) -> Result<Vec<f32>, ServiceError> {
        let pooled = pool(self.inner.run(input)?, input.layout(), &self.inner.name)?;
        to_vec(&pooled, &self.inner.name)
    }
}
