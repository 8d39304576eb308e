use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::ServiceError,
    model::{InferenceMode, ModelFamily},
    preprocess::Preprocessor,
};

/// Reference to one trained weight file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub family: ModelFamily,
    pub path: PathBuf,
    #[serde(default)]
    pub active: bool,
    /// Input recipe pinned to this weight file; the family default otherwise.
    #[serde(default)]
    pub preprocess: Option<Preprocessor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactManifest {
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl ArtifactManifest {
    pub fn new(artifacts: Vec<ArtifactRef>) -> Result<Self, ServiceError> {
        let manifest = Self { artifacts };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Loads the manifest and resolves relative artifact paths against the
    /// manifest's directory.
    pub fn from_path(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path)?;
        let mut manifest: ArtifactManifest = serde_json::from_str(&raw)
            .map_err(|e| ServiceError::InvalidManifest(format!("{}: {e}", path.display())))?;
        if let Some(base) = path.parent() {
            for artifact in &mut manifest.artifacts {
                if artifact.path.is_relative() {
                    artifact.path = base.join(&artifact.path);
                }
            }
        }
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ServiceError> {
        for family in ModelFamily::ALL {
            let active: Vec<&str> = self
                .artifacts
                .iter()
                .filter(|a| a.family == family && a.active)
                .map(|a| a.name.as_str())
                .collect();
            if active.len() > 1 {
                return Err(ServiceError::InvalidManifest(format!(
                    "{} artifacts active for {family}: {}",
                    active.len(),
                    active.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// The single active artifact for `family`. `mode` only labels the error.
    pub fn resolve_active(
        &self,
        family: ModelFamily,
        mode: InferenceMode,
    ) -> Result<&ArtifactRef, ServiceError> {
        self.artifacts
            .iter()
            .find(|a| a.family == family && a.active)
            .ok_or(ServiceError::ModelUnavailable { mode, family })
    }
}
