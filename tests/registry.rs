use std::fs;

use rice_variety_service::{
    AppConfig, InferenceMode, ModelRegistry, ServiceError, model::ModelFamily,
};

const META_MODEL: &str = r#"{
  "learner": {
    "gradient_booster": {
      "name": "gbtree",
      "model": {
        "tree_info": [0, 1, 2],
        "trees": [
          {"left_children": [-1], "right_children": [-1], "split_indices": [0],
           "split_conditions": [0.3], "default_left": [0]},
          {"left_children": [-1], "right_children": [-1], "split_indices": [0],
           "split_conditions": [0.1], "default_left": [0]},
          {"left_children": [-1], "right_children": [-1], "split_indices": [0],
           "split_conditions": [0.2], "default_left": [0]}
        ]
      }
    },
    "learner_model_param": {"base_score": "5E-1", "num_class": "3", "num_feature": "1792"},
    "objective": {"name": "multi:softprob"}
  }
}"#;

fn write_fixture(dir: &std::path::Path, manifest: &str) -> AppConfig {
    fs::write(dir.join("labels.json"), r#"["A", "B", "C"]"#).unwrap();
    fs::write(dir.join("xgb_meta_model.json"), META_MODEL).unwrap();
    fs::write(dir.join("manifest.json"), manifest).unwrap();
    AppConfig {
        manifest_path: dir.join("manifest.json"),
        vocabulary_path: Some(dir.join("labels.json")),
        ..AppConfig::default()
    }
}

const MANIFEST: &str = r#"{"artifacts": [
  {"name": "VGG16 Rice Classifier", "family": "single-backbone", "path": "best_VGG16_stage2.pt", "active": true},
  {"name": "VGG16 features", "family": "vgg-features", "path": "vgg16_gap.pt", "active": true},
  {"name": "MobileNetV2 features", "family": "mobilenet-features", "path": "mobilenetv2_gap.pt", "active": true},
  {"name": "XGBoost Meta Model", "family": "meta-stack", "path": "xgb_meta_model.json", "active": true},
  {"name": "ViT old", "family": "transformer", "path": "vit_old.pt", "active": false}
]}"#;

#[test]
fn missing_weight_files_disable_modes_without_failing_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), MANIFEST);

    let registry = ModelRegistry::initialize(&config).unwrap();
    assert_eq!(registry.vocabulary().len(), 3);

    let models = registry.snapshot();
    assert!(models.available_modes().is_empty());
    assert!(matches!(
        models.require(InferenceMode::Ensemble),
        Err(ServiceError::ModelUnavailable {
            family: ModelFamily::VggFeatures,
            ..
        })
    ));

    // the meta model itself parsed and passed its class check
    let metadata = registry.metadata();
    assert_eq!(metadata.len(), 1);
    assert_eq!(metadata[0].family, ModelFamily::MetaStack);
    assert_eq!(metadata[0].output_dim, 3);
}

#[test]
fn resolve_active_reads_the_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), MANIFEST);
    let registry = ModelRegistry::initialize(&config).unwrap();

    let meta = registry
        .resolve_active(ModelFamily::MetaStack, InferenceMode::Ensemble)
        .unwrap();
    assert_eq!(meta.name, "XGBoost Meta Model");
    assert_eq!(meta.path, dir.path().join("xgb_meta_model.json"));

    assert!(matches!(
        registry.resolve_active(ModelFamily::Transformer, InferenceMode::Transformer),
        Err(ServiceError::ModelUnavailable { .. })
    ));
}

#[test]
fn meta_model_with_wrong_class_count_is_not_usable() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), MANIFEST);
    fs::write(dir.path().join("labels.json"), r#"["A", "B", "C", "D"]"#).unwrap();

    let registry = ModelRegistry::initialize(&config).unwrap();
    assert!(registry.metadata().is_empty());
}

#[test]
fn empty_vocabulary_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), MANIFEST);
    fs::write(dir.path().join("labels.json"), "[]").unwrap();

    assert!(matches!(
        ModelRegistry::initialize(&config),
        Err(ServiceError::EmptyVocabulary)
    ));
}

#[test]
fn conflicting_active_artifacts_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(
        dir.path(),
        r#"{"artifacts": [
          {"name": "a", "family": "transformer", "path": "a.pt", "active": true},
          {"name": "b", "family": "transformer", "path": "b.pt", "active": true}
        ]}"#,
    );
    assert!(matches!(
        ModelRegistry::initialize(&config),
        Err(ServiceError::InvalidManifest(_))
    ));
}

#[test]
fn absent_manifest_starts_with_no_modes() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        manifest_path: dir.path().join("nope.json"),
        ..AppConfig::default()
    };
    let registry = ModelRegistry::initialize(&config).unwrap();
    assert_eq!(registry.vocabulary().len(), 62);
    assert!(registry.availability().iter().all(|m| !m.available));
}

#[test]
fn reload_picks_up_manifest_changes() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fixture(dir.path(), r#"{"artifacts": []}"#);
    let registry = ModelRegistry::initialize(&config).unwrap();
    assert!(registry.metadata().is_empty());

    fs::write(dir.path().join("manifest.json"), MANIFEST).unwrap();
    let available = registry.reload().unwrap();
    assert!(available.is_empty());
    assert_eq!(registry.metadata().len(), 1);
    assert!(
        registry
            .resolve_active(ModelFamily::SingleBackbone, InferenceMode::Single)
            .is_ok()
    );
}
