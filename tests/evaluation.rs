mod common;

use std::{fs, sync::Arc};

use common::*;
use rice_variety_service::{
    InferenceMode, InferenceService, LabeledSample, ModelRegistry, evaluation::run_benchmark,
    model::ModelSet,
};

#[tokio::test]
async fn unreadable_sample_is_recorded_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let readable = dir.path().join("grain.png");
    fs::write(&readable, png_bytes(40, 40, 90)).unwrap();

    let mut models = ModelSet::new(abc());
    models
        .set_single(FixedClassifier::probabilities("vgg16", &[0.1, 0.7, 0.2]), vgg())
        .unwrap();
    let service = Arc::new(InferenceService::new(Arc::new(ModelRegistry::from_models(
        models,
    ))));

    let samples = vec![
        LabeledSample {
            image_path: dir.path().join("missing.png"),
            label: "A".into(),
        },
        LabeledSample {
            image_path: readable,
            label: "B".into(),
        },
    ];
    let report = run_benchmark(service, samples).await.unwrap();

    assert_eq!(report.samples.len(), 2);
    let missing = &report.samples[0].outcomes;
    assert_eq!(missing.len(), 1);
    assert!(!missing[0].correct);
    assert!(missing[0].error.as_deref().unwrap().starts_with("io_error"));

    let found = &report.samples[1].outcomes[0];
    assert!(found.correct);
    assert_eq!(found.predicted.as_deref(), Some("B"));

    let single = &report.aggregate[0];
    assert_eq!(single.mode, InferenceMode::Single);
    assert_eq!(single.evaluated, 2);
    assert_eq!(single.failures, 1);
    assert!((single.accuracy - 0.5).abs() < 1e-9);
}
