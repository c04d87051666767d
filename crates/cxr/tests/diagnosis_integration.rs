//! Integration tests for the diagnosis pipeline.
//!
//! These tests run the whole chain on synthetic radiographs with a reduced
//! network so they stay fast on the CPU backend.

use std::fs;
use std::path::Path;

use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use image::{GrayImage, Luma};
use tempfile::TempDir;

use cxr::analysis::GroundTruthComparison;
use cxr::core::{Disease, EngineConfig, Seed, NUM_CLASSES};
use cxr::data::nih::METADATA_FILE;
use cxr::data::NihDataset;
use cxr::models::{write_checkpoint, ContainerLayout, DiagnosticModel, LoadPolicy, StateDict};
use cxr::pipeline::{diagnose_image_with, DiagnosisEngine, DiagnosisReport, EngineState};

type TestBackend = Autodiff<NdArray>;

fn compact_config() -> EngineConfig {
    let mut config = EngineConfig::new("efficientnet_b0")
        .compact(16, 1)
        .with_hidden_dim(16)
        .with_bank_size(8);
    config.input_size = 64;
    config
}

/// A synthetic radiograph: bright lungs, dark mediastinum.
fn write_radiograph(path: &Path, width: u32, height: u32) {
    let image = GrayImage::from_fn(width, height, |x, _| {
        let centre = (x as i32 - width as i32 / 2).unsigned_abs();
        Luma([if centre < width / 8 { 40 } else { 180 }])
    });
    image.save(path).unwrap();
}

#[test]
fn test_diagnose_image_end_to_end() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("chest.png");
    let output = dir.path().join("out");
    write_radiograph(&image, 120, 100);

    let report = diagnose_image_with::<TestBackend>(
        compact_config(),
        Default::default(),
        &image,
        None,
        Some(&output),
        0.4,
    )
    .unwrap();

    let probs = &report.diagnosis.raw_probabilities;
    assert_eq!(probs.len(), NUM_CLASSES);
    assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));

    let top = &report.diagnosis.top_5_diseases;
    assert_eq!(top.len(), 5);
    assert!(top.windows(2).all(|w| w[0].confidence >= w[1].confidence));
    assert_eq!(report.gradcam.len(), report.diagnosis.predicted_diseases.len());
    assert_eq!(report.gradcam_top5.len(), 5);

    for explanation in report.gradcam.iter().chain(&report.gradcam_top5) {
        assert!(output.join(explanation.file_name()).is_file());
    }
    assert!(output.join("attention_analysis.png").is_file());

    let restored = DiagnosisReport::load(output.join("diagnosis_results.json")).unwrap();
    assert_eq!(restored, report);
}

#[test]
fn test_zero_radiograph_on_full_size_model() {
    let config = EngineConfig::default();
    assert_eq!(config.input_size, 224);

    let mut engine = DiagnosisEngine::<TestBackend>::new(config, Default::default());
    engine.initialize(None).unwrap();

    let x = burn::tensor::Tensor::<TestBackend, 4>::zeros([1, 3, 224, 224], &Default::default());
    let predictions = engine.predict(x).unwrap();

    assert_eq!(predictions.raw_probabilities.len(), NUM_CLASSES);
    assert!(predictions
        .raw_probabilities
        .iter()
        .all(|p| (0.0..=1.0).contains(p)));
    let top = &predictions.top_5_diseases;
    assert_eq!(top.len(), 5);
    assert!(top.windows(2).all(|w| w[0].confidence >= w[1].confidence));
    assert_eq!(engine.state(), EngineState::Ready);
}

#[test]
fn test_threshold_soundness_and_completeness() {
    let mut engine = DiagnosisEngine::<TestBackend>::new(compact_config(), Default::default());
    engine.initialize(None).unwrap();

    let x = burn::tensor::Tensor::random(
        [1, 3, 64, 64],
        burn::tensor::Distribution::Normal(0.0, 1.0),
        &Default::default(),
    );
    let predictions = engine.predict(x).unwrap();

    let threshold = engine.config().confidence_threshold;
    let expected: Vec<usize> = predictions
        .raw_probabilities
        .iter()
        .enumerate()
        .filter(|(_, p)| **p >= threshold)
        .map(|(i, _)| i)
        .collect();
    let mut reported: Vec<usize> = predictions.predicted_diseases.iter().map(|p| p.index).collect();
    reported.sort_unstable();
    assert_eq!(reported, expected);
}

#[test]
fn test_prefixed_checkpoint_loads_like_plain() {
    let dir = TempDir::new().unwrap();
    let source: DiagnosticModel<TestBackend> =
        DiagnosticModel::new(&compact_config().with_seed(5), &Default::default()).unwrap();
    let plain = source.state_dict();
    let prefixed: StateDict = plain
        .iter()
        .map(|(name, tensor)| (format!("module.{name}"), tensor.clone()))
        .collect();

    let plain_path = dir.path().join("plain.mpk");
    let prefixed_path = dir.path().join("prefixed.json");
    write_checkpoint(&plain, &plain_path, ContainerLayout::Raw).unwrap();
    write_checkpoint(&prefixed, &prefixed_path, ContainerLayout::StateDict).unwrap();

    let strict = compact_config().with_strict_loading(true);
    let mut a = DiagnosisEngine::<TestBackend>::new(strict.clone(), Default::default());
    let mut b = DiagnosisEngine::<TestBackend>::new(strict, Default::default());
    a.initialize(Some(&plain_path)).unwrap();
    b.initialize(Some(&prefixed_path)).unwrap();

    let x = burn::tensor::Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &Default::default());
    let pa = a.predict(x.clone()).unwrap();
    let pb = b.predict(x).unwrap();
    assert_eq!(pa.raw_probabilities, pb.raw_probabilities);
}

#[test]
fn test_partial_checkpoint_is_reported() {
    let source: DiagnosticModel<TestBackend> =
        DiagnosticModel::new(&compact_config(), &Default::default()).unwrap();
    let mut state = source.state_dict();
    state.retain(|name, _| !name.starts_with("classifier."));
    state.insert(
        "aux_head.weight".to_string(),
        cxr::models::StoredTensor {
            shape: vec![2],
            values: vec![0.0, 1.0],
        },
    );

    let mut lenient = DiagnosisEngine::<TestBackend>::new(compact_config(), Default::default());
    let report = lenient.load_state(&state).unwrap();
    assert!(!report.missing.is_empty());
    assert!(report.missing.iter().all(|k| k.starts_with("classifier.")));
    assert_eq!(report.unexpected, vec!["aux_head.weight".to_string()]);
    lenient.validate().unwrap();
    assert_eq!(lenient.state(), EngineState::Ready);

    let mut model: DiagnosticModel<TestBackend> =
        DiagnosticModel::new(&compact_config(), &Default::default()).unwrap();
    assert!(model.load_state_dict(&state, LoadPolicy::Strict).is_err());
}

#[test]
fn test_nih_samples_compared_with_ground_truth() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join(METADATA_FILE),
        "Image Index,Finding Labels,Follow-up #,Patient ID,Patient Age,Patient Gender,View Position\n\
         00000001_000.png,Cardiomegaly|Effusion,0,1,58,M,PA\n\
         00000002_000.png,No Finding,0,2,41,F,PA\n",
    )
    .unwrap();
    let images = dir.path().join("images_003").join("images");
    fs::create_dir_all(&images).unwrap();
    write_radiograph(&images.join("00000001_000.png"), 96, 96);
    write_radiograph(&images.join("00000002_000.png"), 96, 96);

    let nih = NihDataset::open(dir.path()).unwrap();
    // Cardiomegaly, Pneumonia (absent), Effusion, then one normal study.
    let samples = nih.sample_diverse(3, Seed::new(1));
    assert_eq!(samples.len(), 3);
    assert_eq!(samples[0].primary_disease, "Cardiomegaly");
    assert_eq!(samples[1].primary_disease, "Effusion");
    assert_eq!(samples[2].primary_disease, "No Finding");

    let mut engine = DiagnosisEngine::<TestBackend>::new(compact_config(), Default::default());
    engine.initialize(None).unwrap();

    let report = engine
        .diagnose_file(&samples[0].image_path)
        .unwrap()
        .with_ground_truth(&samples[0].record.finding_labels);
    let comparison: &GroundTruthComparison = report.ground_truth.as_ref().unwrap();
    assert_eq!(comparison.ground_truth, vec!["Cardiomegaly", "Effusion"]);
    assert_eq!(
        comparison.matches.len() + comparison.false_positives.len(),
        report.diagnosis.predicted_diseases.len()
    );
    for missed in &comparison.missed {
        let disease: Disease = missed.parse().unwrap();
        assert!(report
            .diagnosis
            .predicted_diseases
            .iter()
            .all(|p| p.disease != disease));
    }
}
