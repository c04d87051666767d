//! The diagnosis engine.
//!
//! Drives one [`DiagnosticModel`] through its lifecycle: build and load
//! weights, run a synthetic smoke test, then serve diagnosis requests that
//! predict, explain and package results. See [`EngineState`] for the
//! transitions.

use std::path::Path;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use cxr_analysis::DiagnosisPredictions;
use cxr_core::{Disease, EngineConfig, ImageShape, MultiLabelClassifier};
use cxr_data::{to_display_image, Preprocessor};
use cxr_explain::render::attention_panel;
use cxr_explain::{AttentionExtractor, GradCam, GradCamConfig, Saliency};
use cxr_models::{
    read_checkpoint, CheckpointMetadata, DiagnosticModel, LoadPolicy, LoadReport, ModelError,
    StateDict,
};
use image::RgbImage;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, PipelineError, Result};
use crate::report::{AttentionExplanation, DiagnosisReport, DiseaseExplanation, ExplanationFailure};
use crate::state::EngineState;

/// Saliency maps and failures of one request.
struct Explanations {
    gradcam: Vec<DiseaseExplanation>,
    gradcam_top5: Vec<DiseaseExplanation>,
    attention: Option<AttentionExplanation>,
    errors: Vec<ExplanationFailure>,
}

/// Stateful diagnosis orchestrator.
///
/// Explanations need gradients, so the engine runs on an autodiff backend;
/// predictions use the same model in inference mode.
pub struct DiagnosisEngine<B: AutodiffBackend> {
    config: EngineConfig,
    device: B::Device,
    state: EngineState,
    model: Option<DiagnosticModel<B>>,
    load_report: Option<LoadReport>,
}

impl<B: AutodiffBackend> DiagnosisEngine<B> {
    /// Uninitialized engine.
    pub fn new(config: EngineConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            state: EngineState::Uninitialized,
            model: None,
            load_report: None,
        }
    }

    /// Build the model, load weights and run the smoke test.
    ///
    /// # Errors
    ///
    /// See [`DiagnosisEngine::load_weights`] and [`DiagnosisEngine::validate`].
    pub fn initialize(&mut self, weights: Option<&Path>) -> Result<()> {
        self.load_weights(weights)?;
        self.validate()
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Change the reporting threshold for later requests.
    ///
    /// # Errors
    ///
    /// Fails unless `threshold` is in `[0, 1]`.
    pub fn set_threshold(&mut self, threshold: f32) -> Result<()> {
        let config = self.config.clone().with_threshold(threshold);
        config.validate().map_err(ModelError::from)?;
        self.config = config;
        Ok(())
    }

    /// The model, once built.
    pub fn model(&self) -> Option<&DiagnosticModel<B>> {
        self.model.as_ref()
    }

    /// Outcome of the checkpoint load; `None` after random initialization.
    pub fn load_report(&self) -> Option<&LoadReport> {
        self.load_report.as_ref()
    }

    fn policy(&self) -> LoadPolicy {
        LoadPolicy::from_strict(self.config.strict_loading)
    }

    fn require(&self, expected: EngineState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PipelineError::InvalidState {
                state: self.state,
                operation,
            })
        }
    }

    fn transition(&mut self, next: EngineState) {
        debug_assert!(self.state.can_transition(next), "{} -> {next}", self.state);
        debug!(from = %self.state, to = %next, "engine transition");
        self.state = next;
    }

    fn fail(&mut self, error: PipelineError) -> PipelineError {
        warn!(state = %self.state, %error, "engine failed");
        self.state = EngineState::Failed;
        error
    }

    fn ready_model(&self) -> Result<&DiagnosticModel<B>> {
        self.model.as_ref().ok_or(PipelineError::InvalidState {
            state: self.state,
            operation: "use the model",
        })
    }

    /// Build the model and load `weights`, or keep random weights for `None`.
    ///
    /// Under the lenient policy an unreadable checkpoint is logged and the
    /// model keeps its random initialization. Under the strict policy it is
    /// an error, as is any key mismatch. A failed load leaves the engine
    /// uninitialized.
    ///
    /// # Errors
    ///
    /// Fails for an invalid config, an unsupported backbone or a strict load
    /// failure.
    pub fn load_weights(&mut self, weights: Option<&Path>) -> Result<Option<LoadReport>> {
        self.require(EngineState::Uninitialized, "load weights")?;
        let mut model = DiagnosticModel::new(&self.config, &self.device)?;

        let report = match weights {
            None => {
                info!("no checkpoint given, using random initialization");
                None
            }
            Some(path) => {
                self.check_metadata(path)?;
                match read_checkpoint(path) {
                    Ok(checkpoint) => {
                        info!(
                            path = %path.display(),
                            layout = ?checkpoint.layout,
                            tensors = checkpoint.tensors.len(),
                            "checkpoint read"
                        );
                        Some(model.load_state_dict(&checkpoint.tensors, self.policy())?)
                    }
                    Err(err) if self.policy() == LoadPolicy::Lenient => {
                        warn!(path = %path.display(), error = %err, "checkpoint unreadable, using random initialization");
                        None
                    }
                    Err(err) => return Err(ModelError::from(err).into()),
                }
            }
        };

        self.install(model, report.clone());
        Ok(report)
    }

    /// Compare the checkpoint's side-file, if any, with the configured
    /// backbone. Problems are errors under the strict policy and warnings
    /// otherwise.
    fn check_metadata(&self, weights: &Path) -> Result<()> {
        let checked = CheckpointMetadata::find(weights).and_then(|metadata| match metadata {
            Some(metadata) => {
                debug!(backbone = %metadata.backbone, seed = ?metadata.seed, "checkpoint metadata");
                metadata.check_backbone(&self.config.backbone)
            }
            None => Ok(()),
        });
        match checked {
            Ok(()) => Ok(()),
            Err(err) if self.policy() == LoadPolicy::Lenient => {
                warn!(path = %weights.display(), error = %err, "checkpoint metadata ignored");
                Ok(())
            }
            Err(err) => Err(ModelError::from(err).into()),
        }
    }

    /// Build the model and load an in-memory state dict.
    ///
    /// # Errors
    ///
    /// Fails for an invalid config or a strict load failure.
    pub fn load_state(&mut self, state: &StateDict) -> Result<LoadReport> {
        self.require(EngineState::Uninitialized, "load weights")?;
        let mut model = DiagnosticModel::new(&self.config, &self.device)?;
        let report = model.load_state_dict(state, self.policy())?;
        self.install(model, Some(report.clone()));
        Ok(report)
    }

    fn install(&mut self, model: DiagnosticModel<B>, report: Option<LoadReport>) {
        self.model = Some(model);
        self.load_report = report;
        self.transition(EngineState::WeightsLoaded);
    }

    /// Run the model once on a random normal input.
    ///
    /// The logits must have shape `[1, num_classes]` and be finite. On
    /// failure the engine becomes [`EngineState::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::SmokeTestFailed`].
    pub fn validate(&mut self) -> Result<()> {
        self.require(EngineState::WeightsLoaded, "validate")?;
        match self.smoke_test() {
            Ok(()) => {
                self.transition(EngineState::Validated);
                self.transition(EngineState::Ready);
                info!(backbone = %self.config.backbone, "engine ready");
                Ok(())
            }
            Err(error) => Err(self.fail(error)),
        }
    }

    fn smoke_test(&self) -> Result<()> {
        let model = self.ready_model()?;
        let size = self.config.input_size;
        let x = Tensor::<B, 4>::random(
            [1, 3, size, size],
            Distribution::Normal(0.0, 1.0),
            &self.device,
        );

        let logits = model.forward_logits(x);
        let dims = logits.dims();
        if dims != [1, model.num_classes()] {
            return Err(PipelineError::SmokeTestFailed(format!(
                "expected logits [1, {}], got {dims:?}",
                model.num_classes()
            )));
        }
        let values: Vec<f32> = logits.into_data().iter::<f32>().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::SmokeTestFailed(
                "non-finite logits".to_string(),
            ));
        }
        debug!(?values, "smoke test logits");
        Ok(())
    }

    fn begin_request(&self, operation: &'static str, dims: [usize; 4]) -> Result<()> {
        if !self.state.accepts_requests() {
            return Err(PipelineError::InvalidState {
                state: self.state,
                operation,
            });
        }
        let expected = ImageShape::single(self.config.input_size);
        expected.check(&dims).map_err(|_| PipelineError::InvalidInput {
            expected: format!("{:?}", expected.dims()),
            got: format!("{dims:?}"),
        })
    }

    fn run_prediction(&self, image: Tensor<B, 4>) -> Result<DiagnosisPredictions> {
        let model = self.ready_model()?;
        let probabilities: Vec<f32> = model.forward_probs(image).into_data().iter::<f32>().collect();
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(PipelineError::ForwardFailed(
                "non-finite probabilities".to_string(),
            ));
        }
        Ok(DiagnosisPredictions::from_probabilities(
            &probabilities,
            self.config.confidence_threshold,
            self.config.top_k,
        )?)
    }

    /// Predict one preprocessed `[1, 3, S, S]` image without explanations.
    ///
    /// # Errors
    ///
    /// Refused unless the engine accepts requests. A wrong input shape is
    /// rejected without a state change; a forward failure fails the engine.
    pub fn predict(&mut self, image: Tensor<B, 4>) -> Result<DiagnosisPredictions> {
        self.begin_request("predict", image.dims())?;
        self.transition(EngineState::Predicting);

        match self.run_prediction(image) {
            Ok(predictions) => {
                self.transition(EngineState::Ready);
                Ok(predictions)
            }
            Err(error) => Err(self.fail(error)),
        }
    }

    /// Predict, explain and package one preprocessed `[1, 3, S, S]` image.
    ///
    /// Grad-CAM runs for every above-threshold disease and, separately, for
    /// every top-K disease; one attention map is extracted. A failed
    /// explanation is recorded in the report and does not stop the others.
    ///
    /// # Errors
    ///
    /// Same as [`DiagnosisEngine::predict`].
    pub fn diagnose(&mut self, image: Tensor<B, 4>) -> Result<DiagnosisReport> {
        self.begin_request("diagnose", image.dims())?;
        let display = to_display_image(image.clone())?;
        self.transition(EngineState::Predicting);

        let diagnosis = match self.run_prediction(image.clone()) {
            Ok(predictions) => predictions,
            Err(error) => return Err(self.fail(error)),
        };
        info!(
            predicted = diagnosis.predicted_diseases.len(),
            threshold = self.config.confidence_threshold,
            "prediction complete"
        );

        self.transition(EngineState::Explaining);
        let explanations = match self.explain(image, &display, &diagnosis) {
            Ok(explanations) => explanations,
            Err(error) => return Err(self.fail(error)),
        };
        self.transition(EngineState::Complete);

        Ok(DiagnosisReport {
            diagnosis,
            threshold: self.config.confidence_threshold,
            gradcam: explanations.gradcam,
            gradcam_top5: explanations.gradcam_top5,
            attention: explanations.attention,
            explanation_errors: explanations.errors,
            ground_truth: None,
            load_report: self.load_report.clone(),
        })
    }

    /// Load, preprocess and diagnose an image file.
    ///
    /// # Errors
    ///
    /// Fails if the image cannot be read, and as [`DiagnosisEngine::diagnose`].
    pub fn diagnose_file(&mut self, path: impl AsRef<Path>) -> Result<DiagnosisReport> {
        let preprocessor = Preprocessor::new(self.config.input_size as u32);
        let image = preprocessor.load::<B>(path, &self.device)?;
        self.diagnose(image)
    }

    fn explain(
        &self,
        image: Tensor<B, 4>,
        display: &RgbImage,
        diagnosis: &DiagnosisPredictions,
    ) -> Result<Explanations> {
        let model = self.ready_model()?;
        let gradcam = GradCam::with_config(
            model,
            GradCamConfig::default().with_output_size(self.config.input_size),
        );
        let mut explanations = Explanations {
            gradcam: Vec::new(),
            gradcam_top5: Vec::new(),
            attention: None,
            errors: Vec::new(),
        };

        let predicted = diagnosis.predicted_diseases.iter().map(|p| (p, None));
        let ranked = diagnosis
            .top_5_diseases
            .iter()
            .enumerate()
            .map(|(i, p)| (p, Some(i + 1)));

        for (prediction, rank) in predicted.chain(ranked) {
            let rendered = gradcam
                .explain(image.clone(), Some(prediction.index))
                .and_then(|result| Saliency::render(display, result.heatmap));
            match rendered {
                Ok(saliency) => {
                    let explanation = DiseaseExplanation {
                        disease: prediction.disease,
                        confidence: prediction.confidence,
                        rank,
                        png: saliency.png,
                    };
                    if rank.is_some() {
                        explanations.gradcam_top5.push(explanation);
                    } else {
                        explanations.gradcam.push(explanation);
                    }
                }
                Err(error) => {
                    explanations
                        .errors
                        .push(failure(Some(prediction.disease), rank, &error));
                }
            }
        }

        let attention = AttentionExtractor::new(model)
            .extract(image)
            .and_then(|map| Ok((attention_panel(display, &map)?, map)));
        match attention {
            Ok((png, map)) => {
                explanations.attention = Some(AttentionExplanation {
                    grid: map.to_rows(),
                    png,
                });
            }
            Err(error) => explanations.errors.push(failure(None, None, &error)),
        }

        debug!(
            gradcam = explanations.gradcam.len(),
            top = explanations.gradcam_top5.len(),
            failures = explanations.errors.len(),
            "explanations rendered"
        );
        Ok(explanations)
    }
}

fn failure(
    disease: Option<Disease>,
    rank: Option<usize>,
    error: &cxr_explain::ExplainError,
) -> ExplanationFailure {
    warn!(disease = ?disease, rank = ?rank, %error, "explanation failed");
    ExplanationFailure {
        disease,
        rank,
        kind: ErrorKind::Explanation,
        message: error.to_string(),
    }
}

/// Run the whole chain for one image file.
///
/// Builds an engine from `config` with `threshold`, loads `weights` (random
/// initialization for `None`), validates, diagnoses and, when `output_dir`
/// is given, writes the artifacts there.
///
/// # Errors
///
/// Fails at the first failing stage.
pub fn diagnose_image_with<B: AutodiffBackend>(
    config: EngineConfig,
    device: B::Device,
    image: impl AsRef<Path>,
    weights: Option<&Path>,
    output_dir: Option<&Path>,
    threshold: f32,
) -> Result<DiagnosisReport> {
    let mut engine = DiagnosisEngine::<B>::new(config, device);
    engine.set_threshold(threshold)?;
    engine.initialize(weights)?;

    let report = engine.diagnose_file(image)?;
    if let Some(dir) = output_dir {
        report.persist(dir)?;
    }
    Ok(report)
}

/// [`diagnose_image_with`] on the CPU backend with the default config.
///
/// # Errors
///
/// Fails at the first failing stage.
#[cfg(feature = "backend-ndarray")]
pub fn diagnose_image(
    image: impl AsRef<Path>,
    weights: Option<&Path>,
    output_dir: Option<&Path>,
    threshold: f32,
) -> Result<DiagnosisReport> {
    diagnose_image_with::<cxr_core::backend::ExplainBackend>(
        EngineConfig::default(),
        Default::default(),
        image,
        weights,
        output_dir,
        threshold,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxr_core::backend::ExplainBackend;
    use cxr_models::write_checkpoint;
    use cxr_models::ContainerLayout;
    use tempfile::TempDir;

    type TestBackend = ExplainBackend;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::new("resnet50")
            .compact(16, 1)
            .with_hidden_dim(16)
            .with_bank_size(8);
        config.input_size = 64;
        config
    }

    fn engine() -> DiagnosisEngine<TestBackend> {
        DiagnosisEngine::new(config(), Default::default())
    }

    fn zeros() -> Tensor<TestBackend, 4> {
        Tensor::zeros([1, 3, 64, 64], &Default::default())
    }

    #[test]
    fn test_lifecycle() {
        let mut engine = engine();
        assert_eq!(engine.state(), EngineState::Uninitialized);

        assert!(engine.load_weights(None).unwrap().is_none());
        assert_eq!(engine.state(), EngineState::WeightsLoaded);

        engine.validate().unwrap();
        assert_eq!(engine.state(), EngineState::Ready);

        engine.predict(zeros()).unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_requests_refused_before_ready() {
        let mut engine = engine();
        let err = engine.predict(zeros()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidState { state: EngineState::Uninitialized, .. }
        ));

        engine.load_weights(None).unwrap();
        let err = engine.diagnose(zeros()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);

        let err = engine.load_weights(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[test]
    fn test_zero_input_predictions() {
        let mut engine = engine();
        engine.initialize(None).unwrap();

        let predictions = engine.predict(zeros()).unwrap();
        assert_eq!(predictions.raw_probabilities.len(), 14);
        assert!(predictions
            .raw_probabilities
            .iter()
            .all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(predictions.top_5_diseases.len(), 5);
        assert!(predictions
            .predicted_diseases
            .iter()
            .all(|p| p.confidence >= 0.4));
    }

    #[test]
    fn test_wrong_shape_keeps_engine_ready() {
        let mut engine = engine();
        engine.initialize(None).unwrap();

        let err = engine
            .predict(Tensor::zeros([2, 3, 64, 64], &Default::default()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Inference);
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_diagnose_explains_every_disease() {
        let mut engine = engine();
        engine.initialize(None).unwrap();
        // Everything is above a zero threshold.
        engine.set_threshold(0.0).unwrap();

        let report = engine.diagnose(zeros()).unwrap();
        assert_eq!(engine.state(), EngineState::Complete);
        assert_eq!(report.diagnosis.predicted_diseases.len(), 14);
        assert!(report.explanation_errors.is_empty());
        assert_eq!(report.gradcam.len(), 14);
        assert_eq!(report.gradcam_top5.len(), 5);
        assert!(report.gradcam.iter().all(|e| e.rank.is_none()));
        let ranks: Vec<usize> = report.gradcam_top5.iter().filter_map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);

        let attention = report.attention.unwrap();
        assert_eq!(attention.grid.len(), 2);
        assert!(attention.png.starts_with(&[0x89, b'P', b'N', b'G']));

        // Complete accepts the next request.
        engine.predict(zeros()).unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn test_smoke_test_failure_is_terminal() {
        let source: DiagnosticModel<TestBackend> =
            DiagnosticModel::new(&config(), &Default::default()).unwrap();
        let mut state = source.state_dict();
        for (name, tensor) in state.iter_mut() {
            if name.starts_with("classifier.") {
                tensor.values.iter_mut().for_each(|v| *v = f32::NAN);
            }
        }

        let mut engine = engine();
        engine.load_state(&state).unwrap();
        let err = engine.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SmokeTest);
        assert_eq!(engine.state(), EngineState::Failed);

        let err = engine.predict(zeros()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidState { state: EngineState::Failed, .. }
        ));
    }

    #[test]
    fn test_invalid_threshold_is_rejected() {
        let mut engine = engine();
        let err = engine.set_threshold(1.5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(engine.config().confidence_threshold, 0.4);
    }

    #[test]
    fn test_unsupported_backbone() {
        let mut engine: DiagnosisEngine<TestBackend> =
            DiagnosisEngine::new(EngineConfig::new("vgg16"), Default::default());
        let err = engine.initialize(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[test]
    fn test_foreign_class_count_is_a_configuration_error() {
        let mut config = config();
        config.num_classes = 13;
        let mut engine: DiagnosisEngine<TestBackend> = DiagnosisEngine::new(config, Default::default());

        let err = engine.initialize(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(engine.model().is_none());
    }

    #[test]
    fn test_checkpoint_loading() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights.mpk");

        let source: DiagnosticModel<TestBackend> =
            DiagnosticModel::new(&config().with_seed(9), &Default::default()).unwrap();
        write_checkpoint(&source.state_dict(), &path, ContainerLayout::ModelStateDict).unwrap();

        let mut engine = engine();
        engine.initialize(Some(&path)).unwrap();
        let report = engine.load_report().unwrap();
        assert!(report.is_clean());
        assert_eq!(engine.model().unwrap().state_dict(), source.state_dict());
    }

    #[test]
    fn test_metadata_backbone_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weights.mpk");
        let source: DiagnosticModel<TestBackend> =
            DiagnosticModel::new(&config(), &Default::default()).unwrap();
        write_checkpoint(&source.state_dict(), &path, ContainerLayout::Raw).unwrap();
        CheckpointMetadata::from_config(&EngineConfig::new("densenet121"))
            .save(CheckpointMetadata::path_for(&path))
            .unwrap();

        let mut strict: DiagnosisEngine<TestBackend> =
            DiagnosisEngine::new(config().with_strict_loading(true), Default::default());
        let err = strict.initialize(Some(&path)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Checkpoint);
        assert!(err.to_string().contains("densenet121"));
        assert_eq!(strict.state(), EngineState::Uninitialized);

        // The tensors themselves fit, so a lenient load is clean.
        let mut lenient = engine();
        lenient.initialize(Some(&path)).unwrap();
        assert!(lenient.load_report().unwrap().is_clean());
    }

    #[test]
    fn test_unreadable_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.mpk");
        std::fs::write(&path, b"not a checkpoint").unwrap();

        let mut lenient = engine();
        lenient.initialize(Some(&path)).unwrap();
        assert!(lenient.load_report().is_none());
        assert_eq!(lenient.state(), EngineState::Ready);

        let mut strict: DiagnosisEngine<TestBackend> =
            DiagnosisEngine::new(config().with_strict_loading(true), Default::default());
        let err = strict.initialize(Some(&path)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Checkpoint);
        assert_eq!(strict.state(), EngineState::Uninitialized);
    }
}
