//! Grad-CAM for the diagnostic model.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use cxr_models::{DiagnosticModel, TapPoint};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attribution::{grad_cam, AttributionMap, AttributionMethod};
use crate::capture::{CaptureRequest, CaptureSession};
use crate::error::{ExplainError, Result};

/// Configuration for [`GradCam`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradCamConfig {
    /// Feature map the heatmap is computed on.
    pub target: TapPoint,
    /// Side of the square output heatmap.
    pub output_size: usize,
}

impl Default for GradCamConfig {
    fn default() -> Self {
        Self {
            target: TapPoint::FinalBlock,
            output_size: 224,
        }
    }
}

impl GradCamConfig {
    /// Set the target feature map.
    ///
    /// # Errors
    ///
    /// Only the backbone and final block outputs are feature maps.
    pub fn with_target(mut self, target: TapPoint) -> Result<Self> {
        match target {
            TapPoint::Backbone | TapPoint::FinalBlock => {
                self.target = target;
                Ok(self)
            }
            TapPoint::SpatialAttention => Err(ExplainError::InvalidTarget(target)),
        }
    }

    /// Set the output side length.
    #[must_use]
    pub fn with_output_size(mut self, size: usize) -> Self {
        self.output_size = size;
        self
    }
}

/// One Grad-CAM explanation.
#[derive(Debug, Clone)]
pub struct GradCamResult {
    /// Heatmap normalized to `[0, 1]`, `output_size × output_size`.
    pub heatmap: AttributionMap,
    /// Explained class.
    pub class_index: usize,
    /// Logit of the explained class.
    pub score: f32,
}

/// Grad-CAM extractor borrowing a model.
///
/// Each call to [`GradCam::explain`] opens its own capture session, so calls
/// are independent of one another.
pub struct GradCam<'a, B: AutodiffBackend> {
    model: &'a DiagnosticModel<B>,
    config: GradCamConfig,
}

impl<'a, B: AutodiffBackend> GradCam<'a, B> {
    /// Extractor targeting the final block with 224×224 output.
    pub fn new(model: &'a DiagnosticModel<B>) -> Self {
        Self::with_config(model, GradCamConfig::default())
    }

    /// Extractor with an explicit config.
    pub fn with_config(model: &'a DiagnosticModel<B>, config: GradCamConfig) -> Self {
        Self { model, config }
    }

    /// The extractor's config.
    pub fn config(&self) -> &GradCamConfig {
        &self.config
    }

    /// Explain `class`, or the highest-scoring class of the first image when
    /// `None`.
    ///
    /// Only the first image of the batch is explained.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::InvalidClass`] for an out-of-range class and
    /// [`ExplainError::Model`] for a malformed input.
    pub fn explain(&self, image: Tensor<B, 4>, class: Option<usize>) -> Result<GradCamResult> {
        self.model.check_input(image.dims())?;
        let target = self.config.target;

        let mut session =
            CaptureSession::new().capture(target, CaptureRequest::ActivationAndGradient);
        let logits = self.model.forward_with_hooks(image, &mut session).logits;

        let [_, num_classes] = logits.dims();
        let first_row: Vec<f32> = logits
            .clone()
            .slice([0..1, 0..num_classes])
            .into_data()
            .iter::<f32>()
            .collect();
        let class_index = class.unwrap_or_else(|| argmax(&first_row));
        if class_index >= num_classes {
            return Err(ExplainError::InvalidClass {
                index: class_index,
                num_classes,
            });
        }

        let score = logits.slice([0..1, class_index..class_index + 1]).sum();
        let grads = score.backward();

        let activation = session.activation(target)?.clone().inner();
        let gradient = session.gradient(target, &grads)?;
        let [_, channels, height, width] = activation.dims();

        let cam = grad_cam(
            activation.slice([0..1, 0..channels, 0..height, 0..width]),
            gradient.slice([0..1, 0..channels, 0..height, 0..width]),
        );
        let size = self.config.output_size;
        let cam = interpolate(
            cam,
            [size, size],
            InterpolateOptions::new(InterpolateMode::Bilinear),
        );

        let heatmap = AttributionMap::from_tensor(cam.reshape([size, size]), AttributionMethod::GradCam)
            .with_target_class(class_index)
            .normalize();
        debug!(class_index, %target, feature_hw = ?[height, width], "grad-cam computed");

        Ok(GradCamResult {
            heatmap,
            class_index,
            score: first_row[class_index],
        })
    }
}

/// Index of the first maximum.
fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_value), (i, v)| {
            if *v > best_value {
                (i, *v)
            } else {
                (best, best_value)
            }
        })
        .0
}
