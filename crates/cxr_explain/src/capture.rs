//! Activation and gradient capture.
//!
//! A [`CaptureSession`] is handed to
//! [`DiagnosticModel::forward_with_hooks`](cxr_models::DiagnosticModel::forward_with_hooks)
//! for exactly one pass. It records the outputs of the requested tap points
//! and, where gradients are requested, re-roots the pass at that output so
//! backpropagation stops there and leaves a readable gradient.

use std::collections::BTreeMap;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use cxr_models::{ForwardHook, TapPoint};
use tracing::debug;

use crate::error::{ExplainError, Result};

/// Captured activations by tap point.
#[derive(Debug, Clone)]
pub struct ActivationCapture<B: Backend> {
    activations: BTreeMap<TapPoint, Tensor<B, 4>>,
}

impl<B: Backend> ActivationCapture<B> {
    /// Create an empty capture.
    pub fn new() -> Self {
        Self {
            activations: BTreeMap::new(),
        }
    }

    /// Store an activation.
    pub fn store(&mut self, point: TapPoint, activation: Tensor<B, 4>) {
        self.activations.insert(point, activation);
    }

    /// Get an activation.
    pub fn get(&self, point: TapPoint) -> Option<&Tensor<B, 4>> {
        self.activations.get(&point)
    }

    /// Tap points with a stored activation.
    pub fn points(&self) -> Vec<TapPoint> {
        self.activations.keys().copied().collect()
    }

    /// Whether nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Clear all stored activations.
    pub fn clear(&mut self) {
        self.activations.clear();
    }
}

impl<B: Backend> Default for ActivationCapture<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Gradients read back after backpropagation, by tap point.
#[derive(Debug, Clone)]
pub struct GradientCapture<B: Backend> {
    gradients: BTreeMap<TapPoint, Tensor<B, 4>>,
}

impl<B: Backend> GradientCapture<B> {
    /// Create an empty capture.
    pub fn new() -> Self {
        Self {
            gradients: BTreeMap::new(),
        }
    }

    /// Store a gradient.
    pub fn store(&mut self, point: TapPoint, gradient: Tensor<B, 4>) {
        self.gradients.insert(point, gradient);
    }

    /// Get a gradient.
    pub fn get(&self, point: TapPoint) -> Option<&Tensor<B, 4>> {
        self.gradients.get(&point)
    }

    /// Tap points with a stored gradient.
    pub fn points(&self) -> Vec<TapPoint> {
        self.gradients.keys().copied().collect()
    }
}

impl<B: Backend> Default for GradientCapture<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a session records at a tap point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRequest {
    /// Forward output only.
    Activation,
    /// Forward output, plus its gradient after backpropagation.
    ActivationAndGradient,
}

/// Hook recording tap point outputs during a single forward pass.
///
/// Everything the session captured is released when it is dropped.
#[derive(Debug)]
pub struct CaptureSession<B: Backend> {
    requests: BTreeMap<TapPoint, CaptureRequest>,
    activations: ActivationCapture<B>,
    repeated: Option<TapPoint>,
}

impl<B: Backend> CaptureSession<B> {
    /// Open a session with no requests.
    pub fn new() -> Self {
        Self {
            requests: BTreeMap::new(),
            activations: ActivationCapture::new(),
            repeated: None,
        }
    }

    /// Record the output at `point`.
    #[must_use]
    pub fn capture(mut self, point: TapPoint, request: CaptureRequest) -> Self {
        self.requests.insert(point, request);
        self
    }

    /// The activation recorded at `point`.
    ///
    /// For gradient requests this is the re-rooted tensor the rest of the
    /// pass was built on.
    ///
    /// # Errors
    ///
    /// Fails if the session saw a second pass or nothing was recorded.
    pub fn activation(&self, point: TapPoint) -> Result<&Tensor<B, 4>> {
        if let Some(repeated) = self.repeated {
            return Err(ExplainError::SessionReused(repeated));
        }
        self.activations
            .get(point)
            .ok_or(ExplainError::MissingCapture(point))
    }

    /// Captured activations.
    pub fn activations(&self) -> &ActivationCapture<B> {
        &self.activations
    }
}

impl<B: AutodiffBackend> CaptureSession<B> {
    /// Gradient of the backpropagated value with respect to the output at
    /// `point`.
    ///
    /// # Errors
    ///
    /// Fails if `point` was not captured with a gradient request, or if the
    /// gradient did not reach it.
    pub fn gradient(
        &self,
        point: TapPoint,
        grads: &B::Gradients,
    ) -> Result<Tensor<B::InnerBackend, 4>> {
        if self.requests.get(&point) != Some(&CaptureRequest::ActivationAndGradient) {
            return Err(ExplainError::MissingGradient(point));
        }
        self.activation(point)?
            .grad(grads)
            .ok_or(ExplainError::MissingGradient(point))
    }

    /// Gradients at every point captured with a gradient request.
    ///
    /// # Errors
    ///
    /// Fails if any requested gradient is unavailable.
    pub fn gradients(&self, grads: &B::Gradients) -> Result<GradientCapture<B::InnerBackend>> {
        let mut capture = GradientCapture::new();
        for (point, request) in &self.requests {
            if *request == CaptureRequest::ActivationAndGradient {
                capture.store(*point, self.gradient(*point, grads)?);
            }
        }
        Ok(capture)
    }
}

impl<B: Backend> Default for CaptureSession<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> ForwardHook<B> for CaptureSession<B> {
    fn on_output(&mut self, point: TapPoint, output: Tensor<B, 4>) -> Tensor<B, 4> {
        let Some(request) = self.requests.get(&point).copied() else {
            return output;
        };
        if self.activations.get(point).is_some() {
            self.repeated.get_or_insert(point);
            return output;
        }

        match request {
            CaptureRequest::Activation => {
                self.activations.store(point, output.clone().detach());
                output
            }
            CaptureRequest::ActivationAndGradient => {
                let rooted = output.detach().require_grad();
                self.activations.store(point, rooted.clone());
                rooted
            }
        }
    }
}

impl<B: Backend> Drop for CaptureSession<B> {
    fn drop(&mut self) {
        if !self.activations.is_empty() {
            debug!(points = ?self.activations.points(), "capture session closed");
        }
        self.activations.clear();
        self.requests.clear();
    }
}
