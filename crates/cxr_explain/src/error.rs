//! Error types for cxr_explain.

use cxr_models::{ModelError, TapPoint};
use thiserror::Error;

/// Result type alias using [`ExplainError`].
pub type Result<T> = std::result::Result<T, ExplainError>;

/// Errors raised while producing or rendering an explanation.
#[derive(Error, Debug)]
pub enum ExplainError {
    /// Requested class index is outside the logit range.
    #[error("Invalid class index {index} (model has {num_classes} classes)")]
    InvalidClass {
        /// Requested index.
        index: usize,
        /// Number of logits.
        num_classes: usize,
    },

    /// Grad-CAM cannot target this tap point.
    #[error("Tap point {0} cannot be used as a Grad-CAM target")]
    InvalidTarget(TapPoint),

    /// No output was recorded at a requested tap point.
    #[error("Nothing captured at {0}")]
    MissingCapture(TapPoint),

    /// Backpropagation did not reach a requested tap point.
    #[error("No gradient reached {0}")]
    MissingGradient(TapPoint),

    /// A capture session observed more than one forward pass.
    #[error("Capture session at {0} observed more than one forward pass")]
    SessionReused(TapPoint),

    /// Image composition or PNG encoding failed.
    #[error("Rendering failed: {0}")]
    Render(String),

    /// The model rejected the input.
    #[error(transparent)]
    Model(#[from] ModelError),
}
