//! Error types for cxr_models.

use thiserror::Error;

use crate::checkpoint::CheckpointError;

/// Result type alias using [`ModelError`].
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while building or running the diagnostic model.
#[derive(Error, Debug)]
pub enum ModelError {
    /// The configured backbone identifier is not one of the supported set.
    #[error("Unsupported backbone: {0} (expected resnet50, densenet121, efficientnet_b0 or efficientnet_b1)")]
    UnsupportedBackbone(String),

    /// Input tensor has the wrong dimensions.
    #[error("Invalid input shape: expected {expected}, got {got}")]
    InvalidInput {
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        got: String,
    },

    /// Checkpoint error.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Core error (configuration validation).
    #[error(transparent)]
    Core(#[from] cxr_core::CoreError),
}
