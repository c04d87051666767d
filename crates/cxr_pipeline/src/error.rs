//! Error types for cxr_pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::EngineState;

/// Result type alias using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by the diagnosis engine.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The operation is not allowed in the engine's current state.
    #[error("Cannot {operation} while the engine is {state}")]
    InvalidState {
        /// Current state.
        state: EngineState,
        /// Refused operation.
        operation: &'static str,
    },

    /// The synthetic inference check after loading failed.
    #[error("Inference smoke test failed: {0}")]
    SmokeTestFailed(String),

    /// The forward pass produced unusable output.
    #[error("Forward pass failed: {0}")]
    ForwardFailed(String),

    /// Input tensor has the wrong shape.
    #[error("Invalid input: expected {expected}, got {got}")]
    InvalidInput {
        /// Expected dims.
        expected: String,
        /// Actual dims.
        got: String,
    },

    /// Model construction or checkpoint loading failed.
    #[error("Model error: {0}")]
    Model(#[from] cxr_models::ModelError),

    /// Explanation failed outside of per-disease isolation.
    #[error("Explanation error: {0}")]
    Explain(#[from] cxr_explain::ExplainError),

    /// Post-processing failed.
    #[error("Analysis error: {0}")]
    Analysis(#[from] cxr_analysis::AnalysisError),

    /// Image loading failed.
    #[error("Data error: {0}")]
    Data(#[from] cxr_data::DataError),

    /// I/O error while persisting artifacts.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Report serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Coarse category of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid configuration or unsupported backbone.
    Configuration,
    /// Checkpoint could not be read or matched.
    Checkpoint,
    /// Smoke test failure.
    SmokeTest,
    /// Bad input or forward failure.
    Inference,
    /// Explanation failure.
    Explanation,
    /// Operation refused by the state machine.
    State,
    /// Filesystem, image decoding or serialization.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::SmokeTest => "smoke_test",
            ErrorKind::Inference => "inference",
            ErrorKind::Explanation => "explanation",
            ErrorKind::State => "state",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

impl PipelineError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        use cxr_models::ModelError;

        match self {
            PipelineError::InvalidState { .. } => ErrorKind::State,
            PipelineError::SmokeTestFailed(_) => ErrorKind::SmokeTest,
            PipelineError::ForwardFailed(_) | PipelineError::InvalidInput { .. } => {
                ErrorKind::Inference
            }
            PipelineError::Model(ModelError::Checkpoint(_)) => ErrorKind::Checkpoint,
            PipelineError::Model(ModelError::InvalidInput { .. }) => ErrorKind::Inference,
            PipelineError::Model(_) => ErrorKind::Configuration,
            PipelineError::Explain(_) => ErrorKind::Explanation,
            PipelineError::Analysis(_) => ErrorKind::Inference,
            PipelineError::Data(_)
            | PipelineError::IoError(_)
            | PipelineError::SerializationError(_) => ErrorKind::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let err = PipelineError::SmokeTestFailed("NaN logits".to_string());
        assert_eq!(err.kind(), ErrorKind::SmokeTest);

        let err = PipelineError::Model(cxr_models::ModelError::UnsupportedBackbone("vgg16".into()));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = PipelineError::InvalidState {
            state: EngineState::Failed,
            operation: "predict",
        };
        assert_eq!(err.kind(), ErrorKind::State);
        assert_eq!(err.to_string(), "Cannot predict while the engine is failed");
    }
}
