//! Error types for cxr_analysis.

use thiserror::Error;

/// Result type alias using [`AnalysisError`].
pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Errors raised by post-processing.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Probability vector does not cover the vocabulary.
    #[error("Expected {expected} probabilities, got {got}")]
    InvalidLength {
        /// Vocabulary size.
        expected: usize,
        /// Provided length.
        got: usize,
    },
}
