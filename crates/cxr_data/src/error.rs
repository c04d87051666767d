//! Error types for cxr_data.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using [`DataError`].
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors that can occur in data operations.
#[derive(Error, Debug)]
pub enum DataError {
    /// Image could not be decoded.
    #[error("Image error: {0}")]
    Image(String),

    /// Tensor has the wrong shape for an image.
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// Metadata file is malformed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// A required file does not exist.
    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Core error.
    #[error("Core error: {0}")]
    CoreError(#[from] cxr_core::CoreError),
}
