//! # cxr_core
//!
//! Core types and traits for the cxr-rs chest radiograph diagnostic engine.
//!
//! This crate provides:
//! - [`Disease`] and the fixed 14-label vocabulary the classifier predicts
//! - [`EngineConfig`] with the model and post-processing hyperparameters
//! - [`ForwardMode`] to select training or inference behaviour explicitly
//! - [`ImageShape`] for radiograph tensor shape metadata
//! - [`Seed`] for deterministic random number generation
//! - Error types and common utilities
//!
//! ## Shape Convention
//!
//! Image batches follow the convention `(B, C, H, W)`:
//! - `B`: Batch size (number of radiographs)
//! - `C`: Channels (3, RGB)
//! - `H`, `W`: Spatial size (224 × 224 for inference)
//!
//! ## Example
//!
//! ```rust,ignore
//! use cxr_core::{Disease, EngineConfig, ImageShape};
//!
//! let config = EngineConfig::default();
//! let shape = ImageShape::single(config.input_size);
//! assert_eq!(Disease::ALL.len(), 14);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod error;
mod labels;
mod mode;
mod model_trait;
mod seed;
mod shape;

pub use config::EngineConfig;
pub use error::{CoreError, Result};
pub use labels::{Disease, NO_FINDING, NUM_CLASSES};
pub use mode::ForwardMode;
pub use model_trait::MultiLabelClassifier;
pub use seed::Seed;
pub use shape::ImageShape;

/// Backend type aliases for convenience
pub mod backend {
    pub use burn_autodiff::Autodiff;

    #[cfg(feature = "backend-ndarray")]
    pub use burn_ndarray::NdArray;

    #[cfg(feature = "backend-wgpu")]
    pub use burn_wgpu::Wgpu;

    /// Autodiff-enabled CPU backend used for explanation passes.
    #[cfg(feature = "backend-ndarray")]
    pub type ExplainBackend = Autodiff<NdArray>;
}
