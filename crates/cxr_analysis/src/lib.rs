//! # cxr_analysis
//!
//! Post-processing and evaluation for cxr-rs.
//!
//! This crate provides:
//! - Thresholded predictions and a stable top-K ranking
//! - Comparison of predictions with NIH ground-truth label strings
//! - Per-disease precision, recall and F1 over many radiographs

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod comparison;
mod error;
mod metrics;
mod prediction;

pub use comparison::{parse_ground_truth, GroundTruthComparison};
pub use error::{AnalysisError, Result};
pub use metrics::{BinaryCounts, MultiLabelMetrics};
pub use prediction::{
    threshold_predictions, top_k_predictions, DiagnosisPredictions, Prediction,
};
