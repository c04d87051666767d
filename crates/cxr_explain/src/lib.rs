//! # cxr_explain
//!
//! Explainability tools for cxr-rs: scoped activation/gradient capture,
//! Grad-CAM, attention maps and their rendering.
//!
//! This crate provides:
//! - [`CaptureSession`], a forward hook valid for exactly one pass
//! - [`GradCam`] heatmaps on the final block (or backbone) output
//! - [`AttentionExtractor`] for the raw spatial attention grid
//! - Jet colouring, overlays and PNG panels in [`render`]

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod attention_map;
mod attribution;
mod capture;
mod error;
mod gradcam;
pub mod render;

pub use attention_map::AttentionExtractor;
pub use attribution::{grad_cam, AttributionMap, AttributionMethod};
pub use capture::{ActivationCapture, CaptureRequest, CaptureSession, GradientCapture};
pub use error::{ExplainError, Result};
pub use gradcam::{GradCam, GradCamConfig, GradCamResult};
pub use render::Saliency;
