//! # cxr_pipeline
//!
//! Diagnosis orchestration for cxr-rs.
//!
//! [`DiagnosisEngine`] loads weights, validates the model with a synthetic
//! forward pass and then serves requests: predict, explain every reported
//! disease with Grad-CAM, extract the attention map, and package everything
//! into a [`DiagnosisReport`] that can be written to disk.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cxr_core::{backend::ExplainBackend, EngineConfig};
//! use cxr_pipeline::DiagnosisEngine;
//!
//! let mut engine = DiagnosisEngine::<ExplainBackend>::new(EngineConfig::default(), Default::default());
//! engine.initialize(Some("weights.mpk".as_ref()))?;
//! let report = engine.diagnose_file("chest.png")?;
//! report.persist("out/")?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod engine;
mod error;
pub mod report;
mod state;

#[cfg(feature = "backend-ndarray")]
pub use engine::diagnose_image;
pub use engine::{diagnose_image_with, DiagnosisEngine};
pub use error::{ErrorKind, PipelineError, Result};
pub use report::{AttentionExplanation, DiagnosisReport, DiseaseExplanation, ExplanationFailure};
pub use state::EngineState;
