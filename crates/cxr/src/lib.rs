//! # cxr
//!
//! Explainable chest radiograph diagnosis in Rust.
//!
//! cxr-rs classifies a frontal chest X-ray into the 14 findings of the
//! ChestX-ray14 vocabulary and explains its decisions:
//!
//! - **Model**: CNN backbone, momentum shadow of the final block, spatial
//!   attention, a rare-feature memory bank and a multi-label head
//! - **Checkpoints**: MessagePack or JSON state dicts with wrapper prefix
//!   stripping and a structured load report
//! - **Explainability**: Grad-CAM per disease and the raw attention map
//! - **Analysis**: thresholding, top-K ranking, ground-truth comparison
//! - **Pipeline**: a diagnosis engine that validates, predicts, explains and
//!   writes artifacts
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cxr::prelude::*;
//!
//! let mut engine = DiagnosisEngine::<ExplainBackend>::new(EngineConfig::default(), Default::default());
//! engine.initialize(Some("weights.mpk".as_ref()))?;
//!
//! let report = engine.diagnose_file("chest.png")?.with_ground_truth("Cardiomegaly|Effusion");
//! for p in &report.diagnosis.predicted_diseases {
//!     println!("{}: {:.3}", p.disease, p.confidence);
//! }
//! report.persist("out/")?;
//! ```
//!
//! ## Feature Flags
//!
//! - `backend-ndarray` (default): CPU backend using ndarray
//! - `backend-wgpu`: GPU backend using WGPU

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub use cxr_analysis as analysis;
pub use cxr_core as core;
pub use cxr_data as data;
pub use cxr_explain as explain;
pub use cxr_models as models;
pub use cxr_pipeline as pipeline;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use cxr::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use cxr_core::{Disease, EngineConfig, ForwardMode, ImageShape, MultiLabelClassifier, Seed};
    #[cfg(feature = "backend-ndarray")]
    pub use cxr_core::backend::{ExplainBackend, NdArray};

    // Models
    pub use cxr_models::{
        read_checkpoint, write_checkpoint, BackboneKind, DiagnosticModel, LoadPolicy, LoadReport,
    };

    // Explain
    pub use cxr_explain::{AttentionExtractor, AttributionMap, GradCam, Saliency};

    // Analysis
    pub use cxr_analysis::{DiagnosisPredictions, GroundTruthComparison, Prediction};

    // Data
    #[cfg(feature = "polars-io")]
    pub use cxr_data::NihDataset;
    pub use cxr_data::Preprocessor;

    // Pipeline
    #[cfg(feature = "backend-ndarray")]
    pub use cxr_pipeline::diagnose_image;
    pub use cxr_pipeline::{DiagnosisEngine, DiagnosisReport, EngineState, PipelineError};
}
