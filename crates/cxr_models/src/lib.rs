//! # cxr_models
//!
//! The diagnostic network for cxr-rs and everything needed to run and
//! restore it.
//!
//! ## Components
//! - [`Backbone`] / [`FinalBlock`] - ResNet-50, DenseNet-121 and
//!   EfficientNet-B0/B1 split into a trunk and a final block
//! - [`MomentumShadow`] - gradient-free moving average of the final block
//! - [`SpatialAttention`] - multi-scale single-channel attention gate
//! - [`MemoryBank`] - ring of pooled feature vectors with cosine retrieval
//! - [`ClassifierHead`] - per-disease logits from the fused vector
//! - [`DiagnosticModel`] - one forward pass through all of the above
//!
//! ## Checkpoints
//!
//! Tensors are addressed by dotted name through [`NamedState`]. The
//! [`checkpoint`] module reads the common container layouts, strips wrapper
//! prefixes and reports missing, unexpected and mis-shaped keys.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cxr_core::EngineConfig;
//! use cxr_models::{checkpoint::{read_checkpoint, LoadPolicy}, DiagnosticModel};
//!
//! let mut model = DiagnosticModel::<B>::new(&EngineConfig::default(), &device)?;
//! let checkpoint = read_checkpoint("weights.mpk")?;
//! model.load_state_dict(&checkpoint.tensors, LoadPolicy::Lenient)?;
//! let logits = model.forward(images).logits;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attention;
pub mod backbone;
pub mod checkpoint;
mod error;
pub mod head;
pub mod hooks;
pub mod layers;
pub mod memory_bank;
pub mod model;
pub mod momentum;
pub mod state;

pub use attention::{SpatialAttention, SpatialAttentionConfig};
pub use backbone::{Backbone, BackboneConfig, BackboneKind, FinalBlock};
pub use checkpoint::{
    read_checkpoint, write_checkpoint, Checkpoint, CheckpointError, CheckpointFormat,
    CheckpointMetadata, ContainerLayout, LoadPolicy, LoadReport, StateDict, StoredTensor,
};
pub use error::{ModelError, Result};
pub use head::{ClassifierHead, ClassifierHeadConfig};
pub use hooks::{ForwardHook, NoHooks, TapPoint};
pub use memory_bank::{rarity_scores, MemoryBank};
pub use model::{DiagnosticModel, ForwardOutput};
pub use momentum::MomentumShadow;
pub use state::{collect_state, NamedState, StateEntry, StateKind};
