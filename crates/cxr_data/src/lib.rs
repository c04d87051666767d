//! # cxr_data
//!
//! Radiograph preprocessing and NIH ChestX-ray14 sample loading for cxr-rs.
//!
//! This crate provides:
//! - [`Preprocessor`] turning image files into normalized `[1, 3, 224, 224]` tensors
//! - [`to_display_image`] to undo normalization for overlays
//! - [`nih::NihDataset`] for metadata parsing, image lookup and diverse sampling
//!   (feature `polars-io`, on by default)
//!
//! ## Example
//!
//! ```rust,ignore
//! use cxr_core::backend::NdArray;
//! use cxr_data::Preprocessor;
//!
//! let device = Default::default();
//! let x = Preprocessor::default().load::<NdArray>("chest.png", &device)?;
//! assert_eq!(x.dims(), [1, 3, 224, 224]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
#[cfg(feature = "polars-io")]
pub mod nih;
mod preprocess;

pub use error::{DataError, Result};
#[cfg(feature = "polars-io")]
pub use nih::{NihDataset, NihRecord, NihSample};
pub use preprocess::{to_display_image, Preprocessor, IMAGENET_MEAN, IMAGENET_STD};
