//! Forward hooks.
//!
//! Instead of registering callbacks on layers, the diagnostic model routes
//! the output of each tap point through a caller-supplied [`ForwardHook`].
//! A hook lives only as long as the call it was passed to, so no
//! registration can outlive a pass.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Intermediate outputs exposed to hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapPoint {
    /// Backbone trunk output, the final block's input.
    Backbone,
    /// Final block output; the feature map explained by Grad-CAM.
    FinalBlock,
    /// Spatial attention map `[batch, 1, H, W]`.
    SpatialAttention,
}

impl TapPoint {
    /// Identifier used in logs and capture maps.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            TapPoint::Backbone => "backbone",
            TapPoint::FinalBlock => "final_block",
            TapPoint::SpatialAttention => "spatial_attention",
        }
    }
}

impl std::fmt::Display for TapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Observer of tap point outputs during one forward pass.
pub trait ForwardHook<B: Backend> {
    /// Receives the output at `point` and returns the tensor the network
    /// continues with.
    ///
    /// Returning the input unchanged leaves the pass untouched. A hook may
    /// return a re-rooted copy (detached, gradient-tracked) to read the
    /// gradient at this point after backpropagation.
    fn on_output(&mut self, point: TapPoint, output: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Hook that observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<B: Backend> ForwardHook<B> for NoHooks {
    fn on_output(&mut self, _point: TapPoint, output: Tensor<B, 4>) -> Tensor<B, 4> {
        output
    }
}
