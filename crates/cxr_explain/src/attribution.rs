//! Attribution map computation.

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Method that produced an attribution map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributionMethod {
    /// Gradient-weighted Class Activation Mapping.
    GradCam,
    /// Spatial attention gate.
    Attention,
}

/// A 2-D attribution map in host memory, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionMap {
    values: Vec<f32>,
    height: usize,
    width: usize,
    /// The method used.
    pub method: AttributionMethod,
    /// Target class (for Grad-CAM).
    pub target_class: Option<usize>,
}

impl AttributionMap {
    /// Create a map from row-major values.
    ///
    /// # Panics
    ///
    /// Panics if `values.len() != height * width`.
    pub fn new(values: Vec<f32>, [height, width]: [usize; 2], method: AttributionMethod) -> Self {
        assert_eq!(values.len(), height * width, "attribution map size mismatch");
        Self {
            values,
            height,
            width,
            method,
            target_class: None,
        }
    }

    /// Copy a `[H, W]` tensor to the host.
    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 2>, method: AttributionMethod) -> Self {
        let [height, width] = tensor.dims();
        Self::new(tensor.into_data().iter::<f32>().collect(), [height, width], method)
    }

    /// Set the target class.
    #[must_use]
    pub fn with_target_class(mut self, class: usize) -> Self {
        self.target_class = Some(class);
        self
    }

    /// `[height, width]`.
    pub fn shape(&self) -> [usize; 2] {
        [self.height, self.width]
    }

    /// Row-major values.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Value at `(row, col)`.
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        (row < self.height && col < self.width).then(|| self.values[row * self.width + col])
    }

    /// Rows as nested vectors, for JSON output.
    pub fn to_rows(&self) -> Vec<Vec<f32>> {
        self.values
            .chunks(self.width.max(1))
            .map(<[f32]>::to_vec)
            .collect()
    }

    /// Smallest value.
    pub fn min(&self) -> f32 {
        self.values.iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// Largest value.
    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// Shift to a zero minimum, then scale to a unit maximum.
    ///
    /// A constant map becomes all zeros.
    #[must_use]
    pub fn normalize(&self) -> Self {
        let min = self.min();
        let shifted: Vec<f32> = self.values.iter().map(|v| v - min).collect();
        let max = shifted.iter().copied().fold(0.0_f32, f32::max);

        let values = if max > 0.0 {
            shifted.into_iter().map(|v| v / max).collect()
        } else {
            debug!(method = ?self.method, class = ?self.target_class, "degenerate heatmap");
            vec![0.0; shifted.len()]
        };

        Self {
            values,
            ..self.clone()
        }
    }

    /// Whether every value is zero.
    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }
}

/// Grad-CAM over a batch of feature maps.
///
/// # Arguments
///
/// * `activations` - Feature maps `(batch, channels, H, W)`
/// * `gradients` - Gradients with respect to `activations`, same shape
///
/// # Returns
///
/// `ReLU(Σ_c w_c · A_c)` of shape `(batch, 1, H, W)`, where `w_c` is the
/// spatial mean of the gradient of channel `c`.
pub fn grad_cam<B: Backend>(activations: Tensor<B, 4>, gradients: Tensor<B, 4>) -> Tensor<B, 4> {
    let shape = activations.dims();
    let weights = gradients.mean_dim(3).mean_dim(2);
    let weighted = activations * weights.expand(shape);
    weighted.sum_dim(1).clamp_min(0.0)
}
