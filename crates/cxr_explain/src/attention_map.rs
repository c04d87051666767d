//! Spatial attention extraction.

use burn::prelude::*;
use cxr_models::{DiagnosticModel, TapPoint};

use crate::attribution::{AttributionMap, AttributionMethod};
use crate::capture::{CaptureRequest, CaptureSession};
use crate::error::Result;

/// Reads the spatial attention gate of the first image, at feature-map
/// resolution (7×7 for 224×224 input), without resizing.
pub struct AttentionExtractor<'a, B: Backend> {
    model: &'a DiagnosticModel<B>,
}

impl<'a, B: Backend> AttentionExtractor<'a, B> {
    /// Extractor borrowing `model`.
    pub fn new(model: &'a DiagnosticModel<B>) -> Self {
        Self { model }
    }

    /// Run one inference pass and return the raw attention grid.
    ///
    /// # Errors
    ///
    /// Fails for a malformed input.
    pub fn extract(&self, image: Tensor<B, 4>) -> Result<AttributionMap> {
        self.model.check_input(image.dims())?;

        let mut session =
            CaptureSession::new().capture(TapPoint::SpatialAttention, CaptureRequest::Activation);
        self.model.forward_with_hooks(image, &mut session);

        let attention = session.activation(TapPoint::SpatialAttention)?.clone();
        let [_, _, height, width] = attention.dims();
        let grid = attention
            .slice([0..1, 0..1, 0..height, 0..width])
            .reshape([height, width]);
        Ok(AttributionMap::from_tensor(grid, AttributionMethod::Attention))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxr_core::backend::NdArray;
    use cxr_core::EngineConfig;

    #[test]
    fn test_attention_grid_at_feature_resolution() {
        let config = EngineConfig::new("efficientnet_b0").compact(16, 1).with_hidden_dim(16);
        let model: DiagnosticModel<NdArray> =
            DiagnosticModel::new(&config, &Default::default()).unwrap();

        let x = Tensor::zeros([1, 3, 224, 224], &Default::default());
        let map = AttentionExtractor::new(&model).extract(x).unwrap();

        assert_eq!(map.shape(), [7, 7]);
        assert_eq!(map.method, AttributionMethod::Attention);
        assert!(map.values().iter().all(|v| *v > 0.0 && *v < 1.0));
    }

    #[test]
    fn test_rejects_grayscale_input() {
        let config = EngineConfig::new("densenet121").compact(16, 1).with_hidden_dim(16);
        let model: DiagnosticModel<NdArray> =
            DiagnosticModel::new(&config, &Default::default()).unwrap();

        let x = Tensor::zeros([1, 1, 64, 64], &Default::default());
        assert!(AttentionExtractor::new(&model).extract(x).is_err());
    }
}
