//! Model trait definitions.

use burn::prelude::*;

/// A multi-label image classifier producing one independent logit per class.
///
/// Implementations run in inference mode: no internal state is mutated.
pub trait MultiLabelClassifier<B: Backend> {
    /// Forward pass returning raw logits.
    ///
    /// # Arguments
    ///
    /// * `x` - Input images of shape `(B, 3, H, W)`
    ///
    /// # Returns
    ///
    /// Logits of shape `(B, num_classes)`.
    fn forward_logits(&self, x: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Forward pass returning independent per-class probabilities.
    fn forward_probs(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        burn::tensor::activation::sigmoid(self.forward_logits(x))
    }

    /// Number of output classes.
    fn num_classes(&self) -> usize;
}
