//! Building blocks shared by the backbone adapters.

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid, silu};
use cxr_core::ForwardMode;

use crate::state::{join, NamedState, StateMapper, StateVisitor};

/// Batch normalization honouring an explicit forward mode.
///
/// Burn selects batch statistics whenever the backend tracks gradients.
/// Explanation passes differentiate through the network yet must use the
/// running statistics, so [`ForwardMode::Eval`] normalizes with them directly.
pub fn batch_norm<B: Backend, const D: usize, const DI: usize>(
    bn: &BatchNorm<B, D>,
    x: Tensor<B, DI>,
    mode: ForwardMode,
) -> Tensor<B, DI> {
    if mode.is_train() {
        return bn.forward(x);
    }

    let device = x.device();
    let channels = x.dims()[1];
    let mut shape = [1; DI];
    shape[1] = channels;

    let mean = bn.running_mean.value().to_device(&device).reshape(shape);
    let std = bn
        .running_var
        .value()
        .to_device(&device)
        .add_scalar(bn.epsilon)
        .sqrt()
        .reshape(shape);

    x.sub(mean)
        .div(std)
        .mul(bn.gamma.val().reshape(shape))
        .add(bn.beta.val().reshape(shape))
}

/// Activation following a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// No activation.
    Identity,
    /// Rectified linear unit.
    Relu,
    /// Sigmoid-weighted linear unit.
    Silu,
    /// Logistic sigmoid.
    Sigmoid,
}

impl Activation {
    /// Apply the activation.
    pub fn apply<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Identity => x,
            Activation::Relu => relu(x),
            Activation::Silu => silu(x),
            Activation::Sigmoid => sigmoid(x),
        }
    }
}

/// Convolution followed by batch normalization, stored as `0` and `1`.
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBn<B> {
    /// Bias-free `k × k` convolution with same-style padding.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let pad = kernel / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(pad, pad))
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        let bn = BatchNormConfig::new(out_channels).init(device);
        Self { conv, bn }
    }

    /// Forward pass without activation.
    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        batch_norm(&self.bn, self.conv.forward(x), mode)
    }

    /// Output channels.
    pub fn out_channels(&self) -> usize {
        self.conv.weight.dims()[0]
    }
}

impl<B: Backend> NamedState<B> for ConvBn<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.conv.visit_state(&join(prefix, "0"), visitor);
        self.bn.visit_state(&join(prefix, "1"), visitor);
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        Self {
            conv: self.conv.map_state(&join(prefix, "0"), mapper),
            bn: self.bn.map_state(&join(prefix, "1"), mapper),
        }
    }
}

/// Scale a channel width by a divisor, never below `floor`.
pub fn scaled(channels: usize, divisor: usize, floor: usize) -> usize {
    (channels / divisor.max(1)).max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::module::RunningState;
    use cxr_core::backend::{Autodiff, NdArray};

    #[test]
    fn test_eval_batch_norm_uses_running_stats_under_autodiff() {
        type B = Autodiff<NdArray>;
        let device = Default::default();
        let mut bn: BatchNorm<B, 0> = BatchNormConfig::new(2).init(&device);
        bn.running_mean = RunningState::new(Tensor::from_floats([1.0, -1.0], &device));
        bn.running_var = RunningState::new(Tensor::from_floats([4.0, 1.0], &device));

        let x = Tensor::<B, 2>::from_floats([[3.0, 0.0], [5.0, 1.0]], &device);
        let out = batch_norm(&bn, x, ForwardMode::Eval);
        let values: Vec<f32> = out.into_data().iter::<f32>().collect();

        let expected = [1.0, 1.0, 2.0, 2.0];
        for (v, e) in values.iter().zip(expected) {
            assert!((v - e).abs() < 1e-3, "{v} vs {e}");
        }
    }

    #[test]
    fn test_conv_bn_shapes() {
        let device = Default::default();
        let block: ConvBn<NdArray> = ConvBn::new(4, 8, 3, 2, 1, &device);
        let out = block.forward(Tensor::zeros([1, 4, 16, 16], &device), ForwardMode::Eval);
        assert_eq!(out.dims(), [1, 8, 8, 8]);
        assert_eq!(block.out_channels(), 8);
    }

    #[test]
    fn test_scaled_width() {
        assert_eq!(scaled(64, 1, 8), 64);
        assert_eq!(scaled(64, 16, 8), 8);
        assert_eq!(scaled(32, 16, 8), 8);
    }
}
