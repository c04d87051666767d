//! DenseNet-121 adapter.
//!
//! All feature stages up to `denseblock4` form the backbone; the final
//! batch norm (`norm5`) alone is the final block.

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::module::{avg_pool2d, max_pool2d};
use cxr_core::ForwardMode;

use crate::layers::{batch_norm, scaled};
use crate::state::{join, NamedState, StateMapper, StateVisitor};

const BLOCK_DEPTHS: [usize; 4] = [6, 12, 24, 16];
const BN_SIZE: usize = 4;

/// Channel plan of a DenseNet-121.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenseNetPlan {
    /// Stem output channels.
    pub init_features: usize,
    /// Channels added by each dense layer.
    pub growth: usize,
    /// Layers per dense block.
    pub depths: [usize; 4],
}

impl DenseNetPlan {
    /// Plan a DenseNet-121 with widths divided by `divisor`.
    pub fn new(divisor: usize, max_depth: Option<usize>) -> Self {
        Self {
            init_features: scaled(64, divisor, 8),
            growth: scaled(32, divisor, 2),
            depths: BLOCK_DEPTHS.map(|d| max_depth.map_or(d, |m| d.min(m))),
        }
    }

    /// Channels after each dense block, before its transition.
    fn block_outputs(&self) -> [usize; 4] {
        let mut outputs = [0; 4];
        let mut channels = self.init_features;
        for (i, depth) in self.depths.iter().enumerate() {
            channels += depth * self.growth;
            outputs[i] = channels;
            channels /= 2;
        }
        outputs
    }

    /// Channels of the final feature map.
    pub fn feature_dim(&self) -> usize {
        self.block_outputs()[3]
    }
}

/// Bottlenecked dense layer producing `growth` new channels.
#[derive(Module, Debug)]
pub struct DenseLayer<B: Backend> {
    norm1: BatchNorm<B, 2>,
    conv1: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
}

impl<B: Backend> DenseLayer<B> {
    fn new(in_channels: usize, growth: usize, device: &B::Device) -> Self {
        let inner = BN_SIZE * growth;
        Self {
            norm1: BatchNormConfig::new(in_channels).init(device),
            conv1: Conv2dConfig::new([in_channels, inner], [1, 1])
                .with_bias(false)
                .init(device),
            norm2: BatchNormConfig::new(inner).init(device),
            conv2: Conv2dConfig::new([inner, growth], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        let out = self.conv1.forward(relu(batch_norm(&self.norm1, x, mode)));
        self.conv2.forward(relu(batch_norm(&self.norm2, out, mode)))
    }
}

impl<B: Backend> NamedState<B> for DenseLayer<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.norm1.visit_state(&join(prefix, "norm1"), visitor);
        self.conv1.visit_state(&join(prefix, "conv1"), visitor);
        self.norm2.visit_state(&join(prefix, "norm2"), visitor);
        self.conv2.visit_state(&join(prefix, "conv2"), visitor);
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        Self {
            norm1: self.norm1.map_state(&join(prefix, "norm1"), mapper),
            conv1: self.conv1.map_state(&join(prefix, "conv1"), mapper),
            norm2: self.norm2.map_state(&join(prefix, "norm2"), mapper),
            conv2: self.conv2.map_state(&join(prefix, "conv2"), mapper),
        }
    }
}

/// Dense block: every layer sees the concatenation of all previous outputs.
#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    layers: Vec<DenseLayer<B>>,
}

impl<B: Backend> DenseBlock<B> {
    fn new(in_channels: usize, depth: usize, growth: usize, device: &B::Device) -> Self {
        let layers = (0..depth)
            .map(|i| DenseLayer::new(in_channels + i * growth, growth, device))
            .collect();
        Self { layers }
    }

    fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        self.layers.iter().fold(x, |features, layer| {
            let new = layer.forward(features.clone(), mode);
            Tensor::cat(vec![features, new], 1)
        })
    }
}

impl<B: Backend> NamedState<B> for DenseBlock<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.visit_state(&join(prefix, &format!("denselayer{}", i + 1)), visitor);
        }
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        let layers = self
            .layers
            .into_iter()
            .enumerate()
            .map(|(i, layer)| layer.map_state(&join(prefix, &format!("denselayer{}", i + 1)), mapper))
            .collect();
        Self { layers }
    }
}

/// Halves channels and spatial size between dense blocks.
#[derive(Module, Debug)]
pub struct Transition<B: Backend> {
    norm: BatchNorm<B, 2>,
    conv: Conv2d<B>,
}

impl<B: Backend> Transition<B> {
    fn new(in_channels: usize, device: &B::Device) -> Self {
        Self {
            norm: BatchNormConfig::new(in_channels).init(device),
            conv: Conv2dConfig::new([in_channels, in_channels / 2], [1, 1])
                .with_bias(false)
                .init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        let out = self.conv.forward(relu(batch_norm(&self.norm, x, mode)));
        avg_pool2d(out, [2, 2], [2, 2], [0, 0], true)
    }
}

impl<B: Backend> NamedState<B> for Transition<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.norm.visit_state(&join(prefix, "norm"), visitor);
        self.conv.visit_state(&join(prefix, "conv"), visitor);
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        Self {
            norm: self.norm.map_state(&join(prefix, "norm"), mapper),
            conv: self.conv.map_state(&join(prefix, "conv"), mapper),
        }
    }
}

/// Stem, four dense blocks and three transitions.
///
/// Sequential indices: `0` conv0, `1` norm0, then blocks at 4, 6, 8, 10 and
/// transitions at 5, 7, 9.
#[derive(Module, Debug)]
pub struct DenseNetTrunk<B: Backend> {
    conv0: Conv2d<B>,
    norm0: BatchNorm<B, 2>,
    blocks: Vec<DenseBlock<B>>,
    transitions: Vec<Transition<B>>,
}

impl<B: Backend> DenseNetTrunk<B> {
    /// Create the trunk from a plan.
    pub fn new(plan: &DenseNetPlan, device: &B::Device) -> Self {
        let conv0 = Conv2dConfig::new([3, plan.init_features], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);

        let mut blocks = Vec::with_capacity(4);
        let mut transitions = Vec::with_capacity(3);
        let mut channels = plan.init_features;
        for (i, depth) in plan.depths.iter().enumerate() {
            blocks.push(DenseBlock::new(channels, *depth, plan.growth, device));
            channels += depth * plan.growth;
            if i < 3 {
                transitions.push(Transition::new(channels, device));
                channels /= 2;
            }
        }

        Self {
            conv0,
            norm0: BatchNormConfig::new(plan.init_features).init(device),
            blocks,
            transitions,
        }
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        let x = relu(batch_norm(&self.norm0, self.conv0.forward(x), mode));
        let mut x = max_pool2d(x, [3, 3], [2, 2], [1, 1], [1, 1]);
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(x, mode);
            if let Some(transition) = self.transitions.get(i) {
                x = transition.forward(x, mode);
            }
        }
        x
    }
}

impl<B: Backend> NamedState<B> for DenseNetTrunk<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.conv0.visit_state(&join(prefix, "0"), visitor);
        self.norm0.visit_state(&join(prefix, "1"), visitor);
        for (i, block) in self.blocks.iter().enumerate() {
            block.visit_state(&join(prefix, &(4 + 2 * i).to_string()), visitor);
        }
        for (i, transition) in self.transitions.iter().enumerate() {
            transition.visit_state(&join(prefix, &(5 + 2 * i).to_string()), visitor);
        }
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(i, block)| block.map_state(&join(prefix, &(4 + 2 * i).to_string()), mapper))
            .collect();
        let transitions = self
            .transitions
            .into_iter()
            .enumerate()
            .map(|(i, t)| t.map_state(&join(prefix, &(5 + 2 * i).to_string()), mapper))
            .collect();
        Self {
            conv0: self.conv0.map_state(&join(prefix, "0"), mapper),
            norm0: self.norm0.map_state(&join(prefix, "1"), mapper),
            blocks,
            transitions,
        }
    }
}

/// The final block of DenseNet-121: a single batch norm.
#[derive(Module, Debug)]
pub struct DenseNetNorm<B: Backend> {
    norm5: BatchNorm<B, 2>,
}

impl<B: Backend> DenseNetNorm<B> {
    /// Create the final norm from a plan.
    pub fn new(plan: &DenseNetPlan, device: &B::Device) -> Self {
        Self {
            norm5: BatchNormConfig::new(plan.feature_dim()).init(device),
        }
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        batch_norm(&self.norm5, x, mode)
    }
}

impl<B: Backend> NamedState<B> for DenseNetNorm<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.norm5.visit_state(&join(prefix, "0"), visitor);
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        Self {
            norm5: self.norm5.map_state(&join(prefix, "0"), mapper),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::collect_state;
    use cxr_core::backend::NdArray;

    #[test]
    fn test_full_plan_dims() {
        let plan = DenseNetPlan::new(1, None);
        assert_eq!(plan.feature_dim(), 1024);
    }

    #[test]
    fn test_compact_forward_shapes() {
        let device = Default::default();
        let plan = DenseNetPlan::new(16, Some(1));
        let trunk: DenseNetTrunk<NdArray> = DenseNetTrunk::new(&plan, &device);
        let norm: DenseNetNorm<NdArray> = DenseNetNorm::new(&plan, &device);

        let out = trunk.forward(Tensor::zeros([1, 3, 64, 64], &device), ForwardMode::Eval);
        assert_eq!(out.dims(), [1, plan.feature_dim(), 2, 2]);
        let out = norm.forward(out, ForwardMode::Eval);
        assert_eq!(out.dims(), [1, plan.feature_dim(), 2, 2]);
    }

    #[test]
    fn test_names() {
        let device = Default::default();
        let plan = DenseNetPlan::new(16, Some(1));
        let trunk: DenseNetTrunk<NdArray> = DenseNetTrunk::new(&plan, &device);
        let state = collect_state(&trunk, "backbone");

        assert!(state.contains_key("backbone.4.denselayer1.norm1.weight"));
        assert!(state.contains_key("backbone.5.conv.weight"));
        assert!(state.contains_key("backbone.10.denselayer1.conv2.weight"));
    }
}
