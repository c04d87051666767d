//! Multi-scale spatial attention.

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use serde::{Deserialize, Serialize};

use crate::state::{join, NamedState, StateMapper, StateVisitor};

/// Minimum width of each attention branch.
const MIN_BRANCH_CHANNELS: usize = 8;

/// Configuration for [`SpatialAttention`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialAttentionConfig {
    /// Channels of the gated feature map.
    pub in_channels: usize,
    /// Channel reduction of each branch.
    pub reduction: usize,
}

impl SpatialAttentionConfig {
    /// Create a new config.
    pub fn new(in_channels: usize, reduction: usize) -> Self {
        Self {
            in_channels,
            reduction,
        }
    }

    /// Width of each of the three branches.
    pub fn branch_channels(&self) -> usize {
        (self.in_channels / self.reduction.max(1)).max(MIN_BRANCH_CHANNELS)
    }

    /// Initialize the module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> SpatialAttention<B> {
        let reduced = self.branch_channels();
        let branch = |kernel: usize| {
            let pad = kernel / 2;
            Conv2dConfig::new([self.in_channels, reduced], [kernel, kernel])
                .with_padding(PaddingConfig2d::Explicit(pad, pad))
                .init(device)
        };

        SpatialAttention {
            conv1: branch(1),
            conv3: branch(3),
            conv5: branch(5),
            project: Conv2dConfig::new([reduced * 3, 1], [1, 1]).init(device),
        }
    }
}

/// Single-channel gate over a feature map.
///
/// Three parallel convolutions (1×1, 3×3, 5×5) see the input at different
/// receptive fields; their concatenation is projected to one channel and
/// squashed into (0, 1).
#[derive(Module, Debug)]
pub struct SpatialAttention<B: Backend> {
    conv1: Conv2d<B>,
    conv3: Conv2d<B>,
    conv5: Conv2d<B>,
    project: Conv2d<B>,
}

impl<B: Backend> SpatialAttention<B> {
    /// Attention map of shape `[batch, 1, H, W]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let features = Tensor::cat(
            vec![
                self.conv1.forward(x.clone()),
                self.conv3.forward(x.clone()),
                self.conv5.forward(x),
            ],
            1,
        );
        sigmoid(self.project.forward(features))
    }
}

impl<B: Backend> NamedState<B> for SpatialAttention<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.conv1.visit_state(&join(prefix, "conv1"), visitor);
        self.conv3.visit_state(&join(prefix, "conv3"), visitor);
        self.conv5.visit_state(&join(prefix, "conv5"), visitor);
        self.project
            .visit_state(&join(prefix, "spatial_att.0"), visitor);
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        Self {
            conv1: self.conv1.map_state(&join(prefix, "conv1"), mapper),
            conv3: self.conv3.map_state(&join(prefix, "conv3"), mapper),
            conv5: self.conv5.map_state(&join(prefix, "conv5"), mapper),
            project: self.project.map_state(&join(prefix, "spatial_att.0"), mapper),
        }
    }
}
