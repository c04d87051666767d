//! EfficientNet-B0/B1 adapter.
//!
//! The stem and the seven MBConv stages form the backbone; the closing
//! 1×1 conv-norm-SiLU projection to the head width is the final block.

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, silu};
use burn::tensor::module::adaptive_avg_pool2d;
use cxr_core::ForwardMode;

use crate::layers::{scaled, Activation, ConvBn};
use crate::state::{join, NamedState, StateMapper, StateVisitor};

/// (expand ratio, kernel, stride, out channels, B0 depth) per stage.
const STAGES: [(usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 16, 1),
    (6, 3, 2, 24, 2),
    (6, 5, 2, 40, 2),
    (6, 3, 2, 80, 3),
    (6, 5, 1, 112, 3),
    (6, 5, 2, 192, 4),
    (6, 3, 1, 320, 1),
];

const STEM_CHANNELS: usize = 32;
const HEAD_CHANNELS: usize = 1280;

/// Layout of one MBConv stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePlan {
    /// Expansion ratio of the inverted bottleneck.
    pub expand: usize,
    /// Depthwise kernel size.
    pub kernel: usize,
    /// Stride of the first block.
    pub stride: usize,
    /// Output channels.
    pub out_channels: usize,
    /// Number of blocks.
    pub depth: usize,
}

/// Channel and depth plan of an EfficientNet variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EfficientNetPlan {
    /// Stem output channels.
    pub stem: usize,
    /// Stage layouts.
    pub stages: Vec<StagePlan>,
    /// Final block output channels.
    pub head: usize,
}

impl EfficientNetPlan {
    /// Plan a variant with the given depth multiplier.
    pub fn new(depth_mult: f64, divisor: usize, max_depth: Option<usize>) -> Self {
        let stages = STAGES
            .iter()
            .map(|&(expand, kernel, stride, out, depth)| {
                let depth = (depth as f64 * depth_mult).ceil() as usize;
                StagePlan {
                    expand,
                    kernel,
                    stride,
                    out_channels: scaled(out, divisor, 4),
                    depth: max_depth.map_or(depth, |m| depth.min(m)),
                }
            })
            .collect();
        Self {
            stem: scaled(STEM_CHANNELS, divisor, 4),
            stages,
            head: scaled(HEAD_CHANNELS, divisor, 8),
        }
    }

    /// EfficientNet-B0.
    pub fn b0(divisor: usize, max_depth: Option<usize>) -> Self {
        Self::new(1.0, divisor, max_depth)
    }

    /// EfficientNet-B1.
    pub fn b1(divisor: usize, max_depth: Option<usize>) -> Self {
        Self::new(1.1, divisor, max_depth)
    }

    /// Channels entering the final block.
    pub fn final_in_channels(&self) -> usize {
        self.stages
            .last()
            .map_or(self.stem, |stage| stage.out_channels)
    }

    /// Channels leaving the final block.
    pub fn feature_dim(&self) -> usize {
        self.head
    }
}

/// Inverted residual block with squeeze-and-excitation.
#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    se_reduce: Conv2d<B>,
    se_expand: Conv2d<B>,
    project: ConvBn<B>,
    residual: bool,
}

impl<B: Backend> MbConv<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let squeeze = (in_channels / 4).max(1);
        let expand =
            (expand_ratio != 1).then(|| ConvBn::new(in_channels, hidden, 1, 1, 1, device));

        Self {
            expand,
            depthwise: ConvBn::new(hidden, hidden, kernel, stride, hidden, device),
            se_reduce: Conv2dConfig::new([hidden, squeeze], [1, 1]).init(device),
            se_expand: Conv2dConfig::new([squeeze, hidden], [1, 1]).init(device),
            project: ConvBn::new(hidden, out_channels, 1, 1, 1, device),
            residual: stride == 1 && in_channels == out_channels,
        }
    }

    fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        let mut out = x.clone();
        if let Some(expand) = &self.expand {
            out = silu(expand.forward(out, mode));
        }
        out = silu(self.depthwise.forward(out, mode));

        let scale = adaptive_avg_pool2d(out.clone(), [1, 1]);
        let scale = silu(self.se_reduce.forward(scale));
        let scale = sigmoid(self.se_expand.forward(scale));
        out = out * scale;

        out = self.project.forward(out, mode);
        if self.residual {
            out = out + x;
        }
        out
    }

    fn offset(&self) -> usize {
        usize::from(self.expand.is_some())
    }
}

impl<B: Backend> NamedState<B> for MbConv<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        let block = join(prefix, "block");
        let o = self.offset();
        self.expand.visit_state(&join(&block, "0"), visitor);
        self.depthwise.visit_state(&join(&block, &o.to_string()), visitor);
        let se = join(&block, &(o + 1).to_string());
        self.se_reduce.visit_state(&join(&se, "fc1"), visitor);
        self.se_expand.visit_state(&join(&se, "fc2"), visitor);
        self.project
            .visit_state(&join(&block, &(o + 2).to_string()), visitor);
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        let block = join(prefix, "block");
        let o = self.offset();
        let se = join(&block, &(o + 1).to_string());
        Self {
            expand: self.expand.map_state(&join(&block, "0"), mapper),
            depthwise: self.depthwise.map_state(&join(&block, &o.to_string()), mapper),
            se_reduce: self.se_reduce.map_state(&join(&se, "fc1"), mapper),
            se_expand: self.se_expand.map_state(&join(&se, "fc2"), mapper),
            project: self
                .project
                .map_state(&join(&block, &(o + 2).to_string()), mapper),
            residual: self.residual,
        }
    }
}

/// Stem and MBConv stages (`features[0..=7]`).
#[derive(Module, Debug)]
pub struct EfficientNetTrunk<B: Backend> {
    stem: ConvBn<B>,
    stages: Vec<Vec<MbConv<B>>>,
}

impl<B: Backend> EfficientNetTrunk<B> {
    /// Create the trunk from a plan.
    pub fn new(plan: &EfficientNetPlan, device: &B::Device) -> Self {
        let stem = ConvBn::new(3, plan.stem, 3, 2, 1, device);
        let mut channels = plan.stem;
        let mut stages = Vec::with_capacity(plan.stages.len());
        for stage in &plan.stages {
            let mut blocks = Vec::with_capacity(stage.depth);
            for i in 0..stage.depth {
                let stride = if i == 0 { stage.stride } else { 1 };
                blocks.push(MbConv::new(
                    channels,
                    stage.out_channels,
                    stage.expand,
                    stage.kernel,
                    stride,
                    device,
                ));
                channels = stage.out_channels;
            }
            stages.push(blocks);
        }
        Self { stem, stages }
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        let x = Activation::Silu.apply(self.stem.forward(x, mode));
        self.stages
            .iter()
            .flatten()
            .fold(x, |out, block| block.forward(out, mode))
    }
}

impl<B: Backend> NamedState<B> for EfficientNetTrunk<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.stem.visit_state(&join(prefix, "0"), visitor);
        for (i, stage) in self.stages.iter().enumerate() {
            stage.visit_state(&join(prefix, &(i + 1).to_string()), visitor);
        }
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        let stages = self
            .stages
            .into_iter()
            .enumerate()
            .map(|(i, stage)| stage.map_state(&join(prefix, &(i + 1).to_string()), mapper))
            .collect();
        Self {
            stem: self.stem.map_state(&join(prefix, "0"), mapper),
            stages,
        }
    }
}

/// Final 1×1 conv-norm-SiLU projection (`features[8]`).
#[derive(Module, Debug)]
pub struct EfficientNetHead<B: Backend> {
    conv: ConvBn<B>,
}

impl<B: Backend> EfficientNetHead<B> {
    /// Create the final projection from a plan.
    pub fn new(plan: &EfficientNetPlan, device: &B::Device) -> Self {
        Self {
            conv: ConvBn::new(plan.final_in_channels(), plan.head, 1, 1, 1, device),
        }
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        silu(self.conv.forward(x, mode))
    }
}

impl<B: Backend> NamedState<B> for EfficientNetHead<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.conv.visit_state(&join(prefix, "0"), visitor);
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        Self {
            conv: self.conv.map_state(&join(prefix, "0"), mapper),
        }
    }
}
