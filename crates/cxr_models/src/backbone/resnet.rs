//! ResNet-50 adapter.
//!
//! The stem and the first three stages form the backbone; `layer4` is the
//! final block. Tensor names follow the torchvision sequential layout
//! (`0` conv1, `1` bn1, `4..=6` layer1 to layer3).

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::module::max_pool2d;
use cxr_core::ForwardMode;

use crate::layers::{batch_norm, scaled, ConvBn};
use crate::state::{join, NamedState, StateMapper, StateVisitor};

const STAGE_DEPTHS: [usize; 4] = [3, 4, 6, 3];
const EXPANSION: usize = 4;

/// Stage widths for a width divisor and depth cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResNetPlan {
    /// Stem output channels.
    pub stem: usize,
    /// Bottleneck inner width per stage.
    pub planes: [usize; 4],
    /// Blocks per stage.
    pub depths: [usize; 4],
}

impl ResNetPlan {
    /// Plan a ResNet-50 with widths divided by `divisor`.
    pub fn new(divisor: usize, max_depth: Option<usize>) -> Self {
        let planes = [64, 128, 256, 512].map(|p| scaled(p, divisor, 2));
        let depths = STAGE_DEPTHS.map(|d| max_depth.map_or(d, |m| d.min(m)));
        Self {
            stem: scaled(64, divisor, 8),
            planes,
            depths,
        }
    }

    /// Channels entering `layer4`.
    pub fn final_in_channels(&self) -> usize {
        self.planes[2] * EXPANSION
    }

    /// Channels leaving `layer4`.
    pub fn feature_dim(&self) -> usize {
        self.planes[3] * EXPANSION
    }
}

/// Bottleneck residual block (1×1 → 3×3 → 1×1) with stride on the 3×3.
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    downsample: Option<ConvBn<B>>,
}

impl<B: Backend> Bottleneck<B> {
    /// Create a bottleneck block.
    pub fn new(in_channels: usize, planes: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = planes * EXPANSION;
        let conv1 = Conv2dConfig::new([in_channels, planes], [1, 1])
            .with_bias(false)
            .init(device);
        let conv2 = Conv2dConfig::new([planes, planes], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        let conv3 = Conv2dConfig::new([planes, out_channels], [1, 1])
            .with_bias(false)
            .init(device);

        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| ConvBn::new(in_channels, out_channels, 1, stride, 1, device));

        Self {
            conv1,
            bn1: BatchNormConfig::new(planes).init(device),
            conv2,
            bn2: BatchNormConfig::new(planes).init(device),
            conv3,
            bn3: BatchNormConfig::new(out_channels).init(device),
            downsample,
        }
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone(), mode),
            None => x.clone(),
        };

        let out = relu(batch_norm(&self.bn1, self.conv1.forward(x), mode));
        let out = relu(batch_norm(&self.bn2, self.conv2.forward(out), mode));
        let out = batch_norm(&self.bn3, self.conv3.forward(out), mode);

        relu(out + identity)
    }
}

impl<B: Backend> NamedState<B> for Bottleneck<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.conv1.visit_state(&join(prefix, "conv1"), visitor);
        self.bn1.visit_state(&join(prefix, "bn1"), visitor);
        self.conv2.visit_state(&join(prefix, "conv2"), visitor);
        self.bn2.visit_state(&join(prefix, "bn2"), visitor);
        self.conv3.visit_state(&join(prefix, "conv3"), visitor);
        self.bn3.visit_state(&join(prefix, "bn3"), visitor);
        self.downsample
            .visit_state(&join(prefix, "downsample"), visitor);
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        Self {
            conv1: self.conv1.map_state(&join(prefix, "conv1"), mapper),
            bn1: self.bn1.map_state(&join(prefix, "bn1"), mapper),
            conv2: self.conv2.map_state(&join(prefix, "conv2"), mapper),
            bn2: self.bn2.map_state(&join(prefix, "bn2"), mapper),
            conv3: self.conv3.map_state(&join(prefix, "conv3"), mapper),
            bn3: self.bn3.map_state(&join(prefix, "bn3"), mapper),
            downsample: self
                .downsample
                .map_state(&join(prefix, "downsample"), mapper),
        }
    }
}

/// A sequence of bottlenecks; the first one may downsample.
#[derive(Module, Debug)]
pub struct ResNetStage<B: Backend> {
    blocks: Vec<Bottleneck<B>>,
}

impl<B: Backend> ResNetStage<B> {
    /// Create a stage of `depth` bottlenecks.
    pub fn new(
        in_channels: usize,
        planes: usize,
        depth: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let mut blocks = Vec::with_capacity(depth);
        let mut channels = in_channels;
        for i in 0..depth {
            let block_stride = if i == 0 { stride } else { 1 };
            blocks.push(Bottleneck::new(channels, planes, block_stride, device));
            channels = planes * EXPANSION;
        }
        Self { blocks }
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(x, |out, block| block.forward(out, mode))
    }
}

impl<B: Backend> NamedState<B> for ResNetStage<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.blocks.visit_state(prefix, visitor);
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        Self {
            blocks: self.blocks.map_state(prefix, mapper),
        }
    }
}

/// Stem plus `layer1` to `layer3`.
#[derive(Module, Debug)]
pub struct ResNetTrunk<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    layers: Vec<ResNetStage<B>>,
}

impl<B: Backend> ResNetTrunk<B> {
    /// Create the trunk from a plan.
    pub fn new(plan: &ResNetPlan, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([3, plan.stem], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);

        let mut layers = Vec::with_capacity(3);
        let mut channels = plan.stem;
        for stage in 0..3 {
            let stride = if stage == 0 { 1 } else { 2 };
            layers.push(ResNetStage::new(
                channels,
                plan.planes[stage],
                plan.depths[stage],
                stride,
                device,
            ));
            channels = plan.planes[stage] * EXPANSION;
        }

        Self {
            conv1,
            bn1: BatchNormConfig::new(plan.stem).init(device),
            layers,
        }
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        let x = relu(batch_norm(&self.bn1, self.conv1.forward(x), mode));
        let x = max_pool2d(x, [3, 3], [2, 2], [1, 1], [1, 1]);
        self.layers
            .iter()
            .fold(x, |out, layer| layer.forward(out, mode))
    }
}

impl<B: Backend> NamedState<B> for ResNetTrunk<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.conv1.visit_state(&join(prefix, "0"), visitor);
        self.bn1.visit_state(&join(prefix, "1"), visitor);
        for (i, layer) in self.layers.iter().enumerate() {
            layer.visit_state(&join(prefix, &(i + 4).to_string()), visitor);
        }
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        Self {
            conv1: self.conv1.map_state(&join(prefix, "0"), mapper),
            bn1: self.bn1.map_state(&join(prefix, "1"), mapper),
            layers: self
                .layers
                .into_iter()
                .enumerate()
                .map(|(i, layer)| layer.map_state(&join(prefix, &(i + 4).to_string()), mapper))
                .collect(),
        }
    }
}

/// Build `layer4` from a plan.
pub fn final_stage<B: Backend>(plan: &ResNetPlan, device: &B::Device) -> ResNetStage<B> {
    ResNetStage::new(
        plan.final_in_channels(),
        plan.planes[3],
        plan.depths[3],
        2,
        device,
    )
}
