//! Backbone adapters.
//!
//! Each supported architecture is split into a backbone trunk and a final
//! block. Dispatch is a closed set of variants, chosen once at construction.

mod densenet;
mod efficientnet;
mod resnet;

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use cxr_core::ForwardMode;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::state::{NamedState, StateMapper, StateVisitor};

pub use densenet::{DenseNetNorm, DenseNetPlan, DenseNetTrunk};
pub use efficientnet::{EfficientNetHead, EfficientNetPlan, EfficientNetTrunk};
pub use resnet::{ResNetPlan, ResNetStage, ResNetTrunk};

/// Supported backbone architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackboneKind {
    /// ResNet-50; final block is `layer4`.
    Resnet50,
    /// DenseNet-121; final block is `norm5`.
    Densenet121,
    /// EfficientNet-B0; final block is the head projection.
    EfficientnetB0,
    /// EfficientNet-B1; final block is the head projection.
    EfficientnetB1,
}

impl BackboneKind {
    /// All supported kinds.
    pub const ALL: [BackboneKind; 4] = [
        BackboneKind::Resnet50,
        BackboneKind::Densenet121,
        BackboneKind::EfficientnetB0,
        BackboneKind::EfficientnetB1,
    ];

    /// Identifier used in configuration files.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            BackboneKind::Resnet50 => "resnet50",
            BackboneKind::Densenet121 => "densenet121",
            BackboneKind::EfficientnetB0 => "efficientnet_b0",
            BackboneKind::EfficientnetB1 => "efficientnet_b1",
        }
    }

    /// Final feature channels at full width.
    #[must_use]
    pub const fn full_feature_dim(self) -> usize {
        match self {
            BackboneKind::Resnet50 => 2048,
            BackboneKind::Densenet121 => 1024,
            BackboneKind::EfficientnetB0 | BackboneKind::EfficientnetB1 => 1280,
        }
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackboneKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s.trim())
            .ok_or_else(|| ModelError::UnsupportedBackbone(s.to_string()))
    }
}

/// Architecture selection plus size reduction knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Architecture.
    pub kind: BackboneKind,
    /// Divides every channel width.
    pub width_divisor: usize,
    /// Caps the blocks per stage.
    pub max_stage_depth: Option<usize>,
}

#[derive(Debug, Clone)]
enum Plan {
    ResNet(ResNetPlan),
    DenseNet(DenseNetPlan),
    EfficientNet(EfficientNetPlan),
}

impl BackboneConfig {
    /// Full-size configuration of `kind`.
    pub fn new(kind: BackboneKind) -> Self {
        Self {
            kind,
            width_divisor: 1,
            max_stage_depth: None,
        }
    }

    /// Reduce widths and depths.
    #[must_use]
    pub fn with_reduction(mut self, width_divisor: usize, max_stage_depth: Option<usize>) -> Self {
        self.width_divisor = width_divisor;
        self.max_stage_depth = max_stage_depth;
        self
    }

    fn plan(&self) -> Plan {
        let (div, depth) = (self.width_divisor, self.max_stage_depth);
        match self.kind {
            BackboneKind::Resnet50 => Plan::ResNet(ResNetPlan::new(div, depth)),
            BackboneKind::Densenet121 => Plan::DenseNet(DenseNetPlan::new(div, depth)),
            BackboneKind::EfficientnetB0 => Plan::EfficientNet(EfficientNetPlan::b0(div, depth)),
            BackboneKind::EfficientnetB1 => Plan::EfficientNet(EfficientNetPlan::b1(div, depth)),
        }
    }

    /// Channels of the final block output.
    pub fn feature_dim(&self) -> usize {
        match self.plan() {
            Plan::ResNet(plan) => plan.feature_dim(),
            Plan::DenseNet(plan) => plan.feature_dim(),
            Plan::EfficientNet(plan) => plan.feature_dim(),
        }
    }

    /// Initialize the backbone trunk.
    pub fn init_backbone<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        match self.plan() {
            Plan::ResNet(plan) => Backbone::ResNet(ResNetTrunk::new(&plan, device)),
            Plan::DenseNet(plan) => Backbone::DenseNet(DenseNetTrunk::new(&plan, device)),
            Plan::EfficientNet(plan) => {
                Backbone::EfficientNet(EfficientNetTrunk::new(&plan, device))
            }
        }
    }

    /// Initialize a final block.
    ///
    /// Called once for the main block and once for its shadow, so the two
    /// never share storage.
    pub fn init_final_block<B: Backend>(&self, device: &B::Device) -> FinalBlock<B> {
        match self.plan() {
            Plan::ResNet(plan) => FinalBlock::ResNet(resnet::final_stage(&plan, device)),
            Plan::DenseNet(plan) => FinalBlock::DenseNet(DenseNetNorm::new(&plan, device)),
            Plan::EfficientNet(plan) => {
                FinalBlock::EfficientNet(EfficientNetHead::new(&plan, device))
            }
        }
    }
}

/// Backbone trunk producing the final block's input.
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    /// ResNet-50 stem and `layer1` to `layer3`.
    ResNet(ResNetTrunk<B>),
    /// DenseNet-121 features without `norm5`.
    DenseNet(DenseNetTrunk<B>),
    /// EfficientNet stem and MBConv stages.
    EfficientNet(EfficientNetTrunk<B>),
}

impl<B: Backend> Backbone<B> {
    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        match self {
            Backbone::ResNet(trunk) => trunk.forward(x, mode),
            Backbone::DenseNet(trunk) => trunk.forward(x, mode),
            Backbone::EfficientNet(trunk) => trunk.forward(x, mode),
        }
    }
}

impl<B: Backend> NamedState<B> for Backbone<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        match self {
            Backbone::ResNet(trunk) => trunk.visit_state(prefix, visitor),
            Backbone::DenseNet(trunk) => trunk.visit_state(prefix, visitor),
            Backbone::EfficientNet(trunk) => trunk.visit_state(prefix, visitor),
        }
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        match self {
            Backbone::ResNet(trunk) => Backbone::ResNet(trunk.map_state(prefix, mapper)),
            Backbone::DenseNet(trunk) => Backbone::DenseNet(trunk.map_state(prefix, mapper)),
            Backbone::EfficientNet(trunk) => {
                Backbone::EfficientNet(trunk.map_state(prefix, mapper))
            }
        }
    }
}

/// The last trainable stage; its output is the explained feature map.
#[derive(Module, Debug)]
pub enum FinalBlock<B: Backend> {
    /// ResNet-50 `layer4`.
    ResNet(ResNetStage<B>),
    /// DenseNet-121 `norm5`.
    DenseNet(DenseNetNorm<B>),
    /// EfficientNet head projection.
    EfficientNet(EfficientNetHead<B>),
}

impl<B: Backend> FinalBlock<B> {
    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        match self {
            FinalBlock::ResNet(stage) => stage.forward(x, mode),
            FinalBlock::DenseNet(norm) => norm.forward(x, mode),
            FinalBlock::EfficientNet(head) => head.forward(x, mode),
        }
    }
}

impl<B: Backend> NamedState<B> for FinalBlock<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        match self {
            FinalBlock::ResNet(stage) => stage.visit_state(prefix, visitor),
            FinalBlock::DenseNet(norm) => norm.visit_state(prefix, visitor),
            FinalBlock::EfficientNet(head) => head.visit_state(prefix, visitor),
        }
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        match self {
            FinalBlock::ResNet(stage) => FinalBlock::ResNet(stage.map_state(prefix, mapper)),
            FinalBlock::DenseNet(norm) => FinalBlock::DenseNet(norm.map_state(prefix, mapper)),
            FinalBlock::EfficientNet(head) => {
                FinalBlock::EfficientNet(head.map_state(prefix, mapper))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxr_core::backend::NdArray;

    #[test]
    fn test_parse_kinds() {
        for kind in BackboneKind::ALL {
            assert_eq!(kind.name().parse::<BackboneKind>().unwrap(), kind);
        }
        let err = "vgg16".parse::<BackboneKind>().unwrap_err();
        assert!(matches!(err, ModelError::UnsupportedBackbone(ref name) if name == "vgg16"));
    }

    #[test]
    fn test_full_feature_dims_match_plans() {
        for kind in BackboneKind::ALL {
            assert_eq!(BackboneConfig::new(kind).feature_dim(), kind.full_feature_dim());
        }
    }

    #[test]
    fn test_every_kind_builds_compact() {
        let device = Default::default();
        for kind in BackboneKind::ALL {
            let config = BackboneConfig::new(kind).with_reduction(16, Some(1));
            let backbone: Backbone<NdArray> = config.init_backbone(&device);
            let final_block: FinalBlock<NdArray> = config.init_final_block(&device);

            let x = Tensor::zeros([1, 3, 64, 64], &device);
            let out = final_block.forward(backbone.forward(x, ForwardMode::Eval), ForwardMode::Eval);
            assert_eq!(out.dims(), [1, config.feature_dim(), 2, 2], "{kind}");
        }
    }
}
