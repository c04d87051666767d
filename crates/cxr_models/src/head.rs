//! Classifier head.

use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use cxr_core::ForwardMode;
use serde::{Deserialize, Serialize};

use crate::layers::batch_norm;
use crate::state::{join, NamedState, StateMapper, StateVisitor};

/// Configuration for [`ClassifierHead`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierHeadConfig {
    /// Input vector width.
    pub feature_dim: usize,
    /// Hidden width.
    pub hidden_dim: usize,
    /// Number of output logits.
    pub num_classes: usize,
    /// Dropout probability between the linear layers.
    pub dropout: f64,
}

impl ClassifierHeadConfig {
    /// Create a new config.
    pub fn new(feature_dim: usize, hidden_dim: usize, num_classes: usize, dropout: f64) -> Self {
        Self {
            feature_dim,
            hidden_dim,
            num_classes,
            dropout,
        }
    }

    /// Initialize the head.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassifierHead<B> {
        ClassifierHead {
            norm: BatchNormConfig::new(self.feature_dim).init(device),
            hidden: LinearConfig::new(self.feature_dim, self.hidden_dim).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden_dim, self.num_classes).init(device),
        }
    }
}

/// BatchNorm → Linear → ReLU → Dropout → Linear.
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    norm: BatchNorm<B, 0>,
    hidden: Linear<B>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    /// Logits of shape `[batch, num_classes]`.
    pub fn forward(&self, x: Tensor<B, 2>, mode: ForwardMode) -> Tensor<B, 2> {
        let x = batch_norm(&self.norm, x, mode);
        let x = relu(self.hidden.forward(x));
        let x = match mode {
            ForwardMode::Train => self.dropout.forward(x),
            ForwardMode::Eval => x,
        };
        self.output.forward(x)
    }
}

impl<B: Backend> NamedState<B> for ClassifierHead<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        self.norm.visit_state(&join(prefix, "0"), visitor);
        self.hidden.visit_state(&join(prefix, "1"), visitor);
        self.output.visit_state(&join(prefix, "4"), visitor);
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        Self {
            norm: self.norm.map_state(&join(prefix, "0"), mapper),
            hidden: self.hidden.map_state(&join(prefix, "1"), mapper),
            dropout: self.dropout,
            output: self.output.map_state(&join(prefix, "4"), mapper),
        }
    }
}
