//! Named model state.
//!
//! Burn's module visitors only see parameter ids. Checkpoints written by
//! other frameworks address tensors by dotted path (`final_block.0.conv1.weight`),
//! and the shadow update pairs tensors of two distinct blocks by position in
//! their structure. [`NamedState`] walks a module tree and hands every tensor
//! to a visitor or mapper together with its path.

use std::collections::BTreeMap;

use burn::module::{Param, RunningState};
use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, Linear};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Role of a named tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    /// Trainable weight.
    Parameter,
    /// Non-trainable state such as batch-norm running statistics.
    Buffer,
}

/// Read-only walk over named tensors.
pub trait StateVisitor<B: Backend> {
    /// Called once per tensor.
    fn visit<const D: usize>(&mut self, name: &str, kind: StateKind, tensor: &Tensor<B, D>);
}

/// Rewriting walk over named tensors.
pub trait StateMapper<B: Backend> {
    /// Called once per tensor; the returned tensor replaces it.
    ///
    /// Implementations must return a tensor of the same shape.
    fn map<const D: usize>(&mut self, name: &str, kind: StateKind, tensor: Tensor<B, D>)
        -> Tensor<B, D>;
}

/// A module tree whose tensors can be addressed by dotted path.
pub trait NamedState<B: Backend>: Sized {
    /// Visit every tensor below `prefix`.
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V);

    /// Rewrite every tensor below `prefix`.
    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self;
}

/// Join a path prefix and a field name.
#[must_use]
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn map_param<B: Backend, const D: usize, M: StateMapper<B>>(
    param: Param<Tensor<B, D>>,
    name: &str,
    mapper: &mut M,
) -> Param<Tensor<B, D>> {
    param.map(|tensor| {
        let require_grad = tensor.is_require_grad();
        mapper
            .map(name, StateKind::Parameter, tensor)
            .set_require_grad(require_grad)
    })
}

fn map_running<B: Backend, const D: usize, M: StateMapper<B>>(
    state: RunningState<Tensor<B, D>>,
    name: &str,
    mapper: &mut M,
) -> RunningState<Tensor<B, D>> {
    // Always a fresh cell: running states are shared between clones.
    RunningState::new(mapper.map(name, StateKind::Buffer, state.value_sync()))
}

impl<B: Backend> NamedState<B> for Conv2d<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        visitor.visit(&join(prefix, "weight"), StateKind::Parameter, &self.weight.val());
        if let Some(bias) = &self.bias {
            visitor.visit(&join(prefix, "bias"), StateKind::Parameter, &bias.val());
        }
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        Conv2d {
            weight: map_param(self.weight, &join(prefix, "weight"), mapper),
            bias: self
                .bias
                .map(|bias| map_param(bias, &join(prefix, "bias"), mapper)),
            ..self
        }
    }
}

impl<B: Backend> NamedState<B> for Linear<B> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        visitor.visit(&join(prefix, "weight"), StateKind::Parameter, &self.weight.val());
        if let Some(bias) = &self.bias {
            visitor.visit(&join(prefix, "bias"), StateKind::Parameter, &bias.val());
        }
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        Linear {
            weight: map_param(self.weight, &join(prefix, "weight"), mapper),
            bias: self
                .bias
                .map(|bias| map_param(bias, &join(prefix, "bias"), mapper)),
        }
    }
}

impl<B: Backend, const D: usize> NamedState<B> for BatchNorm<B, D> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        visitor.visit(&join(prefix, "weight"), StateKind::Parameter, &self.gamma.val());
        visitor.visit(&join(prefix, "bias"), StateKind::Parameter, &self.beta.val());
        visitor.visit(
            &join(prefix, "running_mean"),
            StateKind::Buffer,
            &self.running_mean.value_sync(),
        );
        visitor.visit(
            &join(prefix, "running_var"),
            StateKind::Buffer,
            &self.running_var.value_sync(),
        );
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        BatchNorm {
            gamma: map_param(self.gamma, &join(prefix, "weight"), mapper),
            beta: map_param(self.beta, &join(prefix, "bias"), mapper),
            running_mean: map_running(self.running_mean, &join(prefix, "running_mean"), mapper),
            running_var: map_running(self.running_var, &join(prefix, "running_var"), mapper),
            ..self
        }
    }
}

impl<B: Backend, T: NamedState<B>> NamedState<B> for Vec<T> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        for (i, item) in self.iter().enumerate() {
            item.visit_state(&join(prefix, &i.to_string()), visitor);
        }
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        self.into_iter()
            .enumerate()
            .map(|(i, item)| item.map_state(&join(prefix, &i.to_string()), mapper))
            .collect()
    }
}

impl<B: Backend, T: NamedState<B>> NamedState<B> for Option<T> {
    fn visit_state<V: StateVisitor<B>>(&self, prefix: &str, visitor: &mut V) {
        if let Some(item) = self {
            item.visit_state(prefix, visitor);
        }
    }

    fn map_state<M: StateMapper<B>>(self, prefix: &str, mapper: &mut M) -> Self {
        self.map(|item| item.map_state(prefix, mapper))
    }
}

/// Host copy of one named tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Role of the tensor.
    pub kind: StateKind,
    /// Tensor dimensions.
    pub shape: Vec<usize>,
    /// Row-major values.
    pub values: Vec<f32>,
}

/// Visitor copying every tensor to the host.
#[derive(Debug, Default)]
pub struct StateCollector {
    /// Collected entries by path.
    pub entries: BTreeMap<String, StateEntry>,
}

impl<B: Backend> StateVisitor<B> for StateCollector {
    fn visit<const D: usize>(&mut self, name: &str, kind: StateKind, tensor: &Tensor<B, D>) {
        let data = tensor.to_data();
        self.entries.insert(
            name.to_string(),
            StateEntry {
                kind,
                shape: data.shape.clone(),
                values: data.iter::<f32>().collect(),
            },
        );
    }
}

/// Collect the named state of a module tree.
pub fn collect_state<B: Backend, S: NamedState<B>>(
    module: &S,
    prefix: &str,
) -> BTreeMap<String, StateEntry> {
    let mut collector = StateCollector::default();
    module.visit_state(prefix, &mut collector);
    collector.entries
}

/// Build a tensor from host values on `device`.
pub(crate) fn tensor_from_entry<B: Backend, const D: usize>(
    entry: &StateEntry,
    device: &B::Device,
) -> Tensor<B, D> {
    Tensor::from_data(
        TensorData::new(entry.values.clone(), entry.shape.clone()),
        device,
    )
}
