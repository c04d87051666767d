//! Momentum shadow of the final block.

use std::collections::BTreeMap;

use burn::prelude::*;
use cxr_core::ForwardMode;
use tracing::debug;

use crate::backbone::{BackboneConfig, FinalBlock};
use crate::checkpoint::StateLoader;
use crate::state::{collect_state, tensor_from_entry, NamedState, StateEntry, StateKind, StateMapper};

/// Gradient-free exponential moving average of the final block.
///
/// The shadow owns its own parameter and running-statistic storage. It is
/// built from a fresh block whose state is then copied from the main block,
/// never by cloning the main block.
#[derive(Debug)]
pub struct MomentumShadow<B: Backend> {
    block: FinalBlock<B>,
    momentum: f64,
}

impl<B: Backend> MomentumShadow<B> {
    /// Create a shadow initialized to a copy of `main`.
    pub fn new(
        main: &FinalBlock<B>,
        config: &BackboneConfig,
        momentum: f64,
        device: &B::Device,
    ) -> Self {
        let source = collect_state(main, "");
        let mut loader = StateLoader::new(&source);
        let block = config
            .init_final_block(device)
            .map_state("", &mut loader)
            .no_grad();
        Self { block, momentum }
    }

    /// EMA momentum.
    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    /// Borrow the shadow block.
    pub fn block(&self) -> &FinalBlock<B> {
        &self.block
    }

    /// Forward pass outside the autodiff graph.
    pub fn forward(&self, x: Tensor<B, 4>, mode: ForwardMode) -> Tensor<B, 4> {
        self.block.forward(x.detach(), mode).detach()
    }

    /// `shadow = m · shadow + (1 − m) · main` over trainable parameters.
    ///
    /// Buffers keep the shadow's own values. Reads `main`, never writes it.
    pub fn update_from(&mut self, main: &FinalBlock<B>) {
        let source = collect_state(main, "");
        let mut ema = EmaMapper {
            source: &source,
            momentum: self.momentum,
            updated: 0,
        };
        self.block = self.block.clone().map_state("", &mut ema);
        debug!(updated = ema.updated, momentum = self.momentum, "shadow update");
    }

    /// A copy of the shadow with its state rewritten, used when loading
    /// checkpoints.
    pub(crate) fn map_block<M: StateMapper<B>>(&self, prefix: &str, mapper: &mut M) -> Self {
        Self {
            block: self.block.clone().map_state(prefix, mapper).no_grad(),
            momentum: self.momentum,
        }
    }
}

struct EmaMapper<'a> {
    source: &'a BTreeMap<String, StateEntry>,
    momentum: f64,
    updated: usize,
}

impl<B: Backend> StateMapper<B> for EmaMapper<'_> {
    fn map<const D: usize>(
        &mut self,
        name: &str,
        kind: StateKind,
        tensor: Tensor<B, D>,
    ) -> Tensor<B, D> {
        if kind != StateKind::Parameter {
            return tensor;
        }
        match self.source.get(name) {
            Some(entry) if entry.shape.as_slice() == tensor.dims().as_slice() => {
                let main: Tensor<B, D> = tensor_from_entry(entry, &tensor.device());
                self.updated += 1;
                tensor
                    .mul_scalar(self.momentum)
                    .add(main.mul_scalar(1.0 - self.momentum))
            }
            _ => tensor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::BackboneKind;
    use cxr_core::backend::NdArray;

    type TestBackend = NdArray;

    struct Shift(f32);

    impl<B: Backend> StateMapper<B> for Shift {
        fn map<const D: usize>(
            &mut self,
            _name: &str,
            _kind: StateKind,
            tensor: Tensor<B, D>,
        ) -> Tensor<B, D> {
            tensor.add_scalar(self.0)
        }
    }

    fn setup(momentum: f64) -> (FinalBlock<TestBackend>, MomentumShadow<TestBackend>) {
        let device = Default::default();
        let config = BackboneConfig::new(BackboneKind::EfficientnetB0).with_reduction(16, Some(1));
        let main: FinalBlock<TestBackend> = config.init_final_block(&device);
        let shadow = MomentumShadow::new(&main, &config, momentum, &device);
        (main, shadow)
    }

    fn parameters(block: &FinalBlock<TestBackend>) -> BTreeMap<String, Vec<f32>> {
        collect_state(block, "")
            .into_iter()
            .filter(|(_, e)| e.kind == StateKind::Parameter)
            .map(|(k, e)| (k, e.values))
            .collect()
    }

    #[test]
    fn test_shadow_starts_as_copy() {
        let (main, shadow) = setup(0.9999);
        assert_eq!(collect_state(&main, ""), collect_state(shadow.block(), ""));
    }

    #[test]
    fn test_shadow_has_no_gradients() {
        use crate::state::StateVisitor;
        use cxr_core::backend::Autodiff;

        struct GradFlags(Vec<bool>);

        impl<B: Backend> StateVisitor<B> for GradFlags {
            fn visit<const D: usize>(&mut self, _: &str, kind: StateKind, tensor: &Tensor<B, D>) {
                if kind == StateKind::Parameter {
                    self.0.push(tensor.is_require_grad());
                }
            }
        }

        type B = Autodiff<NdArray>;
        let device = Default::default();
        let config = BackboneConfig::new(BackboneKind::Densenet121).with_reduction(16, Some(1));
        let main: FinalBlock<B> = config.init_final_block(&device);
        let shadow = MomentumShadow::new(&main, &config, 0.9, &device);

        let mut main_flags = GradFlags(Vec::new());
        main.visit_state("", &mut main_flags);
        assert!(main_flags.0.iter().all(|g| *g));

        let mut shadow_flags = GradFlags(Vec::new());
        shadow.block().visit_state("", &mut shadow_flags);
        assert!(!shadow_flags.0.is_empty());
        assert!(shadow_flags.0.iter().all(|g| !*g));
    }

    #[test]
    fn test_momentum_one_is_idempotent() {
        let (main, mut shadow) = setup(1.0);
        let before = parameters(shadow.block());

        let main = main.map_state("", &mut Shift(0.5));
        shadow.update_from(&main);
        assert_eq!(parameters(shadow.block()), before);
    }

    #[test]
    fn test_momentum_zero_copies_main() {
        let (main, mut shadow) = setup(0.0);
        let main = main.map_state("", &mut Shift(0.25));

        shadow.update_from(&main);
        assert_eq!(parameters(shadow.block()), parameters(&main));
    }

    #[test]
    fn test_update_leaves_buffers_alone() {
        let (main, mut shadow) = setup(0.5);
        let main = main.map_state("", &mut Shift(1.0));
        shadow.update_from(&main);

        let main_state = collect_state(&main, "");
        let shadow_state = collect_state(shadow.block(), "");
        for (name, entry) in shadow_state {
            if entry.kind == StateKind::Buffer {
                assert_ne!(entry.values, main_state[&name].values, "{name}");
            }
        }
    }
}
