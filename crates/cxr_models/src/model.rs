//! The diagnostic model.

use std::collections::BTreeMap;

use burn::prelude::*;
use cxr_core::{EngineConfig, ForwardMode, ImageShape, MultiLabelClassifier, Seed};
use tracing::{debug, info};

use crate::attention::{SpatialAttention, SpatialAttentionConfig};
use crate::backbone::{Backbone, BackboneConfig, BackboneKind, FinalBlock};
use crate::checkpoint::{LoadPolicy, LoadReport, StateDict, StateLoader, StoredTensor};
use crate::error::{ModelError, Result};
use crate::head::{ClassifierHead, ClassifierHeadConfig};
use crate::hooks::{ForwardHook, NoHooks, TapPoint};
use crate::memory_bank::{rarity_scores, MemoryBank};
use crate::momentum::MomentumShadow;
use crate::state::{collect_state, join, NamedState, StateEntry};

/// Outputs of one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput<B: Backend> {
    /// Raw per-disease logits `[batch, num_classes]`.
    pub logits: Tensor<B, 2>,
    /// Spatial attention map `[batch, 1, H, W]`.
    pub attention: Tensor<B, 4>,
    /// Pooled ROI vector plus pooled shadow vector `[batch, feature_dim]`.
    pub fused: Tensor<B, 2>,
    /// Memory bank contribution added to `fused` before the head.
    pub retrieved: Tensor<B, 2>,
}

/// Backbone, final block with momentum shadow, spatial attention, memory
/// bank and classifier head.
///
/// Inference takes `&self`. [`DiagnosticModel::forward_train`] is the only
/// call that mutates the shadow and the memory bank.
#[derive(Debug)]
pub struct DiagnosticModel<B: Backend> {
    backbone: Backbone<B>,
    final_block: FinalBlock<B>,
    shadow: MomentumShadow<B>,
    attention: SpatialAttention<B>,
    memory_bank: MemoryBank,
    classifier: ClassifierHead<B>,
    backbone_config: BackboneConfig,
    config: EngineConfig,
    device: B::Device,
}

impl<B: Backend> DiagnosticModel<B> {
    /// Build a randomly initialized model.
    ///
    /// The backend generator is seeded from `config.seed` first, so two
    /// models built from the same config start with the same weights.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Core`] for an invalid config and
    /// [`ModelError::UnsupportedBackbone`] for an unknown backbone.
    pub fn new(config: &EngineConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let kind: BackboneKind = config.backbone.parse()?;
        let backbone_config =
            BackboneConfig::new(kind).with_reduction(config.width_divisor, config.max_stage_depth);
        let feature_dim = backbone_config.feature_dim();

        Seed::new(config.seed).apply::<B>();

        let backbone = backbone_config.init_backbone(device);
        let final_block = backbone_config.init_final_block(device);
        let shadow = MomentumShadow::new(&final_block, &backbone_config, config.momentum, device);
        let attention =
            SpatialAttentionConfig::new(feature_dim, config.attention_reduction).init(device);
        let classifier = ClassifierHeadConfig::new(
            feature_dim,
            config.hidden_dim,
            config.num_classes,
            config.dropout,
        )
        .init(device);

        info!(
            backbone = %kind,
            feature_dim,
            bank_size = config.bank_size,
            "diagnostic model initialized"
        );

        Ok(Self {
            backbone,
            final_block,
            shadow,
            attention,
            memory_bank: MemoryBank::new(config.bank_size, feature_dim, config.rarity_threshold),
            classifier,
            backbone_config,
            config: config.clone(),
            device: device.clone(),
        })
    }

    /// Engine configuration the model was built from.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Backbone architecture.
    pub fn backbone_kind(&self) -> BackboneKind {
        self.backbone_config.kind
    }

    /// Width of the pooled feature vector.
    pub fn feature_dim(&self) -> usize {
        self.memory_bank.dim()
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// The memory bank.
    pub fn memory_bank(&self) -> &MemoryBank {
        &self.memory_bank
    }

    /// The momentum shadow.
    pub fn shadow(&self) -> &MomentumShadow<B> {
        &self.shadow
    }

    /// Check that `dims` is a `[batch, 3, H, W]` image batch.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidInput`] otherwise.
    pub fn check_input(&self, dims: [usize; 4]) -> Result<()> {
        let [batch, _, height, width] = dims;
        let expected = ImageShape::new(batch, 3, height, width);
        if expected.numel() == 0 || expected.check(&dims).is_err() {
            return Err(ModelError::InvalidInput {
                expected: "[batch, 3, H, W]".to_string(),
                got: format!("{dims:?}"),
            });
        }
        Ok(())
    }

    /// Inference forward pass.
    pub fn forward(&self, x: Tensor<B, 4>) -> ForwardOutput<B> {
        self.forward_with_hooks(x, &mut NoHooks)
    }

    /// Inference forward pass reporting tap point outputs to `hook`.
    ///
    /// Used by explanation code to capture activations and gradients.
    pub fn forward_with_hooks(
        &self,
        x: Tensor<B, 4>,
        hook: &mut dyn ForwardHook<B>,
    ) -> ForwardOutput<B> {
        self.run(x, ForwardMode::Eval, hook)
    }

    /// Training forward pass.
    ///
    /// Runs in training mode, then moves the shadow towards the final block
    /// and stores the candidate rows of the fused vector in the memory bank.
    /// Retrieval in this pass sees the bank as it was before the insertion.
    pub fn forward_train(&mut self, x: Tensor<B, 4>) -> ForwardOutput<B> {
        let output = self.run(x, ForwardMode::Train, &mut NoHooks);

        let fused = output.fused.clone().detach();
        let rarity = rarity_scores(fused.clone());
        self.shadow.update_from(&self.final_block);
        let written = self.memory_bank.insert_rare(fused, &rarity);
        debug!(written, cursor = self.memory_bank.cursor(), "training step");

        output
    }

    fn run(
        &self,
        x: Tensor<B, 4>,
        mode: ForwardMode,
        hook: &mut dyn ForwardHook<B>,
    ) -> ForwardOutput<B> {
        let features = self.backbone.forward(x, mode);
        let features = hook.on_output(TapPoint::Backbone, features);

        let main = self.final_block.forward(features.clone(), mode);
        let main = hook.on_output(TapPoint::FinalBlock, main);
        let shadow = self.shadow.forward(features, mode);

        let attention = self.attention.forward(main.clone());
        let attention = hook.on_output(TapPoint::SpatialAttention, attention);

        let [batch, channels, height, width] = main.dims();
        let roi = main * attention.clone().expand([batch, channels, height, width]);
        let fused = global_avg_pool(roi) + global_avg_pool(shadow);

        let retrieved = self
            .memory_bank
            .retrieve(fused.clone(), self.config.retrieval_k);
        let logits = self
            .classifier
            .forward(fused.clone() + retrieved.clone(), mode);

        ForwardOutput {
            logits,
            attention,
            fused,
            retrieved,
        }
    }

    /// Every tensor of the model by checkpoint name.
    pub fn state_dict(&self) -> StateDict {
        let mut entries: BTreeMap<String, StateEntry> = BTreeMap::new();
        entries.extend(collect_state(&self.backbone, "backbone"));
        entries.extend(collect_state(&self.final_block, "final_block"));
        entries.extend(collect_state(
            self.shadow.block(),
            "momentum_final_block.final_block",
        ));
        entries.extend(collect_state(&self.attention, "spatial_attention"));
        entries.extend(collect_state(&self.classifier, "classifier"));
        for (name, entry) in self.memory_bank.state_entries() {
            entries.insert(join("memory_bank", name), entry);
        }

        entries
            .iter()
            .map(|(name, entry)| (name.clone(), StoredTensor::from(entry)))
            .collect()
    }

    /// Copy matching tensors from `state` into the model.
    ///
    /// Tensors are matched by name and shape. Under [`LoadPolicy::Strict`]
    /// any mismatch fails the load and leaves the model untouched; under
    /// [`LoadPolicy::Lenient`] mismatches are logged and the rest is loaded.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Checkpoint`] when a strict load finds mismatches.
    pub fn load_state_dict(&mut self, state: &StateDict, policy: LoadPolicy) -> Result<LoadReport> {
        let mut loader = StateLoader::from_state_dict(state);

        let backbone = self.backbone.clone().map_state("backbone", &mut loader);
        let final_block = self.final_block.clone().map_state("final_block", &mut loader);
        let shadow = self
            .shadow
            .map_block("momentum_final_block.final_block", &mut loader);
        let attention = self
            .attention
            .clone()
            .map_state("spatial_attention", &mut loader);
        let classifier = self.classifier.clone().map_state("classifier", &mut loader);

        let mut memory_bank = self.memory_bank.clone();
        let expected = memory_bank.state_entries();
        for (name, current) in expected {
            let key = join("memory_bank", name);
            match loader.take_entry(&key) {
                Some(entry) => {
                    let restored = match name {
                        "memory" => memory_bank.load_memory(&entry),
                        _ => memory_bank.load_cursor(&entry),
                    };
                    if restored {
                        loader.record_loaded();
                    } else {
                        loader.record_mismatch(&key, current.shape, entry.shape);
                    }
                }
                None => loader.record_missing(&key),
            }
        }

        let report = loader.finish().enforce(policy)?;

        self.backbone = backbone;
        self.final_block = final_block;
        self.shadow = shadow;
        self.attention = attention;
        self.classifier = classifier;
        self.memory_bank = memory_bank;

        info!(%report, "state dict loaded");
        Ok(report)
    }
}

impl<B: Backend> MultiLabelClassifier<B> for DiagnosticModel<B> {
    fn forward_logits(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(x).logits
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }
}

fn global_avg_pool<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, _, _] = x.dims();
    x.mean_dim(3).mean_dim(2).reshape([batch, channels])
}
