//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::labels::NUM_CLASSES;

/// Hyperparameters of the diagnostic model and its post-processing.
///
/// Every field has a default, so partial JSON documents are accepted.
///
/// # Example
///
/// ```rust
/// use cxr_core::EngineConfig;
///
/// let config = EngineConfig::new("resnet50").with_bank_size(128);
/// assert_eq!(config.bank_size, 128);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backbone identifier (`resnet50`, `densenet121`, `efficientnet_b0`, `efficientnet_b1`).
    pub backbone: String,
    /// Number of output classes.
    pub num_classes: usize,
    /// Probability at or above which a disease is reported.
    pub confidence_threshold: f32,
    /// EMA momentum of the shadow final block.
    pub momentum: f64,
    /// Channel reduction of the spatial attention branches.
    pub attention_reduction: usize,
    /// Capacity of the memory bank.
    pub bank_size: usize,
    /// Rarity score below which a fused vector is stored in training mode.
    pub rarity_threshold: f32,
    /// Number of neighbours retrieved from the memory bank.
    pub retrieval_k: usize,
    /// Hidden width of the classifier head.
    pub hidden_dim: usize,
    /// Dropout probability of the classifier head.
    pub dropout: f64,
    /// Number of ranked diseases reported and explained.
    pub top_k: usize,
    /// Side length of the square network input.
    pub input_size: usize,
    /// Divides every backbone channel width; 1 builds the full network.
    pub width_divisor: usize,
    /// Caps the number of blocks per backbone stage when set.
    pub max_stage_depth: Option<usize>,
    /// Treat checkpoint key mismatches as errors instead of warnings.
    pub strict_loading: bool,
    /// Seed for weight initialization and the smoke-test input.
    pub seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backbone: "efficientnet_b0".to_string(),
            num_classes: NUM_CLASSES,
            confidence_threshold: 0.4,
            momentum: 0.9999,
            attention_reduction: 8,
            bank_size: 512,
            rarity_threshold: 0.2,
            retrieval_k: 3,
            hidden_dim: 512,
            dropout: 0.3,
            top_k: 5,
            input_size: 224,
            width_divisor: 1,
            max_stage_depth: None,
            strict_loading: false,
            seed: 42,
        }
    }
}

impl EngineConfig {
    /// Create a default configuration for the given backbone.
    #[must_use]
    pub fn new(backbone: impl Into<String>) -> Self {
        Self {
            backbone: backbone.into(),
            ..Default::default()
        }
    }

    /// Set the confidence threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Set the shadow EMA momentum.
    #[must_use]
    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    /// Set the memory bank capacity.
    #[must_use]
    pub fn with_bank_size(mut self, bank_size: usize) -> Self {
        self.bank_size = bank_size;
        self
    }

    /// Set the classifier hidden width.
    #[must_use]
    pub fn with_hidden_dim(mut self, hidden_dim: usize) -> Self {
        self.hidden_dim = hidden_dim;
        self
    }

    /// Build a reduced network: channel widths divided by `divisor`,
    /// at most `depth` blocks per stage.
    #[must_use]
    pub fn compact(mut self, divisor: usize, depth: usize) -> Self {
        self.width_divisor = divisor;
        self.max_stage_depth = Some(depth);
        self
    }

    /// Set strict checkpoint loading.
    #[must_use]
    pub fn with_strict_loading(mut self, strict: bool) -> Self {
        self.strict_loading = strict;
        self
    }

    /// Set the seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check every value against its permitted range.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, msg: impl FnOnce() -> String) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(CoreError::InvalidConfig(msg()))
            }
        }

        check(self.num_classes == NUM_CLASSES, || {
            format!(
                "num_classes must match the {NUM_CLASSES}-label vocabulary, got {}",
                self.num_classes
            )
        })?;
        check((0.0..=1.0).contains(&self.confidence_threshold), || {
            format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )
        })?;
        check((0.0..=1.0).contains(&self.momentum), || {
            format!("momentum must be in [0, 1], got {}", self.momentum)
        })?;
        check(self.attention_reduction > 0, || {
            "attention_reduction must be positive".into()
        })?;
        check(self.bank_size > 0, || "bank_size must be positive".into())?;
        check(self.rarity_threshold >= 0.0, || {
            format!(
                "rarity_threshold must be non-negative, got {}",
                self.rarity_threshold
            )
        })?;
        check(self.retrieval_k > 0, || "retrieval_k must be positive".into())?;
        check(self.hidden_dim > 0, || "hidden_dim must be positive".into())?;
        check((0.0..1.0).contains(&self.dropout), || {
            format!("dropout must be in [0, 1), got {}", self.dropout)
        })?;
        check(self.top_k > 0 && self.top_k <= self.num_classes, || {
            format!(
                "top_k must be in 1..={}, got {}",
                self.num_classes, self.top_k
            )
        })?;
        check(self.input_size >= 32 && self.input_size % 32 == 0, || {
            format!(
                "input_size must be a positive multiple of 32, got {}",
                self.input_size
            )
        })?;
        check(self.width_divisor > 0, || "width_divisor must be positive".into())?;
        check(self.max_stage_depth != Some(0), || {
            "max_stage_depth must be positive when set".into()
        })
    }

    /// Load a configuration from a JSON file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| CoreError::SerializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::SerializationError(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.backbone, "efficientnet_b0");
        assert_eq!(config.num_classes, 14);
        assert!((config.confidence_threshold - 0.4).abs() < f32::EPSILON);
        assert!((config.momentum - 0.9999).abs() < f64::EPSILON);
        assert_eq!(config.attention_reduction, 8);
        assert_eq!(config.bank_size, 512);
        assert!((config.rarity_threshold - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.retrieval_k, 3);
        assert_eq!(config.hidden_dim, 512);
        assert!((config.dropout - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.top_k, 5);
        assert_eq!(config.input_size, 224);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(EngineConfig::default().with_threshold(1.5).validate().is_err());
        assert!(EngineConfig::default().with_momentum(-0.1).validate().is_err());
        assert!(EngineConfig::default().with_bank_size(0).validate().is_err());

        let mut config = EngineConfig::default();
        config.top_k = 15;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("top_k"));

        let mut config = EngineConfig::default();
        config.input_size = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_foreign_vocabulary() {
        let config: EngineConfig = serde_json::from_str(r#"{"num_classes": 13}"#).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(ref msg) if msg.contains("num_classes")));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"backbone": "resnet50", "bank_size": 64}"#).unwrap();
        assert_eq!(config.backbone, "resnet50");
        assert_eq!(config.bank_size, 64);
        assert_eq!(config.retrieval_k, 3);
    }

    #[test]
    fn test_json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let config = EngineConfig::new("densenet121").compact(16, 1);
        config.to_json_file(&path).unwrap();

        let loaded = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
