//! Checkpoint reading, writing and partial loading.
//!
//! A checkpoint is a mapping from dotted tensor names to `{shape, values}`
//! records, stored as MessagePack (`*.mpk`) or JSON (`*.json`). Training
//! frameworks wrap that mapping in different containers, so reading accepts:
//!
//! - the raw mapping,
//! - `{"model": mapping}`,
//! - `{"model": {"state_dict": mapping}}`,
//! - `{"state_dict": mapping}`.
//!
//! Other top-level keys (epoch, optimizer state) are ignored. Key prefixes
//! added by wrappers (`model.model.`, `model.`, `module.`) are stripped.
//!
//! # Example
//!
//! ```rust,ignore
//! use cxr_models::checkpoint::{read_checkpoint, LoadPolicy};
//!
//! let checkpoint = read_checkpoint("weights.mpk")?;
//! let report = model.load_state_dict(&checkpoint.tensors, LoadPolicy::Lenient)?;
//! report.log_warnings();
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use cxr_core::EngineConfig;
use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::backbone::BackboneKind;
use crate::state::{tensor_from_entry, StateEntry, StateKind, StateMapper};

/// Wrapper prefixes removed from checkpoint keys, checked in order.
pub const WRAPPER_PREFIXES: [&str; 3] = ["model.model.", "model.", "module."];

/// Checkpoint serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointFormat {
    /// MessagePack binary format (fast, compact).
    MessagePack,
    /// JSON text, convenient for small fixtures.
    Json,
}

impl CheckpointFormat {
    /// Format implied by a file extension; anything but `.json` is MessagePack.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => CheckpointFormat::Json,
            _ => CheckpointFormat::MessagePack,
        }
    }
}

/// How key mismatches are treated when loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoadPolicy {
    /// Any missing, unexpected or mis-shaped key is an error.
    Strict,
    /// Mismatches are reported and logged; matching tensors are loaded.
    #[default]
    Lenient,
}

impl LoadPolicy {
    /// Policy from a strictness flag.
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            LoadPolicy::Strict
        } else {
            LoadPolicy::Lenient
        }
    }
}

/// One stored tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor {
    /// Tensor dimensions; empty for scalars.
    pub shape: Vec<usize>,
    /// Row-major values.
    pub values: Vec<f32>,
}

impl From<&StateEntry> for StoredTensor {
    fn from(entry: &StateEntry) -> Self {
        Self {
            shape: entry.shape.clone(),
            values: entry.values.clone(),
        }
    }
}

/// Tensors by name.
pub type StateDict = BTreeMap<String, StoredTensor>;

/// Container shape a checkpoint was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerLayout {
    /// The mapping itself.
    Raw,
    /// `{"model": mapping}`.
    Model,
    /// `{"model": {"state_dict": mapping}}`.
    ModelStateDict,
    /// `{"state_dict": mapping}`.
    StateDict,
}

/// A decoded checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Where the mapping was found.
    pub layout: ContainerLayout,
    /// Tensors with wrapper prefixes stripped.
    pub tensors: StateDict,
}

/// Remove the first matching wrapper prefix.
pub fn strip_wrapper_prefix(key: &str) -> &str {
    WRAPPER_PREFIXES
        .iter()
        .find_map(|prefix| key.strip_prefix(prefix))
        .unwrap_or(key)
}

fn normalize_keys(tensors: StateDict) -> StateDict {
    tensors
        .into_iter()
        .map(|(key, tensor)| (strip_wrapper_prefix(&key).to_string(), tensor))
        .collect()
}

/// Decode checkpoint bytes.
///
/// # Errors
///
/// Returns [`CheckpointError::InvalidFormat`] if the bytes do not decode as a
/// mapping.
pub fn decode_checkpoint(bytes: &[u8], format: CheckpointFormat) -> Result<Checkpoint> {
    let container: Container = match format {
        CheckpointFormat::MessagePack => rmp_serde::from_slice(bytes)
            .map_err(|e| CheckpointError::InvalidFormat(e.to_string()))?,
        CheckpointFormat::Json => serde_json::from_slice(bytes)
            .map_err(|e| CheckpointError::InvalidFormat(e.to_string()))?,
    };
    let (layout, tensors) = container.resolve();
    Ok(Checkpoint {
        layout,
        tensors: normalize_keys(tensors),
    })
}

/// Read and decode a checkpoint file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or decoded.
pub fn read_checkpoint(path: impl AsRef<Path>) -> Result<Checkpoint> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| CheckpointError::Load(format!("{}: {e}", path.display())))?;
    decode_checkpoint(&bytes, CheckpointFormat::from_path(path))
}

/// Encode a state dict in the given container layout.
///
/// # Errors
///
/// Returns [`CheckpointError::Save`] if serialization fails.
pub fn encode_checkpoint(
    tensors: &StateDict,
    layout: ContainerLayout,
    format: CheckpointFormat,
) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct WithStateDict<'a> {
        state_dict: &'a StateDict,
    }

    #[derive(Serialize)]
    struct WithModel<T> {
        model: T,
    }

    fn encode<T: Serialize>(value: &T, format: CheckpointFormat) -> Result<Vec<u8>> {
        match format {
            CheckpointFormat::MessagePack => rmp_serde::to_vec_named(value)
                .map_err(|e| CheckpointError::Save(e.to_string())),
            CheckpointFormat::Json => {
                serde_json::to_vec(value).map_err(|e| CheckpointError::Save(e.to_string()))
            }
        }
    }

    match layout {
        ContainerLayout::Raw => encode(tensors, format),
        ContainerLayout::Model => encode(&WithModel { model: tensors }, format),
        ContainerLayout::ModelStateDict => encode(
            &WithModel {
                model: WithStateDict {
                    state_dict: tensors,
                },
            },
            format,
        ),
        ContainerLayout::StateDict => encode(&WithStateDict { state_dict: tensors }, format),
    }
}

/// Write a state dict to `path`, format chosen by extension.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub fn write_checkpoint(
    tensors: &StateDict,
    path: impl AsRef<Path>,
    layout: ContainerLayout,
) -> Result<()> {
    let path = path.as_ref();
    let bytes = encode_checkpoint(tensors, layout, CheckpointFormat::from_path(path))?;
    std::fs::write(path, bytes)
        .map_err(|e| CheckpointError::Save(format!("{}: {e}", path.display())))
}

/// A tensor whose stored shape differs from the model's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeMismatch {
    /// Tensor name.
    pub name: String,
    /// Shape in the model.
    pub expected: Vec<usize>,
    /// Shape in the checkpoint.
    pub found: Vec<usize>,
}

/// Outcome of a partial load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    /// Tensors copied into the model.
    pub loaded: usize,
    /// Model tensors absent from the checkpoint.
    pub missing: Vec<String>,
    /// Checkpoint tensors with no counterpart in the model.
    pub unexpected: Vec<String>,
    /// Tensors present on both sides with different shapes.
    pub shape_mismatches: Vec<ShapeMismatch>,
}

impl LoadReport {
    /// Whether every tensor matched.
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.shape_mismatches.is_empty()
    }

    /// Emit one warning per mismatch category.
    pub fn log_warnings(&self) {
        if !self.missing.is_empty() {
            warn!(count = self.missing.len(), keys = ?self.missing, "missing keys in state dict");
        }
        if !self.unexpected.is_empty() {
            warn!(count = self.unexpected.len(), keys = ?self.unexpected, "unexpected keys in state dict");
        }
        for mismatch in &self.shape_mismatches {
            warn!(
                name = %mismatch.name,
                expected = ?mismatch.expected,
                found = ?mismatch.found,
                "shape mismatch in state dict"
            );
        }
    }

    /// Apply a load policy.
    ///
    /// # Errors
    ///
    /// Under [`LoadPolicy::Strict`], returns [`CheckpointError::Mismatch`]
    /// unless the report is clean.
    pub fn enforce(self, policy: LoadPolicy) -> Result<Self> {
        if policy == LoadPolicy::Strict && !self.is_clean() {
            return Err(CheckpointError::Mismatch(self.to_string()));
        }
        if !self.is_clean() {
            self.log_warnings();
        }
        Ok(self)
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} loaded, {} missing, {} unexpected, {} shape mismatches",
            self.loaded,
            self.missing.len(),
            self.unexpected.len(),
            self.shape_mismatches.len()
        )
    }
}

/// Mapper replacing tensors with same-named, same-shaped checkpoint entries.
pub struct StateLoader<'a> {
    source: HashMap<&'a str, (&'a [usize], &'a [f32])>,
    consumed: BTreeSet<String>,
    report: LoadReport,
}

impl<'a> StateLoader<'a> {
    /// Loader reading from collected model state.
    pub fn new(source: &'a BTreeMap<String, StateEntry>) -> Self {
        Self::from_parts(
            source
                .iter()
                .map(|(k, e)| (k.as_str(), (e.shape.as_slice(), e.values.as_slice()))),
        )
    }

    /// Loader reading from a checkpoint.
    pub fn from_state_dict(source: &'a StateDict) -> Self {
        Self::from_parts(
            source
                .iter()
                .map(|(k, t)| (k.as_str(), (t.shape.as_slice(), t.values.as_slice()))),
        )
    }

    fn from_parts(parts: impl Iterator<Item = (&'a str, (&'a [usize], &'a [f32]))>) -> Self {
        Self {
            source: parts.collect(),
            consumed: BTreeSet::new(),
            report: LoadReport::default(),
        }
    }

    /// Look up an entry outside the module walk (memory bank buffers).
    pub(crate) fn take_entry(&mut self, name: &str) -> Option<StateEntry> {
        let (shape, values) = self.source.get(name)?;
        self.consumed.insert(name.to_string());
        Some(StateEntry {
            kind: StateKind::Buffer,
            shape: shape.to_vec(),
            values: values.to_vec(),
        })
    }

    /// Record a tensor that could not be restored.
    pub(crate) fn record_mismatch(&mut self, name: &str, expected: Vec<usize>, found: Vec<usize>) {
        self.report.shape_mismatches.push(ShapeMismatch {
            name: name.to_string(),
            expected,
            found,
        });
    }

    /// Record a tensor restored outside the module walk.
    pub(crate) fn record_loaded(&mut self) {
        self.report.loaded += 1;
    }

    /// Record a model tensor the checkpoint lacks.
    pub(crate) fn record_missing(&mut self, name: &str) {
        self.report.missing.push(name.to_string());
    }

    /// Finish, listing every checkpoint entry that was never consumed.
    pub fn finish(mut self) -> LoadReport {
        let mut unexpected: Vec<String> = self
            .source
            .keys()
            .filter(|k| !self.consumed.contains(**k))
            .map(|k| (*k).to_string())
            .collect();
        unexpected.sort();
        self.report.unexpected = unexpected;
        self.report
    }
}

impl<B: Backend> StateMapper<B> for StateLoader<'_> {
    fn map<const D: usize>(
        &mut self,
        name: &str,
        _kind: StateKind,
        tensor: Tensor<B, D>,
    ) -> Tensor<B, D> {
        let Some((shape, values)) = self.source.get(name).copied() else {
            self.report.missing.push(name.to_string());
            return tensor;
        };
        self.consumed.insert(name.to_string());

        let dims = tensor.dims();
        if shape != dims.as_slice() || values.len() != dims.iter().product::<usize>() {
            self.record_mismatch(name, dims.to_vec(), shape.to_vec());
            return tensor;
        }

        self.report.loaded += 1;
        let entry = StateEntry {
            kind: StateKind::Parameter,
            shape: shape.to_vec(),
            values: values.to_vec(),
        };
        tensor_from_entry(&entry, &tensor.device())
    }
}

/// Description written beside a checkpoint as `<stem>.meta.json`.
///
/// Loading consults it to catch weights that belong to another backbone
/// before any tensor is matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Backbone the tensors belong to.
    pub backbone: String,
    /// Initialization seed, for untrained checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Configuration the model was built with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<EngineConfig>,
}

impl CheckpointMetadata {
    /// Metadata for a model built from `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            backbone: config.backbone.clone(),
            seed: Some(config.seed),
            config: Some(config.clone()),
        }
    }

    /// Side-file location for `checkpoint`.
    pub fn path_for(checkpoint: impl AsRef<Path>) -> PathBuf {
        checkpoint.as_ref().with_extension("meta.json")
    }

    /// Read the side-file of `checkpoint`, if there is one.
    pub fn find(checkpoint: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = Self::path_for(checkpoint);
        if path.is_file() {
            Self::load(path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Fail unless the checkpoint was written for `backbone`.
    ///
    /// Identifiers are compared after parsing, so aliases of the same
    /// architecture match.
    pub fn check_backbone(&self, backbone: &str) -> Result<()> {
        let same = match (
            self.backbone.parse::<BackboneKind>(),
            backbone.parse::<BackboneKind>(),
        ) {
            (Ok(written), Ok(expected)) => written == expected,
            _ => self.backbone == backbone,
        };
        if same {
            Ok(())
        } else {
            Err(CheckpointError::Mismatch(format!(
                "checkpoint was written for '{}', model is '{backbone}'",
                self.backbone
            )))
        }
    }

    /// Save metadata to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CheckpointError::Save(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| CheckpointError::Save(e.to_string()))?;
        Ok(())
    }

    /// Load metadata from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json =
            std::fs::read_to_string(path).map_err(|e| CheckpointError::Load(e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| CheckpointError::Load(e.to_string()))
    }
}

/// Result type for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Checkpoint-related errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Error saving checkpoint.
    #[error("Failed to save checkpoint: {0}")]
    Save(String),

    /// Error loading checkpoint.
    #[error("Failed to load checkpoint: {0}")]
    Load(String),

    /// Invalid format.
    #[error("Invalid checkpoint format: {0}")]
    InvalidFormat(String),

    /// Keys did not match under the strict policy.
    #[error("Checkpoint does not match the model: {0}")]
    Mismatch(String),
}

// Decoding. Values that are not `{shape, values}` records are skipped one at
// a time, so the whole file is never buffered.

#[derive(Deserialize)]
#[serde(untagged)]
enum MaybeTensor {
    Tensor(StoredTensor),
    #[allow(dead_code)]
    Other(IgnoredAny),
}

struct TensorMap(StateDict);

impl<'de> Deserialize<'de> for TensorMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct TensorMapVisitor;

        impl<'de> Visitor<'de> for TensorMapVisitor {
            type Value = TensorMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of tensor names to {shape, values}")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<TensorMap, A::Error> {
                let mut tensors = StateDict::new();
                while let Some(key) = map.next_key::<String>()? {
                    if let MaybeTensor::Tensor(tensor) = map.next_value::<MaybeTensor>()? {
                        tensors.insert(key, tensor);
                    }
                }
                Ok(TensorMap(tensors))
            }
        }

        deserializer.deserialize_map(TensorMapVisitor)
    }
}

/// Value under `model`: either the mapping or `{state_dict: mapping}`.
struct ModelSection {
    nested: Option<StateDict>,
    tensors: StateDict,
}

impl<'de> Deserialize<'de> for ModelSection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SectionVisitor;

        impl<'de> Visitor<'de> for SectionVisitor {
            type Value = ModelSection;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a model state mapping")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<ModelSection, A::Error> {
                let mut nested = None;
                let mut tensors = StateDict::new();
                while let Some(key) = map.next_key::<String>()? {
                    if key == "state_dict" {
                        nested = Some(map.next_value::<TensorMap>()?.0);
                    } else if let MaybeTensor::Tensor(tensor) = map.next_value::<MaybeTensor>()? {
                        tensors.insert(key, tensor);
                    }
                }
                Ok(ModelSection { nested, tensors })
            }
        }

        deserializer.deserialize_map(SectionVisitor)
    }
}

struct Container {
    model: Option<ModelSection>,
    state_dict: Option<StateDict>,
    raw: StateDict,
}

impl Container {
    fn resolve(self) -> (ContainerLayout, StateDict) {
        match (self.model, self.state_dict) {
            (Some(ModelSection { nested: Some(tensors), .. }), _) => {
                (ContainerLayout::ModelStateDict, tensors)
            }
            (Some(section), _) => (ContainerLayout::Model, section.tensors),
            (None, Some(tensors)) => (ContainerLayout::StateDict, tensors),
            (None, None) => (ContainerLayout::Raw, self.raw),
        }
    }
}

impl<'de> Deserialize<'de> for Container {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ContainerVisitor;

        impl<'de> Visitor<'de> for ContainerVisitor {
            type Value = Container;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a checkpoint mapping")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Container, A::Error> {
                let mut container = Container {
                    model: None,
                    state_dict: None,
                    raw: StateDict::new(),
                };
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "model" => container.model = Some(map.next_value()?),
                        "state_dict" => {
                            container.state_dict = Some(map.next_value::<TensorMap>()?.0);
                        }
                        _ => {
                            if let MaybeTensor::Tensor(tensor) = map.next_value::<MaybeTensor>()? {
                                container.raw.insert(key, tensor);
                            }
                        }
                    }
                }
                Ok(container)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(
                self,
                _seq: A,
            ) -> std::result::Result<Container, A::Error> {
                Err(de::Error::custom("checkpoint must be a mapping, found a sequence"))
            }
        }

        deserializer.deserialize_map(ContainerVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StateDict {
        let mut tensors = StateDict::new();
        tensors.insert(
            "classifier.1.bias".to_string(),
            StoredTensor {
                shape: vec![2],
                values: vec![0.5, -0.5],
            },
        );
        tensors.insert(
            "memory_bank.index".to_string(),
            StoredTensor {
                shape: vec![],
                values: vec![3.0],
            },
        );
        tensors
    }

    #[test]
    fn test_strip_wrapper_prefix() {
        assert_eq!(strip_wrapper_prefix("model.model.backbone.0.weight"), "backbone.0.weight");
        assert_eq!(strip_wrapper_prefix("model.backbone.0.weight"), "backbone.0.weight");
        assert_eq!(strip_wrapper_prefix("module.classifier.1.bias"), "classifier.1.bias");
        assert_eq!(strip_wrapper_prefix("backbone.0.weight"), "backbone.0.weight");
        // Only one prefix is removed.
        assert_eq!(strip_wrapper_prefix("module.module.x"), "module.x");
    }

    #[test]
    fn test_every_layout_decodes_to_same_tensors() {
        let tensors = sample();
        let layouts = [
            ContainerLayout::Raw,
            ContainerLayout::Model,
            ContainerLayout::ModelStateDict,
            ContainerLayout::StateDict,
        ];
        for format in [CheckpointFormat::MessagePack, CheckpointFormat::Json] {
            for layout in layouts {
                let bytes = encode_checkpoint(&tensors, layout, format).unwrap();
                let decoded = decode_checkpoint(&bytes, format).unwrap();
                assert_eq!(decoded.layout, layout, "{format:?}");
                assert_eq!(decoded.tensors, tensors, "{layout:?} {format:?}");
            }
        }
    }

    #[test]
    fn test_extra_top_level_keys_are_ignored() {
        let json = r#"{
            "epoch": 12,
            "optimizer": {"lr": 0.001},
            "state_dict": {"module.head.weight": {"shape": [1], "values": [2]}}
        }"#;
        let decoded = decode_checkpoint(json.as_bytes(), CheckpointFormat::Json).unwrap();
        assert_eq!(decoded.layout, ContainerLayout::StateDict);
        assert_eq!(decoded.tensors.len(), 1);
        assert_eq!(decoded.tensors["head.weight"].values, vec![2.0]);
    }

    #[test]
    fn test_non_mapping_is_rejected() {
        let err = decode_checkpoint(b"[1, 2, 3]", CheckpointFormat::Json).unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidFormat(_)));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(CheckpointFormat::from_path("w.json"), CheckpointFormat::Json);
        assert_eq!(CheckpointFormat::from_path("w.mpk"), CheckpointFormat::MessagePack);
        assert_eq!(CheckpointFormat::from_path("weights"), CheckpointFormat::MessagePack);
    }

    #[test]
    fn test_report_policy() {
        let clean = LoadReport {
            loaded: 3,
            ..Default::default()
        };
        assert!(clean.clone().enforce(LoadPolicy::Strict).is_ok());

        let dirty = LoadReport {
            loaded: 2,
            missing: vec!["a".into()],
            ..Default::default()
        };
        assert!(dirty.clone().enforce(LoadPolicy::Lenient).is_ok());
        let err = dirty.enforce(LoadPolicy::Strict).unwrap_err();
        assert!(err.to_string().contains("1 missing"));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.mpk");
        write_checkpoint(&sample(), &path, ContainerLayout::Model).unwrap();

        let checkpoint = read_checkpoint(&path).unwrap();
        assert_eq!(checkpoint.layout, ContainerLayout::Model);
        assert_eq!(checkpoint.tensors, sample());
    }

    #[test]
    fn test_checkpoint_metadata_side_file() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("weights.mpk");
        assert!(CheckpointMetadata::find(&weights).unwrap().is_none());

        let config = EngineConfig::new("densenet121").with_seed(21);
        let meta = CheckpointMetadata::from_config(&config);
        meta.save(CheckpointMetadata::path_for(&weights)).unwrap();
        assert!(dir.path().join("weights.meta.json").is_file());

        let found = CheckpointMetadata::find(&weights).unwrap().unwrap();
        assert_eq!(found, meta);
        assert_eq!(found.seed, Some(21));
        assert!(found.check_backbone("densenet121").is_ok());
        let err = found.check_backbone("resnet50").unwrap_err();
        assert!(matches!(err, CheckpointError::Mismatch(msg) if msg.contains("densenet121")));
    }
}
