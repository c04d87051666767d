//! The chest radiograph disease vocabulary.
//!
//! The classifier emits one logit per label in the fixed order of
//! [`Disease::ALL`]. The order is part of the output contract: index `i` of
//! every probability vector refers to `Disease::ALL[i]`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Number of disease categories the classifier predicts.
pub const NUM_CLASSES: usize = 14;

/// Ground-truth marker for radiographs without any labelled finding.
///
/// It is not a class of the classifier.
pub const NO_FINDING: &str = "No Finding";

/// One of the 14 thoracic findings of the ChestX-ray14 vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Disease {
    /// Collapse of lung tissue.
    Atelectasis,
    /// Consolidated lung parenchyma.
    Consolidation,
    /// Infiltrate.
    Infiltration,
    /// Air in the pleural space.
    Pneumothorax,
    /// Pulmonary edema.
    Edema,
    /// Emphysema.
    Emphysema,
    /// Pulmonary fibrosis.
    Fibrosis,
    /// Pleural effusion.
    Effusion,
    /// Pneumonia.
    Pneumonia,
    /// Pleural thickening.
    #[serde(rename = "Pleural_Thickening")]
    PleuralThickening,
    /// Enlarged cardiac silhouette.
    Cardiomegaly,
    /// Pulmonary nodule.
    Nodule,
    /// Pulmonary mass.
    Mass,
    /// Hiatal hernia.
    Hernia,
}

impl Disease {
    /// All diseases in classifier output order.
    pub const ALL: [Disease; NUM_CLASSES] = [
        Disease::Atelectasis,
        Disease::Consolidation,
        Disease::Infiltration,
        Disease::Pneumothorax,
        Disease::Edema,
        Disease::Emphysema,
        Disease::Fibrosis,
        Disease::Effusion,
        Disease::Pneumonia,
        Disease::PleuralThickening,
        Disease::Cardiomegaly,
        Disease::Nodule,
        Disease::Mass,
        Disease::Hernia,
    ];

    /// Canonical label as written in the NIH metadata.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Disease::Atelectasis => "Atelectasis",
            Disease::Consolidation => "Consolidation",
            Disease::Infiltration => "Infiltration",
            Disease::Pneumothorax => "Pneumothorax",
            Disease::Edema => "Edema",
            Disease::Emphysema => "Emphysema",
            Disease::Fibrosis => "Fibrosis",
            Disease::Effusion => "Effusion",
            Disease::Pneumonia => "Pneumonia",
            Disease::PleuralThickening => "Pleural_Thickening",
            Disease::Cardiomegaly => "Cardiomegaly",
            Disease::Nodule => "Nodule",
            Disease::Mass => "Mass",
            Disease::Hernia => "Hernia",
        }
    }

    /// Position of this disease in the classifier output.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Disease at a classifier output position.
    ///
    /// # Errors
    ///
    /// Returns an error if `index >= NUM_CLASSES`.
    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or_else(|| CoreError::UnknownDisease(format!("class index {index}")))
    }

    /// Label names in output order.
    #[must_use]
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|d| d.name()).collect()
    }
}

impl fmt::Display for Disease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Disease {
    type Err = CoreError;

    /// Parses the canonical label. A space is accepted in place of the
    /// underscore of `Pleural_Thickening`.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().replace(' ', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.name().eq_ignore_ascii_case(&normalized))
            .ok_or_else(|| CoreError::UnknownDisease(s.to_string()))
    }
}
