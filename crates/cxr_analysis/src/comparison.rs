//! Comparison of predicted labels against NIH ground truth.

use cxr_core::NO_FINDING;
use serde::{Deserialize, Serialize};

use crate::prediction::Prediction;

/// Split an NIH `Finding Labels` value such as `"Cardiomegaly|Effusion"`.
///
/// `"No Finding"` is kept as a single label.
pub fn parse_ground_truth(labels: &str) -> Vec<String> {
    let labels = labels.trim();
    if labels == NO_FINDING {
        return vec![NO_FINDING.to_string()];
    }
    labels
        .split('|')
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .collect()
}

/// Predicted labels partitioned against ground truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundTruthComparison {
    /// Predicted labels present in the ground truth, in prediction order.
    pub matches: Vec<String>,
    /// Ground-truth findings that were not predicted. Never contains
    /// `"No Finding"`.
    pub missed: Vec<String>,
    /// Predicted labels absent from the ground truth.
    pub false_positives: Vec<String>,
    /// Parsed ground truth.
    pub ground_truth: Vec<String>,
    /// Predicted labels.
    pub predicted: Vec<String>,
}

impl GroundTruthComparison {
    /// Compare predicted labels with a ground-truth string.
    pub fn compare<S: AsRef<str>>(predicted: &[S], ground_truth: &str) -> Self {
        let ground_truth = parse_ground_truth(ground_truth);
        let predicted: Vec<String> = predicted.iter().map(|p| p.as_ref().to_string()).collect();

        let (matches, false_positives) = predicted
            .iter()
            .cloned()
            .partition(|label| ground_truth.contains(label));
        let missed = ground_truth
            .iter()
            .filter(|label| label.as_str() != NO_FINDING && !predicted.contains(label))
            .cloned()
            .collect();

        Self {
            matches,
            missed,
            false_positives,
            ground_truth,
            predicted,
        }
    }

    /// Compare thresholded predictions with a ground-truth string.
    pub fn from_predictions(predictions: &[Prediction], ground_truth: &str) -> Self {
        let labels: Vec<&str> = predictions.iter().map(|p| p.disease.name()).collect();
        Self::compare(&labels, ground_truth)
    }

    /// Matches over predictions; 0 when nothing was predicted.
    pub fn precision(&self) -> f32 {
        let predicted = self.matches.len() + self.false_positives.len();
        if predicted == 0 {
            0.0
        } else {
            self.matches.len() as f32 / predicted as f32
        }
    }

    /// Matches over ground-truth labels; 0 without ground truth.
    pub fn recall(&self) -> f32 {
        if self.ground_truth.is_empty() {
            0.0
        } else {
            self.matches.len() as f32 / self.ground_truth.len() as f32
        }
    }

    /// Harmonic mean of precision and recall.
    pub fn f1(&self) -> f32 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_ground_truth() {
        assert_eq!(parse_ground_truth("Cardiomegaly|Effusion"), vec!["Cardiomegaly", "Effusion"]);
        assert_eq!(parse_ground_truth("No Finding"), vec!["No Finding"]);
        assert_eq!(parse_ground_truth("Hernia"), vec!["Hernia"]);
    }

    #[test]
    fn test_compare_partitions_labels() {
        let comparison =
            GroundTruthComparison::compare(&["Cardiomegaly", "Mass"], "Cardiomegaly|Effusion");

        assert_eq!(comparison.matches, vec!["Cardiomegaly"]);
        assert_eq!(comparison.missed, vec!["Effusion"]);
        assert_eq!(comparison.false_positives, vec!["Mass"]);
        assert_relative_eq!(comparison.precision(), 0.5);
        assert_relative_eq!(comparison.recall(), 0.5);
        assert_relative_eq!(comparison.f1(), 0.5);
    }

    #[test]
    fn test_no_finding_is_never_missed() {
        let comparison = GroundTruthComparison::compare::<&str>(&[], "No Finding");
        assert!(comparison.missed.is_empty());
        assert!(comparison.matches.is_empty());
        assert_eq!(comparison.precision(), 0.0);
        assert_eq!(comparison.recall(), 0.0);

        let comparison = GroundTruthComparison::compare(&["Nodule"], "No Finding");
        assert_eq!(comparison.false_positives, vec!["Nodule"]);
    }

    #[test]
    fn test_from_predictions_uses_vocabulary_names() {
        use cxr_core::Disease;
        let predictions = [Prediction {
            disease: Disease::PleuralThickening,
            confidence: 0.6,
            index: 9,
        }];
        let comparison =
            GroundTruthComparison::from_predictions(&predictions, "Pleural_Thickening|Nodule");
        assert_eq!(comparison.matches, vec!["Pleural_Thickening"]);
        assert_eq!(comparison.missed, vec!["Nodule"]);
    }
}
