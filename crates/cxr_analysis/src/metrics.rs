//! Per-disease metrics over a set of radiographs.
//!
//! Each disease is an independent binary decision, so instead of one
//! multi-class confusion matrix there is a 2×2 table per disease.

use cxr_core::{Disease, NUM_CLASSES};
use serde::{Deserialize, Serialize};

/// Binary confusion counts of one disease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryCounts {
    /// Predicted and present.
    pub true_positives: usize,
    /// Predicted but absent.
    pub false_positives: usize,
    /// Present but not predicted.
    pub false_negatives: usize,
    /// Neither predicted nor present.
    pub true_negatives: usize,
}

impl BinaryCounts {
    /// Record one decision.
    pub fn add(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.true_positives += 1,
            (true, false) => self.false_positives += 1,
            (false, true) => self.false_negatives += 1,
            (false, false) => self.true_negatives += 1,
        }
    }

    /// TP / (TP + FP).
    pub fn precision(&self) -> f32 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    /// TP / (TP + FN).
    pub fn recall(&self) -> f32 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    /// F1 score.
    pub fn f1(&self) -> f32 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    /// Number of radiographs where the disease is present.
    pub fn support(&self) -> usize {
        self.true_positives + self.false_negatives
    }
}

fn ratio(num: usize, den: usize) -> f32 {
    if den == 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}

/// Accumulated per-disease counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiLabelMetrics {
    /// Counts in vocabulary order.
    pub counts: Vec<BinaryCounts>,
    /// Radiographs seen.
    pub samples: usize,
    /// Radiographs whose predicted set equals the ground-truth set.
    pub exact_matches: usize,
}

impl Default for MultiLabelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiLabelMetrics {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self {
            counts: vec![BinaryCounts::default(); NUM_CLASSES],
            samples: 0,
            exact_matches: 0,
        }
    }

    /// Record one radiograph.
    pub fn add(&mut self, predicted: &[Disease], actual: &[Disease]) {
        let mut exact = true;
        for disease in Disease::ALL {
            let p = predicted.contains(&disease);
            let a = actual.contains(&disease);
            exact &= p == a;
            self.counts[disease.index()].add(p, a);
        }
        self.samples += 1;
        if exact {
            self.exact_matches += 1;
        }
    }

    /// Counts of one disease.
    pub fn counts(&self, disease: Disease) -> BinaryCounts {
        self.counts[disease.index()]
    }

    /// Share of radiographs with an exactly matching label set.
    pub fn subset_accuracy(&self) -> f32 {
        ratio(self.exact_matches, self.samples)
    }

    /// Unweighted mean F1 over diseases with support.
    pub fn macro_f1(&self) -> f32 {
        let supported: Vec<f32> = self
            .counts
            .iter()
            .filter(|c| c.support() > 0)
            .map(BinaryCounts::f1)
            .collect();
        if supported.is_empty() {
            0.0
        } else {
            supported.iter().sum::<f32>() / supported.len() as f32
        }
    }

    /// Micro-averaged F1 over all decisions.
    pub fn micro_f1(&self) -> f32 {
        let total = self.counts.iter().fold(BinaryCounts::default(), |acc, c| BinaryCounts {
            true_positives: acc.true_positives + c.true_positives,
            false_positives: acc.false_positives + c.false_positives,
            false_negatives: acc.false_negatives + c.false_negatives,
            true_negatives: acc.true_negatives + c.true_negatives,
        });
        total.f1()
    }

    /// Get a text representation.
    pub fn to_string_table(&self) -> String {
        let mut output = String::new();
        output.push_str("                      precision    recall  f1-score   support\n\n");

        for disease in Disease::ALL {
            let c = self.counts(disease);
            output.push_str(&format!(
                "{:>20}      {:.2}      {:.2}      {:.2}     {:5}\n",
                disease.name(),
                c.precision(),
                c.recall(),
                c.f1(),
                c.support()
            ));
        }

        output.push('\n');
        output.push_str(&format!(
            "{:>20}      {:>4}      {:>4}      {:.2}     {:5}\n",
            "macro f1", "", "", self.macro_f1(), self.samples
        ));
        output.push_str(&format!(
            "{:>20}      {:>4}      {:>4}      {:.2}     {:5}\n",
            "micro f1", "", "", self.micro_f1(), self.samples
        ));
        output.push_str(&format!(
            "{:>20}      {:>4}      {:>4}      {:.2}     {:5}\n",
            "subset accuracy", "", "", self.subset_accuracy(), self.samples
        ));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_binary_counts() {
        let mut counts = BinaryCounts::default();
        counts.add(true, true);
        counts.add(true, false);
        counts.add(false, true);
        counts.add(false, false);

        assert_relative_eq!(counts.precision(), 0.5);
        assert_relative_eq!(counts.recall(), 0.5);
        assert_eq!(counts.support(), 2);
    }

    #[test]
    fn test_accumulation() {
        let mut metrics = MultiLabelMetrics::new();
        metrics.add(&[Disease::Cardiomegaly], &[Disease::Cardiomegaly]);
        metrics.add(
            &[Disease::Cardiomegaly, Disease::Mass],
            &[Disease::Cardiomegaly, Disease::Effusion],
        );
        metrics.add(&[], &[]);

        assert_eq!(metrics.samples, 3);
        assert_relative_eq!(metrics.subset_accuracy(), 2.0 / 3.0);

        let cardio = metrics.counts(Disease::Cardiomegaly);
        assert_eq!(cardio.true_positives, 2);
        assert_eq!(metrics.counts(Disease::Mass).false_positives, 1);
        assert_eq!(metrics.counts(Disease::Effusion).false_negatives, 1);
        // Cardiomegaly F1 = 1, Effusion F1 = 0.
        assert_relative_eq!(metrics.macro_f1(), 0.5);
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = MultiLabelMetrics::default();
        assert_eq!(metrics.macro_f1(), 0.0);
        assert_eq!(metrics.subset_accuracy(), 0.0);
        assert!(metrics.to_string_table().contains("Pleural_Thickening"));
    }
}
