//! Thresholded and ranked predictions.

use std::cmp::Ordering;

use cxr_core::{Disease, NUM_CLASSES};
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

/// One disease with its probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Disease label.
    pub disease: Disease,
    /// Sigmoid probability in `[0, 1]`.
    pub confidence: f32,
    /// Index in the classifier output.
    pub index: usize,
}

/// Post-processed classifier output for one radiograph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisPredictions {
    /// Probability per disease in vocabulary order.
    pub raw_probabilities: Vec<f32>,
    /// Diseases at or above the threshold, most confident first.
    pub predicted_diseases: Vec<Prediction>,
    /// The highest-ranked diseases regardless of threshold.
    pub top_5_diseases: Vec<Prediction>,
}

impl DiagnosisPredictions {
    /// Threshold and rank a probability vector.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::InvalidLength`] unless there is exactly one
    /// probability per disease.
    pub fn from_probabilities(probabilities: &[f32], threshold: f32, top_k: usize) -> Result<Self> {
        Ok(Self {
            raw_probabilities: probabilities.to_vec(),
            predicted_diseases: threshold_predictions(probabilities, threshold)?,
            top_5_diseases: top_k_predictions(probabilities, top_k)?,
        })
    }

    /// Whether nothing reached the threshold.
    pub fn is_negative(&self) -> bool {
        self.predicted_diseases.is_empty()
    }
}

fn check_length(probabilities: &[f32]) -> Result<()> {
    if probabilities.len() != NUM_CLASSES {
        return Err(AnalysisError::InvalidLength {
            expected: NUM_CLASSES,
            got: probabilities.len(),
        });
    }
    Ok(())
}

/// Stable descending sort; equal confidences keep vocabulary order.
fn ranked(probabilities: &[f32]) -> Vec<Prediction> {
    let mut predictions: Vec<Prediction> = Disease::ALL
        .iter()
        .zip(probabilities)
        .enumerate()
        .map(|(index, (disease, confidence))| Prediction {
            disease: *disease,
            confidence: *confidence,
            index,
        })
        .collect();
    predictions.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });
    predictions
}

/// Diseases with probability `>= threshold`, most confident first.
///
/// # Errors
///
/// Fails unless there is one probability per disease.
pub fn threshold_predictions(probabilities: &[f32], threshold: f32) -> Result<Vec<Prediction>> {
    check_length(probabilities)?;
    Ok(ranked(probabilities)
        .into_iter()
        .filter(|p| p.confidence >= threshold)
        .collect())
}

/// The `k` most probable diseases, ties in vocabulary order.
///
/// # Errors
///
/// Fails unless there is one probability per disease.
pub fn top_k_predictions(probabilities: &[f32], k: usize) -> Result<Vec<Prediction>> {
    check_length(probabilities)?;
    let mut predictions = ranked(probabilities);
    predictions.truncate(k);
    Ok(predictions)
}
