//! Diagnosis results and their on-disk artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use cxr_analysis::{DiagnosisPredictions, GroundTruthComparison};
use cxr_core::Disease;
use cxr_models::LoadReport;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ErrorKind, Result};

/// File name of the serialized report.
pub const REPORT_FILE: &str = "diagnosis_results.json";
/// File name of the attention panel.
pub const ATTENTION_FILE: &str = "attention_analysis.png";

/// PNG bytes carried as standard base64 in JSON.
mod png_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&cxr_explain::render::to_base64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(serde::de::Error::custom)
    }
}

/// Grad-CAM rendering for one disease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiseaseExplanation {
    /// Explained disease.
    pub disease: Disease,
    /// Its probability.
    pub confidence: f32,
    /// Position in the top-K list, 1-based; `None` for above-threshold maps.
    pub rank: Option<usize>,
    /// Radiograph beside the heatmap overlay.
    #[serde(with = "png_base64")]
    pub png: Vec<u8>,
}

impl DiseaseExplanation {
    /// Artifact file name.
    pub fn file_name(&self) -> String {
        match self.rank {
            Some(rank) => format!("top{rank}_{}_gradcam.png", self.disease.name()),
            None => format!("{}_gradcam_analysis.png", self.disease.name()),
        }
    }
}

/// Spatial attention of the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionExplanation {
    /// Raw attention grid, row-major.
    pub grid: Vec<Vec<f32>>,
    /// Radiograph beside the upscaled grid.
    #[serde(with = "png_base64")]
    pub png: Vec<u8>,
}

/// An explanation that could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplanationFailure {
    /// Disease being explained, `None` for the attention map.
    pub disease: Option<Disease>,
    /// Top-K rank, if any.
    pub rank: Option<usize>,
    /// Error category.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
}

/// Everything produced for one radiograph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisReport {
    /// Probabilities, thresholded and top-K predictions.
    pub diagnosis: DiagnosisPredictions,
    /// Threshold used.
    pub threshold: f32,
    /// One map per above-threshold disease.
    pub gradcam: Vec<DiseaseExplanation>,
    /// One map per top-K disease.
    pub gradcam_top5: Vec<DiseaseExplanation>,
    /// Attention map, unless it failed.
    pub attention: Option<AttentionExplanation>,
    /// Explanations that failed. Never stops the rest.
    pub explanation_errors: Vec<ExplanationFailure>,
    /// Comparison with the labelled findings, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_truth: Option<GroundTruthComparison>,
    /// Outcome of the weight load, `None` for random initialization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_report: Option<LoadReport>,
}

impl DiagnosisReport {
    /// Attach a ground-truth comparison of the thresholded predictions.
    #[must_use]
    pub fn with_ground_truth(mut self, labels: &str) -> Self {
        self.ground_truth = Some(GroundTruthComparison::from_predictions(
            &self.diagnosis.predicted_diseases,
            labels,
        ));
        self
    }

    /// Pretty JSON.
    ///
    /// # Errors
    ///
    /// Fails only if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write every PNG and the JSON report into `dir`.
    ///
    /// Returns the written paths.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or a file cannot be written.
    pub fn persist(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let mut written = Vec::new();
        for explanation in self.gradcam.iter().chain(&self.gradcam_top5) {
            let path = dir.join(explanation.file_name());
            fs::write(&path, &explanation.png)?;
            written.push(path);
        }
        if let Some(attention) = &self.attention {
            let path = dir.join(ATTENTION_FILE);
            fs::write(&path, &attention.png)?;
            written.push(path);
        }

        let path = dir.join(REPORT_FILE);
        fs::write(&path, self.to_json()?)?;
        written.push(path);

        info!(dir = %dir.display(), files = written.len(), "diagnosis artifacts written");
        Ok(written)
    }

    /// Read a report written by [`DiagnosisReport::persist`].
    ///
    /// # Errors
    ///
    /// Fails if the file is unreadable or malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxr_core::NUM_CLASSES;
    use tempfile::TempDir;

    fn report() -> DiagnosisReport {
        let mut probs = vec![0.1; NUM_CLASSES];
        probs[Disease::PleuralThickening.index()] = 0.7;
        let diagnosis = DiagnosisPredictions::from_probabilities(&probs, 0.4, 5).unwrap();
        DiagnosisReport {
            diagnosis,
            threshold: 0.4,
            gradcam: vec![DiseaseExplanation {
                disease: Disease::PleuralThickening,
                confidence: 0.7,
                rank: None,
                png: vec![137, 80, 78, 71],
            }],
            gradcam_top5: vec![DiseaseExplanation {
                disease: Disease::PleuralThickening,
                confidence: 0.7,
                rank: Some(1),
                png: vec![1, 2, 3],
            }],
            attention: Some(AttentionExplanation {
                grid: vec![vec![0.5; 7]; 7],
                png: vec![4, 5],
            }),
            explanation_errors: vec![],
            ground_truth: None,
            load_report: None,
        }
    }

    #[test]
    fn test_file_names() {
        let report = report();
        assert_eq!(report.gradcam[0].file_name(), "Pleural_Thickening_gradcam_analysis.png");
        assert_eq!(report.gradcam_top5[0].file_name(), "top1_Pleural_Thickening_gradcam.png");
    }

    #[test]
    fn test_png_is_base64_in_json() {
        let json: serde_json::Value = serde_json::from_str(&report().to_json().unwrap()).unwrap();
        assert_eq!(json["gradcam"][0]["png"], "iVBORw==");
        assert_eq!(json["gradcam"][0]["disease"], "Pleural_Thickening");
        assert!(json.get("ground_truth").is_none());
    }

    #[test]
    fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let report = report().with_ground_truth("Pleural_Thickening|Effusion");

        let written = report.persist(dir.path()).unwrap();
        assert_eq!(written.len(), 4);
        assert!(dir.path().join("Pleural_Thickening_gradcam_analysis.png").is_file());
        assert!(dir.path().join("top1_Pleural_Thickening_gradcam.png").is_file());
        assert!(dir.path().join(ATTENTION_FILE).is_file());

        let restored = DiagnosisReport::load(dir.path().join(REPORT_FILE)).unwrap();
        assert_eq!(restored, report);
        let comparison = restored.ground_truth.unwrap();
        assert_eq!(comparison.missed, vec!["Effusion"]);
    }
}
