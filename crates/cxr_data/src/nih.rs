//! NIH ChestX-ray14 sample loading.
//!
//! Reads the `Data_Entry_2017.csv` metadata and locates images under the
//! archive's `images_001/images` … `images_012/images` folders.
//!
//! # Example
//!
//! ```rust,ignore
//! use cxr_core::Seed;
//! use cxr_data::nih::NihDataset;
//!
//! let dataset = NihDataset::open("data/nih_chestxray_14")?;
//! for sample in dataset.sample_diverse(10, Seed::new(7)) {
//!     println!("{sample}");
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use cxr_core::{Disease, Seed, NO_FINDING};
use polars::prelude::*;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{DataError, Result};

/// Metadata file name at the archive root.
pub const METADATA_FILE: &str = "Data_Entry_2017.csv";

/// Number of `images_NNN` folders in the archive.
pub const IMAGE_FOLDERS: usize = 12;

/// Diseases in the order diverse sampling visits them.
pub const SAMPLING_ORDER: [Disease; 14] = [
    Disease::Cardiomegaly,
    Disease::Pneumonia,
    Disease::Effusion,
    Disease::Atelectasis,
    Disease::Mass,
    Disease::Nodule,
    Disease::Pneumothorax,
    Disease::Consolidation,
    Disease::Hernia,
    Disease::Infiltration,
    Disease::Emphysema,
    Disease::Fibrosis,
    Disease::PleuralThickening,
    Disease::Edema,
];

const COL_IMAGE: &str = "Image Index";
const COL_LABELS: &str = "Finding Labels";
const COL_AGE: &str = "Patient Age";
const COL_GENDER: &str = "Patient Gender";
const COL_VIEW: &str = "View Position";

/// One row of the metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NihRecord {
    /// Image file name, e.g. `00000001_000.png`.
    pub image_name: String,
    /// Raw `Finding Labels` value, e.g. `Cardiomegaly|Effusion`.
    pub finding_labels: String,
    /// Patient age in years, if parseable.
    pub patient_age: Option<u32>,
    /// `M` or `F`.
    pub patient_gender: String,
    /// `PA` or `AP`.
    pub view_position: String,
}

impl NihRecord {
    /// Individual labels of this record.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.finding_labels
            .split('|')
            .map(str::trim)
            .filter(|l| !l.is_empty())
    }

    /// Whether the record carries `disease` as one of its labels.
    pub fn has_label(&self, disease: Disease) -> bool {
        self.labels().any(|l| l == disease.name())
    }

    /// Whether the record is a normal study.
    pub fn is_no_finding(&self) -> bool {
        self.finding_labels.trim() == NO_FINDING
    }
}

/// A record together with the resolved image path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NihSample {
    /// Metadata row.
    pub record: NihRecord,
    /// Location of the image file.
    pub image_path: PathBuf,
    /// Label the sample was drawn for, or `No Finding`.
    pub primary_disease: String,
}

impl fmt::Display for NihSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let age = self
            .record
            .patient_age
            .map_or_else(|| "unknown age".to_string(), |a| format!("{a} years old"));
        writeln!(f, "Image: {}", self.record.image_name)?;
        writeln!(f, "Ground Truth: {}", self.record.finding_labels)?;
        writeln!(f, "Patient Info: {age}, {}", self.record.patient_gender)?;
        writeln!(f, "View: {}", self.record.view_position)?;
        write!(f, "Primary Disease: {}", self.primary_disease)
    }
}

/// An NIH ChestX-ray14 archive on disk.
#[derive(Debug, Clone)]
pub struct NihDataset {
    root: PathBuf,
    records: Vec<NihRecord>,
}

impl NihDataset {
    /// Open the archive rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::NotFound`] if the metadata file is missing and
    /// [`DataError::Parse`] if it lacks a required column.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let csv_path = root.join(METADATA_FILE);
        if !csv_path.exists() {
            return Err(DataError::NotFound(csv_path));
        }

        let records = read_metadata(&csv_path)?;
        info!(root = %root.display(), records = records.len(), "opened NIH archive");
        Ok(Self { root, records })
    }

    /// Archive built from already parsed records.
    pub fn from_records(root: impl Into<PathBuf>, records: Vec<NihRecord>) -> Self {
        Self {
            root: root.into(),
            records,
        }
    }

    /// Archive root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All metadata rows.
    pub fn records(&self) -> &[NihRecord] {
        &self.records
    }

    /// Number of metadata rows.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the metadata is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Locate an image in the first `images_NNN/images` folder holding it.
    pub fn find_image(&self, image_name: &str) -> Option<PathBuf> {
        (1..=IMAGE_FOLDERS)
            .map(|i| {
                self.root
                    .join(format!("images_{i:03}"))
                    .join("images")
                    .join(image_name)
            })
            .find(|path| path.is_file())
    }

    fn resolve(&self, record: &NihRecord, primary: &str) -> Option<NihSample> {
        match self.find_image(&record.image_name) {
            Some(image_path) => Some(NihSample {
                record: record.clone(),
                image_path,
                primary_disease: primary.to_string(),
            }),
            None => {
                debug!(image = %record.image_name, "image missing from archive");
                None
            }
        }
    }

    /// Draw up to `n` samples covering as many diseases as possible.
    ///
    /// Visits the first `n` diseases of [`SAMPLING_ORDER`], picking one
    /// random record carrying each. Remaining slots are filled with
    /// `No Finding` records. Records whose image is missing are skipped.
    pub fn sample_diverse(&self, n: usize, seed: Seed) -> Vec<NihSample> {
        let mut rng = seed.to_rng();
        let mut samples = Vec::with_capacity(n);

        for disease in SAMPLING_ORDER.iter().take(n) {
            let candidates: Vec<&NihRecord> =
                self.records.iter().filter(|r| r.has_label(*disease)).collect();
            if let Some(record) = candidates.choose(&mut rng) {
                if let Some(sample) = self.resolve(record, disease.name()) {
                    samples.push(sample);
                }
            }
        }

        if samples.len() < n {
            let normal: Vec<&NihRecord> = self.records.iter().filter(|r| r.is_no_finding()).collect();
            let needed = n - samples.len();
            samples.extend(
                normal
                    .choose_multiple(&mut rng, needed.min(normal.len()))
                    .filter_map(|record| self.resolve(record, NO_FINDING)),
            );
        }

        if samples.len() < n {
            warn!(requested = n, found = samples.len(), "fewer samples than requested");
        }
        samples.truncate(n);
        samples
    }
}

/// Read one metadata column as trimmed text, nulls as empty strings.
fn text_column(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let column = df
        .column(name)
        .map_err(|_| DataError::Parse(format!("missing column '{name}'")))?
        .cast(&DataType::String)
        .map_err(|e| DataError::Parse(format!("column '{name}': {e}")))?;
    let values = column
        .str()
        .map_err(|e| DataError::Parse(format!("column '{name}': {e}")))?;
    Ok(values
        .into_iter()
        .map(|v| v.unwrap_or_default().trim().to_string())
        .collect())
}

/// Convert a metadata frame into records.
///
/// Columns are located by header name, so extra columns and any column
/// order are accepted. Rows without an image name are dropped.
///
/// # Errors
///
/// Fails if a required column is missing.
pub fn records_from_frame(df: &DataFrame) -> Result<Vec<NihRecord>> {
    let images = text_column(df, COL_IMAGE)?;
    let labels = text_column(df, COL_LABELS)?;
    let ages = text_column(df, COL_AGE)?;
    let genders = text_column(df, COL_GENDER)?;
    let views = text_column(df, COL_VIEW)?;

    let records = images
        .into_iter()
        .zip(labels)
        .zip(ages)
        .zip(genders)
        .zip(views)
        .filter(|((((image, _), _), _), _)| !image.is_empty())
        .map(|((((image_name, finding_labels), age), patient_gender), view_position)| NihRecord {
            image_name,
            finding_labels,
            patient_age: parse_age(&age),
            patient_gender,
            view_position,
        })
        .collect();
    Ok(records)
}

/// Read the metadata file.
///
/// Every column is read as text; ages are parsed afterwards.
///
/// # Errors
///
/// Fails if the file is not valid CSV or lacks a required column.
pub fn read_metadata(path: impl AsRef<Path>) -> Result<Vec<NihRecord>> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.as_ref().to_path_buf()))
        .map_err(|e| DataError::Parse(format!("Failed to create CSV reader: {e}")))?
        .finish()
        .map_err(|e| DataError::Parse(format!("Failed to read CSV: {e}")))?;

    records_from_frame(&df)
}

/// Ages appear either as plain integers or as `058Y`.
fn parse_age(field: &str) -> Option<u32> {
    let digits: String = field.trim().chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const CSV: &str = "\
Image Index,Finding Labels,Follow-up #,Patient ID,Patient Age,Patient Gender,View Position
00000001_000.png,Cardiomegaly,0,1,58,M,PA
00000002_000.png,Cardiomegaly|Effusion,0,2,81,F,AP
00000003_000.png,No Finding,0,3,074Y,F,PA
00000004_000.png,Pleural_Thickening,0,4,40,M,PA
00000005_000.png,No Finding,0,5,33,M,PA
00000006_000.png,Infiltration,0,6,12,F,AP
";

    fn archive(with_images: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(METADATA_FILE), CSV).unwrap();
        for (i, name) in with_images.iter().enumerate() {
            let folder = dir
                .path()
                .join(format!("images_{:03}", i % IMAGE_FOLDERS + 1))
                .join("images");
            fs::create_dir_all(&folder).unwrap();
            fs::write(folder.join(name), b"png").unwrap();
        }
        dir
    }

    fn read_str(csv: &str) -> Result<Vec<NihRecord>> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(METADATA_FILE);
        fs::write(&path, csv).unwrap();
        read_metadata(&path)
    }

    #[test]
    fn test_read_metadata() {
        let records = read_str(CSV).unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(records[1].finding_labels, "Cardiomegaly|Effusion");
        assert_eq!(records[1].patient_age, Some(81));
        assert_eq!(records[2].patient_age, Some(74));
        assert_eq!(records[1].view_position, "AP");
        assert!(records[1].has_label(Disease::Effusion));
        assert!(records[2].is_no_finding());
    }

    #[test]
    fn test_missing_column() {
        let err = read_str("Image Index,Finding Labels\na.png,Mass\n").unwrap_err();
        assert!(matches!(err, DataError::Parse(msg) if msg.contains("Patient Age")));
    }

    #[test]
    fn test_quoted_fields_and_crlf() {
        let csv = "Image Index,Finding Labels,Patient Age,Patient Gender,View Position,OriginalImage[Width,Height]\r\n\
                   a.png,\"Mass|Nodule\",45,M,PA,2048,2500\r\n";
        let records = read_str(csv).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].finding_labels, "Mass|Nodule");
        assert_eq!(records[0].patient_age, Some(45));
        assert_eq!(records[0].view_position, "PA");
    }

    #[test]
    fn test_frame_records() {
        let df = polars::df!(
            "Image Index" => ["b.png", ""],
            "Finding Labels" => ["Hernia", "Mass"],
            "Patient Age" => [61i64, 20],
            "Patient Gender" => ["F", "M"],
            "View Position" => ["AP", "PA"]
        )
        .unwrap();
        let records = records_from_frame(&df).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].has_label(Disease::Hernia));
        assert_eq!(records[0].patient_age, Some(61));
    }

    #[test]
    fn test_labels_match_exactly() {
        let record = NihRecord {
            image_name: "x.png".to_string(),
            finding_labels: "Pleural_Thickening".to_string(),
            patient_age: None,
            patient_gender: "M".to_string(),
            view_position: "PA".to_string(),
        };
        assert!(record.has_label(Disease::PleuralThickening));
        assert!(!record.has_label(Disease::Mass));
    }

    #[test]
    fn test_open_missing_metadata() {
        let dir = TempDir::new().unwrap();
        let err = NihDataset::open(dir.path()).unwrap_err();
        assert!(matches!(err, DataError::NotFound(_)));
    }

    #[test]
    fn test_find_image_searches_folders() {
        let dir = archive(&["00000001_000.png", "00000002_000.png"]);
        let dataset = NihDataset::open(dir.path()).unwrap();

        let found = dataset.find_image("00000002_000.png").unwrap();
        assert!(found.ends_with("images_002/images/00000002_000.png"));
        assert!(dataset.find_image("99999999_000.png").is_none());
    }

    #[test]
    fn test_sample_diverse() {
        let dir = archive(&[
            "00000001_000.png",
            "00000002_000.png",
            "00000003_000.png",
            "00000005_000.png",
        ]);
        let dataset = NihDataset::open(dir.path()).unwrap();

        let samples = dataset.sample_diverse(4, Seed::new(3));
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].primary_disease, "Cardiomegaly");
        // Pneumonia has no records; Effusion only has 00000002.
        assert_eq!(samples[1].primary_disease, "Effusion");
        assert_eq!(samples[1].record.image_name, "00000002_000.png");
        assert!(samples[2..].iter().all(|s| s.primary_disease == NO_FINDING));
        assert!(samples.iter().all(|s| s.image_path.is_file()));
    }

    #[test]
    fn test_sample_diverse_is_seeded() {
        let dir = archive(&["00000001_000.png", "00000002_000.png", "00000003_000.png"]);
        let dataset = NihDataset::open(dir.path()).unwrap();

        let a = dataset.sample_diverse(3, Seed::new(11));
        let b = dataset.sample_diverse(3, Seed::new(11));
        assert_eq!(a, b);
    }

    #[test]
    fn test_sample_display() {
        let sample = NihSample {
            record: read_str(CSV).unwrap().remove(0),
            image_path: PathBuf::from("images_001/images/00000001_000.png"),
            primary_disease: "Cardiomegaly".to_string(),
        };
        let text = sample.to_string();
        assert!(text.contains("Ground Truth: Cardiomegaly"));
        assert!(text.contains("58 years old, M"));
    }
}
