//! cxr-rs CLI for chest radiograph diagnosis, evaluation and checkpoints.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cxr_analysis::{parse_ground_truth, GroundTruthComparison, MultiLabelMetrics};
use cxr_core::backend::ExplainBackend;
use cxr_core::{Disease, EngineConfig, Seed, NO_FINDING};
use cxr_data::{NihDataset, Preprocessor};
use cxr_models::{write_checkpoint, CheckpointMetadata, ContainerLayout, DiagnosticModel};
use cxr_pipeline::{DiagnosisEngine, DiagnosisReport};

/// Backend for inference and Grad-CAM.
type InferBackend = ExplainBackend;

#[derive(Parser, Debug)]
#[command(name = "cxr")]
#[command(author, version)]
#[command(about = "Explainable chest X-ray diagnosis - predict, explain and evaluate")]
#[command(long_about = "cxr-rs: multi-label chest radiograph diagnosis with Grad-CAM explanations.

EXAMPLES:
  # Diagnose one radiograph and write heatmaps
  cxr diagnose chest.png --weights model.mpk --output out/

  # Compare against known findings
  cxr diagnose chest.png --weights model.mpk --ground-truth 'Cardiomegaly|Effusion'

  # Evaluate on diverse NIH ChestX-ray14 samples
  cxr evaluate --dataset data/nih_chestxray_14 --weights model.mpk --samples 14

  # List the disease vocabulary
  cxr labels

BACKBONES:
  efficientnet_b0 [default], efficientnet_b1, resnet50, densenet121")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by commands that build a model.
#[derive(clap::Args, Debug, Clone)]
struct ModelArgs {
    /// Backbone architecture
    #[arg(long, default_value = "efficientnet_b0", value_name = "NAME")]
    backbone: String,

    /// Engine configuration JSON (overrides --backbone)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Checkpoint (.mpk or .json); random weights when omitted
    #[arg(long, value_name = "FILE")]
    weights: Option<PathBuf>,

    /// Fail on any checkpoint key mismatch
    #[arg(long, default_value = "false")]
    strict: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Diagnose one radiograph
    Diagnose {
        /// Image file (PNG or JPEG)
        image: PathBuf,

        #[command(flatten)]
        model: ModelArgs,

        /// Probability at or above which a disease is reported
        #[arg(long, default_value = "0.4", value_name = "P")]
        threshold: f32,

        /// Directory for heatmaps and diagnosis_results.json
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,

        /// Known findings, e.g. 'Cardiomegaly|Effusion' or 'No Finding'
        #[arg(long, value_name = "LABELS")]
        ground_truth: Option<String>,
    },
    /// Evaluate on NIH ChestX-ray14 samples
    Evaluate {
        /// NIH archive root containing Data_Entry_2017.csv
        #[arg(long, value_name = "DIR")]
        dataset: PathBuf,

        #[command(flatten)]
        model: ModelArgs,

        /// Number of samples
        #[arg(long, default_value = "10", value_name = "N")]
        samples: usize,

        /// Probability at or above which a disease is reported
        #[arg(long, default_value = "0.4", value_name = "P")]
        threshold: f32,

        /// Random seed for sample selection
        #[arg(long, default_value = "42", value_name = "SEED")]
        seed: u64,
    },
    /// Print the disease vocabulary in output order
    Labels,
    /// Write a randomly initialized checkpoint
    InitCheckpoint {
        /// Output path; the extension selects MessagePack or JSON
        #[arg(long, value_name = "FILE")]
        output: PathBuf,

        /// Backbone architecture
        #[arg(long, default_value = "efficientnet_b0", value_name = "NAME")]
        backbone: String,

        /// Random seed for initialization
        #[arg(long, default_value = "42", value_name = "SEED")]
        seed: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    match cli.command {
        Commands::Diagnose {
            image,
            model,
            threshold,
            output,
            ground_truth,
        } => handle_diagnose(image, model, threshold, output, ground_truth),
        Commands::Evaluate {
            dataset,
            model,
            samples,
            threshold,
            seed,
        } => handle_evaluate(dataset, model, samples, threshold, seed),
        Commands::Labels => {
            handle_labels();
            Ok(())
        }
        Commands::InitCheckpoint {
            output,
            backbone,
            seed,
        } => handle_init_checkpoint(output, backbone, seed),
    }
}

/// Engine configuration from the command line.
fn engine_config(args: &ModelArgs, threshold: f32) -> Result<EngineConfig> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => EngineConfig::new(&args.backbone),
    };
    let strict = args.strict || config.strict_loading;
    let config = config.with_threshold(threshold).with_strict_loading(strict);
    config.validate().context("Invalid engine configuration")?;
    Ok(config)
}

fn ready_engine(args: &ModelArgs, threshold: f32) -> Result<DiagnosisEngine<InferBackend>> {
    let config = engine_config(args, threshold)?;
    let mut engine = DiagnosisEngine::<InferBackend>::new(config, Default::default());
    engine
        .initialize(args.weights.as_deref())
        .context("Failed to initialize the diagnosis engine")?;

    match (engine.load_report(), &args.weights) {
        (Some(report), _) => println!("Weights: {report}"),
        (None, Some(path)) => println!("Weights: '{}' unreadable, using random initialization", path.display()),
        (None, None) => println!("Weights: random initialization"),
    }
    Ok(engine)
}

fn handle_diagnose(
    image: PathBuf,
    model: ModelArgs,
    threshold: f32,
    output: Option<PathBuf>,
    ground_truth: Option<String>,
) -> Result<()> {
    println!("=== cxr-rs Diagnosis ===\n");
    println!("  Image: {}", image.display());
    println!("  Backbone: {}", model.backbone);
    println!("  Threshold: {threshold}\n");

    let mut engine = ready_engine(&model, threshold)?;
    let mut report = engine
        .diagnose_file(&image)
        .with_context(|| format!("Failed to diagnose '{}'", image.display()))?;
    if let Some(labels) = &ground_truth {
        report = report.with_ground_truth(labels);
    }

    print_report(&report);

    if let Some(dir) = output {
        let written = report
            .persist(&dir)
            .with_context(|| format!("Failed to write artifacts to '{}'", dir.display()))?;
        println!("\nWrote {} files to {}", written.len(), dir.display());
    }
    Ok(())
}

fn print_report(report: &DiagnosisReport) {
    println!("\nPredicted (≥ {:.2}):", report.threshold);
    println!("─────────────────────────────────────────");
    if report.diagnosis.is_negative() {
        println!("  No disease above threshold");
    }
    for p in &report.diagnosis.predicted_diseases {
        println!("  {:<20} {:.3}", p.disease.name(), p.confidence);
    }

    println!("\nTop {}:", report.diagnosis.top_5_diseases.len());
    println!("─────────────────────────────────────────");
    for (rank, p) in report.diagnosis.top_5_diseases.iter().enumerate() {
        println!("  {}. {:<17} {:.3}", rank + 1, p.disease.name(), p.confidence);
    }

    for failure in &report.explanation_errors {
        let target = failure.disease.map_or("attention", Disease::name);
        println!("  ! explanation for {target} failed: {}", failure.message);
    }

    if let Some(comparison) = &report.ground_truth {
        print_comparison(comparison);
    }
}

fn print_comparison(comparison: &GroundTruthComparison) {
    println!("\nGround truth: {}", comparison.ground_truth.join(", "));
    println!("─────────────────────────────────────────");
    println!("  Matches:         {}", comparison.matches.join(", "));
    println!("  Missed:          {}", comparison.missed.join(", "));
    println!("  False positives: {}", comparison.false_positives.join(", "));
    println!(
        "  Precision: {:.2}  Recall: {:.2}",
        comparison.precision(),
        comparison.recall()
    );
}

/// Labelled findings of an NIH `Finding Labels` value.
fn ground_truth_diseases(labels: &str) -> Vec<Disease> {
    parse_ground_truth(labels)
        .iter()
        .filter(|label| label.as_str() != NO_FINDING)
        .filter_map(|label| label.parse().ok())
        .collect()
}

fn handle_evaluate(
    dataset: PathBuf,
    model: ModelArgs,
    samples: usize,
    threshold: f32,
    seed: u64,
) -> Result<()> {
    println!("=== cxr-rs Evaluation ===\n");

    let nih = NihDataset::open(&dataset)
        .with_context(|| format!("Failed to open NIH archive '{}'", dataset.display()))?;
    let selected = nih.sample_diverse(samples, Seed::new(seed));
    if selected.is_empty() {
        bail!("No images found under '{}'", dataset.display());
    }
    println!("  Records: {}", nih.len());
    println!("  Samples: {}\n", selected.len());

    let mut engine = ready_engine(&model, threshold)?;
    let preprocessor = Preprocessor::new(engine.config().input_size as u32);
    let device = Default::default();
    let mut metrics = MultiLabelMetrics::new();

    for sample in &selected {
        let image = preprocessor
            .load::<InferBackend>(&sample.image_path, &device)
            .with_context(|| format!("Failed to load '{}'", sample.image_path.display()))?;
        let predictions = engine
            .predict(image)
            .with_context(|| format!("Failed to diagnose '{}'", sample.record.image_name))?;

        let predicted: Vec<Disease> = predictions
            .predicted_diseases
            .iter()
            .map(|p| p.disease)
            .collect();
        let actual = ground_truth_diseases(&sample.record.finding_labels);
        metrics.add(&predicted, &actual);

        let comparison = GroundTruthComparison::from_predictions(
            &predictions.predicted_diseases,
            &sample.record.finding_labels,
        );
        println!(
            "{:<20} truth: {:<35} matched {}/{}  fp {}",
            sample.record.image_name,
            sample.record.finding_labels,
            comparison.matches.len(),
            comparison.ground_truth.len(),
            comparison.false_positives.len()
        );
    }

    println!("\n{}", metrics.to_string_table());
    Ok(())
}

fn handle_labels() {
    println!("Disease vocabulary ({} labels, output order):\n", Disease::ALL.len());
    for disease in Disease::ALL {
        println!("  {:>2}  {}", disease.index(), disease.name());
    }
}

fn handle_init_checkpoint(output: PathBuf, backbone: String, seed: u64) -> Result<()> {
    let config = EngineConfig::new(&backbone).with_seed(seed);
    let model = DiagnosticModel::<InferBackend>::new(&config, &Default::default())
        .context("Failed to build model")?;

    let state = model.state_dict();
    write_checkpoint(&state, &output, ContainerLayout::Raw)
        .with_context(|| format!("Failed to write '{}'", output.display()))?;

    let metadata_file = CheckpointMetadata::path_for(&output);
    CheckpointMetadata::from_config(&config)
        .save(&metadata_file)
        .with_context(|| format!("Failed to write '{}'", metadata_file.display()))?;

    println!("Wrote {} tensors to {}", state.len(), output.display());
    println!("Metadata: {}", metadata_file.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_diagnose() {
        let cli = Cli::try_parse_from([
            "cxr",
            "-vv",
            "diagnose",
            "chest.png",
            "--weights",
            "model.mpk",
            "--threshold",
            "0.5",
            "--ground-truth",
            "Cardiomegaly|Effusion",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Diagnose {
                image,
                model,
                threshold,
                output,
                ground_truth,
            } => {
                assert_eq!(image, PathBuf::from("chest.png"));
                assert_eq!(model.weights, Some(PathBuf::from("model.mpk")));
                assert_eq!(model.backbone, "efficientnet_b0");
                assert!(!model.strict);
                assert_eq!(threshold, 0.5);
                assert!(output.is_none());
                assert_eq!(ground_truth.as_deref(), Some("Cardiomegaly|Effusion"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_evaluate_defaults() {
        let cli = Cli::try_parse_from(["cxr", "evaluate", "--dataset", "nih"]).unwrap();
        match cli.command {
            Commands::Evaluate {
                samples,
                threshold,
                seed,
                ..
            } => {
                assert_eq!(samples, 10);
                assert_eq!(threshold, 0.4);
                assert_eq!(seed, 42);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_init_checkpoint() {
        let cli = Cli::try_parse_from([
            "cxr",
            "init-checkpoint",
            "--output",
            "w.json",
            "--backbone",
            "resnet50",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::InitCheckpoint { backbone, .. } if backbone == "resnet50"
        ));
    }

    #[test]
    fn test_diagnose_requires_image() {
        assert!(Cli::try_parse_from(["cxr", "diagnose"]).is_err());
    }

    #[test]
    fn test_engine_config_applies_flags() {
        let args = ModelArgs {
            backbone: "densenet121".to_string(),
            config: None,
            weights: None,
            strict: true,
        };
        let config = engine_config(&args, 0.3).unwrap();
        assert_eq!(config.backbone, "densenet121");
        assert_eq!(config.confidence_threshold, 0.3);
        assert!(config.strict_loading);

        assert!(engine_config(&args, 2.0).is_err());
    }

    #[test]
    fn test_engine_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        EngineConfig::new("resnet50").with_bank_size(64).to_json_file(&path).unwrap();

        let args = ModelArgs {
            backbone: "efficientnet_b0".to_string(),
            config: Some(path),
            weights: None,
            strict: false,
        };
        let config = engine_config(&args, 0.4).unwrap();
        assert_eq!(config.backbone, "resnet50");
        assert_eq!(config.bank_size, 64);
    }

    #[test]
    fn test_ground_truth_diseases() {
        assert_eq!(
            ground_truth_diseases("Cardiomegaly|Pleural_Thickening"),
            vec![Disease::Cardiomegaly, Disease::PleuralThickening]
        );
        assert!(ground_truth_diseases("No Finding").is_empty());
    }
}
