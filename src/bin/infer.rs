use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use eeg2dream::{save_predictions, ConfidenceSummary, DreamInferenceEngine, InferenceConfig};

#[derive(Parser)]
#[command(name = "infer", about = "Decode dream text from EEG feature files")]
struct Args {
    #[arg(long, default_value = "models/eeg_text_best.safetensors.gz")]
    checkpoint: PathBuf,

    #[arg(long, default_value = "data/processed/comprehensive_features")]
    feature_dir: PathBuf,

    /// Feature files decoded (first N by name)
    #[arg(long, default_value_t = 5)]
    max_files: usize,

    /// Softmax temperature for confidence scoring
    #[arg(long, default_value_t = 2.0)]
    temperature: f32,

    /// Results report path
    #[arg(long, default_value = "results/dream_predictions.txt")]
    output: PathBuf,

    /// Logging verbosity: trace, debug, info, warn, error
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = args.log_level.parse::<Level>().unwrap_or(Level::INFO);
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(level).with_target(false).finish(),
    )?;

    if !args.checkpoint.is_file() {
        bail!("model not found at {}; train it first", args.checkpoint.display());
    }
    let cfg = InferenceConfig {
        temperature: args.temperature,
        feature_dir: args.feature_dir,
        max_files: args.max_files,
    };
    let engine = DreamInferenceEngine::from_checkpoint(&args.checkpoint, &cfg)?;

    let preds = engine.batch_inference()?;
    let Some(summary) = ConfidenceSummary::from_predictions(&preds) else {
        warn!("no predictions generated");
        return Ok(());
    };
    save_predictions(&preds, &args.output)?;

    info!(
        n = summary.count,
        average = format!("{:.6}", summary.average),
        max = format!("{:.6}", summary.max),
        min = format!("{:.6}", summary.min),
        "confidence"
    );
    for (i, p) in preds.iter().take(5).enumerate() {
        let preview: String = p.text.chars().take(60).collect();
        info!(rank = i + 1, confidence = format!("{:.6}", p.confidence), text = %preview, "prediction");
    }
    Ok(())
}
