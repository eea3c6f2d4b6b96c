use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use eeg2dream::{analyze_dataset, verify_dir, PipelineConfig, RecordingPreprocessor};

#[derive(Parser)]
#[command(name = "preprocess", about = "EEG recordings → per-epoch feature files")]
struct Args {
    /// Directory searched (recursively) for .edf / raw.safetensors recordings
    #[arg(long, default_value = "data/raw")]
    data_dir: PathBuf,

    /// Where <name>_features.safetensors.gz files are written
    #[arg(long, default_value = "data/processed/comprehensive_features")]
    output_dir: PathBuf,

    /// Resampling target in Hz
    #[arg(long, default_value_t = 100.0)]
    target_sfreq: f32,

    /// Recordings are cropped to this many seconds
    #[arg(long, default_value_t = 300.0)]
    max_duration: f64,

    /// Epoch length in seconds
    #[arg(long, default_value_t = 30.0)]
    epoch_length: f32,

    /// Fractional overlap between consecutive epochs
    #[arg(long, default_value_t = 0.5)]
    epoch_overlap: f32,

    /// Band-pass low edge in Hz
    #[arg(long, default_value_t = 0.5)]
    l_freq: f32,

    /// Band-pass high edge in Hz
    #[arg(long, default_value_t = 40.0)]
    h_freq: f32,

    /// Power-line notch in Hz (0 disables)
    #[arg(long, default_value_t = 50.0)]
    notch_freq: f32,

    /// Only count recordings per dataset family, then exit
    #[arg(long)]
    analyze_only: bool,

    /// Inspect the output directory after processing
    #[arg(long)]
    verify: bool,

    /// Logging verbosity: trace, debug, info, warn, error
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) -> Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let counts = analyze_dataset(&args.data_dir)?;
    if args.analyze_only {
        return Ok(());
    }
    if counts.total() == 0 {
        warn!(dir = %args.data_dir.display(), "no recordings found");
        return Ok(());
    }

    let cfg = PipelineConfig {
        target_sfreq: args.target_sfreq,
        max_duration: args.max_duration,
        epoch_length: args.epoch_length,
        epoch_overlap: args.epoch_overlap,
        l_freq: args.l_freq,
        h_freq: args.h_freq,
        notch_freq: (args.notch_freq > 0.0).then_some(args.notch_freq),
        ..PipelineConfig::default()
    };
    let summary = RecordingPreprocessor::new(cfg).process_all(&args.data_dir, &args.output_dir)?;
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed.len(),
        total_epochs = summary.total_epochs,
        out = %args.output_dir.display(),
        "preprocessing finished"
    );
    for f in &summary.failed {
        warn!(file = %f, "not processed");
    }

    if args.verify {
        let report = verify_dir(&args.output_dir)?;
        info!(
            n_files = report.n_files,
            estimated_total_epochs = report.estimated_total_epochs,
            "feature store verified"
        );
    }
    Ok(())
}
