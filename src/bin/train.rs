use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use eeg2dream::{
    load_checkpoint, EpochDataset, ModelConfig, SequenceDecoderModel, SignalNormalizer, TrainConfig,
    Trainer,
};

#[derive(Parser)]
#[command(name = "train", about = "Train the EEG → text decoder head on feature files")]
struct Args {
    /// Directory of *_features.safetensors.gz files
    #[arg(long, default_value = "data/processed/comprehensive_features")]
    feature_dir: PathBuf,

    /// Best checkpoint is written here
    #[arg(long, default_value = "models/eeg_text_best.safetensors.gz")]
    checkpoint: PathBuf,

    /// Continue from an existing checkpoint (model and optimizer state)
    #[arg(long)]
    resume: Option<PathBuf>,

    #[arg(long, default_value_t = 200)]
    epochs: usize,

    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    #[arg(long, default_value_t = 1e-4)]
    lr: f32,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Encoder output width and LSTM hidden size
    #[arg(long, default_value_t = 128)]
    hidden_dim: usize,

    #[arg(long, default_value_t = 5000)]
    vocab_size: usize,

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

    let cfg = TrainConfig {
        batch_size: args.batch_size,
        learning_rate: args.lr,
        num_epochs: args.epochs,
        seed: args.seed,
        checkpoint_path: args.checkpoint.clone(),
        ..TrainConfig::default()
    };

    let mut trainer = match &args.resume {
        Some(path) => {
            info!(checkpoint = %path.display(), "resuming");
            Trainer::resume(load_checkpoint(path)?, cfg)?
        }
        None => {
            let model_cfg = ModelConfig {
                hidden_dim: args.hidden_dim,
                vocab_size: args.vocab_size,
                ..ModelConfig::default()
            };
            Trainer::new(SequenceDecoderModel::new(model_cfg, args.seed), cfg)
        }
    };

    let m = &trainer.model().config;
    let normalizer = SignalNormalizer::new(m.input_channels, m.input_length);
    let dataset = EpochDataset::load(&args.feature_dir, normalizer)?;
    if dataset.is_empty() {
        bail!("no training samples under {}", args.feature_dir.display());
    }

    let report = trainer.train(&dataset)?;
    info!(
        epochs = report.epochs_run,
        best_loss = report.best_loss,
        final_lr = report.final_lr,
        checkpoint = %args.checkpoint.display(),
        "training finished"
    );
    Ok(())
}
