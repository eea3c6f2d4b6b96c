//! # eeg2dream: EEG recordings to dream text
//!
//! `eeg2dream` turns raw polysomnography / EEG recordings into per-epoch
//! feature files, and decodes normalised epochs into short word sequences
//! with a convolutional encoder and an LSTM decoder, scoring every
//! prediction with a confidence value.
//!
//! ## Pipeline overview
//!
//! ```text
//! recording.edf
//!   │
//!   ├─ recording::RawRecording::load()   EDF / EDF+ or raw.safetensors
//!   ├─ crop                              first max_duration seconds (300 s)
//!   ├─ channels::select_channels()       label heuristic, ≤ max_channels (19)
//!   ├─ filter (FIR band-pass + notch)    0.5–40 Hz, 50 Hz
//!   ├─ resample::resample()              FFT → target_sfreq (100 Hz)
//!   ├─ epoch::epoch_overlapping()        30 s windows, 50 % overlap
//!   ├─ features::FeatureExtractor        band powers + statistics
//!   └─ store::write_bundle()             <name>_features.safetensors.gz
//!        │
//!        ├─→ dataset::EpochDataset → train::Trainer → checkpoint
//!        │
//!        └─→ inference::DreamInferenceEngine
//!              normalize → decode → confidence + tokens → text
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use eeg2dream::{PipelineConfig, RecordingPreprocessor};
//! use std::path::Path;
//!
//! let pre = RecordingPreprocessor::new(PipelineConfig::default());
//! let summary = pre
//!     .process_all(Path::new("data/raw"), Path::new("data/processed/comprehensive_features"))
//!     .unwrap();
//! println!("{} files, {} epochs", summary.succeeded, summary.total_epochs);
//! ```
//!
//! ```no_run
//! use eeg2dream::{DreamInferenceEngine, InferenceConfig};
//! use ndarray::Array2;
//! use std::path::Path;
//!
//! let engine = DreamInferenceEngine::from_checkpoint(
//!     Path::new("models/eeg_text_best.safetensors.gz"),
//!     &InferenceConfig::default(),
//! )
//! .unwrap();
//! let pred = engine.predict(Array2::<f32>::zeros((19, 3000))).unwrap();
//! println!("{} ({:.3})", pred.text, pred.confidence);
//! ```

pub mod channels;
pub mod confidence;
pub mod config;
pub mod dataset;
pub mod epoch;
pub mod error;
pub mod features;
pub mod filter;
pub mod inference;
pub mod io;
pub mod lexicon;
pub mod model;
pub mod normalize;
pub mod preprocess;
pub mod recording;
pub mod resample;
pub mod store;
pub mod train;

// ── Crate-root re-exports ─────────────────────────────────────────────────

// config
pub use config::{InferenceConfig, ModelConfig, PipelineConfig, TrainConfig};

// errors
pub use error::{EdfError, FeatureStoreError, ModelError};

// preprocessing
pub use channels::select_channels;
pub use epoch::{epoch_count, epoch_overlapping};
pub use features::{Band, FeatureBundle, FeatureExtractor, Statistic};
pub use normalize::{zscore_global_inplace, SignalNormalizer};
pub use preprocess::{analyze_dataset, discover_files, BatchSummary, RecordingPreprocessor, Stage};
pub use recording::RawRecording;
pub use resample::resample;

// io / store
pub use io::{StFile, StWriter};
pub use store::{feature_file_name, read_bundle, read_raw_signals, verify_dir, write_bundle, StoreReport};

// model
pub use confidence::{ConfidenceEstimator, ConfidenceScores};
pub use lexicon::tokens_to_text;
pub use model::{load_checkpoint, save_checkpoint, Checkpoint, SequenceDecoder, SequenceDecoderModel};

// inference / training
pub use dataset::EpochDataset;
pub use inference::{
    format_predictions, save_predictions, ConfidenceSummary, DreamInferenceEngine, LogitsStats,
    PredictionResult, SignalInput,
};
pub use train::{TrainReport, Trainer};
