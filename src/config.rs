//! Pipeline, model, inference and training configuration.
//!
//! Every struct has `pub` fields and a [`Default`] that matches the settings
//! the decoder was trained with, so you can override a single knob with
//! struct-update syntax.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for recording preprocessing.
///
/// ```
/// use eeg2dream::PipelineConfig;
///
/// let cfg = PipelineConfig {
///     epoch_overlap: 0.0,   // back-to-back windows
///     ..PipelineConfig::default()
/// };
/// assert_eq!(cfg.step_samples(), 3000);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Sampling rate after resampling, in Hz.
    ///
    /// Recordings already at this rate (within 1 mHz) are passed through.
    ///
    /// Default: `100.0` Hz.
    pub target_sfreq: f32,

    /// Recordings whose last sample lies after this time are cropped to
    /// `[0, max_duration]` (inclusive) right after loading.
    ///
    /// Default: `300.0` s.
    pub max_duration: f64,

    /// Window length in seconds.
    ///
    /// At the defaults each epoch has **3 000 samples** (30 s × 100 Hz).
    ///
    /// Default: `30.0` s.
    pub epoch_length: f32,

    /// Fraction of a window shared with the next one, in `[0, 1)`.
    ///
    /// The window step is `epoch_length · (1 − epoch_overlap)`.
    ///
    /// Default: `0.5`.
    pub epoch_overlap: f32,

    /// Lower band-pass edge in Hz.
    ///
    /// Default: `0.5` Hz.
    pub l_freq: f32,

    /// Upper band-pass edge in Hz. At or above the Nyquist rate of the
    /// recording the band-pass degrades to a highpass.
    ///
    /// Default: `40.0` Hz.
    pub h_freq: f32,

    /// Power-line frequency removed with a notch filter after the band-pass.
    ///
    /// `None` disables the notch. A notch that cannot be realised below
    /// Nyquist (e.g. 50 Hz at 100 Hz sampling) is skipped with a warning.
    ///
    /// Default: `Some(50.0)` Hz.
    pub notch_freq: Option<f32>,

    /// Upper bound on channels kept by label-based selection.
    ///
    /// Default: `19`.
    pub max_channels: usize,
}

impl Default for PipelineConfig {
    /// 100 Hz · 300 s max · 30 s epochs at 50 % overlap · 0.5–40 Hz · 50 Hz notch.
    fn default() -> Self {
        Self {
            target_sfreq: 100.0,
            max_duration: 300.0,
            epoch_length: 30.0,
            epoch_overlap: 0.5,
            l_freq: 0.5,
            h_freq: 40.0,
            notch_freq: Some(50.0),
            max_channels: 19,
        }
    }
}

impl PipelineConfig {
    /// Samples per epoch at the target rate, rounded to the nearest sample.
    ///
    /// ```
    /// use eeg2dream::PipelineConfig;
    /// assert_eq!(PipelineConfig::default().epoch_samples(), 3000);
    /// ```
    pub fn epoch_samples(&self) -> usize {
        (f64::from(self.epoch_length) * f64::from(self.target_sfreq)).round() as usize
    }

    /// Samples between consecutive epoch starts, rounded to the nearest
    /// sample and at least 1.
    ///
    /// ```
    /// use eeg2dream::PipelineConfig;
    /// assert_eq!(PipelineConfig::default().step_samples(), 1500);
    /// ```
    pub fn step_samples(&self) -> usize {
        let step = f64::from(self.epoch_length)
            * (1.0 - f64::from(self.epoch_overlap))
            * f64::from(self.target_sfreq);
        (step.round() as usize).max(1)
    }
}

/// Shape of the sequence decoder.
///
/// Stored as JSON in checkpoint metadata so a checkpoint always loads into a
/// model of the right size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Signal rows the encoder expects (inputs are padded/cropped to this).
    pub input_channels: usize,
    /// Signal columns after padding/cropping.
    pub input_length: usize,
    /// Encoder output size, embedding size and LSTM hidden size.
    pub hidden_dim: usize,
    pub vocab_size: usize,
    /// Decoding steps per sample.
    pub max_seq_len: usize,
    /// Dropout between the two LSTM layers, training only.
    pub dropout: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_channels: 19,
            input_length: 3000,
            hidden_dim: 128,
            vocab_size: 5000,
            max_seq_len: 20,
            dropout: 0.3,
        }
    }
}

/// Inference session settings.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// Softmax temperature used for confidence scoring.
    ///
    /// Default: `2.0`.
    pub temperature: f32,

    /// Directory holding `*_features.safetensors.gz` files.
    ///
    /// Default: `data/processed/comprehensive_features`.
    pub feature_dir: PathBuf,

    /// Files processed by batch inference (sorted by name first).
    ///
    /// Default: `5`.
    pub max_files: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            temperature: 2.0,
            feature_dir: PathBuf::from("data/processed/comprehensive_features"),
            max_files: 5,
        }
    }
}

/// Training loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    /// Default: `2`.
    pub batch_size: usize,
    /// Initial AdamW step size. Default: `1e-4`.
    pub learning_rate: f32,
    /// Decoupled weight decay. Default: `0.01`.
    pub weight_decay: f32,
    /// Global gradient-norm ceiling. Default: `1.0`.
    pub grad_clip: f32,
    /// Learning-rate multiplier applied on a plateau. Default: `0.5`.
    pub plateau_factor: f32,
    /// Epochs without improvement tolerated before the rate is cut. Default: `2`.
    pub plateau_patience: usize,
    /// Default: `200`.
    pub num_epochs: usize,
    /// Seeds initialisation, shuffling, dropout and target sampling. Default: `42`.
    pub seed: u64,
    /// Where the best checkpoint is written.
    ///
    /// Default: `models/eeg_text_best.safetensors.gz`.
    pub checkpoint_path: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            learning_rate: 1e-4,
            weight_decay: 0.01,
            grad_clip: 1.0,
            plateau_factor: 0.5,
            plateau_patience: 2,
            num_epochs: 200,
            seed: 42,
            checkpoint_path: PathBuf::from("models/eeg_text_best.safetensors.gz"),
        }
    }
}
