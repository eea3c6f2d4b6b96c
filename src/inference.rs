//! Dream decoding sessions.
//!
//! A [`DreamInferenceEngine`] is built once (from a checkpoint, or around any
//! [`SequenceDecoder`]) and owns everything a prediction needs:
//!
//! ```text
//! sample [C, T] ─ SignalNormalizer ─→ [1, C', T'] ─ decoder ─→ logits [1, S, V]
//!                                                     ├─ ConfidenceEstimator → confidence
//!                                                     └─ argmax per step → tokens → lexicon → text
//! ```
use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::InferenceConfig;
use crate::confidence::{ConfidenceEstimator, ConfidenceScores};
use crate::lexicon::tokens_to_text;
use crate::model::layers::argmax;
use crate::model::{load_checkpoint, SequenceDecoder, SequenceDecoderModel};
use crate::normalize::SignalNormalizer;
use crate::store::{list_feature_files, read_raw_signals};

/// Heading of the results report.
pub const REPORT_TITLE: &str = "EEG DREAM DECODING RESULTS";

// ── Input coercion ────────────────────────────────────────────────────────────

/// Anything that can be turned into a `[channels, time]` sample.
pub trait SignalInput {
    fn into_signal(self) -> Result<Array2<f32>>;
}

impl SignalInput for Array2<f32> {
    fn into_signal(self) -> Result<Array2<f32>> {
        Ok(self)
    }
}

impl SignalInput for &Array2<f32> {
    fn into_signal(self) -> Result<Array2<f32>> {
        Ok(self.clone())
    }
}

impl SignalInput for ArrayView2<'_, f32> {
    fn into_signal(self) -> Result<Array2<f32>> {
        Ok(self.to_owned())
    }
}

/// A sample paired with anything else (e.g. its label); only the array is used.
impl<T> SignalInput for (Array2<f32>, T) {
    fn into_signal(self) -> Result<Array2<f32>> {
        Ok(self.0)
    }
}

/// Nested rows; every row must have the same length.
impl SignalInput for Vec<Vec<f32>> {
    fn into_signal(self) -> Result<Array2<f32>> {
        let n_rows = self.len();
        let n_cols = self.first().map_or(0, Vec::len);
        if let Some((i, row)) = self.iter().enumerate().find(|(_, r)| r.len() != n_cols) {
            bail!("ragged sample: row {i} has {} values, expected {n_cols}", row.len());
        }
        let flat: Vec<f32> = self.into_iter().flatten().collect();
        Ok(Array2::from_shape_vec((n_rows, n_cols), flat)?)
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Summary of a logits tensor (`std` uses the `n − 1` denominator).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogitsStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
}

impl LogitsStats {
    pub fn of(logits: &Array3<f32>) -> Self {
        let n = logits.len();
        let min = logits.iter().copied().fold(f32::INFINITY, f32::min);
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = logits.iter().map(|&v| v as f64).sum::<f64>() / n.max(1) as f64;
        let ss = logits.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>();
        let std = if n > 1 { (ss / (n - 1) as f64).sqrt() } else { f64::NAN };
        Self { min, max, mean: mean as f32, std: std as f32 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub text: String,
    /// One id per decoding step, including anything after PAD/END.
    pub tokens: Vec<usize>,
    /// `max` of the tempered-max, entropy and top-2 scores.
    pub confidence: f32,
    pub scores: ConfidenceScores,
    pub logits_stats: LogitsStats,
    /// Set by file mode.
    pub file: Option<String>,
    /// Set by file mode.
    pub epoch: Option<usize>,
}

/// Average / max / min confidence over a batch of predictions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceSummary {
    pub count: usize,
    pub average: f32,
    pub max: f32,
    pub min: f32,
}

impl ConfidenceSummary {
    /// `None` for an empty batch.
    pub fn from_predictions(preds: &[PredictionResult]) -> Option<Self> {
        if preds.is_empty() {
            return None;
        }
        let sum: f64 = preds.iter().map(|p| p.confidence as f64).sum();
        Some(Self {
            count: preds.len(),
            average: (sum / preds.len() as f64) as f32,
            max: preds.iter().map(|p| p.confidence).fold(f32::NEG_INFINITY, f32::max),
            min: preds.iter().map(|p| p.confidence).fold(f32::INFINITY, f32::min),
        })
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// An inference session: model, normaliser, estimator and feature directory.
pub struct DreamInferenceEngine<M: SequenceDecoder = SequenceDecoderModel> {
    model: M,
    normalizer: SignalNormalizer,
    estimator: ConfidenceEstimator,
    feature_dir: PathBuf,
    max_files: usize,
}

impl DreamInferenceEngine<SequenceDecoderModel> {
    /// Load the model from `checkpoint`. A missing or unreadable checkpoint
    /// fails here, before any prediction is attempted.
    pub fn from_checkpoint(checkpoint: &Path, cfg: &InferenceConfig) -> Result<Self> {
        let ck = load_checkpoint(checkpoint)
            .with_context(|| format!("cannot start inference session from {}", checkpoint.display()))?;
        info!(
            checkpoint = %checkpoint.display(),
            vocab = ck.model.config.vocab_size,
            steps = ck.model.config.max_seq_len,
            "model loaded"
        );
        Ok(Self::with_model(ck.model, cfg))
    }
}

impl<M: SequenceDecoder> DreamInferenceEngine<M> {
    pub fn with_model(model: M, cfg: &InferenceConfig) -> Self {
        let (channels, timepoints) = model.input_shape();
        Self {
            model,
            normalizer: SignalNormalizer::new(channels, timepoints),
            estimator: ConfidenceEstimator::new(cfg.temperature),
            feature_dir: cfg.feature_dir.clone(),
            max_files: cfg.max_files,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn feature_dir(&self) -> &Path {
        &self.feature_dir
    }

    /// Decode one sample.
    pub fn predict<S: SignalInput>(&self, sample: S) -> Result<PredictionResult> {
        let signal = sample.into_signal()?;
        let x = self.normalizer.normalize(signal.view()).insert_axis(Axis(0));
        let logits = self.model.decode(x.view(), self.model.max_seq_len())?;
        if logits.len_of(Axis(0)) != 1 || logits.is_empty() {
            bail!("decoder returned logits of shape {:?}", logits.shape());
        }
        let logits_stats = LogitsStats::of(&logits);
        debug!(
            min = logits_stats.min,
            max = logits_stats.max,
            mean = logits_stats.mean,
            "raw logits"
        );

        let (scores, _probs) = self.estimator.scores(&logits);
        let tokens: Vec<usize> = logits
            .index_axis(Axis(0), 0)
            .rows()
            .into_iter()
            .map(argmax)
            .collect();
        Ok(PredictionResult {
            text: tokens_to_text(&tokens),
            tokens,
            confidence: scores.combined(),
            scores,
            logits_stats,
            file: None,
            epoch: None,
        })
    }

    /// Decode every epoch of `<feature_dir>/<file_name>`.
    ///
    /// A file without `raw_signals` is an error; a failing epoch is logged and
    /// skipped.
    pub fn predict_from_file(&self, file_name: &str) -> Result<Vec<PredictionResult>> {
        let path = self.feature_dir.join(file_name);
        let raw = read_raw_signals(&path)?;
        info!(file = file_name, n_epochs = raw.len_of(Axis(0)), shape = ?raw.shape(), "decoding file");

        let mut preds = Vec::with_capacity(raw.len_of(Axis(0)));
        for (epoch, sample) in raw.outer_iter().enumerate() {
            match self.predict(sample) {
                Ok(mut p) => {
                    debug!(file = file_name, epoch, confidence = p.confidence, "epoch decoded");
                    p.file = Some(file_name.to_string());
                    p.epoch = Some(epoch);
                    preds.push(p);
                }
                Err(e) => warn!(file = file_name, epoch, error = %e, "epoch failed; skipped"),
            }
        }
        Ok(preds)
    }

    /// Decode the first `max_files` feature files (by name). Files that fail
    /// are logged and skipped.
    pub fn batch_inference(&self) -> Result<Vec<PredictionResult>> {
        let files = list_feature_files(&self.feature_dir)?;
        if files.is_empty() {
            warn!(dir = %self.feature_dir.display(), "no feature files found");
            return Ok(vec![]);
        }
        let todo: Vec<&PathBuf> = files.iter().take(self.max_files).collect();
        info!(n_files = todo.len(), "running batch inference");

        let mut all = Vec::new();
        for (i, path) in todo.iter().enumerate() {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            match self.predict_from_file(name) {
                Ok(preds) => {
                    info!(file = name, index = i + 1, total = todo.len(), n_predictions = preds.len(), "file done");
                    for p in preds.iter().take(2) {
                        let preview: String = p.text.chars().take(50).collect();
                        info!(epoch = p.epoch, confidence = p.confidence, text = %preview, "sample prediction");
                    }
                    all.extend(preds);
                }
                Err(e) => warn!(file = name, error = %e, "file failed; skipped"),
            }
        }
        Ok(all)
    }
}

// ── Report ────────────────────────────────────────────────────────────────────

/// Render predictions as the plain-text results report.
pub fn format_predictions(preds: &[PredictionResult]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{REPORT_TITLE}");
    let _ = writeln!(out, "{}\n", "=".repeat(70));
    for p in preds {
        if let Some(file) = &p.file {
            let _ = writeln!(out, "File: {file}");
        }
        if let Some(epoch) = p.epoch {
            let _ = writeln!(out, "Epoch: {epoch}");
        }
        let s = &p.logits_stats;
        let _ = writeln!(out, "Dream Text: {}", p.text);
        let _ = writeln!(out, "Confidence: {:.6}", p.confidence);
        let _ = writeln!(out, "Raw Tokens: {:?}", p.tokens);
        let _ = writeln!(
            out,
            "Logits Stats: min={:.4}, max={:.4}, mean={:.4}, std={:.4}",
            s.min, s.max, s.mean, s.std
        );
        let _ = writeln!(out, "{}", "-".repeat(60));
    }
    out
}

/// Write the results report, creating parent directories.
pub fn save_predictions(preds: &[PredictionResult], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, format_predictions(preds))
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), n = preds.len(), "predictions saved");
    Ok(())
}
