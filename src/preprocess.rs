//! Recording → feature file.
//!
//! Each recording walks the stages
//!
//! ```text
//! Load → SelectChannels → Filter → Resample → Epoch → ExtractFeatures → Persist
//! ```
//!
//! and any stage may fail, in which case the error carries the stage name.
//! [`process_all`] runs every discovered file, logging and skipping
//! failures; one bad file never stops the batch.
use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::channels::select_channels;
use crate::config::PipelineConfig;
use crate::epoch::epoch_overlapping;
use crate::features::{FeatureBundle, FeatureExtractor};
use crate::filter::{apply_fir_zero_phase, design_bandpass, design_notch};
use crate::recording::RawRecording;
use crate::resample::resample;
use crate::store::{feature_file_name, write_bundle, FEATURE_SUFFIX};

/// Pipeline stage, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    SelectChannels,
    Filter,
    Resample,
    Epoch,
    ExtractFeatures,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Load => "load",
            Stage::SelectChannels => "select-channels",
            Stage::Filter => "filter",
            Stage::Resample => "resample",
            Stage::Epoch => "epoch",
            Stage::ExtractFeatures => "extract-features",
            Stage::Persist => "persist",
        };
        f.write_str(s)
    }
}

/// Runs the in-memory stages for one recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingPreprocessor {
    pub cfg: PipelineConfig,
}

impl RecordingPreprocessor {
    pub fn new(cfg: PipelineConfig) -> Self {
        Self { cfg }
    }

    /// Crop, select, filter, resample, epoch and extract features.
    pub fn preprocess(&self, mut rec: RawRecording) -> Result<FeatureBundle> {
        let cfg = &self.cfg;

        if rec.crop(cfg.max_duration) {
            debug!(max_duration = cfg.max_duration, "cropped recording");
        }

        let picks = select_channels(&rec.ch_names, self.cfg.max_channels);
        rec.pick_channels(&picks)
            .with_context(|| format!("stage {}", Stage::SelectChannels))?;
        debug!(n_channels = picks.len(), "channels selected");

        self.filter(&mut rec)
            .with_context(|| format!("stage {}", Stage::Filter))?;

        let data = resample(&rec.data, rec.sfreq, cfg.target_sfreq)
            .with_context(|| format!("stage {}", Stage::Resample))?;

        let epochs = epoch_overlapping(data.view(), cfg.epoch_samples(), cfg.step_samples())
            .with_context(|| format!("stage {}", Stage::Epoch))?;
        if epochs.is_empty() {
            bail!(
                "stage {}: {} samples at {} Hz is shorter than one {} s epoch",
                Stage::Epoch,
                data.ncols(),
                cfg.target_sfreq,
                cfg.epoch_length
            );
        }

        FeatureExtractor
            .extract(&epochs, cfg.target_sfreq)
            .with_context(|| format!("stage {}", Stage::ExtractFeatures))
    }

    /// Band-pass, then notch when the notch is realisable at this rate.
    fn filter(&self, rec: &mut RawRecording) -> Result<()> {
        let cfg = &self.cfg;
        let h = design_bandpass(cfg.l_freq, cfg.h_freq, rec.sfreq);
        apply_fir_zero_phase(&mut rec.data, &h)?;

        if let Some(freq) = cfg.notch_freq {
            match design_notch(freq, rec.sfreq) {
                Some(h) => apply_fir_zero_phase(&mut rec.data, &h)?,
                None => warn!(freq, sfreq = rec.sfreq, "notch above Nyquist, skipped"),
            }
        }
        Ok(())
    }

    /// Load `path`, preprocess it and write `<out_dir>/<basename>_features…`.
    /// Returns the number of epochs written.
    pub fn process_file(&self, path: &Path, out_dir: &Path) -> Result<usize> {
        let rec = RawRecording::load(path).with_context(|| format!("stage {}", Stage::Load))?;
        info!(
            file = %path.display(),
            n_channels = rec.n_channels(),
            sfreq = rec.sfreq,
            duration = rec.duration_secs(),
            "loaded"
        );
        let bundle = self.preprocess(rec)?;

        let out = out_dir.join(feature_file_name(&basename(path)));
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("stage {}: creating {}", Stage::Persist, out_dir.display()))?;
        write_bundle(&bundle, &out).with_context(|| format!("stage {}", Stage::Persist))?;
        info!(out = %out.display(), n_epochs = bundle.n_epochs(), "features saved");
        Ok(bundle.n_epochs())
    }

    /// Process every recording under `data_dir`.
    pub fn process_all(&self, data_dir: &Path, out_dir: &Path) -> Result<BatchSummary> {
        let files = discover_files(data_dir)?;
        info!(n_files = files.len(), dir = %data_dir.display(), "processing recordings");

        let mut summary = BatchSummary::default();
        for (i, path) in files.iter().enumerate() {
            info!(index = i + 1, total = files.len(), file = %path.display(), "processing");
            match self.process_file(path, out_dir) {
                Ok(n) => {
                    summary.succeeded += 1;
                    summary.total_epochs += n;
                }
                Err(e) => {
                    error!(file = %path.display(), error = format!("{e:#}"), "failed");
                    summary.failed.push(path.display().to_string());
                }
            }
        }
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            total_epochs = summary.total_epochs,
            "batch complete"
        );
        Ok(summary)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    /// Paths of the recordings that failed.
    pub failed: Vec<String>,
    pub total_epochs: usize,
}

/// File name without its recording extension (`.edf`, `.safetensors`, `.safetensors.gz`).
pub fn basename(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lower = name.to_lowercase();
    for ext in [".safetensors.gz", ".safetensors", ".edf"] {
        if lower.ends_with(ext) {
            return name[..name.len() - ext.len()].to_string();
        }
    }
    name
}

fn is_recording(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.ends_with(FEATURE_SUFFIX) {
        return false;
    }
    name.ends_with(".edf") || name.ends_with(".safetensors") || name.ends_with(".safetensors.gz")
}

/// Recordings under `dir`, recursively, sorted by path.
pub fn discover_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let entries = std::fs::read_dir(&d).with_context(|| format!("reading {}", d.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if is_recording(&path) {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Dataset family, by file-name convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    /// Sleep-EDF cassette (`SC4…`).
    SleepCassette,
    /// Sleep-EDF telemetry (`ST7…`).
    SleepTelemetry,
    /// EEGMMIDB imagery runs (`S0…R01`, `S0…R02`).
    MotorImagery,
    /// EEGMMIDB movement runs (`S0…R03`, `S0…R04`).
    MotorMovement,
    Other,
}

impl DatasetKind {
    pub fn of(name: &str) -> Self {
        if name.starts_with("SC4") {
            DatasetKind::SleepCassette
        } else if name.starts_with("ST7") {
            DatasetKind::SleepTelemetry
        } else if name.starts_with("S0") && (name.contains("R01") || name.contains("R02")) {
            DatasetKind::MotorImagery
        } else if name.starts_with("S0") && (name.contains("R03") || name.contains("R04")) {
            DatasetKind::MotorMovement
        } else {
            DatasetKind::Other
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetCounts {
    pub sleep_cassette: usize,
    pub sleep_telemetry: usize,
    pub motor_imagery: usize,
    pub motor_movement: usize,
    pub other: usize,
}

impl DatasetCounts {
    pub fn total(&self) -> usize {
        self.sleep_cassette + self.sleep_telemetry + self.motor_imagery + self.motor_movement + self.other
    }
}

/// Count discovered recordings per dataset family.
pub fn analyze_dataset(data_dir: &Path) -> Result<DatasetCounts> {
    let mut counts = DatasetCounts::default();
    for path in discover_files(data_dir)? {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match DatasetKind::of(&name) {
            DatasetKind::SleepCassette => counts.sleep_cassette += 1,
            DatasetKind::SleepTelemetry => counts.sleep_telemetry += 1,
            DatasetKind::MotorImagery => counts.motor_imagery += 1,
            DatasetKind::MotorMovement => counts.motor_movement += 1,
            DatasetKind::Other => counts.other += 1,
        }
    }
    info!(
        total = counts.total(),
        sleep_cassette = counts.sleep_cassette,
        sleep_telemetry = counts.sleep_telemetry,
        motor_imagery = counts.motor_imagery,
        motor_movement = counts.motor_movement,
        other = counts.other,
        "dataset analysis"
    );
    Ok(counts)
}
