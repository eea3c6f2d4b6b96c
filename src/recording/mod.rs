//! Continuous raw recordings and their loaders.
//!
//! - [`edf`]: EDF / EDF+ files (the usual sleep and motor-imagery datasets).
//! - [`RawRecording::from_safetensors`]: `raw.safetensors` with `data` `[C, T]`,
//!   `sfreq` `[1]` and an optional newline-joined `ch_names` byte entry.
pub mod edf;

use anyhow::{bail, Context, Result};
use ndarray::{s, Array2, Axis};
use std::path::Path;

use crate::io::StFile;

pub use edf::{parse_edf, read_edf, EdfHeader, SignalHeader};

/// A multi-channel recording, mutated in place while it is preprocessed.
#[derive(Debug, Clone)]
pub struct RawRecording {
    /// `[C, T]` samples in volts.
    pub data: Array2<f32>,
    /// Sampling rate in Hz.
    pub sfreq: f32,
    /// One label per row of `data`.
    pub ch_names: Vec<String>,
}

impl RawRecording {
    pub fn new(data: Array2<f32>, sfreq: f32, ch_names: Vec<String>) -> Result<Self> {
        if ch_names.len() != data.nrows() {
            bail!("{} channel names for {} data rows", ch_names.len(), data.nrows());
        }
        if !(sfreq > 0.0) {
            bail!("sampling rate must be positive, got {sfreq}");
        }
        Ok(Self { data, sfreq, ch_names })
    }

    /// Load a recording, choosing the reader from the file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "edf" => read_edf(path),
            "safetensors" | "gz" => Self::from_safetensors(path),
            other => bail!("unsupported recording format '.{other}': {}", path.display()),
        }
    }

    /// Read a `raw.safetensors` container.
    ///
    /// Missing `ch_names` yields `EEG 000`, `EEG 001`, … so that channel
    /// selection still recognises every row as EEG.
    pub fn from_safetensors(path: &Path) -> Result<Self> {
        let f = StFile::open(path)?;
        let data = f.f32_array2("data")?;
        let sfreq = *f
            .f32_tensor("sfreq")?
            .iter()
            .next()
            .context("empty 'sfreq' entry")?;

        let ch_names = if f.contains("ch_names") {
            std::str::from_utf8(f.bytes("ch_names")?)?
                .split('\n')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        } else {
            (0..data.nrows()).map(|i| format!("EEG {i:03}")).collect()
        };

        Self::new(data, sfreq, ch_names)
            .with_context(|| format!("invalid recording {}", path.display()))
    }

    #[inline]
    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    #[inline]
    pub fn n_times(&self) -> usize {
        self.data.ncols()
    }

    /// Time of the last sample in seconds (`(T - 1) / sfreq`).
    pub fn last_time(&self) -> f64 {
        self.n_times().saturating_sub(1) as f64 / self.sfreq as f64
    }

    /// Total duration in seconds (`T / sfreq`).
    pub fn duration_secs(&self) -> f64 {
        self.n_times() as f64 / self.sfreq as f64
    }

    /// Keep only samples with time `≤ tmax`. Returns `true` if anything was cut.
    pub fn crop(&mut self, tmax: f64) -> bool {
        if self.last_time() <= tmax {
            return false;
        }
        let keep = ((tmax * self.sfreq as f64).floor() as usize + 1).min(self.n_times());
        self.data = self.data.slice(s![.., ..keep]).to_owned();
        true
    }

    /// Keep the named channels, in the given order.
    ///
    /// A label that occurs more than once resolves to a different row each
    /// time it is named: the first mention takes the first unused match.
    pub fn pick_channels(&mut self, names: &[String]) -> Result<()> {
        let mut used = vec![false; self.ch_names.len()];
        let idx = names
            .iter()
            .map(|n| {
                let i = self
                    .ch_names
                    .iter()
                    .enumerate()
                    .position(|(i, c)| c == n && !used[i])
                    .with_context(|| format!("channel '{n}' not in recording"))?;
                used[i] = true;
                Ok(i)
            })
            .collect::<Result<Vec<usize>>>()?;
        self.data = self.data.select(Axis(0), &idx);
        self.ch_names = names.to_vec();
        Ok(())
    }
}
