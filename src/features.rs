//! Per-epoch feature extraction.
//!
//! For `[N, C, T]` epochs at `sfreq` Hz:
//!
//! | group | entries | shape |
//! |---|---|---|
//! | raw | `raw_signals` | `[N, C, T]` |
//! | spectral | `<band>_power`: mean square of the 4th-order Butterworth band-passed signal | `[N, C]` |
//! | statistical | `mean`, `std` (population), `max`, `min`, `rms` | `[N, C]` |
//!
//! Band filtering is zero-phase (forward-backward second-order sections).
use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3, ArrayView1, Axis};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::filter::iir::{butter_bandpass, sosfiltfilt};

/// Butterworth order of the band-power filters.
pub const BAND_FILTER_ORDER: usize = 4;

/// Frequency bands used for band power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Band {
    Delta,
    Theta,
    Alpha,
    Beta,
    Gamma,
}

impl Band {
    pub const ALL: [Band; 5] = [Band::Delta, Band::Theta, Band::Alpha, Band::Beta, Band::Gamma];

    /// `(low, high)` edges in Hz.
    pub fn range(self) -> (f64, f64) {
        match self {
            Band::Delta => (0.5, 4.0),
            Band::Theta => (4.0, 8.0),
            Band::Alpha => (8.0, 13.0),
            Band::Beta => (13.0, 30.0),
            Band::Gamma => (30.0, 40.0),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Band::Delta => "delta",
            Band::Theta => "theta",
            Band::Alpha => "alpha",
            Band::Beta => "beta",
            Band::Gamma => "gamma",
        }
    }

    /// Entry name inside the spectral group, e.g. `alpha_power`.
    pub fn key(self) -> String {
        format!("{}_power", self.name())
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-(epoch, channel) summary statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Statistic {
    Mean,
    Std,
    Max,
    Min,
    Rms,
}

impl Statistic {
    pub const ALL: [Statistic; 5] =
        [Statistic::Mean, Statistic::Std, Statistic::Max, Statistic::Min, Statistic::Rms];

    pub fn name(self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Std => "std",
            Statistic::Max => "max",
            Statistic::Min => "min",
            Statistic::Rms => "rms",
        }
    }

    fn of(self, x: ArrayView1<f32>) -> f32 {
        let n = x.len().max(1) as f64;
        match self {
            Statistic::Mean => (x.iter().map(|&v| v as f64).sum::<f64>() / n) as f32,
            Statistic::Std => {
                let m = x.iter().map(|&v| v as f64).sum::<f64>() / n;
                (x.iter().map(|&v| (v as f64 - m).powi(2)).sum::<f64>() / n).sqrt() as f32
            }
            Statistic::Max => x.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            Statistic::Min => x.iter().copied().fold(f32::INFINITY, f32::min),
            Statistic::Rms => (x.iter().map(|&v| (v as f64).powi(2)).sum::<f64>() / n).sqrt() as f32,
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything persisted for one recording.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBundle {
    /// `[N, C, T]` epochs.
    pub raw_signals: Array3<f32>,
    /// `[N, C]` band power per band.
    pub spectral: BTreeMap<Band, Array2<f32>>,
    /// `[N, C]` per statistic.
    pub statistical: BTreeMap<Statistic, Array2<f32>>,
}

impl FeatureBundle {
    pub fn n_epochs(&self) -> usize {
        self.raw_signals.len_of(Axis(0))
    }

    /// Check that every tensor shares the epoch axis and the channel axis.
    pub fn validate(&self) -> Result<()> {
        let (n, c, _) = self.raw_signals.dim();
        let tables = self
            .spectral
            .iter()
            .map(|(b, a)| (b.key(), a))
            .chain(self.statistical.iter().map(|(s, a)| (s.name().to_string(), a)));
        for (name, arr) in tables {
            if arr.dim() != (n, c) {
                bail!("feature '{name}' has shape {:?}, expected ({n}, {c})", arr.dim());
            }
        }
        Ok(())
    }
}

/// Computes a [`FeatureBundle`] from epoched data.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn extract(&self, epochs: &Array3<f32>, sfreq: f32) -> Result<FeatureBundle> {
        let (n, c, t) = epochs.dim();
        debug!(n_epochs = n, n_channels = c, n_times = t, sfreq, "extracting features");

        let mut spectral = BTreeMap::new();
        for band in Band::ALL {
            let (lo, hi) = band.range();
            let sos = butter_bandpass(BAND_FILTER_ORDER, lo, hi, sfreq as f64)
                .with_context(|| format!("designing {band} band filter at {sfreq} Hz"))?;
            let mut power = Array2::<f32>::zeros((n, c));
            for ((e, ch), p) in power.indexed_iter_mut() {
                let x = epochs.slice(ndarray::s![e, ch, ..]).to_vec();
                let y = sosfiltfilt(&sos, &x);
                *p = (y.iter().map(|&v| (v as f64).powi(2)).sum::<f64>() / t.max(1) as f64) as f32;
            }
            spectral.insert(band, power);
        }

        let statistical = Statistic::ALL
            .iter()
            .map(|&stat| {
                let table = Array2::from_shape_fn((n, c), |(e, ch)| {
                    stat.of(epochs.slice(ndarray::s![e, ch, ..]))
                });
                (stat, table)
            })
            .collect();

        let bundle = FeatureBundle { raw_signals: epochs.clone(), spectral, statistical };
        bundle.validate()?;
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine_epochs(freq: f32, sfreq: f32, n: usize, c: usize, t: usize) -> Array3<f32> {
        Array3::from_shape_fn((n, c, t), |(_, _, i)| (2.0 * PI * freq * i as f32 / sfreq).sin())
    }

    #[test]
    fn bundle_tables_share_first_axis() {
        let epochs = sine_epochs(10.0, 100.0, 3, 2, 500);
        let b = FeatureExtractor.extract(&epochs, 100.0).unwrap();
        assert_eq!(b.n_epochs(), 3);
        assert_eq!(b.spectral.len(), 5);
        assert_eq!(b.statistical.len(), 5);
        for arr in b.spectral.values().chain(b.statistical.values()) {
            assert_eq!(arr.dim(), (3, 2));
        }
    }

    #[test]
    fn alpha_sine_puts_power_in_alpha() {
        let epochs = sine_epochs(10.0, 100.0, 1, 1, 3000);
        let b = FeatureExtractor.extract(&epochs, 100.0).unwrap();
        let alpha = b.spectral[&Band::Alpha][[0, 0]];
        // sin² averages to 0.5
        approx::assert_abs_diff_eq!(alpha, 0.5, epsilon = 0.05);
        for band in [Band::Delta, Band::Theta, Band::Gamma] {
            assert!(b.spectral[&band][[0, 0]] < 0.01, "{band} leaked");
        }
    }

    #[test]
    fn statistics_of_a_ramp() {
        let epochs = Array3::from_shape_fn((1, 1, 4), |(_, _, i)| i as f32); // 0 1 2 3
        let b = FeatureExtractor.extract(&epochs, 100.0).unwrap();
        let get = |s: Statistic| b.statistical[&s][[0, 0]];
        approx::assert_abs_diff_eq!(get(Statistic::Mean), 1.5);
        approx::assert_abs_diff_eq!(get(Statistic::Std), 1.25_f32.sqrt(), epsilon = 1e-6);
        assert_eq!(get(Statistic::Max), 3.0);
        assert_eq!(get(Statistic::Min), 0.0);
        approx::assert_abs_diff_eq!(get(Statistic::Rms), 3.5_f32.sqrt(), epsilon = 1e-6);
    }

    #[test]
    fn gamma_band_needs_rate_above_80hz() {
        let epochs = Array3::<f32>::zeros((1, 1, 100));
        assert!(FeatureExtractor.extract(&epochs, 64.0).is_err());
    }

    #[test]
    fn band_keys() {
        assert_eq!(Band::Delta.key(), "delta_power");
        assert_eq!(Band::Gamma.range(), (30.0, 40.0));
    }

    #[test]
    fn validate_catches_short_table() {
        let mut b = FeatureExtractor.extract(&Array3::zeros((2, 1, 50)), 100.0).unwrap();
        b.statistical.insert(Statistic::Mean, Array2::zeros((1, 1)));
        assert!(b.validate().is_err());
    }
}
