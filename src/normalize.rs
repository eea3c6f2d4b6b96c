//! Fixed-shape normalisation of a single `(channels × time)` sample.
//!
//! `normalize` runs in two steps:
//!   1. pad or crop to `[max_channels, max_timepoints]`: zero rows/columns are
//!      appended, or the leading rows/columns are kept;
//!   2. global z-score over the whole padded tensor:
//!      `(x − μ) / (σ + 1e-8)` with the population σ.
//!
//! Padding happens before the statistics are taken, so the zero fill takes
//! part in μ and σ.
use ndarray::{s, Array2, ArrayView2};

/// Added to σ before dividing.
pub const STD_EPSILON: f64 = 1e-8;

/// Stateless pad/crop + z-score normaliser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalNormalizer {
    pub max_channels: usize,
    pub max_timepoints: usize,
}

impl SignalNormalizer {
    pub fn new(max_channels: usize, max_timepoints: usize) -> Self {
        Self { max_channels, max_timepoints }
    }

    /// Shape every output of [`normalize`](Self::normalize) has.
    pub fn output_shape(&self) -> (usize, usize) {
        (self.max_channels, self.max_timepoints)
    }

    pub fn normalize(&self, sample: ArrayView2<f32>) -> Array2<f32> {
        let mut out = pad_or_crop(sample, self.max_channels, self.max_timepoints);
        zscore_global_inplace(&mut out);
        out
    }
}

/// Zero-padded / truncated copy with shape `[max_channels, max_timepoints]`.
pub fn pad_or_crop(sample: ArrayView2<f32>, max_channels: usize, max_timepoints: usize) -> Array2<f32> {
    let (c, t) = sample.dim();
    let keep_c = c.min(max_channels);
    let keep_t = t.min(max_timepoints);
    let mut out = Array2::<f32>::zeros((max_channels, max_timepoints));
    out.slice_mut(s![..keep_c, ..keep_t])
        .assign(&sample.slice(s![..keep_c, ..keep_t]));
    out
}

/// Global z-score in place. Returns the `(mean, std)` that were removed.
///
/// Accumulates in f64; an all-constant input maps to zeros.
pub fn zscore_global_inplace(data: &mut Array2<f32>) -> (f32, f32) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let n = data.len() as f64;
    let mean = data.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = data
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let std = var.sqrt();
    let denom = std + STD_EPSILON;
    data.mapv_inplace(|v| ((v as f64 - mean) / denom) as f32);
    (mean as f32, std as f32)
}
