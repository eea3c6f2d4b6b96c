//! FFT resampling of `[C, T]` recordings to the pipeline rate.
//!
//! Each row is odd-reflection padded to a power-of-two friendly length,
//! transformed, truncated or zero-extended in the frequency domain, and
//! inverse-transformed at the new length:
//!
//! ```text
//! pad (min(T/8, 100)·2 samples, rounded up to 2^k)
//!   → FFT(old_len)
//!   → Nyquist bin ×2 when shrinking, ×0.5 when growing (even lengths)
//!   → scale by new_len / old_len
//!   → inverse FFT(new_len) over the Hermitian-completed half spectrum
//!   → strip round(ratio · pad) samples from each side
//! ```
//!
//! Output length is `round(T · dst / src)`.
use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView1};
use rustfft::num_complex::Complex64;
use rustfft::FftPlanner;
use tracing::debug;

use crate::filter::apply::odd_reflect_pad;

/// Rates closer than this are treated as equal and the data is passed through.
pub const RATE_TOLERANCE: f32 = 1e-3;

/// Left/right padding: `min(n / 8, 100) · 2` extra samples, rounded up so the
/// padded length is a power of two.
pub fn auto_npad(n: usize) -> (usize, usize) {
    let min_add = (n / 8).min(100) * 2;
    let total = (n + min_add).next_power_of_two() - n;
    (total / 2, total - total / 2)
}

/// Output length for `n` input samples.
pub fn resampled_len(n: usize, src_sfreq: f32, dst_sfreq: f32) -> usize {
    (n as f64 * dst_sfreq as f64 / src_sfreq as f64).round() as usize
}

/// Resample every row of `data` from `src_sfreq` to `dst_sfreq`.
///
/// Returns the input unchanged when the rates already match.
pub fn resample(data: &Array2<f32>, src_sfreq: f32, dst_sfreq: f32) -> Result<Array2<f32>> {
    if !(src_sfreq > 0.0 && dst_sfreq > 0.0) {
        bail!("sampling rates must be positive (src {src_sfreq}, dst {dst_sfreq})");
    }
    if (src_sfreq - dst_sfreq).abs() < RATE_TOLERANCE {
        return Ok(data.clone());
    }
    let ratio = dst_sfreq as f64 / src_sfreq as f64;
    let n_in = data.ncols();
    let n_out = resampled_len(n_in, src_sfreq, dst_sfreq);
    let npad = auto_npad(n_in);
    debug!(src_sfreq, dst_sfreq, n_in, n_out, "resampling");

    let mut planner = FftPlanner::new();
    let mut out = Array2::<f32>::zeros((data.nrows(), n_out));
    for (row, mut dst) in data.rows().into_iter().zip(out.rows_mut()) {
        let y = resample_row(&mut planner, &row.to_vec(), ratio, npad);
        dst.assign(&ArrayView1::from(&y));
    }
    Ok(out)
}

/// Resample one signal by `ratio` with explicit padding.
pub fn resample_1d(x: &[f32], ratio: f64, npad: (usize, usize)) -> Vec<f32> {
    resample_row(&mut FftPlanner::new(), x, ratio, npad)
}

fn resample_row(
    planner: &mut FftPlanner<f64>,
    x: &[f32],
    ratio: f64,
    (npad_l, npad_r): (usize, usize),
) -> Vec<f32> {
    let n_in = x.len();
    if n_in == 0 {
        return vec![];
    }
    let n_out = (ratio * n_in as f64).round() as usize;

    let mut spec: Vec<Complex64> = odd_reflect_pad(x, npad_l, npad_r)
        .iter()
        .map(|&v| Complex64::new(v as f64, 0.0))
        .collect();
    let old_len = spec.len();
    let new_len = (ratio * old_len as f64).round() as usize;
    planner.plan_fft_forward(old_len).process(&mut spec);
    spec.truncate(old_len / 2 + 1);

    let shrinking = new_len < old_len;
    let use_len = if shrinking { new_len } else { old_len };
    if use_len % 2 == 0 {
        if let Some(bin) = spec.get_mut(use_len / 2) {
            *bin *= if shrinking { 2.0 } else { 0.5 };
        }
    }

    // Half spectrum (scaled) into a full-length Hermitian buffer.
    let scale = new_len as f64 / old_len as f64;
    let half = new_len / 2 + 1;
    let mut buf = vec![Complex64::default(); new_len];
    for (dst, src) in buf.iter_mut().zip(spec.iter().take(half)) {
        *dst = *src * scale;
    }
    for i in 1..half {
        let mirror = new_len - i;
        if mirror >= half {
            buf[mirror] = buf[i].conj();
        }
    }
    planner.plan_fft_inverse(new_len).process(&mut buf);

    let strip_l = (ratio * npad_l as f64).round() as usize;
    let inv_n = 1.0 / new_len as f64;
    let mut y: Vec<f32> = buf
        .iter()
        .skip(strip_l)
        .take(n_out)
        .map(|c| (c.re * inv_n) as f32)
        .collect();
    y.resize(n_out, 0.0);
    y
}
