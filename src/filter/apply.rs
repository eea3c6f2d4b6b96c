//! Overlap-add zero-phase FIR convolution.
//!
//! Zero phase comes from shifting the output left by `(N-1)/2` samples on a
//! symmetric kernel. Edge transients are suppressed by odd-reflection padding
//! of `N-1` samples on each side, stripped again afterwards.
use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView1};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// A FIR kernel prepared for a fixed signal length: FFT size chosen, kernel
/// spectrum and plans computed once, then reused for every channel.
pub struct OverlapAdd {
    n_h: usize,
    n_fft: usize,
    h_fft: Vec<Complex<f32>>,
    fwd: Arc<dyn Fft<f32>>,
    inv: Arc<dyn Fft<f32>>,
}

impl OverlapAdd {
    /// Plan filtering of `n_x`-sample signals with the odd-length kernel `h`.
    pub fn new(h: &[f32], n_x: usize) -> Result<Self> {
        let n_h = h.len();
        if n_h % 2 == 0 {
            bail!("zero-phase FIR needs an odd kernel length, got {n_h}");
        }
        let n_ext = n_x + 2 * (n_h - 1);
        let n_fft = choose_fft_len(n_h, n_ext);

        let mut planner: FftPlanner<f32> = FftPlanner::new();
        let fwd = planner.plan_fft_forward(n_fft);
        let inv = planner.plan_fft_inverse(n_fft);

        let mut h_fft = complex_padded(h, n_fft);
        fwd.process(&mut h_fft);

        Ok(Self { n_h, n_fft, h_fft, fwd, inv })
    }

    /// Filter one signal; output has the same length as `x`.
    pub fn filter(&self, x: &[f32]) -> Vec<f32> {
        let n_x = x.len();
        if n_x == 0 {
            return vec![];
        }
        let shift = (self.n_h - 1) / 2;
        let n_edge = self.n_h - 1;
        let x_ext = odd_reflect_pad(x, n_edge, n_edge);
        let n_ext = x_ext.len();

        let n_seg = self.n_fft - self.n_h + 1;
        let inv_scale = 1.0 / self.n_fft as f32;
        let mut y = vec![0.0_f32; n_ext];

        for start in (0..n_ext).step_by(n_seg) {
            let stop = (start + n_seg).min(n_ext);
            let mut buf = complex_padded(&x_ext[start..stop], self.n_fft);
            self.fwd.process(&mut buf);
            for (b, &hf) in buf.iter_mut().zip(&self.h_fft) {
                *b *= hf;
            }
            self.inv.process(&mut buf);

            // Accumulate, shifted left by `shift` for zero phase.
            let out_start = start.saturating_sub(shift);
            let out_end = (out_start + self.n_fft).min(n_ext);
            let prod_start = shift.saturating_sub(start);
            for (o, p) in (out_start..out_end).zip(prod_start..self.n_fft) {
                y[o] += buf[p].re * inv_scale;
            }
        }

        y[n_edge..n_edge + n_x].to_vec()
    }
}

/// Apply a zero-phase FIR kernel to every row of `data` ([C, T]) in place.
pub fn apply_fir_zero_phase(data: &mut Array2<f32>, h: &[f32]) -> Result<()> {
    let ola = OverlapAdd::new(h, data.ncols())?;
    for mut row in data.rows_mut() {
        let filtered = ola.filter(&row.to_vec());
        row.assign(&ArrayView1::from(&filtered));
    }
    Ok(())
}

/// Filter a single signal (plans a fresh [`OverlapAdd`]).
pub fn filter_1d(x: &[f32], h: &[f32]) -> Result<Vec<f32>> {
    Ok(OverlapAdd::new(h, x.len())?.filter(x))
}

/// Odd reflection about the end samples, zero-filled beyond the signal:
///
/// left `pad[i] = 2·x[0] − x[i]`, right `pad[i] = 2·x[n−1] − x[n−1−i]`.
pub(crate) fn odd_reflect_pad(x: &[f32], n_l: usize, n_r: usize) -> Vec<f32> {
    let n = x.len();
    if n == 0 {
        return vec![0.0; n_l + n_r];
    }
    let refl_l = n_l.min(n - 1);
    let refl_r = n_r.min(n - 1);
    let first = x[0];
    let last = x[n - 1];

    let mut out = Vec::with_capacity(n_l + n + n_r);
    out.extend(std::iter::repeat(0.0).take(n_l - refl_l));
    out.extend((1..=refl_l).rev().map(|i| 2.0 * first - x[i]));
    out.extend_from_slice(x);
    out.extend((1..=refl_r).map(|i| 2.0 * last - x[n - 1 - i]));
    out.extend(std::iter::repeat(0.0).take(n_r - refl_r));
    out
}

/// Power-of-two FFT size minimising
/// `ceil(n_x / (N − n_h + 1)) · N · (log2 N + 1) + 4e-5 · N · n_x`.
fn choose_fft_len(n_h: usize, n_x: usize) -> usize {
    let min_fft = 2 * n_h - 1;
    let max_pow = (n_x as f64).log2().ceil() as u32 + 1;
    let min_pow = (min_fft as f64).log2().ceil() as u32;

    (min_pow..=max_pow.max(min_pow))
        .map(|pow| {
            let n = 1_usize << pow;
            let n_seg = (n - n_h + 1) as f64;
            let cost = (n_x as f64 / n_seg).ceil() * n as f64 * (pow as f64 + 1.0)
                + 4e-5 * n as f64 * n_x as f64;
            (n, cost)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(n, _)| n)
        .unwrap_or(1 << max_pow)
}

fn complex_padded(x: &[f32], n: usize) -> Vec<Complex<f32>> {
    x.iter()
        .map(|&v| Complex { re: v, im: 0.0 })
        .chain(std::iter::repeat(Complex::default()))
        .take(n)
        .collect()
}
