//! Butterworth band-pass filters as cascaded second-order sections.
//!
//! Design follows the classic analog-prototype route:
//!
//! ```text
//! prototype poles  p_k = exp(iπ(2k + N + 1) / 2N)
//!   → pre-warp edges     ω = 2·fs·tan(π·f / fs)
//!   → low-pass→band-pass p ↦ p·bw/2 ± √((p·bw/2)² − ω0²),  N zeros at 0
//!   → bilinear transform z = (2fs + s) / (2fs − s),  N extra zeros at −1
//!   → one section per conjugate pole pair, zeros {+1, −1}
//! ```
//!
//! Filtering is zero-phase: forward then backward through the cascade, with
//! odd-reflection padding and steady-state initial conditions so the edges do
//! not ring.
use anyhow::{bail, Result};
use rustfft::num_complex::Complex64;
use std::f64::consts::PI;

use super::apply::odd_reflect_pad;

/// One biquad: `b = [b0, b1, b2]`, `a = [1, a1, a2]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sos {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

/// Design an `order`-th order Butterworth band-pass (`2 · order` poles).
pub fn butter_bandpass(order: usize, low: f64, high: f64, sfreq: f64) -> Result<Vec<Sos>> {
    let nyq = sfreq / 2.0;
    if order == 0 || order % 2 == 1 {
        bail!("band-pass order must be even and positive, got {order}");
    }
    if !(0.0 < low && low < high && high < nyq) {
        bail!("band edges must satisfy 0 < {low} < {high} < {nyq} Hz");
    }

    let fs2 = 2.0 * sfreq;
    let wl = fs2 * (PI * low / sfreq).tan();
    let wh = fs2 * (PI * high / sfreq).tan();
    let bw = wh - wl;
    let w0_sq = wl * wh;

    // Analog band-pass poles.
    let mut analog = Vec::with_capacity(2 * order);
    for k in 0..order {
        let theta = PI * (2 * k + order + 1) as f64 / (2 * order) as f64;
        let p_lp = Complex64::from_polar(1.0, theta) * (bw / 2.0);
        let root = (p_lp * p_lp - w0_sq).sqrt();
        analog.push(p_lp + root);
        analog.push(p_lp - root);
    }

    // Gain: bw^N from the transform, then bilinear (2fs)^N / Π(2fs − p).
    let denom = analog.iter().fold(Complex64::new(1.0, 0.0), |acc, p| acc * (fs2 - *p));
    let gain = (Complex64::new((bw * fs2).powi(order as i32), 0.0) / denom).re;

    let digital: Vec<Complex64> = analog.iter().map(|&p| (fs2 + p) / (fs2 - p)).collect();

    // Conjugate pairs: keep the upper-half-plane member of each.
    let mut upper: Vec<Complex64> = digital.iter().copied().filter(|p| p.im > 0.0).collect();
    if upper.len() != order {
        bail!("unexpected pole layout: {} complex pairs for order {order}", upper.len());
    }
    upper.sort_by(|a, b| a.norm().total_cmp(&b.norm()));

    let sections = upper
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let g = if i == 0 { gain } else { 1.0 };
            Sos { b: [g, 0.0, -g], a: [1.0, -2.0 * p.re, p.norm_sqr()] }
        })
        .collect();
    Ok(sections)
}

/// Steady-state initial conditions for a unit step, per section.
///
/// Scale by the first input sample before filtering.
pub fn sosfilt_zi(sos: &[Sos]) -> Vec<[f64; 2]> {
    let mut scale = 1.0;
    sos.iter()
        .map(|s| {
            let [b0, b1, b2] = s.b;
            let [_, a1, a2] = s.a;
            let det = 1.0 + a1 + a2;
            let r0 = b1 - a1 * b0;
            let r1 = b2 - a2 * b0;
            let z0 = (r0 + r1) / det;
            let z1 = r1 - a2 * z0;
            let zi = [scale * z0, scale * z1];
            scale *= (b0 + b1 + b2) / det;
            zi
        })
        .collect()
}

/// Causal cascade filter (transposed direct form II) with explicit state.
pub fn sosfilt(sos: &[Sos], x: &mut [f64], zi: &mut [[f64; 2]]) {
    for (s, z) in sos.iter().zip(zi.iter_mut()) {
        let [b0, b1, b2] = s.b;
        let [_, a1, a2] = s.a;
        for v in x.iter_mut() {
            let xin = *v;
            let y = b0 * xin + z[0];
            z[0] = b1 * xin - a1 * y + z[1];
            z[1] = b2 * xin - a2 * y;
            *v = y;
        }
    }
}

/// Number of padding samples used by [`sosfiltfilt`].
pub fn padlen(sos: &[Sos]) -> usize {
    3 * (2 * sos.len() + 1)
}

/// Zero-phase forward-backward filtering of one signal.
pub fn sosfiltfilt(sos: &[Sos], x: &[f32]) -> Vec<f32> {
    let n = x.len();
    if n == 0 {
        return vec![];
    }
    let edge = padlen(sos).min(n - 1);
    let mut ext: Vec<f64> = odd_reflect_pad(x, edge, edge).iter().map(|&v| v as f64).collect();
    let zi = sosfilt_zi(sos);

    let x0 = ext[0];
    let mut state: Vec<[f64; 2]> = zi.iter().map(|z| [z[0] * x0, z[1] * x0]).collect();
    sosfilt(sos, &mut ext, &mut state);

    ext.reverse();
    let y0 = ext[0];
    let mut state: Vec<[f64; 2]> = zi.iter().map(|z| [z[0] * y0, z[1] * y0]).collect();
    sosfilt(sos, &mut ext, &mut state);
    ext.reverse();

    ext[edge..edge + n].iter().map(|&v| v as f32).collect()
}
