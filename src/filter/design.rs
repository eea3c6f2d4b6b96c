//! Windowed-sinc FIR design (Hamming window).
//!
//! Transition bandwidths and lengths follow MNE's `filter_length='auto'`:
//!   • low edge:  `min(max(0.25 · l_freq, 2.0), l_freq)`
//!   • high edge: `min(max(0.25 · h_freq, 2.0), sfreq/2 − h_freq)`
//!   • length:    `ceil(3.3 / min(bandwidths) · sfreq)`, rounded to odd
//!
//! Every kernel is built from unit-DC-gain lowpass prototypes with cutoffs at
//! the middle of each transition band:
//!   • highpass = δ − LP(l)
//!   • bandpass = LP(h) − LP(l)
//!   • notch    = δ − (LP(hi) − LP(lo))
use std::f64::consts::PI;

/// Default power-line notch width divisor (`width = freq / 200`).
pub const NOTCH_WIDTH_DIVISOR: f32 = 200.0;

/// Default notch transition bandwidth in Hz.
pub const NOTCH_TRANS_BANDWIDTH: f32 = 1.0;

/// Transition bandwidth for the low (highpass) edge.
pub fn auto_trans_bandwidth(l_freq: f32) -> f32 {
    (0.25 * l_freq).max(2.0).min(l_freq)
}

/// Transition bandwidth for the high (lowpass) edge.
pub fn auto_h_trans_bandwidth(h_freq: f32, sfreq: f32) -> f32 {
    (0.25 * h_freq).max(2.0).min(sfreq / 2.0 - h_freq)
}

/// Number of taps for a transition bandwidth: `ceil(3.3 / trans_bw · sfreq)`, odd.
pub fn auto_filter_length(trans_bw: f32, sfreq: f32) -> usize {
    let n_raw = (3.3 / trans_bw * sfreq).ceil() as usize;
    if n_raw % 2 == 0 { n_raw + 1 } else { n_raw }
}

/// Zero-phase highpass at `l_freq`.
pub fn design_highpass(l_freq: f32, sfreq: f32) -> Vec<f32> {
    let trans_bw = auto_trans_bandwidth(l_freq);
    let n = auto_filter_length(trans_bw, sfreq);
    let h = firwin(n, l_freq - trans_bw / 2.0, sfreq, false);
    h.iter().map(|&v| v as f32).collect()
}

/// Zero-phase bandpass `[l_freq, h_freq]`.
///
/// Falls back to a pure highpass when `h_freq` is at or above Nyquist.
pub fn design_bandpass(l_freq: f32, h_freq: f32, sfreq: f32) -> Vec<f32> {
    if h_freq >= sfreq / 2.0 {
        return design_highpass(l_freq, sfreq);
    }
    let l_tb = auto_trans_bandwidth(l_freq);
    let h_tb = auto_h_trans_bandwidth(h_freq, sfreq);
    let n = auto_filter_length(l_tb.min(h_tb), sfreq);

    let lp_high = firwin(n, h_freq + h_tb / 2.0, sfreq, true);
    let lp_low  = firwin(n, l_freq - l_tb / 2.0, sfreq, true);
    lp_high.iter().zip(&lp_low).map(|(a, b)| (a - b) as f32).collect()
}

/// Zero-phase band-stop around `freq` (power-line removal).
///
/// Stop band is `freq ± freq/400`, widened by half of
/// [`NOTCH_TRANS_BANDWIDTH`] on each side. Returns `None` when the upper edge
/// reaches Nyquist, since such a notch cannot be realised at this rate.
pub fn design_notch(freq: f32, sfreq: f32) -> Option<Vec<f32>> {
    let half_width = freq / NOTCH_WIDTH_DIVISOR / 2.0;
    let lo = freq - half_width - NOTCH_TRANS_BANDWIDTH / 2.0;
    let hi = freq + half_width + NOTCH_TRANS_BANDWIDTH / 2.0;
    if hi >= sfreq / 2.0 || lo <= 0.0 {
        return None;
    }
    let n = auto_filter_length(NOTCH_TRANS_BANDWIDTH, sfreq);
    let lp_hi = firwin(n, hi, sfreq, true);
    let lp_lo = firwin(n, lo, sfreq, true);
    let mut h: Vec<f64> = lp_hi.iter().zip(&lp_lo).map(|(a, b)| -(a - b)).collect();
    h[n / 2] += 1.0;
    Some(h.iter().map(|&v| v as f32).collect())
}

/// Hamming-windowed sinc with unit DC gain; `pass_zero = false` spectrally
/// inverts it into a highpass.
pub fn firwin(n: usize, cutoff_hz: f32, sfreq: f32, pass_zero: bool) -> Vec<f64> {
    debug_assert!(n % 2 == 1, "firwin requires odd N for linear-phase filter");
    let alpha = (n - 1) as f64 / 2.0;
    let fc = cutoff_hz as f64 / (sfreq as f64 / 2.0);

    let win = hamming(n);
    let mut h: Vec<f64> = (0..n)
        .map(|i| {
            let x = i as f64 - alpha;
            let sinc = if x == 0.0 { fc } else { (PI * fc * x).sin() / (PI * x) };
            sinc * win[i]
        })
        .collect();

    let s: f64 = h.iter().sum();
    h.iter_mut().for_each(|v| *v /= s);

    if !pass_zero {
        h.iter_mut().for_each(|v| *v = -*v);
        h[n / 2] += 1.0;
    }
    h
}

/// Hamming window of length `n`.
pub fn hamming(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

/// Magnitude of the kernel's frequency response at `freq` Hz.
pub fn gain_at(h: &[f32], freq: f32, sfreq: f32) -> f64 {
    let w = 2.0 * PI * freq as f64 / sfreq as f64;
    let (re, im) = h.iter().enumerate().fold((0.0, 0.0), |(re, im), (k, &v)| {
        let ph = w * k as f64;
        (re + v as f64 * ph.cos(), im - v as f64 * ph.sin())
    });
    (re * re + im * im).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths_are_odd() {
        for sfreq in [100.0_f32, 160.0, 256.0, 512.0] {
            assert!(design_bandpass(0.5, 40.0, sfreq).len() % 2 == 1);
            if let Some(h) = design_notch(50.0, sfreq) {
                assert!(h.len() % 2 == 1);
            }
        }
    }

    #[test]
    fn bandpass_length_set_by_low_edge() {
        // l_tb = 0.5 Hz → 3.3 / 0.5 · 100 = 660 → 661 taps
        assert_eq!(design_bandpass(0.5, 40.0, 100.0).len(), 661);
    }

    #[test]
    fn high_transition_limited_by_nyquist() {
        approx::assert_abs_diff_eq!(auto_h_trans_bandwidth(40.0, 100.0), 10.0);
        approx::assert_abs_diff_eq!(auto_h_trans_bandwidth(40.0, 85.0), 2.5);
    }

    #[test]
    fn bandpass_response() {
        let h = design_bandpass(0.5, 40.0, 256.0);
        assert!(gain_at(&h, 0.0, 256.0) < 1e-3);
        assert!((gain_at(&h, 10.0, 256.0) - 1.0).abs() < 1e-2);
        assert!(gain_at(&h, 80.0, 256.0) < 1e-2);
    }

    #[test]
    fn notch_response() {
        let h = design_notch(50.0, 256.0).unwrap();
        assert!((gain_at(&h, 0.0, 256.0) - 1.0).abs() < 1e-6);
        assert!((gain_at(&h, 20.0, 256.0) - 1.0).abs() < 1e-2);
        assert!(gain_at(&h, 50.0, 256.0) < 0.05);
    }

    #[test]
    fn notch_unavailable_at_nyquist() {
        assert!(design_notch(50.0, 100.0).is_none());
    }

    #[test]
    fn highpass_is_symmetric() {
        let h = design_highpass(0.5, 256.0);
        let n = h.len();
        for i in 0..n / 2 {
            approx::assert_abs_diff_eq!(h[i], h[n - 1 - i], epsilon = 1e-7_f32);
        }
    }
}
