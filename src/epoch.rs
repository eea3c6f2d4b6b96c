//! Fixed-length, optionally overlapping epoching.
//!
//! Splits continuous `[C, T]` data into windows of `epoch_samples` samples
//! starting every `step_samples` samples:
//!
//! ```text
//! n_epochs = floor((T − L) / step) + 1     (0 when T < L)
//! epoch[e] = data[:, e·step .. e·step + L]
//! ```
//!
//! The trailing partial window is discarded. No baseline correction is applied.
use anyhow::{bail, Result};
use ndarray::{s, Array3, ArrayView2};

/// Number of complete windows for a signal of `n_times` samples.
pub fn epoch_count(n_times: usize, epoch_samples: usize, step_samples: usize) -> usize {
    if epoch_samples == 0 || step_samples == 0 || n_times < epoch_samples {
        return 0;
    }
    (n_times - epoch_samples) / step_samples + 1
}

/// Cut `data` ([C, T]) into `[E, C, epoch_samples]`.
pub fn epoch_overlapping(
    data: ArrayView2<f32>,
    epoch_samples: usize,
    step_samples: usize,
) -> Result<Array3<f32>> {
    if epoch_samples == 0 || step_samples == 0 {
        bail!("epoch length and step must be positive (got {epoch_samples}, {step_samples})");
    }
    let (n_ch, n_t) = data.dim();
    let n_epochs = epoch_count(n_t, epoch_samples, step_samples);

    let mut out = Array3::<f32>::zeros((n_epochs, n_ch, epoch_samples));
    for (e, mut dst) in out.outer_iter_mut().enumerate() {
        let start = e * step_samples;
        dst.assign(&data.slice(s![.., start..start + epoch_samples]));
    }
    Ok(out)
}
