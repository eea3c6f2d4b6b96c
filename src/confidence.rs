//! Confidence scoring from decoder logits.
//!
//! Four scores are computed from `[B, S, V]` logits, with `p = softmax(logits / T)`:
//!
//! | method | score |
//! |---|---|
//! | 1 tempered max | `max p` over the whole tensor |
//! | 2 raw max | `max softmax(logits)`, logged only |
//! | 3 entropy | `exp(−mean_{b,s} Σ_v −p·ln(p + 1e-8))` |
//! | 4 top-2 gap | `mean_{b,s} (p₁ − p₂)` |
//!
//! The reported confidence is `max(1, 3, 4)`.
use ndarray::{Array3, ArrayView1, Axis};
use tracing::debug;

/// Inside the entropy logarithm.
pub const LOG_EPSILON: f64 = 1e-8;

/// The four confidence scores of one prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceScores {
    pub tempered_max: f32,
    pub raw_max: f32,
    pub entropy: f32,
    pub top2_gap: f32,
}

impl ConfidenceScores {
    /// `max(tempered_max, entropy, top2_gap)`; `raw_max` is diagnostic only.
    pub fn combined(&self) -> f32 {
        self.tempered_max.max(self.entropy).max(self.top2_gap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceEstimator {
    pub temperature: f32,
}

impl Default for ConfidenceEstimator {
    fn default() -> Self {
        Self { temperature: 2.0 }
    }
}

impl ConfidenceEstimator {
    pub fn new(temperature: f32) -> Self {
        Self { temperature }
    }

    /// Combined confidence plus the tempered probabilities.
    pub fn estimate(&self, logits: &Array3<f32>) -> (f32, Array3<f32>) {
        let (scores, probs) = self.scores(logits);
        (scores.combined(), probs)
    }

    /// All four scores plus the tempered probabilities.
    pub fn scores(&self, logits: &Array3<f32>) -> (ConfidenceScores, Array3<f32>) {
        let tempered = softmax_last(logits, self.temperature.max(f32::EPSILON));
        let raw = softmax_last(logits, 1.0);

        let n_rows = (logits.len_of(Axis(0)) * logits.len_of(Axis(1))).max(1) as f64;
        let mut entropy_sum = 0.0_f64;
        let mut gap_sum = 0.0_f64;
        for row in tempered.lanes(Axis(2)) {
            entropy_sum += entropy(row);
            let (p1, p2) = top2(row);
            gap_sum += (p1 - p2) as f64;
        }

        let scores = ConfidenceScores {
            tempered_max: global_max(&tempered),
            raw_max: global_max(&raw),
            entropy: (-(entropy_sum / n_rows)).exp() as f32,
            top2_gap: (gap_sum / n_rows) as f32,
        };
        debug!(
            tempered_max = scores.tempered_max,
            raw_max = scores.raw_max,
            entropy = scores.entropy,
            top2_gap = scores.top2_gap,
            "confidence methods"
        );
        (scores, tempered)
    }
}

/// Numerically stable softmax over the vocabulary axis of `logits / temperature`.
pub fn softmax_last(logits: &Array3<f32>, temperature: f32) -> Array3<f32> {
    let mut out = logits.mapv(|v| v / temperature);
    for mut row in out.lanes_mut(Axis(2)) {
        let m = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - m).exp());
        let s: f32 = row.sum();
        if s > 0.0 {
            row.mapv_inplace(|v| v / s);
        }
    }
    out
}

fn entropy(p: ArrayView1<f32>) -> f64 {
    p.iter()
        .map(|&v| {
            let v = v as f64;
            -v * (v + LOG_EPSILON).ln()
        })
        .sum()
}

fn top2(p: ArrayView1<f32>) -> (f32, f32) {
    let mut first = f32::NEG_INFINITY;
    let mut second = f32::NEG_INFINITY;
    for &v in p {
        if v > first {
            second = first;
            first = v;
        } else if v > second {
            second = v;
        }
    }
    if second == f32::NEG_INFINITY {
        second = 0.0;
    }
    (first, second)
}

fn global_max(a: &Array3<f32>) -> f32 {
    a.iter().copied().fold(0.0, f32::max)
}
