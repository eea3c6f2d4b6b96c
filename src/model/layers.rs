//! Building blocks of the sequence decoder: Conv1d, BatchNorm1d, MaxPool1d,
//! Embedding, LSTM cell and Linear.
//!
//! Parameter layouts follow the usual PyTorch conventions so checkpoints are
//! self-describing: conv weight `[out, in, k]`, linear weight `[out, in]`,
//! LSTM gate blocks stacked `i, f, g, o` along the first axis.
//!
//! Each block also has a `backward` that returns (or accumulates) the
//! gradients of its inputs and parameters, given the gradient of its output.
use ndarray::{s, Array, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, Dimension, Ix1, Ix2, Ix3, Zip};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};

/// BatchNorm variance epsilon.
pub const BN_EPS: f32 = 1e-5;

/// Weight of the current batch in the running-statistics update.
pub const BN_MOMENTUM: f32 = 0.1;

/// `U(−1/√fan_in, 1/√fan_in)`, the default for conv, linear and LSTM tensors.
fn uniform_fan_in<R: Rng, D: Dimension>(rng: &mut R, shape: D, fan_in: usize) -> Array<f32, D> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    let dist = Uniform::new_inclusive(-bound, bound);
    Array::from_shape_simple_fn(shape, || dist.sample(rng))
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

// ── Encoder ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Conv1d {
    /// `[out, in, k]`
    pub weight: Array3<f32>,
    pub bias: Array1<f32>,
    pub stride: usize,
    pub padding: usize,
}

impl Conv1d {
    pub fn init<R: Rng>(
        rng: &mut R,
        c_in: usize,
        c_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Self {
        let fan_in = c_in * kernel;
        Self {
            weight: uniform_fan_in(rng, Ix3(c_out, c_in, kernel), fan_in),
            bias: uniform_fan_in(rng, Ix1(c_out), fan_in),
            stride,
            padding,
        }
    }

    pub fn out_len(&self, len: usize) -> usize {
        let k = self.weight.len_of(Axis(2));
        let padded = len + 2 * self.padding;
        if padded < k {
            0
        } else {
            (padded - k) / self.stride + 1
        }
    }

    /// Input position read by patch row `row` at output step `t`, if not padding.
    fn source(&self, row: usize, t: usize, len: usize) -> Option<(usize, usize)> {
        let k = self.weight.len_of(Axis(2));
        let (ci, kk) = (row / k, row % k);
        match (t * self.stride + kk).checked_sub(self.padding) {
            Some(p) if p < len => Some((ci, p)),
            _ => None,
        }
    }

    /// `[C_in, L]` → `[C_in·k, L_out]` patch matrix.
    fn im2col(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let (_, c_in, k) = self.weight.dim();
        let len = x.ncols();
        Array2::from_shape_fn((c_in * k, self.out_len(len)), |(row, t)| {
            self.source(row, t, len).map_or(0.0, |(ci, p)| x[[ci, p]])
        })
    }

    /// `[C_out, C_in·k]`, rows in im2col order.
    fn weight_matrix(&self) -> Array2<f32> {
        let (c_out, c_in, k) = self.weight.dim();
        Array2::from_shape_fn((c_out, c_in * k), |(o, j)| self.weight[[o, j / k, j % k]])
    }

    /// `[C_in, L]` → `[C_out, L_out]` via im2col and one matrix product.
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut y = self.weight_matrix().dot(&self.im2col(x));
        y += &self.bias.view().insert_axis(Axis(1));
        y
    }

    /// Gradients for one sample: `(dx, dweight, dbias)`.
    pub fn backward(&self, x: ArrayView2<f32>, dy: ArrayView2<f32>) -> (Array2<f32>, Array3<f32>, Array1<f32>) {
        let (c_out, c_in, k) = self.weight.dim();
        let len = x.ncols();
        let dw = dy.dot(&self.im2col(x).t());
        let dweight = Array3::from_shape_fn((c_out, c_in, k), |(o, ci, kk)| dw[[o, ci * k + kk]]);
        let dbias = dy.sum_axis(Axis(1));

        let dcols = self.weight_matrix().t().dot(&dy);
        let mut dx = Array2::<f32>::zeros((c_in, len));
        for ((row, t), &g) in dcols.indexed_iter() {
            if let Some(src) = self.source(row, t, len) {
                dx[src] += g;
            }
        }
        (dx, dweight, dbias)
    }
}

/// Batch normalisation over channels of `[C, L]` maps.
///
/// [`forward_inplace`](Self::forward_inplace) uses the running statistics,
/// [`forward_train`](Self::forward_train) the statistics of the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNorm1d {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
}

impl BatchNorm1d {
    pub fn new(channels: usize) -> Self {
        Self {
            weight: Array1::ones(channels),
            bias: Array1::zeros(channels),
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
        }
    }

    /// `[C, L]` in place.
    pub fn forward_inplace(&self, x: &mut Array2<f32>) {
        for (c, mut row) in x.rows_mut().into_iter().enumerate() {
            let scale = self.weight[c] / (self.running_var[c] + BN_EPS).sqrt();
            let shift = self.bias[c] - self.running_mean[c] * scale;
            row.mapv_inplace(|v| v * scale + shift);
        }
    }

    /// Normalise a batch in place with its own per-channel mean and
    /// variance (over samples and time), then fold them into the running
    /// estimates. The running variance takes the unbiased estimate.
    pub fn forward_train(&mut self, xs: &mut [Array2<f32>]) -> BnCache {
        let channels = self.weight.len();
        let n: usize = xs.iter().map(|x| x.ncols()).sum();
        let mut mean = Array1::<f32>::zeros(channels);
        let mut inv_std = Array1::<f32>::zeros(channels);

        for c in 0..channels {
            let mut sum = 0.0_f64;
            for x in xs.iter() {
                sum += x.row(c).iter().map(|&v| v as f64).sum::<f64>();
            }
            let mu = sum / n.max(1) as f64;
            let mut sq = 0.0_f64;
            for x in xs.iter() {
                sq += x.row(c).iter().map(|&v| (v as f64 - mu).powi(2)).sum::<f64>();
            }
            let var = sq / n.max(1) as f64;
            let unbiased = if n > 1 { sq / (n - 1) as f64 } else { var };

            mean[c] = mu as f32;
            inv_std[c] = 1.0 / (var as f32 + BN_EPS).sqrt();
            self.running_mean[c] = (1.0 - BN_MOMENTUM) * self.running_mean[c] + BN_MOMENTUM * mu as f32;
            self.running_var[c] = (1.0 - BN_MOMENTUM) * self.running_var[c] + BN_MOMENTUM * unbiased as f32;
        }

        let mut normed = Vec::with_capacity(xs.len());
        for x in xs.iter_mut() {
            let z = Array2::from_shape_fn(x.dim(), |(c, t)| (x[[c, t]] - mean[c]) * inv_std[c]);
            for ((c, t), v) in x.indexed_iter_mut() {
                *v = self.weight[c] * z[[c, t]] + self.bias[c];
            }
            normed.push(z);
        }
        BnCache { normed, inv_std }
    }

    /// Gradients of a [`forward_train`](Self::forward_train) pass:
    /// `(dx per sample, dweight, dbias)`.
    pub fn backward(&self, cache: &BnCache, dys: &[Array2<f32>]) -> (Vec<Array2<f32>>, Array1<f32>, Array1<f32>) {
        let channels = self.weight.len();
        let n = dys.iter().map(|d| d.ncols()).sum::<usize>().max(1) as f32;
        let mut dweight = Array1::<f32>::zeros(channels);
        let mut dbias = Array1::<f32>::zeros(channels);
        for (dy, z) in dys.iter().zip(&cache.normed) {
            for ((c, t), &g) in dy.indexed_iter() {
                dweight[c] += g * z[[c, t]];
                dbias[c] += g;
            }
        }

        let dxs = dys
            .iter()
            .zip(&cache.normed)
            .map(|(dy, z)| {
                Array2::from_shape_fn(dy.dim(), |(c, t)| {
                    let gamma = self.weight[c];
                    let centred = n * dy[[c, t]] - dbias[c] - z[[c, t]] * dweight[c];
                    gamma * cache.inv_std[c] * centred / n
                })
            })
            .collect();
        (dxs, dweight, dbias)
    }
}

/// Per-batch state kept by [`BatchNorm1d::forward_train`].
#[derive(Debug, Clone)]
pub struct BnCache {
    /// `(x − μ) / σ`, one `[C, L]` map per sample.
    pub normed: Vec<Array2<f32>>,
    pub inv_std: Array1<f32>,
}

pub fn relu_inplace(x: &mut Array2<f32>) {
    x.mapv_inplace(|v| v.max(0.0));
}

/// Zero `dy` wherever the ReLU output `out` was clamped.
pub fn relu_backward(out: ArrayView2<f32>, dy: &mut Array2<f32>) {
    Zip::from(dy).and(out).for_each(|g, &a| {
        if a <= 0.0 {
            *g = 0.0;
        }
    });
}

/// Non-overlapping max pool (kernel = stride = `k`), trailing remainder dropped.
pub fn max_pool(x: ArrayView2<f32>, k: usize) -> Array2<f32> {
    let l_out = x.ncols() / k;
    Array2::from_shape_fn((x.nrows(), l_out), |(c, t)| {
        (t * k..t * k + k).map(|i| x[[c, i]]).fold(f32::NEG_INFINITY, f32::max)
    })
}

/// Send each pooled gradient to the first maximum of its window.
pub fn max_pool_backward(x: ArrayView2<f32>, dy: ArrayView2<f32>, k: usize) -> Array2<f32> {
    let mut dx = Array2::<f32>::zeros(x.raw_dim());
    for ((c, t), &g) in dy.indexed_iter() {
        let start = t * k;
        let best = (start..start + k).fold(start, |best, i| if x[[c, i]] > x[[c, best]] { i } else { best });
        dx[[c, best]] += g;
    }
    dx
}

/// Mean over time: `[C, L]` → `[C]`.
pub fn global_avg_pool(x: ArrayView2<f32>) -> Array1<f32> {
    x.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(x.nrows()))
}

/// `[C]` → `[C, len]`, spreading each gradient evenly over time.
pub fn global_avg_pool_backward(dy: ArrayView1<f32>, len: usize) -> Array2<f32> {
    let scale = 1.0 / len.max(1) as f32;
    Array2::from_shape_fn((dy.len(), len), |(c, _)| dy[c] * scale)
}

// ── Decoder ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// `[vocab, dim]`
    pub weight: Array2<f32>,
}

impl Embedding {
    /// Rows drawn from `N(0, 1)`.
    pub fn init<R: Rng>(rng: &mut R, vocab: usize, dim: usize) -> Self {
        let weight = Array2::from_shape_simple_fn((vocab, dim), || StandardNormal.sample(rng));
        Self { weight }
    }

    /// Look up one row per token; ids past the table wrap around.
    pub fn forward(&self, tokens: &[usize]) -> Array2<f32> {
        let vocab = self.weight.nrows().max(1);
        let idx: Vec<usize> = tokens.iter().map(|&t| t % vocab).collect();
        self.weight.select(Axis(0), &idx)
    }

    /// Scatter-add `dy` rows into `dweight` at the (wrapped) ids.
    pub fn backward(&self, tokens: &[usize], dy: ArrayView2<f32>, dweight: &mut Array2<f32>) {
        let vocab = self.weight.nrows().max(1);
        for (&t, row) in tokens.iter().zip(dy.rows()) {
            let mut dst = dweight.row_mut(t % vocab);
            dst += &row;
        }
    }
}

/// One LSTM layer, stepped a single time position at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct LstmCell {
    /// `[4H, in]`
    pub weight_ih: Array2<f32>,
    /// `[4H, H]`
    pub weight_hh: Array2<f32>,
    pub bias_ih: Array1<f32>,
    pub bias_hh: Array1<f32>,
}

impl LstmCell {
    pub fn init<R: Rng>(rng: &mut R, input: usize, hidden: usize) -> Self {
        Self {
            weight_ih: uniform_fan_in(rng, Ix2(4 * hidden, input), hidden),
            weight_hh: uniform_fan_in(rng, Ix2(4 * hidden, hidden), hidden),
            bias_ih: uniform_fan_in(rng, Ix1(4 * hidden), hidden),
            bias_hh: uniform_fan_in(rng, Ix1(4 * hidden), hidden),
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.weight_hh.ncols()
    }

    /// Activated gates `[i, f, g, o]`, each `[B, H]`.
    fn gates(&self, x: ArrayView2<f32>, h: ArrayView2<f32>) -> [Array2<f32>; 4] {
        let hs = self.hidden_size();
        let mut pre = x.dot(&self.weight_ih.t()) + h.dot(&self.weight_hh.t());
        pre += &(&self.bias_ih + &self.bias_hh);
        let block = |k: usize| pre.slice(s![.., k * hs..(k + 1) * hs]).to_owned();
        [
            block(0).mapv_into(sigmoid),
            block(1).mapv_into(sigmoid),
            block(2).mapv_into(f32::tanh),
            block(3).mapv_into(sigmoid),
        ]
    }

    fn advance(gates: &[Array2<f32>; 4], h: &mut Array2<f32>, c: &mut Array2<f32>) {
        let [i, f, g, o] = gates;
        Zip::from(&mut *c)
            .and(i)
            .and(f)
            .and(g)
            .for_each(|c, &i, &f, &g| *c = f * *c + i * g);
        Zip::from(&mut *h)
            .and(&*c)
            .and(o)
            .for_each(|h, &c, &o| *h = o * c.tanh());
    }

    /// `x [B, in]`, `h`/`c [B, H]` updated in place.
    pub fn step(&self, x: ArrayView2<f32>, h: &mut Array2<f32>, c: &mut Array2<f32>) {
        let gates = self.gates(x, h.view());
        Self::advance(&gates, h, c);
    }

    /// [`step`](Self::step), also returning the activations needed to
    /// backpropagate through it.
    pub fn step_cached(&self, x: ArrayView2<f32>, h: &mut Array2<f32>, c: &mut Array2<f32>) -> LstmStep {
        let (h_prev, c_prev) = (h.clone(), c.clone());
        let gates = self.gates(x, h.view());
        Self::advance(&gates, h, c);
        LstmStep { x: x.to_owned(), h_prev, c_prev, gates, c: c.clone(), h: h.clone() }
    }

    /// Backpropagate one step. `dh` and `dc` are the gradients reaching the
    /// step's outputs; parameter gradients are added to `grads`.
    /// Returns `(dx, dh_prev, dc_prev)`.
    pub fn step_backward(
        &self,
        st: &LstmStep,
        dh: ArrayView2<f32>,
        dc: ArrayView2<f32>,
        grads: &mut LstmGrads,
    ) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let (b, hs) = st.c.dim();
        let [gi, gf, gg, go] = &st.gates;
        let mut dgates = Array2::<f32>::zeros((b, 4 * hs));
        let mut dc_prev = Array2::<f32>::zeros((b, hs));
        for r in 0..b {
            for u in 0..hs {
                let (i, f, g, o) = (gi[[r, u]], gf[[r, u]], gg[[r, u]], go[[r, u]]);
                let tc = st.c[[r, u]].tanh();
                let dct = dh[[r, u]] * o * (1.0 - tc * tc) + dc[[r, u]];
                dgates[[r, u]] = dct * g * i * (1.0 - i);
                dgates[[r, hs + u]] = dct * st.c_prev[[r, u]] * f * (1.0 - f);
                dgates[[r, 2 * hs + u]] = dct * i * (1.0 - g * g);
                dgates[[r, 3 * hs + u]] = dh[[r, u]] * tc * o * (1.0 - o);
                dc_prev[[r, u]] = dct * f;
            }
        }
        grads.weight_ih += &dgates.t().dot(&st.x);
        grads.weight_hh += &dgates.t().dot(&st.h_prev);
        let db = dgates.sum_axis(Axis(0));
        grads.bias_ih += &db;
        grads.bias_hh += &db;
        (dgates.dot(&self.weight_ih), dgates.dot(&self.weight_hh), dc_prev)
    }
}

/// Inputs and activations of one [`LstmCell::step_cached`] call.
#[derive(Debug, Clone)]
pub struct LstmStep {
    x: Array2<f32>,
    h_prev: Array2<f32>,
    c_prev: Array2<f32>,
    gates: [Array2<f32>; 4],
    c: Array2<f32>,
    /// Output hidden state `[B, H]`.
    pub h: Array2<f32>,
}

/// Gradient accumulators shaped like an [`LstmCell`].
#[derive(Debug, Clone, PartialEq)]
pub struct LstmGrads {
    pub weight_ih: Array2<f32>,
    pub weight_hh: Array2<f32>,
    pub bias_ih: Array1<f32>,
    pub bias_hh: Array1<f32>,
}

impl LstmGrads {
    pub fn zeros_like(cell: &LstmCell) -> Self {
        Self {
            weight_ih: Array2::zeros(cell.weight_ih.raw_dim()),
            weight_hh: Array2::zeros(cell.weight_hh.raw_dim()),
            bias_ih: Array1::zeros(cell.bias_ih.raw_dim()),
            bias_hh: Array1::zeros(cell.bias_hh.raw_dim()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    /// `[out, in]`
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    pub fn init<R: Rng>(rng: &mut R, input: usize, output: usize) -> Self {
        Self {
            weight: uniform_fan_in(rng, Ix2(output, input), input),
            bias: uniform_fan_in(rng, Ix1(output), input),
        }
    }

    /// `[B, in]` → `[B, out]`.
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        x.dot(&self.weight.t()) + &self.bias
    }

    /// Accumulate parameter gradients for `x [B, in]`, `dy [B, out]`; returns `dx`.
    pub fn backward(
        &self,
        x: ArrayView2<f32>,
        dy: ArrayView2<f32>,
        dweight: &mut Array2<f32>,
        dbias: &mut Array1<f32>,
    ) -> Array2<f32> {
        *dweight += &dy.t().dot(&x);
        *dbias += &dy.sum_axis(Axis(0));
        dy.dot(&self.weight)
    }
}

/// Index of the first maximum (NaN never wins).
pub fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    let mut best_v = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > best_v {
            best = i;
            best_v = v;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn conv_matches_direct_sum() {
        let conv = Conv1d {
            weight: array![[[1.0, 2.0, 3.0]]],
            bias: array![0.5],
            stride: 2,
            padding: 1,
        };
        let x = array![[1.0_f32, 1.0, 2.0, 3.0, 5.0]];
        // padded: 0 1 1 2 3 5 0 → windows at 0, 2, 4
        let y = conv.forward(x.view());
        assert_eq!(conv.out_len(5), 3);
        assert_eq!(y, array![[0.0 + 2.0 + 3.0 + 0.5, 1.0 + 4.0 + 9.0 + 0.5, 3.0 + 10.0 + 0.0 + 0.5]]);
    }

    #[test]
    fn encoder_lengths_for_thirty_second_window() {
        let mut rng = StdRng::seed_from_u64(0);
        let c1 = Conv1d::init(&mut rng, 19, 32, 7, 2, 3);
        let c2 = Conv1d::init(&mut rng, 32, 64, 5, 2, 2);
        let c3 = Conv1d::init(&mut rng, 64, 128, 3, 2, 1);
        let l = c1.out_len(3000);
        assert_eq!(l, 1500);
        let l = c2.out_len(l / 3);
        assert_eq!(l, 250);
        assert_eq!(c3.out_len(l / 3), 42);
    }

    #[test]
    fn batchnorm_eval_affine() {
        let mut bn = BatchNorm1d::new(2);
        bn.running_mean = array![1.0, -1.0];
        bn.running_var = array![4.0, 1.0];
        bn.weight = array![2.0, 1.0];
        let mut x = array![[3.0_f32], [0.0]];
        bn.forward_inplace(&mut x);
        approx::assert_abs_diff_eq!(x[[0, 0]], 2.0 * 2.0 / (4.0 + BN_EPS).sqrt(), epsilon = 1e-6);
        approx::assert_abs_diff_eq!(x[[1, 0]], 1.0 / (1.0 + BN_EPS).sqrt(), epsilon = 1e-6);
    }

    #[test]
    fn pool_drops_remainder() {
        let x = array![[1.0_f32, 5.0, 2.0, 0.0, -1.0, 4.0, 9.0]];
        assert_eq!(max_pool(x.view(), 3), array![[5.0, 4.0]]);
        assert_eq!(global_avg_pool(x.view()), array![20.0 / 7.0]);
    }

    #[test]
    fn lstm_zero_weights_half_open_gates() {
        let cell = LstmCell {
            weight_ih: Array2::zeros((8, 3)),
            weight_hh: Array2::zeros((8, 2)),
            bias_ih: Array1::zeros(8),
            bias_hh: Array1::zeros(8),
        };
        let mut h = Array2::from_elem((1, 2), 0.7);
        let mut c = Array2::from_elem((1, 2), 1.0);
        cell.step(Array2::ones((1, 3)).view(), &mut h, &mut c);
        // f = 0.5, g = 0 → c = 0.5; h = 0.5 · tanh(0.5)
        approx::assert_abs_diff_eq!(c[[0, 0]], 0.5);
        approx::assert_abs_diff_eq!(h[[0, 1]], 0.5 * 0.5_f32.tanh(), epsilon = 1e-7);
    }

    #[test]
    fn lstm_gate_order_is_ifgo() {
        let hs = 1;
        let mut bias = Array1::zeros(4 * hs);
        bias[2] = 20.0; // g → tanh ≈ 1
        bias[0] = 20.0; // i → σ ≈ 1
        bias[1] = -20.0; // f → σ ≈ 0
        bias[3] = 20.0; // o → σ ≈ 1
        let cell = LstmCell {
            weight_ih: Array2::zeros((4, 1)),
            weight_hh: Array2::zeros((4, 1)),
            bias_ih: bias,
            bias_hh: Array1::zeros(4),
        };
        let mut h = Array2::zeros((1, 1));
        let mut c = Array2::from_elem((1, 1), -3.0);
        cell.step(Array2::zeros((1, 1)).view(), &mut h, &mut c);
        approx::assert_abs_diff_eq!(c[[0, 0]], 1.0, epsilon = 1e-5);
        approx::assert_abs_diff_eq!(h[[0, 0]], 1.0_f32.tanh(), epsilon = 1e-5);
    }

    #[test]
    fn embedding_wraps_ids() {
        let emb = Embedding { weight: array![[0.0_f32], [1.0], [2.0]] };
        assert_eq!(emb.forward(&[1, 4, 2]), array![[1.0], [1.0], [2.0]]);
    }

    #[test]
    fn argmax_prefers_first() {
        assert_eq!(argmax(array![1.0_f32, 3.0, 3.0, 0.0].view()), 1);
    }

    /// Central difference of `f` at `x[i]`.
    fn numeric<D: Dimension>(x: &Array<f32, D>, i: usize, f: impl Fn(&Array<f32, D>) -> f64) -> f32 {
        let h = 1e-2;
        let mut plus = x.clone();
        plus.as_slice_mut().unwrap()[i] += h;
        let mut minus = x.clone();
        minus.as_slice_mut().unwrap()[i] -= h;
        ((f(&plus) - f(&minus)) / (2.0 * h as f64)) as f32
    }

    /// `Σ y · r` for a fixed pseudo-random `r`, so `dL/dy = r`.
    fn fixed_weights(shape: (usize, usize)) -> Array2<f32> {
        Array2::from_shape_fn(shape, |(a, b)| ((a * 7 + b * 3) as f32 * 0.37).sin())
    }

    fn weighted_sum(y: &Array2<f32>, r: &Array2<f32>) -> f64 {
        y.iter().zip(r).map(|(&a, &b)| a as f64 * b as f64).sum()
    }

    #[test]
    fn conv_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(4);
        let conv = Conv1d::init(&mut rng, 2, 3, 5, 2, 2);
        let x = Array2::from_shape_fn((2, 9), |(c, t)| ((c * 9 + t) as f32 * 0.4).cos());
        let r = fixed_weights((3, conv.out_len(9)));
        let (dx, dw, db) = conv.backward(x.view(), r.view());

        for i in 0..x.len() {
            let fd = numeric(&x, i, |x| weighted_sum(&conv.forward(x.view()), &r));
            approx::assert_abs_diff_eq!(dx.as_slice().unwrap()[i], fd, epsilon = 2e-3);
        }
        for i in 0..conv.weight.len() {
            let fd = numeric(&conv.weight, i, |w| {
                let c = Conv1d { weight: w.clone(), ..conv.clone() };
                weighted_sum(&c.forward(x.view()), &r)
            });
            approx::assert_abs_diff_eq!(dw.as_slice().unwrap()[i], fd, epsilon = 2e-3);
        }
        for (a, b) in db.iter().zip(r.sum_axis(Axis(1)).iter()) {
            approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn batchnorm_backward_matches_finite_difference() {
        let mut bn = BatchNorm1d::new(2);
        bn.weight = array![1.5, -0.5];
        bn.bias = array![0.1, 0.2];
        let xs = vec![
            Array2::from_shape_fn((2, 4), |(c, t)| ((c + 2 * t) as f32 * 0.7).sin()),
            Array2::from_shape_fn((2, 4), |(c, t)| ((3 * c + t) as f32 * 0.3).cos()),
        ];
        let rs = [fixed_weights((2, 4)), fixed_weights((2, 4)).mapv(|v| v * -0.5 + 0.2)];
        let loss = |xs: &[Array2<f32>]| {
            let mut ys = xs.to_vec();
            bn.clone().forward_train(&mut ys);
            ys.iter().zip(&rs).map(|(y, r)| weighted_sum(y, r)).sum::<f64>()
        };

        let mut ys = xs.clone();
        let cache = bn.clone().forward_train(&mut ys);
        let (dxs, dw, dbias) = bn.backward(&cache, &rs);
        for k in 0..2 {
            for i in 0..8 {
                let fd = numeric(&xs[k], i, |x| {
                    let mut v = xs.clone();
                    v[k] = x.clone();
                    loss(&v)
                });
                approx::assert_abs_diff_eq!(dxs[k].as_slice().unwrap()[i], fd, epsilon = 5e-3);
            }
        }
        let expected = &rs[0].sum_axis(Axis(1)) + &rs[1].sum_axis(Axis(1));
        for (a, b) in dbias.iter().zip(expected.iter()) {
            approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
        assert!(dw.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn batchnorm_train_moves_running_stats() {
        let mut bn = BatchNorm1d::new(1);
        let mut xs = vec![array![[1.0_f32, 3.0]], array![[5.0_f32, 7.0]]];
        bn.forward_train(&mut xs);
        // batch mean 4, unbiased variance 20/3
        approx::assert_abs_diff_eq!(bn.running_mean[0], 0.4, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(bn.running_var[0], 0.9 + 0.1 * 20.0 / 3.0, epsilon = 1e-5);
        let mean: f32 = xs.iter().flat_map(|x| x.iter().copied()).sum::<f32>() / 4.0;
        approx::assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn lstm_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(9);
        let cell = LstmCell::init(&mut rng, 3, 2);
        let x = Array2::from_shape_fn((2, 3), |(b, i)| ((b * 3 + i) as f32 * 0.9).sin());
        let h0 = Array2::from_shape_fn((2, 2), |(b, u)| 0.3 * (b as f32 - u as f32));
        let c0 = Array2::from_shape_fn((2, 2), |(b, u)| 0.2 * (b + u) as f32);
        let rh = fixed_weights((2, 2));
        let rc = fixed_weights((2, 2)).mapv(|v| 0.5 - v);
        let loss = |cell: &LstmCell, x: &Array2<f32>, h: &Array2<f32>, c: &Array2<f32>| {
            let (mut h, mut c) = (h.clone(), c.clone());
            cell.step(x.view(), &mut h, &mut c);
            weighted_sum(&h, &rh) + weighted_sum(&c, &rc)
        };

        let (mut h, mut c) = (h0.clone(), c0.clone());
        let st = cell.step_cached(x.view(), &mut h, &mut c);
        assert_eq!(st.h, h);
        let mut grads = LstmGrads::zeros_like(&cell);
        let (dx, dh, dc) = cell.step_backward(&st, rh.view(), rc.view(), &mut grads);

        for i in 0..x.len() {
            let fd = numeric(&x, i, |x| loss(&cell, x, &h0, &c0));
            approx::assert_abs_diff_eq!(dx.as_slice().unwrap()[i], fd, epsilon = 2e-3);
        }
        for i in 0..4 {
            let fd = numeric(&h0, i, |h| loss(&cell, &x, h, &c0));
            approx::assert_abs_diff_eq!(dh.as_slice().unwrap()[i], fd, epsilon = 2e-3);
            let fd = numeric(&c0, i, |c| loss(&cell, &x, &h0, c));
            approx::assert_abs_diff_eq!(dc.as_slice().unwrap()[i], fd, epsilon = 2e-3);
        }
        for i in 0..cell.weight_hh.len() {
            let fd = numeric(&cell.weight_hh, i, |w| {
                let c = LstmCell { weight_hh: w.clone(), ..cell.clone() };
                loss(&c, &x, &h0, &c0)
            });
            approx::assert_abs_diff_eq!(grads.weight_hh.as_slice().unwrap()[i], fd, epsilon = 2e-3);
        }
        assert_eq!(grads.bias_ih, grads.bias_hh);
    }

    #[test]
    fn pooling_and_lookup_route_gradients() {
        let x = array![[1.0_f32, 5.0, 5.0, 0.0, -1.0, 4.0, 9.0]];
        let dx = max_pool_backward(x.view(), array![[2.0_f32, 3.0]].view(), 3);
        assert_eq!(dx, array![[0.0, 2.0, 0.0, 0.0, 0.0, 3.0, 0.0]]);
        assert_eq!(global_avg_pool_backward(array![4.0_f32].view(), 4), array![[1.0, 1.0, 1.0, 1.0]]);

        let mut dy = array![[1.0_f32, -2.0, 3.0]];
        relu_backward(array![[0.5_f32, 0.0, 2.0]].view(), &mut dy);
        assert_eq!(dy, array![[1.0, 0.0, 3.0]]);

        let emb = Embedding { weight: Array2::zeros((3, 1)) };
        let mut dw = Array2::zeros((3, 1));
        emb.backward(&[1, 4, 0], array![[1.0_f32], [2.0], [5.0]].view(), &mut dw);
        assert_eq!(dw, array![[5.0], [3.0], [0.0]]);
    }

    #[test]
    fn linear_backward_accumulates() {
        let lin = Linear { weight: array![[1.0_f32, 2.0], [0.0, -1.0]], bias: array![0.0, 0.0] };
        let mut dw = Array2::zeros((2, 2));
        let mut db = Array1::zeros(2);
        let x = array![[1.0_f32, 3.0]];
        let dy = array![[1.0_f32, 2.0]];
        let dx = lin.backward(x.view(), dy.view(), &mut dw, &mut db);
        lin.backward(x.view(), dy.view(), &mut dw, &mut db);
        assert_eq!(dx, array![[1.0, 0.0]]);
        assert_eq!(dw, array![[2.0, 6.0], [4.0, 12.0]]);
        assert_eq!(db, array![2.0, 4.0]);
    }

    #[test]
    fn init_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let lin = Linear::init(&mut rng, 16, 4);
        assert!(lin.weight.iter().all(|v| v.abs() <= 0.25));
        assert_eq!(lin.forward(Array2::zeros((3, 16)).view()).dim(), (3, 4));
    }
}
