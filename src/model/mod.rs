//! Convolutional encoder + two-layer LSTM greedy decoder.
//!
//! ```text
//! [B, C, L]
//!   ├─ Conv1d(C→32, k7, s2, p3) → BN → ReLU → MaxPool(3)
//!   ├─ Conv1d(32→64, k5, s2, p2) → BN → ReLU → MaxPool(3)
//!   ├─ Conv1d(64→H, k3, s2, p1)  → BN → ReLU → mean over time
//!   │      └─→ features [B, H]  (h0 of both LSTM layers, c0 = 0)
//!   └─ for step in 0..S:
//!          embed(previous token, first = 0) → LSTM ×2 → Linear(H→V)
//!          next token = argmax(logits)
//! → logits [B, S, V]
//! ```
//!
//! - [`layers`]: the individual blocks.
//! - [`checkpoint`]: save/load of parameters and optimizer state.
//! - [`backprop`]: training-mode forward pass and gradients.
pub mod backprop;
pub mod checkpoint;
pub mod layers;

use anyhow::Result;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::config::ModelConfig;
use crate::error::ModelError;
use layers::{argmax, global_avg_pool, max_pool, relu_inplace, BatchNorm1d, Conv1d, Embedding, Linear, LstmCell};

pub use backprop::{Gradients, TrainTape};
pub use checkpoint::{load_checkpoint, save_checkpoint, Checkpoint};

/// Pooling window after the first two conv blocks.
pub const POOL_SIZE: usize = 3;

/// Anything that maps a `[B, C, L]` signal batch to `[B, steps, vocab]` logits.
pub trait SequenceDecoder {
    /// `(channels, timepoints)` every sample is normalised to before decoding.
    fn input_shape(&self) -> (usize, usize);

    /// Decoding steps produced by default.
    fn max_seq_len(&self) -> usize;

    fn decode(&self, x: ArrayView3<f32>, steps: usize) -> Result<Array3<f32>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDecoderModel {
    pub config: ModelConfig,
    pub convs: [Conv1d; 3],
    pub norms: [BatchNorm1d; 3],
    pub embedding: Embedding,
    pub lstm: [LstmCell; 2],
    pub output_projection: Linear,
}

impl SequenceDecoderModel {
    /// Randomly initialised model (deterministic for a given seed).
    pub fn new(config: ModelConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let h = config.hidden_dim;
        let convs = [
            Conv1d::init(&mut rng, config.input_channels, 32, 7, 2, 3),
            Conv1d::init(&mut rng, 32, 64, 5, 2, 2),
            Conv1d::init(&mut rng, 64, h, 3, 2, 1),
        ];
        let norms = [BatchNorm1d::new(32), BatchNorm1d::new(64), BatchNorm1d::new(h)];
        let embedding = Embedding::init(&mut rng, config.vocab_size, h);
        let lstm = [LstmCell::init(&mut rng, h, h), LstmCell::init(&mut rng, h, h)];
        let output_projection = Linear::init(&mut rng, h, config.vocab_size);
        Self { config, convs, norms, embedding, lstm, output_projection }
    }

    /// Encode one `[C, L]` sample into a `[H]` feature vector (as a row).
    fn encode_one(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut a = x.to_owned();
        for (i, (conv, bn)) in self.convs.iter().zip(&self.norms).enumerate() {
            a = conv.forward(a.view());
            bn.forward_inplace(&mut a);
            relu_inplace(&mut a);
            if i < 2 {
                a = max_pool(a.view(), POOL_SIZE);
            }
        }
        global_avg_pool(a.view()).insert_axis(Axis(0))
    }

    /// `[B, C, L]` → `[B, H]`.
    pub fn encode(&self, x: ArrayView3<f32>) -> Result<Array2<f32>> {
        self.check_input(x)?;
        let rows: Vec<Array2<f32>> = x.outer_iter().map(|s| self.encode_one(s)).collect();
        let views: Vec<ArrayView2<f32>> = rows.iter().map(|r| r.view()).collect();
        Ok(ndarray::concatenate(Axis(0), &views)?)
    }

    fn check_input(&self, x: ArrayView3<f32>) -> Result<()> {
        let (_, c, l) = x.dim();
        let mut len = l;
        for (i, conv) in self.convs.iter().enumerate() {
            len = conv.out_len(len);
            if i < 2 {
                len /= POOL_SIZE;
            }
        }
        if c != self.config.input_channels || len == 0 {
            return Err(ModelError::InputShape {
                got: x.shape().to_vec(),
                channels: self.config.input_channels,
                length: self.config.input_length,
            }
            .into());
        }
        Ok(())
    }

    /// Greedy decode with running statistics and no dropout.
    fn greedy_decode(&self, x: ArrayView3<f32>, steps: usize) -> Result<Array3<f32>> {
        let features = self.encode(x)?;
        let (b, h) = features.dim();
        let v = self.config.vocab_size;

        let mut hs = [features.clone(), features];
        let mut cs = [Array2::<f32>::zeros((b, h)), Array2::<f32>::zeros((b, h))];
        let mut tokens = vec![0usize; b];
        let mut logits = Array3::<f32>::zeros((b, steps, v));

        for step in 0..steps {
            let emb = self.embedding.forward(&tokens);
            let [h0, h1] = &mut hs;
            let [c0, c1] = &mut cs;
            self.lstm[0].step(emb.view(), h0, c0);
            self.lstm[1].step(h0.view(), h1, c1);

            let out = self.output_projection.forward(h1.view());
            for (t, row) in tokens.iter_mut().zip(out.rows()) {
                *t = argmax(row);
            }
            logits.slice_mut(s![.., step, ..]).assign(&out);
        }
        debug!(batch = b, steps, "decoded");
        Ok(logits)
    }
}

impl SequenceDecoder for SequenceDecoderModel {
    fn input_shape(&self) -> (usize, usize) {
        (self.config.input_channels, self.config.input_length)
    }

    fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    fn decode(&self, x: ArrayView3<f32>, steps: usize) -> Result<Array3<f32>> {
        self.greedy_decode(x, steps)
    }
}
