//! Training-mode forward pass and reverse-mode gradients.
//!
//! [`SequenceDecoderModel::forward_train`] runs the encoder with batch
//! statistics (moving the BatchNorm running estimates) and the decoder with
//! dropout between the LSTM layers, recording a [`TrainTape`].
//! [`SequenceDecoderModel::backward`] walks the tape in reverse:
//!
//! ```text
//! dlogits ─→ projection ─→ LSTM l1 ─→ dropout mask ─→ LSTM l0 ─→ embedding rows
//!                 (steps S−1 … 0, h/c gradients carried between steps)
//! dh0(l0) + dh0(l1) ─→ avg pool ─→ ReLU ─→ BN ─→ conv ─→ (max pool ─→ ReLU ─→ BN ─→ conv) ×2
//! ```
//!
//! The greedy token fed to the next step is not differentiable; it only
//! decides which embedding row receives gradient.
use anyhow::{ensure, Result};
use ndarray::{s, Array1, Array2, Array3, ArrayD, ArrayView3};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::debug;

use super::checkpoint::{conv_key, lstm_key, norm_key};
use super::layers::{
    argmax, global_avg_pool, global_avg_pool_backward, max_pool, max_pool_backward, relu_backward, relu_inplace,
    BnCache, LstmGrads, LstmStep,
};
use super::{SequenceDecoderModel, POOL_SIZE};

/// Gradients of every trainable tensor, keyed like
/// [`SequenceDecoderModel::trainable_parameters_mut`].
pub type Gradients = BTreeMap<String, ArrayD<f32>>;

/// One conv block of the encoder.
#[derive(Debug, Clone)]
struct BlockTape {
    /// Conv inputs, one `[C_in, L]` per sample.
    inputs: Vec<Array2<f32>>,
    bn: BnCache,
    /// ReLU outputs (before pooling), one per sample.
    activated: Vec<Array2<f32>>,
}

/// One decoding step.
#[derive(Debug, Clone)]
struct StepTape {
    tokens: Vec<usize>,
    l0: LstmStep,
    /// `0` or `1/(1−p)` per unit.
    mask: Array2<f32>,
    l1: LstmStep,
}

/// Everything [`SequenceDecoderModel::backward`] needs from a training pass.
#[derive(Debug, Clone)]
pub struct TrainTape {
    /// `[B, S, V]`
    pub logits: Array3<f32>,
    blocks: Vec<BlockTape>,
    steps: Vec<StepTape>,
}

impl SequenceDecoderModel {
    /// Forward pass in training mode.
    pub fn forward_train(&mut self, x: ArrayView3<f32>, steps: usize, rng: &mut StdRng) -> Result<TrainTape> {
        self.check_input(x)?;
        let b = x.len_of(ndarray::Axis(0));
        let h = self.config.hidden_dim;
        let v = self.config.vocab_size;

        let mut a: Vec<Array2<f32>> = x.outer_iter().map(|s| s.to_owned()).collect();
        let mut blocks = Vec::with_capacity(self.convs.len());
        for i in 0..self.convs.len() {
            let inputs = std::mem::take(&mut a);
            let mut out: Vec<Array2<f32>> = inputs.iter().map(|s| self.convs[i].forward(s.view())).collect();
            let bn = self.norms[i].forward_train(&mut out);
            out.iter_mut().for_each(relu_inplace);
            if i < 2 {
                a = out.iter().map(|o| max_pool(o.view(), POOL_SIZE)).collect();
            }
            blocks.push(BlockTape { inputs, bn, activated: out });
        }
        let mut features = Array2::<f32>::zeros((b, h));
        for (mut row, act) in features.rows_mut().into_iter().zip(&blocks[2].activated) {
            row.assign(&global_avg_pool(act.view()));
        }

        let p = self.config.dropout.clamp(0.0, 0.99);
        let keep = 1.0 / (1.0 - p);
        let mut hs = [features.clone(), features];
        let mut cs = [Array2::<f32>::zeros((b, h)), Array2::<f32>::zeros((b, h))];
        let mut tokens = vec![0usize; b];
        let mut logits = Array3::<f32>::zeros((b, steps, v));
        let mut tape = Vec::with_capacity(steps);

        for step in 0..steps {
            let emb = self.embedding.forward(&tokens);
            let [h0, h1] = &mut hs;
            let [c0, c1] = &mut cs;
            let l0 = self.lstm[0].step_cached(emb.view(), h0, c0);
            let mask = Array2::from_shape_simple_fn((b, h), || if rng.gen::<f32>() < p { 0.0 } else { keep });
            let between = &*h0 * &mask;
            let l1 = self.lstm[1].step_cached(between.view(), h1, c1);

            let out = self.output_projection.forward(h1.view());
            logits.slice_mut(s![.., step, ..]).assign(&out);
            let fed = tokens.clone();
            for (t, row) in tokens.iter_mut().zip(out.rows()) {
                *t = argmax(row);
            }
            tape.push(StepTape { tokens: fed, l0, mask, l1 });
        }
        debug!(batch = b, steps, "training forward");
        Ok(TrainTape { logits, blocks, steps: tape })
    }

    /// Gradients of `Σ dlogits · logits` with respect to every trainable tensor.
    pub fn backward(&self, tape: &TrainTape, dlogits: ArrayView3<f32>) -> Result<Gradients> {
        ensure!(
            dlogits.dim() == tape.logits.dim(),
            "gradient shape {:?} does not match logits {:?}",
            dlogits.shape(),
            tape.logits.shape()
        );
        let b = dlogits.len_of(ndarray::Axis(0));
        let h = self.config.hidden_dim;
        let proj = &self.output_projection;

        let mut d_proj_w = Array2::<f32>::zeros(proj.weight.raw_dim());
        let mut d_proj_b = Array1::<f32>::zeros(proj.bias.raw_dim());
        let mut d_emb = Array2::<f32>::zeros(self.embedding.weight.raw_dim());
        let mut d_lstm = [LstmGrads::zeros_like(&self.lstm[0]), LstmGrads::zeros_like(&self.lstm[1])];
        let mut dh = [Array2::<f32>::zeros((b, h)), Array2::<f32>::zeros((b, h))];
        let mut dc = [Array2::<f32>::zeros((b, h)), Array2::<f32>::zeros((b, h))];

        for (step, st) in tape.steps.iter().enumerate().rev() {
            let dy = dlogits.slice(s![.., step, ..]);
            dh[1] += &proj.backward(st.l1.h.view(), dy, &mut d_proj_w, &mut d_proj_b);

            let (dx1, dh1, dc1) = self.lstm[1].step_backward(&st.l1, dh[1].view(), dc[1].view(), &mut d_lstm[1]);
            dh[1] = dh1;
            dc[1] = dc1;
            dh[0] += &(dx1 * &st.mask);

            let (dx0, dh0, dc0) = self.lstm[0].step_backward(&st.l0, dh[0].view(), dc[0].view(), &mut d_lstm[0]);
            dh[0] = dh0;
            dc[0] = dc0;
            self.embedding.backward(&st.tokens, dx0.view(), &mut d_emb);
        }

        let mut grads = Gradients::new();
        grads.insert("output_projection.weight".into(), d_proj_w.into_dyn());
        grads.insert("output_projection.bias".into(), d_proj_b.into_dyn());
        grads.insert("embedding.weight".into(), d_emb.into_dyn());
        for (l, g) in d_lstm.into_iter().enumerate() {
            grads.insert(lstm_key("weight_ih", l), g.weight_ih.into_dyn());
            grads.insert(lstm_key("weight_hh", l), g.weight_hh.into_dyn());
            grads.insert(lstm_key("bias_ih", l), g.bias_ih.into_dyn());
            grads.insert(lstm_key("bias_hh", l), g.bias_hh.into_dyn());
        }

        // Both layers start from the encoder features.
        let dfeatures = &dh[0] + &dh[1];
        let last_len = tape.blocks[2].activated.first().map_or(1, |a| a.ncols());
        let mut d: Vec<Array2<f32>> = dfeatures
            .rows()
            .into_iter()
            .map(|row| global_avg_pool_backward(row, last_len))
            .collect();

        for (i, blk) in tape.blocks.iter().enumerate().rev() {
            if i < 2 {
                d = d
                    .iter()
                    .zip(&blk.activated)
                    .map(|(dy, act)| max_pool_backward(act.view(), dy.view(), POOL_SIZE))
                    .collect();
            }
            for (dy, act) in d.iter_mut().zip(&blk.activated) {
                relu_backward(act.view(), dy);
            }
            let (d_pre, d_gamma, d_beta) = self.norms[i].backward(&blk.bn, &d);
            grads.insert(norm_key(i, "weight"), d_gamma.into_dyn());
            grads.insert(norm_key(i, "bias"), d_beta.into_dyn());

            let conv = &self.convs[i];
            let mut dw = Array3::<f32>::zeros(conv.weight.raw_dim());
            let mut db = Array1::<f32>::zeros(conv.bias.raw_dim());
            let mut dx = Vec::with_capacity(b);
            for (dy, x) in d_pre.iter().zip(&blk.inputs) {
                let (gx, gw, gb) = conv.backward(x.view(), dy.view());
                dw += &gw;
                db += &gb;
                dx.push(gx);
            }
            grads.insert(conv_key(i, "weight"), dw.into_dyn());
            grads.insert(conv_key(i, "bias"), db.into_dyn());
            d = dx;
        }
        Ok(grads)
    }
}
