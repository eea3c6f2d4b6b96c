//! End-to-end training loop.
//!
//! Every parameter of the model is optimised. Each batch:
//!
//! ```text
//! training forward (batch statistics, dropout) → logits [B, S, V]
//! targets ~ U{1, …, V−1}                       (no tokenizer: random targets)
//! loss   = cross-entropy, PAD (0) ignored
//! dL/dlogits = (softmax − onehot) / n_counted
//! backward through projection, LSTM, embedding and encoder
//! clip global grad norm → AdamW step
//! ```
//!
//! After every epoch the mean loss drives a reduce-on-plateau schedule and the
//! best checkpoint (with optimizer state) is written.
use anyhow::{bail, ensure, Result};
use ndarray::{Array2, ArrayD, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::TrainConfig;
use crate::dataset::EpochDataset;
use crate::lexicon::PAD;
use crate::model::checkpoint::{is_buffer, save_checkpoint, Checkpoint, OptimizerState};
use crate::model::{Gradients, SequenceDecoderModel};

// ── Optimiser ─────────────────────────────────────────────────────────────────

/// AdamW with decoupled weight decay over named tensors.
///
/// Moments are created lazily, the first time a tensor receives a gradient.
#[derive(Debug, Clone)]
pub struct AdamW {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
    step: usize,
    exp_avg: BTreeMap<String, ArrayD<f32>>,
    exp_avg_sq: BTreeMap<String, ArrayD<f32>>,
}

impl AdamW {
    pub fn new(lr: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            step: 0,
            exp_avg: BTreeMap::new(),
            exp_avg_sq: BTreeMap::new(),
        }
    }

    /// Restore moments saved by [`state`](Self::state). Every moment must name
    /// a trainable tensor of `model` and match its shape.
    pub fn from_state(state: &OptimizerState, weight_decay: f32, model: &SequenceDecoderModel) -> Result<Self> {
        let shapes: BTreeMap<String, Vec<usize>> = model
            .named_parameters()
            .into_iter()
            .filter(|(n, _)| !is_buffer(n))
            .map(|(n, p)| (n, p.shape().to_vec()))
            .collect();
        for (name, m) in state.exp_avg.iter().chain(&state.exp_avg_sq) {
            match shapes.get(name) {
                Some(shape) if shape.as_slice() == m.shape() => {}
                Some(shape) => bail!("optimizer moment {name} has shape {:?}, parameter has {shape:?}", m.shape()),
                None => bail!("optimizer moment {name} matches no trainable parameter"),
            }
        }
        let mut opt = Self::new(state.lr, weight_decay);
        opt.step = state.step;
        opt.exp_avg = state.exp_avg.clone();
        opt.exp_avg_sq = state.exp_avg_sq.clone();
        Ok(opt)
    }

    pub fn state(&self) -> OptimizerState {
        OptimizerState {
            step: self.step,
            lr: self.lr,
            exp_avg: self.exp_avg.clone(),
            exp_avg_sq: self.exp_avg_sq.clone(),
        }
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// One update of every tensor that has a gradient in `grads`.
    pub fn step(&mut self, model: &mut SequenceDecoderModel, grads: &Gradients) -> Result<()> {
        self.step += 1;
        let t = self.step as i32;
        let bc1 = 1.0 - self.beta1.powi(t);
        let bc2 = 1.0 - self.beta2.powi(t);
        let (lr, b1, b2, eps, decay) = (self.lr, self.beta1, self.beta2, self.eps, self.weight_decay);

        for (name, mut p) in model.trainable_parameters_mut() {
            let Some(g) = grads.get(&name) else { continue };
            ensure!(g.shape() == p.shape(), "gradient {name} has shape {:?}, parameter has {:?}", g.shape(), p.shape());
            let m = self.exp_avg.entry(name.clone()).or_insert_with(|| ArrayD::zeros(p.raw_dim()));
            let v = self.exp_avg_sq.entry(name).or_insert_with(|| ArrayD::zeros(p.raw_dim()));
            Zip::from(&mut p).and(g).and(m).and(v).for_each(|p, &g, m, v| {
                *p *= 1.0 - lr * decay;
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *p -= lr * (*m / bc1) / ((*v / bc2).sqrt() + eps);
            });
        }
        Ok(())
    }
}

/// Halve (by `factor`) the learning rate after `patience` epochs without improvement.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    pub factor: f32,
    pub patience: usize,
    /// Relative improvement needed to reset the counter.
    pub threshold: f32,
    best: f32,
    bad_epochs: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f32, patience: usize) -> Self {
        Self { factor, patience, threshold: 1e-4, best: f32::INFINITY, bad_epochs: 0 }
    }

    /// Feed one epoch's loss; returns the (possibly reduced) learning rate.
    pub fn step(&mut self, loss: f32, lr: f32) -> f32 {
        if loss < self.best * (1.0 - self.threshold) {
            self.best = loss;
            self.bad_epochs = 0;
            return lr;
        }
        self.bad_epochs += 1;
        if self.bad_epochs > self.patience {
            self.bad_epochs = 0;
            let new_lr = lr * self.factor;
            info!(old_lr = lr, new_lr, "reducing learning rate");
            return new_lr;
        }
        lr
    }
}

// ── Loss ──────────────────────────────────────────────────────────────────────

/// Cross-entropy over `[N, V]` logits with PAD targets ignored.
///
/// Returns the mean loss and `dL/dlogits`; `(0, zeros)` when every target is PAD.
pub fn cross_entropy(logits: &Array2<f32>, targets: &[usize]) -> (f32, Array2<f32>) {
    let mut grad = Array2::<f32>::zeros(logits.raw_dim());
    let counted = targets.iter().filter(|&&t| t != PAD).count();
    if counted == 0 {
        return (0.0, grad);
    }
    let mut loss = 0.0_f64;
    for ((row, mut g), &t) in logits.rows().into_iter().zip(grad.rows_mut()).zip(targets) {
        if t == PAD {
            continue;
        }
        let m = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let sum: f64 = row.iter().map(|&v| ((v - m) as f64).exp()).sum();
        let log_z = m as f64 + sum.ln();
        loss += log_z - row[t] as f64;
        for (gv, &v) in g.iter_mut().zip(row.iter()) {
            *gv = (((v as f64 - log_z).exp()) / counted as f64) as f32;
        }
        g[t] -= 1.0 / counted as f32;
    }
    ((loss / counted as f64) as f32, grad)
}

/// Scale gradients in place so their joint L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut Gradients, max_norm: f32) -> f32 {
    let sq: f64 = grads.values().flat_map(|g| g.iter()).map(|&g| (g as f64).powi(2)).sum();
    let norm = sq.sqrt() as f32;
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        for g in grads.values_mut() {
            g.mapv_inplace(|v| v * coef);
        }
    }
    norm
}

// ── Trainer ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub epochs_run: usize,
    pub best_loss: f32,
    pub final_lr: f32,
    pub epoch_losses: Vec<f32>,
}

pub struct Trainer {
    model: SequenceDecoderModel,
    optimizer: AdamW,
    scheduler: ReduceLrOnPlateau,
    cfg: TrainConfig,
    rng: StdRng,
}

impl Trainer {
    pub fn new(model: SequenceDecoderModel, cfg: TrainConfig) -> Self {
        Self {
            optimizer: AdamW::new(cfg.learning_rate, cfg.weight_decay),
            scheduler: ReduceLrOnPlateau::new(cfg.plateau_factor, cfg.plateau_patience),
            rng: StdRng::seed_from_u64(cfg.seed),
            model,
            cfg,
        }
    }

    /// Continue from a checkpoint, restoring optimizer moments when present.
    pub fn resume(ck: Checkpoint, cfg: TrainConfig) -> Result<Self> {
        let mut t = Self::new(ck.model, cfg);
        if let Some(state) = &ck.optimizer {
            t.optimizer = AdamW::from_state(state, t.cfg.weight_decay, &t.model)?;
            info!(step = state.step, lr = state.lr, "optimizer state restored");
        }
        Ok(t)
    }

    pub fn model(&self) -> &SequenceDecoderModel {
        &self.model
    }

    pub fn into_model(self) -> SequenceDecoderModel {
        self.model
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.lr
    }

    pub fn optimizer_state(&self) -> OptimizerState {
        self.optimizer.state()
    }

    /// Random targets in `[1, vocab)`.
    fn dummy_targets(&mut self, n: usize) -> Vec<usize> {
        let vocab = self.model.config.vocab_size;
        (0..n).map(|_| self.rng.gen_range(1..vocab)).collect()
    }

    /// One pass over shuffled batches; returns the mean batch loss.
    pub fn train_epoch(&mut self, ds: &EpochDataset) -> Result<f32> {
        if ds.is_empty() {
            bail!("cannot train on an empty dataset");
        }
        if self.model.config.vocab_size < 2 {
            bail!("vocabulary of {} leaves no non-PAD target", self.model.config.vocab_size);
        }
        let steps = self.model.config.max_seq_len;
        let batches = ds.batches(self.cfg.batch_size, &mut self.rng)?;
        let mut total = 0.0_f64;

        for (i, batch) in batches.iter().enumerate() {
            let tape = self.model.forward_train(batch.view(), steps, &mut self.rng)?;
            let (b, s, v) = tape.logits.dim();
            let logits = tape.logits.to_shape((b * s, v))?.into_owned();

            let targets = self.dummy_targets(b * s);
            let (loss, dlogits) = cross_entropy(&logits, &targets);
            let dlogits = dlogits.into_shape_with_order((b, s, v))?;
            let mut grads = self.model.backward(&tape, dlogits.view())?;
            let norm = clip_grad_norm(&mut grads, self.cfg.grad_clip);

            self.optimizer.step(&mut self.model, &grads)?;
            total += loss as f64;
            debug!(batch = i, loss, grad_norm = norm, "batch");
        }
        Ok((total / batches.len().max(1) as f64) as f32)
    }

    /// Run `num_epochs` epochs, saving the best checkpoint as the loss improves.
    pub fn train(&mut self, ds: &EpochDataset) -> Result<TrainReport> {
        info!(
            samples = ds.len(),
            batch_size = self.cfg.batch_size,
            epochs = self.cfg.num_epochs,
            "starting training"
        );
        let mut best = f32::INFINITY;
        let mut losses = Vec::with_capacity(self.cfg.num_epochs);
        for epoch in 1..=self.cfg.num_epochs {
            let started = Instant::now();
            let loss = self.train_epoch(ds)?;
            self.optimizer.lr = self.scheduler.step(loss, self.optimizer.lr);
            info!(
                epoch,
                loss,
                lr = self.optimizer.lr,
                secs = started.elapsed().as_secs_f32(),
                "epoch complete"
            );
            losses.push(loss);
            if loss < best {
                best = loss;
                save_checkpoint(&self.cfg.checkpoint_path, &self.model, Some(&self.optimizer.state()))?;
                info!(best_loss = best, "new best checkpoint");
            }
        }
        Ok(TrainReport {
            epochs_run: losses.len(),
            best_loss: best,
            final_lr: self.optimizer.lr,
            epoch_losses: losses,
        })
    }
}
