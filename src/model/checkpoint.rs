//! Model checkpoints.
//!
//! One gzip-compressed safetensors container:
//!
//! ```text
//! __metadata__.model_config        ModelConfig as JSON
//! model.eeg_encoder.{0,4,8}.{weight,bias}                        conv blocks
//! model.eeg_encoder.{1,5,9}.{weight,bias,running_mean,running_var} batch norms
//! model.embedding.weight
//! model.text_decoder.{weight_ih,weight_hh,bias_ih,bias_hh}_l{0,1}
//! model.output_projection.{weight,bias}
//! optimizer.step, optimizer.lr
//! optimizer.exp_avg.<param>, optimizer.exp_avg_sq.<param>
//! ```
//!
//! Inference only reads the `model.*` entries.
use anyhow::{Context, Result};
use ndarray::{Array, ArrayD, ArrayViewD, ArrayViewMutD, Dimension, Ix1, Ix2, Ix3};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use super::layers::{BatchNorm1d, Conv1d, Embedding, Linear, LstmCell};
use super::SequenceDecoderModel;
use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::io::{StFile, StWriter};

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const CONFIG_KEY: &str = "model_config";

/// Sequential indices of the conv and norm layers inside the encoder.
const CONV_INDICES: [usize; 3] = [0, 4, 8];
const NORM_INDICES: [usize; 3] = [1, 5, 9];

pub(crate) fn conv_key(block: usize, field: &str) -> String {
    format!("eeg_encoder.{}.{field}", CONV_INDICES[block])
}

pub(crate) fn norm_key(block: usize, field: &str) -> String {
    format!("eeg_encoder.{}.{field}", NORM_INDICES[block])
}

pub(crate) fn lstm_key(field: &str, layer: usize) -> String {
    format!("text_decoder.{field}_l{layer}")
}

/// BatchNorm running statistics: saved with the model, never optimised.
pub fn is_buffer(name: &str) -> bool {
    name.ends_with(".running_mean") || name.ends_with(".running_var")
}

/// Adam moments for the optimised parameters, keyed by parameter name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OptimizerState {
    pub step: usize,
    pub lr: f32,
    pub exp_avg: BTreeMap<String, ArrayD<f32>>,
    pub exp_avg_sq: BTreeMap<String, ArrayD<f32>>,
}

/// Everything read back from a checkpoint file.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub model: SequenceDecoderModel,
    pub optimizer: Option<OptimizerState>,
}

impl SequenceDecoderModel {
    /// Parameters and buffers under their checkpoint names (without the
    /// `model.` prefix).
    pub fn named_parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        let mut out = Vec::new();
        for (i, (conv, bn)) in self.convs.iter().zip(&self.norms).enumerate() {
            out.push((conv_key(i, "weight"), conv.weight.view().into_dyn()));
            out.push((conv_key(i, "bias"), conv.bias.view().into_dyn()));
            out.push((norm_key(i, "weight"), bn.weight.view().into_dyn()));
            out.push((norm_key(i, "bias"), bn.bias.view().into_dyn()));
            out.push((norm_key(i, "running_mean"), bn.running_mean.view().into_dyn()));
            out.push((norm_key(i, "running_var"), bn.running_var.view().into_dyn()));
        }
        out.push(("embedding.weight".into(), self.embedding.weight.view().into_dyn()));
        for (l, cell) in self.lstm.iter().enumerate() {
            out.push((lstm_key("weight_ih", l), cell.weight_ih.view().into_dyn()));
            out.push((lstm_key("weight_hh", l), cell.weight_hh.view().into_dyn()));
            out.push((lstm_key("bias_ih", l), cell.bias_ih.view().into_dyn()));
            out.push((lstm_key("bias_hh", l), cell.bias_hh.view().into_dyn()));
        }
        out.push(("output_projection.weight".into(), self.output_projection.weight.view().into_dyn()));
        out.push(("output_projection.bias".into(), self.output_projection.bias.view().into_dyn()));
        out
    }

    /// Mutable views of every optimised tensor (buffers excluded), same names.
    pub fn trainable_parameters_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f32>)> {
        let mut out = Vec::new();
        for (i, (conv, bn)) in self.convs.iter_mut().zip(self.norms.iter_mut()).enumerate() {
            out.push((conv_key(i, "weight"), conv.weight.view_mut().into_dyn()));
            out.push((conv_key(i, "bias"), conv.bias.view_mut().into_dyn()));
            out.push((norm_key(i, "weight"), bn.weight.view_mut().into_dyn()));
            out.push((norm_key(i, "bias"), bn.bias.view_mut().into_dyn()));
        }
        out.push(("embedding.weight".into(), self.embedding.weight.view_mut().into_dyn()));
        for (l, cell) in self.lstm.iter_mut().enumerate() {
            out.push((lstm_key("weight_ih", l), cell.weight_ih.view_mut().into_dyn()));
            out.push((lstm_key("weight_hh", l), cell.weight_hh.view_mut().into_dyn()));
            out.push((lstm_key("bias_ih", l), cell.bias_ih.view_mut().into_dyn()));
            out.push((lstm_key("bias_hh", l), cell.bias_hh.view_mut().into_dyn()));
        }
        let proj = &mut self.output_projection;
        out.push(("output_projection.weight".into(), proj.weight.view_mut().into_dyn()));
        out.push(("output_projection.bias".into(), proj.bias.view_mut().into_dyn()));
        out
    }

    /// Rebuild a model from the `model.*` entries of a container.
    pub fn from_container(f: &StFile, config: ModelConfig) -> Result<Self> {
        let reader = ParamReader { f };
        let h = config.hidden_dim;
        let c_in = [config.input_channels, 32, 64];
        let c_out = [32, 64, h];
        let kernels = [7, 5, 3];
        let strides = [2, 2, 2];
        let pads = [3, 2, 1];

        let mut convs = Vec::with_capacity(3);
        let mut norms = Vec::with_capacity(3);
        for i in 0..3 {
            convs.push(Conv1d {
                weight: reader.get(&conv_key(i, "weight"), Ix3(c_out[i], c_in[i], kernels[i]))?,
                bias: reader.get(&conv_key(i, "bias"), Ix1(c_out[i]))?,
                stride: strides[i],
                padding: pads[i],
            });
            norms.push(BatchNorm1d {
                weight: reader.get(&norm_key(i, "weight"), Ix1(c_out[i]))?,
                bias: reader.get(&norm_key(i, "bias"), Ix1(c_out[i]))?,
                running_mean: reader.get(&norm_key(i, "running_mean"), Ix1(c_out[i]))?,
                running_var: reader.get(&norm_key(i, "running_var"), Ix1(c_out[i]))?,
            });
        }
        let lstm_layer = |l: usize| -> Result<LstmCell> {
            Ok(LstmCell {
                weight_ih: reader.get(&lstm_key("weight_ih", l), Ix2(4 * h, h))?,
                weight_hh: reader.get(&lstm_key("weight_hh", l), Ix2(4 * h, h))?,
                bias_ih: reader.get(&lstm_key("bias_ih", l), Ix1(4 * h))?,
                bias_hh: reader.get(&lstm_key("bias_hh", l), Ix1(4 * h))?,
            })
        };
        let lstm = [lstm_layer(0)?, lstm_layer(1)?];
        let embedding = Embedding { weight: reader.get("embedding.weight", Ix2(config.vocab_size, h))? };
        let output_projection = Linear {
            weight: reader.get("output_projection.weight", Ix2(config.vocab_size, h))?,
            bias: reader.get("output_projection.bias", Ix1(config.vocab_size))?,
        };

        let convs: [Conv1d; 3] = convs.try_into().map_err(|_| anyhow::anyhow!("conv stack"))?;
        let norms: [BatchNorm1d; 3] = norms.try_into().map_err(|_| anyhow::anyhow!("norm stack"))?;
        Ok(Self { config, convs, norms, embedding, lstm, output_projection })
    }
}

struct ParamReader<'a> {
    f: &'a StFile,
}

impl ParamReader<'_> {
    fn get<D: Dimension>(&self, name: &str, expected: D) -> Result<Array<f32, D>> {
        let key = format!("{MODEL_PREFIX}{name}");
        if !self.f.contains(&key) {
            return Err(ModelError::MissingParameter(name.to_string()).into());
        }
        let t = self.f.f32_tensor(&key)?;
        if t.shape() != expected.slice() {
            return Err(ModelError::ParameterShape {
                name: name.to_string(),
                got: t.shape().to_vec(),
                expected: expected.slice().to_vec(),
            }
            .into());
        }
        Ok(t.into_dimensionality::<D>()?)
    }
}

/// Write model parameters, its config and (optionally) optimizer state.
pub fn save_checkpoint(
    path: &Path,
    model: &SequenceDecoderModel,
    optimizer: Option<&OptimizerState>,
) -> Result<()> {
    let mut w = StWriter::new();
    w.set_metadata(CONFIG_KEY, serde_json::to_string(&model.config)?);
    for (name, p) in model.named_parameters() {
        let data: Vec<f32> = p.iter().copied().collect();
        w.add_f32(&format!("{MODEL_PREFIX}{name}"), &data, p.shape());
    }
    if let Some(opt) = optimizer {
        w.add_i32(&format!("{OPTIMIZER_PREFIX}step"), &[opt.step as i32], &[1]);
        w.add_f32(&format!("{OPTIMIZER_PREFIX}lr"), &[opt.lr], &[1]);
        for (group, map) in [("exp_avg", &opt.exp_avg), ("exp_avg_sq", &opt.exp_avg_sq)] {
            for (name, arr) in map {
                let data: Vec<f32> = arr.iter().copied().collect();
                w.add_f32(&format!("{OPTIMIZER_PREFIX}{group}.{name}"), &data, arr.shape());
            }
        }
    }
    w.write(path)
        .with_context(|| format!("saving checkpoint {}", path.display()))?;
    info!(path = %path.display(), params = w.len(), "checkpoint saved");
    Ok(())
}

/// Read a checkpoint. Fails if the file is missing or any parameter is absent.
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let f = StFile::open(path).with_context(|| format!("loading checkpoint {}", path.display()))?;
    let config = match f.metadata(CONFIG_KEY) {
        Some(json) => serde_json::from_str(json).context("parsing model_config metadata")?,
        None => {
            warn!(file = f.label(), "checkpoint has no model_config; using defaults");
            ModelConfig::default()
        }
    };
    let model = SequenceDecoderModel::from_container(&f, config)
        .with_context(|| format!("restoring model from {}", f.label()))?;
    let optimizer = read_optimizer(&f)?;
    Ok(Checkpoint { model, optimizer })
}

fn read_optimizer(f: &StFile) -> Result<Option<OptimizerState>> {
    let step_key = format!("{OPTIMIZER_PREFIX}step");
    if !f.contains(&step_key) {
        return Ok(None);
    }
    let mut state = OptimizerState {
        step: f.f32_tensor(&step_key)?.iter().next().copied().unwrap_or(0.0) as usize,
        lr: f.f32_tensor(&format!("{OPTIMIZER_PREFIX}lr"))?.iter().next().copied().unwrap_or(0.0),
        ..OptimizerState::default()
    };
    for key in f.keys() {
        let Some(rest) = key.strip_prefix(OPTIMIZER_PREFIX) else { continue };
        if let Some(name) = rest.strip_prefix("exp_avg_sq.") {
            state.exp_avg_sq.insert(name.to_string(), f.f32_tensor(key)?);
        } else if let Some(name) = rest.strip_prefix("exp_avg.") {
            state.exp_avg.insert(name.to_string(), f.f32_tensor(key)?);
        }
    }
    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SequenceDecoder;
    use ndarray::Array3;

    fn cfg() -> ModelConfig {
        ModelConfig { input_channels: 2, input_length: 120, hidden_dim: 4, vocab_size: 12, max_seq_len: 3, dropout: 0.3 }
    }

    #[test]
    fn save_load_restores_identical_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models/best.safetensors.gz");
        let model = SequenceDecoderModel::new(cfg(), 11);
        save_checkpoint(&path, &model, None).unwrap();

        let ck = load_checkpoint(&path).unwrap();
        assert_eq!(ck.model, model);
        assert!(ck.optimizer.is_none());
        let x = Array3::from_shape_fn((1, 2, 120), |(_, c, t)| (c as f32 + t as f32 * 0.1).cos());
        assert_eq!(ck.model.decode(x.view(), 3).unwrap(), model.decode(x.view(), 3).unwrap());
    }

    #[test]
    fn pytorch_style_names() {
        let model = SequenceDecoderModel::new(cfg(), 0);
        let names: Vec<String> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names.len(), 3 * 6 + 1 + 8 + 2);
        assert!(names.contains(&"eeg_encoder.9.running_var".to_string()));
        assert!(names.contains(&"text_decoder.weight_hh_l1".to_string()));
    }

    #[test]
    fn trainable_set_excludes_running_stats() {
        let mut model = SequenceDecoderModel::new(cfg(), 0);
        let all: Vec<String> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
        let trainable: Vec<String> = model.trainable_parameters_mut().into_iter().map(|(n, _)| n).collect();
        let expected: Vec<String> = all.into_iter().filter(|n| !is_buffer(n)).collect();
        assert_eq!(trainable, expected);
        assert_eq!(trainable.len(), 3 * 4 + 1 + 8 + 2);
    }

    #[test]
    fn optimizer_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ck.safetensors.gz");
        let model = SequenceDecoderModel::new(cfg(), 1);
        let mut opt = OptimizerState { step: 17, lr: 5e-5, ..Default::default() };
        opt.exp_avg.insert("output_projection.bias".into(), ArrayD::from_elem(vec![12], 0.25));
        opt.exp_avg_sq.insert("output_projection.bias".into(), ArrayD::from_elem(vec![12], 0.5));
        save_checkpoint(&path, &model, Some(&opt)).unwrap();
        assert_eq!(load_checkpoint(&path).unwrap().optimizer, Some(opt));
    }

    #[test]
    fn missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_checkpoint(&dir.path().join("nope.safetensors.gz")).is_err());
    }

    #[test]
    fn missing_parameter_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.safetensors.gz");
        let mut w = StWriter::new();
        w.set_metadata(CONFIG_KEY, serde_json::to_string(&cfg()).unwrap());
        w.add_f32("model.output_projection.bias", &[0.0; 12], &[12]);
        w.write(&path).unwrap();
        let err = load_checkpoint(&path).unwrap_err();
        assert!(err.chain().any(|e| matches!(e.downcast_ref::<ModelError>(), Some(ModelError::MissingParameter(_)))));
    }
}
