mod common;
use common::write_feature_file;
use eeg2dream::lexicon::{word, FALLBACK_TEXT};
use eeg2dream::{
    format_predictions, save_checkpoint, save_predictions, ConfidenceSummary, DreamInferenceEngine,
    FeatureStoreError, InferenceConfig, ModelConfig, SequenceDecoder, SequenceDecoderModel, StWriter,
};
use ndarray::{Array2, Array3, ArrayView3};
use std::cell::RefCell;
use std::path::Path;

/// Emits one fixed token at every step and remembers its last input.
struct FixedToken {
    token: usize,
    vocab: usize,
    seen: RefCell<Option<Array3<f32>>>,
}

impl FixedToken {
    fn new(token: usize) -> Self {
        Self { token, vocab: 16, seen: RefCell::new(None) }
    }
}

impl SequenceDecoder for FixedToken {
    fn input_shape(&self) -> (usize, usize) {
        (19, 3000)
    }

    fn max_seq_len(&self) -> usize {
        20
    }

    fn decode(&self, x: ArrayView3<f32>, steps: usize) -> anyhow::Result<Array3<f32>> {
        *self.seen.borrow_mut() = Some(x.to_owned());
        let mut logits = Array3::zeros((x.dim().0, steps, self.vocab));
        for b in 0..x.dim().0 {
            for s in 0..steps {
                logits[[b, s, self.token]] = 8.0;
            }
        }
        Ok(logits)
    }
}

fn cfg(dir: &Path) -> InferenceConfig {
    InferenceConfig { feature_dir: dir.to_path_buf(), ..InferenceConfig::default() }
}

#[test]
fn constant_epoch_decodes_fixed_token() {
    let engine = DreamInferenceEngine::with_model(FixedToken::new(5), &InferenceConfig::default());
    let pred = engine.predict(Array2::<f32>::ones((19, 3000))).unwrap();

    let seen = engine.model().seen.borrow().clone().unwrap();
    assert_eq!(seen.dim(), (1, 19, 3000));
    assert!(seen.iter().all(|&v| v == 0.0));

    assert_eq!(pred.tokens, vec![5; 20]);
    assert_eq!(pred.text, vec![word(5); 20].join(" "));
    assert_eq!(pred.text.split(' ').next(), Some("rest"));
    assert!(pred.confidence > 0.0 && pred.confidence <= 1.0);
    assert_eq!(pred.file, None);
}

#[test]
fn pad_token_renders_silent_dream() {
    let engine = DreamInferenceEngine::with_model(FixedToken::new(0), &InferenceConfig::default());
    let pred = engine.predict(vec![vec![0.5_f32; 100]; 4]).unwrap();
    assert_eq!(pred.text, FALLBACK_TEXT);
    assert_eq!(pred.tokens, vec![0; 20]);
}

#[test]
fn missing_raw_signals_is_typed_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = StWriter::new();
    w.add_f32("statistical/mean", &[0.0; 4], &[2, 2]);
    w.write(&dir.path().join("broken_features.safetensors.gz")).unwrap();

    let engine = DreamInferenceEngine::with_model(FixedToken::new(5), &cfg(dir.path()));
    let err = engine.predict_from_file("broken_features.safetensors.gz").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FeatureStoreError>(),
        Some(FeatureStoreError::MissingEntry { .. })
    ));

    // batch mode logs and skips it
    assert!(engine.batch_inference().unwrap().is_empty());
}

#[test]
fn file_mode_tags_file_and_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let epochs = Array3::from_shape_fn((3, 2, 400), |(e, c, t)| ((e + c) as f32 + t as f32 * 0.05).sin());
    write_feature_file(dir.path(), "SC4001E0-PSG", &epochs, 100.0);

    let engine = DreamInferenceEngine::with_model(FixedToken::new(7), &cfg(dir.path()));
    let preds = engine.predict_from_file("SC4001E0-PSG_features.safetensors.gz").unwrap();
    assert_eq!(preds.len(), 3);
    for (i, p) in preds.iter().enumerate() {
        assert_eq!(p.epoch, Some(i));
        assert_eq!(p.file.as_deref(), Some("SC4001E0-PSG_features.safetensors.gz"));
    }
}

#[test]
fn batch_inference_respects_max_files_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    let epochs = Array3::from_shape_fn((2, 2, 300), |(_, c, t)| (c as f32 + t as f32 * 0.1).cos());
    for name in ["c", "a", "b"] {
        write_feature_file(dir.path(), name, &epochs, 100.0);
    }
    let engine = DreamInferenceEngine::with_model(
        FixedToken::new(3),
        &InferenceConfig { max_files: 2, ..cfg(dir.path()) },
    );
    let preds = engine.batch_inference().unwrap();
    let files: Vec<&str> = preds.iter().filter_map(|p| p.file.as_deref()).collect();
    assert_eq!(
        files,
        vec![
            "a_features.safetensors.gz",
            "a_features.safetensors.gz",
            "b_features.safetensors.gz",
            "b_features.safetensors.gz"
        ]
    );
}

#[test]
fn checkpoint_session_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let model_cfg = ModelConfig {
        input_channels: 2,
        input_length: 300,
        hidden_dim: 8,
        vocab_size: 64,
        max_seq_len: 6,
        dropout: 0.3,
    };
    let ck = dir.path().join("model.safetensors.gz");
    save_checkpoint(&ck, &SequenceDecoderModel::new(model_cfg, 11), None).unwrap();

    let epochs = Array3::from_shape_fn((2, 2, 300), |(e, c, t)| ((e * 2 + c) as f32 + t as f32 * 0.2).sin());
    write_feature_file(dir.path(), "rec", &epochs, 100.0);

    let engine = DreamInferenceEngine::from_checkpoint(&ck, &cfg(dir.path())).unwrap();
    let preds = engine.batch_inference().unwrap();
    assert_eq!(preds.len(), 2);
    for p in &preds {
        assert_eq!(p.tokens.len(), 6);
        assert!(p.tokens.iter().all(|&t| t < 64));
        assert!((0.0..=1.0).contains(&p.confidence));
    }

    let summary = ConfidenceSummary::from_predictions(&preds).unwrap();
    assert!(summary.min <= summary.average && summary.average <= summary.max);

    let out = dir.path().join("results").join("predictions.txt");
    save_predictions(&preds, &out).unwrap();
    let text = std::fs::read_to_string(&out).unwrap();
    assert_eq!(text, format_predictions(&preds));
    assert!(text.starts_with("EEG DREAM DECODING RESULTS\n"));
    assert_eq!(text.matches("Dream Text: ").count(), 2);
    assert!(text.contains("File: rec_features.safetensors.gz\nEpoch: 1\n"));
}

#[test]
fn missing_checkpoint_fails_before_predicting() {
    let dir = tempfile::tempdir().unwrap();
    let res = DreamInferenceEngine::from_checkpoint(&dir.path().join("absent.safetensors.gz"), &cfg(dir.path()));
    assert!(res.is_err());
}
