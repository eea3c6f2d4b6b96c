//! Normalised `(signal, placeholder text)` pairs for the training loop.
//!
//! Every epoch of every feature file is loaded eagerly and normalised once.
//! Files that fail to load are logged and skipped.
use anyhow::{Context, Result};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::Path;
use tracing::{info, warn};

use crate::normalize::SignalNormalizer;
use crate::store::{list_feature_files, read_raw_signals};

/// One training example.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSample {
    /// `[max_channels, max_timepoints]`, z-scored.
    pub signal: Array2<f32>,
    pub text: String,
    pub file: String,
    pub epoch: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EpochDataset {
    samples: Vec<EpochSample>,
}

impl EpochDataset {
    /// Load every feature file in `dir`. A missing directory yields an empty dataset.
    pub fn load(dir: &Path, normalizer: SignalNormalizer) -> Result<Self> {
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "feature directory not found; dataset is empty");
            return Ok(Self::default());
        }
        let files = list_feature_files(dir)?;
        info!(n_files = files.len(), "loading feature files");

        let mut ds = Self::default();
        for path in &files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match read_raw_signals(path) {
                Ok(raw) => ds.push_epochs(&raw, &name, normalizer),
                Err(e) => warn!(file = %name, error = %e, "skipping file"),
            }
        }
        info!(n_samples = ds.len(), "dataset ready");
        Ok(ds)
    }

    /// Append every epoch of a `[N, C, T]` tensor.
    pub fn push_epochs(&mut self, raw: &Array3<f32>, file: &str, normalizer: SignalNormalizer) {
        for (epoch, sample) in raw.outer_iter().enumerate() {
            let text = format!("Sleep brain activity pattern {}", self.samples.len());
            self.samples.push(EpochSample {
                signal: normalizer.normalize(sample),
                text,
                file: file.to_string(),
                epoch,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<(ArrayView2<'_, f32>, &str)> {
        self.samples.get(idx).map(|s| (s.signal.view(), s.text.as_str()))
    }

    pub fn samples(&self) -> &[EpochSample] {
        &self.samples
    }

    /// Shuffled mini-batches of `[B, C, T]`; the last one may be short.
    ///
    /// Fails if the samples of a batch differ in shape, which happens only
    /// when epochs were pushed with different normalisers.
    pub fn batches<R: Rng>(&self, batch_size: usize, rng: &mut R) -> Result<Vec<Array3<f32>>> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        order.shuffle(rng);
        order
            .chunks(batch_size.max(1))
            .enumerate()
            .map(|(b, chunk)| {
                let views: Vec<_> = chunk
                    .iter()
                    .map(|&i| self.samples[i].signal.view().insert_axis(Axis(0)))
                    .collect();
                ndarray::concatenate(Axis(0), &views)
                    .with_context(|| format!("batch {b}: samples differ in shape"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::StWriter;
    use crate::store::{feature_file_name, write_bundle};
    use crate::features::FeatureExtractor;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn write_file(dir: &Path, name: &str, n: usize) {
        let epochs = Array3::from_shape_fn((n, 2, 100), |(e, c, t)| ((e * 3 + c + t) as f32 * 0.2).sin());
        let b = FeatureExtractor.extract(&epochs, 100.0).unwrap();
        write_bundle(&b, &dir.join(feature_file_name(name))).unwrap();
    }

    #[test]
    fn loads_all_epochs_with_placeholder_text() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a", 2);
        write_file(dir.path(), "b", 3);
        let ds = EpochDataset::load(dir.path(), SignalNormalizer::new(4, 120)).unwrap();
        assert_eq!(ds.len(), 5);
        let (sig, text) = ds.get(4).unwrap();
        assert_eq!(sig.dim(), (4, 120));
        assert_eq!(text, "Sleep brain activity pattern 4");
        assert_eq!(ds.samples()[2].file, feature_file_name("b"));
        assert_eq!(ds.samples()[2].epoch, 0);
    }

    #[test]
    fn broken_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "good", 2);
        let mut w = StWriter::new();
        w.add_f32("statistical/mean", &[0.0; 2], &[1, 2]);
        w.write(&dir.path().join(feature_file_name("no_raw"))).unwrap();
        std::fs::write(dir.path().join(feature_file_name("zz_garbage")), b"not gzip").unwrap();
        let ds = EpochDataset::load(dir.path(), SignalNormalizer::new(2, 100)).unwrap();
        assert_eq!(ds.len(), 2);
    }

    #[test]
    fn missing_dir_is_empty() {
        let ds = EpochDataset::load(Path::new("/definitely/not/here"), SignalNormalizer::new(2, 10)).unwrap();
        assert!(ds.is_empty());
    }

    #[test]
    fn batches_cover_every_sample_once() {
        let mut ds = EpochDataset::default();
        ds.push_epochs(&Array3::from_shape_fn((5, 1, 4), |(e, _, t)| (e * 10 + t) as f32), "f", SignalNormalizer::new(1, 4));
        let mut rng = StdRng::seed_from_u64(3);
        let batches = ds.batches(2, &mut rng).unwrap();
        assert_eq!(batches.iter().map(|b| b.len_of(Axis(0))).collect::<Vec<_>>(), vec![2, 2, 1]);
        let total: usize = batches.iter().map(|b| b.len_of(Axis(0))).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn mixed_shapes_are_an_error() {
        let mut ds = EpochDataset::default();
        ds.push_epochs(&Array3::zeros((1, 1, 4)), "a", SignalNormalizer::new(1, 4));
        ds.push_epochs(&Array3::zeros((1, 1, 4)), "b", SignalNormalizer::new(2, 4));
        let mut rng = StdRng::seed_from_u64(0);
        let err = ds.batches(4, &mut rng).unwrap_err();
        assert!(format!("{err:#}").contains("differ in shape"));
        // kept apart, each batch is fine on its own
        assert_eq!(ds.batches(1, &mut rng).unwrap().len(), 2);
    }
}
