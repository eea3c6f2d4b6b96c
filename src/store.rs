//! On-disk feature store: one compressed container per recording.
//!
//! ```text
//! <out_dir>/<basename>_features.safetensors.gz
//!   raw_signals                [N, C, T]
//!   spectral/<band>_power      [N, C]   × 5
//!   statistical/<stat>         [N, C]   × 5
//! ```
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::features::{Band, FeatureBundle, Statistic};
use crate::io::{StFile, StWriter};
use ndarray::Array3;

/// Suffix shared by every feature file.
pub const FEATURE_SUFFIX: &str = "_features.safetensors.gz";

pub const RAW_SIGNALS: &str = "raw_signals";
pub const SPECTRAL_GROUP: &str = "spectral";
pub const STATISTICAL_GROUP: &str = "statistical";

/// Files sampled when estimating the total epoch count.
pub const VERIFY_SAMPLE_FILES: usize = 5;

/// `SC4001E0-PSG` → `SC4001E0-PSG_features.safetensors.gz`.
pub fn feature_file_name(basename: &str) -> String {
    format!("{basename}{FEATURE_SUFFIX}")
}

fn spectral_key(band: Band) -> String {
    format!("{SPECTRAL_GROUP}/{}", band.key())
}

fn statistical_key(stat: Statistic) -> String {
    format!("{STATISTICAL_GROUP}/{}", stat.name())
}

/// Persist a bundle as a single gzip-compressed container.
pub fn write_bundle(bundle: &FeatureBundle, path: &Path) -> Result<()> {
    bundle.validate()?;
    let mut w = StWriter::new();
    w.add_array(RAW_SIGNALS, &bundle.raw_signals);
    for (band, power) in &bundle.spectral {
        w.add_array(&spectral_key(*band), power);
    }
    for (stat, table) in &bundle.statistical {
        w.add_array(&statistical_key(*stat), table);
    }
    w.set_metadata("n_epochs", bundle.n_epochs().to_string());
    w.write(path)
        .with_context(|| format!("writing features to {}", path.display()))
}

/// Read every group back into a [`FeatureBundle`].
pub fn read_bundle(path: &Path) -> Result<FeatureBundle> {
    let f = StFile::open(path)?;
    let raw_signals = f.f32_array3(RAW_SIGNALS)?;
    let spectral = Band::ALL
        .iter()
        .map(|&b| Ok((b, f.f32_array2(&spectral_key(b))?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    let statistical = Statistic::ALL
        .iter()
        .map(|&s| Ok((s, f.f32_array2(&statistical_key(s))?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    let bundle = FeatureBundle { raw_signals, spectral, statistical };
    bundle.validate()?;
    Ok(bundle)
}

/// Read only the canonical `[N, C, T]` signal tensor.
///
/// A file without `raw_signals` fails with
/// [`FeatureStoreError::MissingEntry`](crate::error::FeatureStoreError::MissingEntry).
pub fn read_raw_signals(path: &Path) -> Result<Array3<f32>> {
    StFile::open(path)?.f32_array3(RAW_SIGNALS)
}

/// Feature files in `dir`, sorted by name.
pub fn list_feature_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(FEATURE_SUFFIX))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Outcome of [`verify_dir`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreReport {
    pub n_files: usize,
    /// Entry name → shape of the first file, sorted by name.
    pub layout: Vec<(String, Vec<usize>)>,
    /// Epochs counted in the sampled files.
    pub sampled_epochs: usize,
    /// `sampled_epochs · n_files / min(5, n_files)`.
    pub estimated_total_epochs: usize,
}

/// Describe the first feature file and extrapolate the epoch count from
/// the first [`VERIFY_SAMPLE_FILES`] files.
pub fn verify_dir(dir: &Path) -> Result<StoreReport> {
    let files = list_feature_files(dir)?;
    info!(dir = %dir.display(), n_files = files.len(), "verifying feature store");
    let Some(first) = files.first() else {
        warn!("no feature files found");
        return Ok(StoreReport {
            n_files: 0,
            layout: vec![],
            sampled_epochs: 0,
            estimated_total_epochs: 0,
        });
    };

    let f = StFile::open(first)?;
    let layout = f
        .keys()
        .into_iter()
        .map(|k| Ok((k.to_string(), f.shape(k)?)))
        .collect::<Result<Vec<_>>>()?;
    for (key, shape) in &layout {
        info!(file = f.label(), entry = %key, ?shape, "layout");
    }

    let sampled = &files[..files.len().min(VERIFY_SAMPLE_FILES)];
    let mut sampled_epochs = 0;
    for path in sampled {
        let f = StFile::open(path)?;
        if f.contains(RAW_SIGNALS) {
            sampled_epochs += f.shape(RAW_SIGNALS)?.first().copied().unwrap_or(0);
        }
    }
    let estimated_total_epochs = sampled_epochs * files.len() / sampled.len();
    info!(sampled_epochs, estimated_total_epochs, "epoch estimate");

    Ok(StoreReport { n_files: files.len(), layout, sampled_epochs, estimated_total_epochs })
}
