/// Shared fixtures: synthetic signals, EDF files and feature files.
use eeg2dream::{feature_file_name, write_bundle, FeatureExtractor};
use ndarray::{Array2, Array3, ArrayD};
use std::f32::consts::PI;
use std::path::{Path, PathBuf};

#[allow(unused)]
/// `[n_ch, n_t]` sum of sines; channel `c` gets an extra `0.1·c` offset in
/// phase so rows differ.
pub fn sines(n_ch: usize, n_t: usize, sfreq: f32, freqs: &[f32]) -> Array2<f32> {
    Array2::from_shape_fn((n_ch, n_t), |(c, t)| {
        let time = t as f32 / sfreq;
        freqs
            .iter()
            .map(|f| (2.0 * PI * f * time + 0.1 * c as f32).sin())
            .sum()
    })
}

#[allow(unused)]
pub fn max_abs_diff(a: &ArrayD<f32>, b: &ArrayD<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

fn pad(s: &str, w: usize) -> Vec<u8> {
    let mut v = s.as_bytes().to_vec();
    v.resize(w, b' ');
    v
}

#[allow(unused)]
/// Write a plain EDF file with 1 s records. `data_uv` is in microvolts and
/// must stay within ±500 µV; `n_t` must be a multiple of `sfreq`.
pub fn write_edf(path: &Path, labels: &[&str], data_uv: &Array2<f32>, sfreq: usize) {
    let ns = labels.len();
    assert_eq!(ns, data_uv.nrows());
    let n_records = data_uv.ncols() / sfreq;

    let mut b = Vec::new();
    b.extend(pad("0", 8));
    b.extend(pad("X X X X", 80));
    b.extend(pad("Startdate X X X X", 80));
    b.extend(pad("01.01.20", 8));
    b.extend(pad("00.00.00", 8));
    b.extend(pad(&(256 + ns * 256).to_string(), 8));
    b.extend(pad("", 44));
    b.extend(pad(&n_records.to_string(), 8));
    b.extend(pad("1", 8));
    b.extend(pad(&ns.to_string(), 4));
    for l in labels { b.extend(pad(l, 16)); }
    for _ in 0..ns { b.extend(pad("AgAgCl electrode", 80)); }
    for _ in 0..ns { b.extend(pad("uV", 8)); }
    for _ in 0..ns { b.extend(pad("-500", 8)); }
    for _ in 0..ns { b.extend(pad("500", 8)); }
    for _ in 0..ns { b.extend(pad("-32768", 8)); }
    for _ in 0..ns { b.extend(pad("32767", 8)); }
    for _ in 0..ns { b.extend(pad("", 80)); }
    for _ in 0..ns { b.extend(pad(&sfreq.to_string(), 8)); }
    for _ in 0..ns { b.extend(pad("", 32)); }

    let gain = 1000.0 / 65535.0;
    for rec in 0..n_records {
        for row in data_uv.rows() {
            for k in 0..sfreq {
                let v = row[rec * sfreq + k];
                let dig = ((v + 500.0) / gain - 32768.0).round().clamp(-32768.0, 32767.0) as i16;
                b.extend(dig.to_le_bytes());
            }
        }
    }
    std::fs::write(path, b).unwrap();
}

#[allow(unused)]
/// Extract features from synthetic epochs and store them as
/// `<dir>/<basename>_features.safetensors.gz`.
pub fn write_feature_file(dir: &Path, basename: &str, epochs: &Array3<f32>, sfreq: f32) -> PathBuf {
    let bundle = FeatureExtractor.extract(epochs, sfreq).unwrap();
    let path = dir.join(feature_file_name(basename));
    write_bundle(&bundle, &path).unwrap();
    path
}
