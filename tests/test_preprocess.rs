mod common;
use common::{sines, write_edf};
use eeg2dream::{
    analyze_dataset, read_bundle, verify_dir, Band, PipelineConfig, RecordingPreprocessor, StWriter,
    Statistic,
};
use std::path::Path;

fn short_epochs() -> PipelineConfig {
    // 10 s windows every 5 s
    PipelineConfig { epoch_length: 10.0, ..PipelineConfig::default() }
}

fn write_recording(dir: &Path, name: &str, secs: usize) {
    let data = sines(3, secs * 100, 100.0, &[2.0, 10.0]).mapv(|v| v * 50.0);
    write_edf(&dir.join(name), &["EEG Fpz-Cz", "EEG Pz-Oz", "EMG submental"], &data, 100);
}

#[test]
fn one_corrupt_file_does_not_stop_the_batch() {
    let raw = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_recording(raw.path(), "SC4001E0-PSG.edf", 40);
    std::fs::write(raw.path().join("SC4002E0-PSG.edf"), b"definitely not an EDF header").unwrap();
    write_recording(raw.path(), "SC4003E0-PSG.edf", 40);

    let summary = RecordingPreprocessor::new(short_epochs())
        .process_all(raw.path(), out.path())
        .unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].ends_with("SC4002E0-PSG.edf"));
    // 4000 samples, 1000-sample windows every 500 → 7 per file
    assert_eq!(summary.total_epochs, 14);

    assert!(out.path().join("SC4003E0-PSG_features.safetensors.gz").is_file());
    assert!(!out.path().join("SC4002E0-PSG_features.safetensors.gz").exists());
}

#[test]
fn feature_file_layout() {
    let raw = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_recording(raw.path(), "SC4011E0-PSG.edf", 40);
    let n = RecordingPreprocessor::new(short_epochs())
        .process_file(&raw.path().join("SC4011E0-PSG.edf"), out.path())
        .unwrap();
    assert_eq!(n, 7);

    let b = read_bundle(&out.path().join("SC4011E0-PSG_features.safetensors.gz")).unwrap();
    // "EMG submental" carries none of the EEG markers
    assert_eq!(b.raw_signals.dim(), (7, 2, 1000));
    for band in Band::ALL {
        assert_eq!(b.spectral[&band].dim(), (7, 2));
    }
    for stat in Statistic::ALL {
        assert_eq!(b.statistical[&stat].dim(), (7, 2));
    }
    // 10 Hz dominates: alpha beats every other band
    let alpha = b.spectral[&Band::Alpha][[3, 0]];
    assert!(alpha > b.spectral[&Band::Beta][[3, 0]]);
    assert!(alpha > b.spectral[&Band::Gamma][[3, 0]]);

    let report = verify_dir(out.path()).unwrap();
    assert_eq!(report.n_files, 1);
    assert_eq!(report.estimated_total_epochs, 7);
    assert!(report.layout.iter().any(|(k, s)| k == "raw_signals" && s == &vec![7, 2, 1000]));
}

#[test]
fn safetensors_recordings_are_resampled() {
    let raw = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let mut w = StWriter::new();
    w.add_array("data", &sines(2, 256 * 30, 256.0, &[6.0]).mapv(|v| v * 1e-5));
    w.add_f32("sfreq", &[256.0], &[1]);
    w.write(&raw.path().join("S001R03.safetensors")).unwrap();

    let summary = RecordingPreprocessor::new(short_epochs())
        .process_all(raw.path(), out.path())
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    let b = read_bundle(&out.path().join("S001R03_features.safetensors.gz")).unwrap();
    // 30 s at 100 Hz → 3000 samples → 5 windows
    assert_eq!(b.raw_signals.dim(), (5, 2, 1000));
}

#[test]
fn dataset_families_counted() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["SC4001E0-PSG.edf", "SC4002E0-PSG.edf", "ST7011J0-PSG.edf", "S001R01.edf", "S001R04.edf", "misc.edf"] {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }
    let counts = analyze_dataset(dir.path()).unwrap();
    assert_eq!(counts.sleep_cassette, 2);
    assert_eq!(counts.sleep_telemetry, 1);
    assert_eq!(counts.motor_imagery, 1);
    assert_eq!(counts.motor_movement, 1);
    assert_eq!(counts.other, 1);
    assert_eq!(counts.total(), 6);
}
