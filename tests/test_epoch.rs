use eeg2dream::epoch::{epoch_count, epoch_overlapping};
use eeg2dream::PipelineConfig;
use ndarray::{s, Array2};

#[test]
fn default_config_on_five_minutes() {
    let cfg = PipelineConfig::default();
    // 300 s at 100 Hz, 30 s windows every 15 s
    assert_eq!(cfg.epoch_samples(), 3000);
    assert_eq!(cfg.step_samples(), 1500);
    let data = Array2::<f32>::zeros((19, 30_000));
    let e = epoch_overlapping(data.view(), cfg.epoch_samples(), cfg.step_samples()).unwrap();
    assert_eq!(e.dim(), (19, 19, 3000));
}

#[test]
fn windows_start_on_step_boundaries() {
    let data = Array2::from_shape_fn((2, 50), |(c, t)| (c * 100 + t) as f32);
    let e = epoch_overlapping(data.view(), 20, 10).unwrap();
    assert_eq!(e.dim().0, 4);
    for k in 0..4 {
        assert_eq!(e.slice(s![k, .., ..]), data.slice(s![.., k * 10..k * 10 + 20]));
    }
}

#[test]
fn partial_tail_dropped() {
    assert_eq!(epoch_count(2999, 3000, 1500), 0);
    assert_eq!(epoch_count(4499, 3000, 1500), 1);
    assert_eq!(epoch_count(4500, 3000, 1500), 2);
}

#[test]
fn zero_step_rejected() {
    let data = Array2::<f32>::zeros((1, 10));
    assert!(epoch_overlapping(data.view(), 5, 0).is_err());
}
