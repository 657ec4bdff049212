//! Integration tests for [`medseg_dann::metrics`].

use approx::assert_abs_diff_eq;
use ndarray::Array4;

use medseg_dann::metrics::{
    dice_per_channel, mean, nanmean, BestMetric, DiceMetric, Improvement, MetricBuffer, ValidationReport,
};
use medseg_dann::modality::Modality;

fn volume(channels: &[&[f32]]) -> Array4<f32> {
    let n = channels[0].len();
    let flat: Vec<f32> = channels.iter().flat_map(|c| c.iter().copied()).collect();
    Array4::from_shape_vec((channels.len(), 1, 1, n), flat).unwrap()
}

// ---------------------------------------------------------------------------
// Dice
// ---------------------------------------------------------------------------

/// Half-overlapping masks score 2·1 / (2 + 2) = 0.5.
#[test]
fn dice_partial_overlap() {
    let p = volume(&[&[1.0, 1.0, 0.0, 0.0], &[0.0, 0.0, 1.0, 1.0]]);
    let g = volume(&[&[1.0, 0.0, 1.0, 0.0], &[0.0, 1.0, 0.0, 1.0]]);
    let d = dice_per_channel(&p, &g);
    assert_abs_diff_eq!(d[0], 0.5, epsilon = 1e-12);
    assert_abs_diff_eq!(d[1], 0.5, epsilon = 1e-12);
}

/// Channels with an empty ground truth are skipped by the aggregate.
#[test]
fn dice_metric_skips_absent_classes() {
    let p = volume(&[&[1.0, 0.0], &[0.0, 1.0], &[0.0, 0.0]]);
    let g = volume(&[&[1.0, 0.0], &[0.0, 1.0], &[0.0, 0.0]]);
    let mut m = DiceMetric::new();
    m.update(&p, &g);
    assert_abs_diff_eq!(m.aggregate(), 1.0, epsilon = 1e-12);

    m.reset();
    assert!(m.aggregate().is_nan());
}

#[test]
fn nan_aware_means() {
    assert_abs_diff_eq!(nanmean([1.0, f64::NAN, 0.0]), 0.5);
    assert!(nanmean([f64::NAN]).is_nan());
    assert!(mean(&[1.0, f64::NAN]).is_nan());
    assert!(mean(&[]).is_nan());

    let mut buf = MetricBuffer::new();
    buf.push(0.25);
    buf.push(0.75);
    assert_eq!(buf.len(), 2);
    assert_abs_diff_eq!(buf.mean(), 0.5);
}

// ---------------------------------------------------------------------------
// ValidationReport
// ---------------------------------------------------------------------------

/// Dual-stream tracking uses the worse modality.
#[test]
fn combined_is_min_of_modalities() {
    let r = ValidationReport::dual(0.8, 0.6, 0.7);
    assert_abs_diff_eq!(r.combined(), 0.6);
    assert_eq!(r.modality(Modality::Ct), Some(0.8));
    assert!(r.is_dual());
}

/// A NaN modality falls back to the overall mean.
#[test]
fn combined_nan_falls_back_to_mean() {
    let r = ValidationReport::dual(f64::NAN, 0.6, 0.55);
    assert_abs_diff_eq!(r.combined(), 0.55);
    let single = ValidationReport::single(0.42);
    assert_abs_diff_eq!(single.combined(), 0.42);
    assert!(!single.is_dual());
}

#[test]
fn report_entries_order() {
    let keys: Vec<&str> = ValidationReport::dual(0.1, 0.2, 0.15).entries().iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec!["Average", "CT", "MR"]);
    assert_eq!(ValidationReport::single(0.3).entries().len(), 1);
}

// ---------------------------------------------------------------------------
// BestMetric
// ---------------------------------------------------------------------------

/// The sequence 0.5, 0.3, 0.7, 0.6, 0.9 improves at positions 0, 2 and 4.
#[test]
fn best_metric_strict_improvements() {
    let mut best = BestMetric::new();
    let improved: Vec<usize> = [0.5, 0.3, 0.7, 0.6, 0.9]
        .iter()
        .enumerate()
        .filter(|(_, &m)| matches!(best.observe(m), Improvement::Improved { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(improved, vec![0, 2, 4]);
    assert_abs_diff_eq!(best.value(), 0.9);
}

#[test]
fn best_metric_rejects_nan_and_ties() {
    let mut best = BestMetric::new();
    assert_eq!(best.observe(f64::NAN), Improvement::NoImprovement { best: 0.0 });
    assert_eq!(best.observe(0.0), Improvement::NoImprovement { best: 0.0 });
    assert_eq!(best.observe(0.3), Improvement::Improved { previous: 0.0 });
    assert_eq!(best.observe(0.3), Improvement::NoImprovement { best: 0.3 });
}
