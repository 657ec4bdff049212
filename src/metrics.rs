//! Validation metrics for volumetric segmentation.
//!
//! This module provides:
//!
//! - **Dice** over one-hot `[C, D, H, W]` volumes, background included. A
//!   channel whose ground truth is empty scores `NaN` and is skipped by the
//!   reductions, so classes absent from a case never drag its score down.
//! - [`MetricBuffer`]: collects one scalar per validation batch and reduces
//!   by arithmetic mean.
//! - [`ValidationReport`]: the Average / CT / MR triple produced by a
//!   validation pass, with the conservative combined criterion used for
//!   best-model tracking.
//! - [`BestMetric`]: strict-improvement tracker owned by the trainer.

use ndarray::{Array4, Axis, Zip};

use crate::modality::Modality;

// ---------------------------------------------------------------------------
// NaN-aware reductions
// ---------------------------------------------------------------------------

/// Mean of the non-NaN values, `NaN` when there are none.
pub fn nanmean<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let (sum, count) = values
        .into_iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// Plain arithmetic mean; `NaN` propagates, an empty input yields `NaN`.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

// ---------------------------------------------------------------------------
// DiceMetric
// ---------------------------------------------------------------------------

/// Per-channel Dice coefficient of a binarised prediction against a one-hot
/// ground truth.
///
/// Returns one value per channel: `2|P∩G| / (|P|+|G|)`, or `NaN` when the
/// ground-truth channel is empty.
pub fn dice_per_channel(prediction: &Array4<f32>, ground_truth: &Array4<f32>) -> Vec<f64> {
    debug_assert_eq!(prediction.shape(), ground_truth.shape());
    prediction
        .axis_iter(Axis(0))
        .zip(ground_truth.axis_iter(Axis(0)))
        .map(|(p, g)| {
            let mut inter = 0.0_f64;
            let mut p_sum = 0.0_f64;
            let mut g_sum = 0.0_f64;
            Zip::from(&p).and(&g).for_each(|&pv, &gv| {
                inter += f64::from(pv * gv);
                p_sum += f64::from(pv);
                g_sum += f64::from(gv);
            });
            if g_sum == 0.0 {
                f64::NAN
            } else {
                2.0 * inter / (p_sum + g_sum)
            }
        })
        .collect()
}

/// Dice metric with background included and mean reduction over every
/// non-NaN `(sample, channel)` score.
#[derive(Debug, Clone, Default)]
pub struct DiceMetric {
    scores: Vec<f64>,
}

impl DiceMetric {
    /// Name used in log tags.
    pub const NAME: &'static str = "DiceMetric";

    /// Create an empty metric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Score one postprocessed sample and buffer its channel scores.
    pub fn update(&mut self, prediction: &Array4<f32>, ground_truth: &Array4<f32>) {
        self.scores.extend(dice_per_channel(prediction, ground_truth));
    }

    /// Reduce the buffered scores; `NaN` if nothing scorable was seen.
    pub fn aggregate(&self) -> f64 {
        nanmean(self.scores.iter().copied())
    }

    /// Drop the buffered scores.
    pub fn reset(&mut self) {
        self.scores.clear();
    }
}

// ---------------------------------------------------------------------------
// MetricBuffer
// ---------------------------------------------------------------------------

/// One scalar per validation batch, reduced by arithmetic mean.
#[derive(Debug, Clone, Default)]
pub struct MetricBuffer {
    values: Vec<f64>,
}

impl MetricBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one batch score.
    pub fn push(&mut self, value: f64) {
        self.values.push(value);
    }

    /// Number of recorded batches.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` when no batch was recorded.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Recorded values in push order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Arithmetic mean. A `NaN` batch makes the mean `NaN`.
    pub fn mean(&self) -> f64 {
        mean(&self.values)
    }
}

// ---------------------------------------------------------------------------
// ValidationReport
// ---------------------------------------------------------------------------

/// Result of one validation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationReport {
    /// Mean over every batch of every stream.
    pub mean: f64,
    /// Mean over the CT stream, when validated separately.
    pub ct: Option<f64>,
    /// Mean over the MR stream, when validated separately.
    pub mr: Option<f64>,
}

impl ValidationReport {
    /// Report of a single-stream pass.
    pub fn single(mean: f64) -> Self {
        ValidationReport { mean, ct: None, mr: None }
    }

    /// Report of a dual-stream pass.
    pub fn dual(ct: f64, mr: f64, mean: f64) -> Self {
        ValidationReport { mean, ct: Some(ct), mr: Some(mr) }
    }

    /// `true` when CT and MR were reported separately.
    pub fn is_dual(&self) -> bool {
        self.ct.is_some() && self.mr.is_some()
    }

    /// Per-modality mean, if reported.
    pub fn modality(&self, modality: Modality) -> Option<f64> {
        match modality {
            Modality::Ct => self.ct,
            Modality::Mr => self.mr,
        }
    }

    /// Metric used for best-model tracking.
    ///
    /// Single-stream: the mean. Dual-stream: `min(ct, mr)`, falling back to
    /// the overall mean when that minimum is `NaN`.
    pub fn combined(&self) -> f64 {
        match (self.ct, self.mr) {
            (Some(ct), Some(mr)) => {
                let m = if ct.is_nan() || mr.is_nan() { f64::NAN } else { ct.min(mr) };
                if m.is_nan() {
                    self.mean
                } else {
                    m
                }
            }
            _ => self.mean,
        }
    }

    /// `(suffix, value)` pairs for logging: `Average`, then `CT` and `MR`
    /// when present.
    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        let mut out = vec![("Average", self.mean)];
        if let Some(ct) = self.ct {
            out.push((Modality::Ct.tag_suffix(), ct));
        }
        if let Some(mr) = self.mr {
            out.push((Modality::Mr.tag_suffix(), mr));
        }
        out
    }

    /// A human-readable summary line suitable for logging.
    pub fn summary(&self) -> String {
        self.entries()
            .iter()
            .map(|(k, v)| format!("{k}={v:.5}"))
            .collect::<Vec<_>>()
            .join("  ")
    }
}

// ---------------------------------------------------------------------------
// BestMetric
// ---------------------------------------------------------------------------

/// Outcome of offering a metric to [`BestMetric::observe`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Improvement {
    /// Strictly better than the previous best, which is returned.
    Improved {
        /// Best value before this observation.
        previous: f64,
    },
    /// Not better; `NaN` always lands here.
    NoImprovement {
        /// Current best.
        best: f64,
    },
}

/// Best validation metric seen so far. Starts at `0.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMetric {
    best: f64,
}

impl Default for BestMetric {
    fn default() -> Self {
        BestMetric { best: 0.0 }
    }
}

impl BestMetric {
    /// Tracker starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current best value.
    pub fn value(&self) -> f64 {
        self.best
    }

    /// Offer a new metric; the best moves only on strict improvement.
    pub fn observe(&mut self, metric: f64) -> Improvement {
        if metric > self.best {
            let previous = self.best;
            self.best = metric;
            Improvement::Improved { previous }
        } else {
            Improvement::NoImprovement { best: self.best }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn volume(channels: &[&[f32]]) -> Array4<f32> {
        let n = channels[0].len();
        let flat: Vec<f32> = channels.iter().flat_map(|c| c.iter().copied()).collect();
        Array4::from_shape_vec((channels.len(), 1, 1, n), flat).unwrap()
    }

    #[test]
    fn dice_perfect_and_disjoint() {
        let p = volume(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let g = volume(&[&[1.0, 0.0], &[0.0, 1.0]]);
        assert_eq!(dice_per_channel(&p, &g), vec![1.0, 1.0]);

        let p = volume(&[&[0.0, 1.0], &[1.0, 0.0]]);
        assert_eq!(dice_per_channel(&p, &g), vec![0.0, 0.0]);
    }

    #[test]
    fn dice_empty_ground_truth_is_nan() {
        let p = volume(&[&[1.0, 1.0], &[0.0, 0.0]]);
        let g = volume(&[&[1.0, 1.0], &[0.0, 0.0]]);
        let d = dice_per_channel(&p, &g);
        assert_abs_diff_eq!(d[0], 1.0);
        assert!(d[1].is_nan());

        let mut m = DiceMetric::new();
        m.update(&p, &g);
        assert_abs_diff_eq!(m.aggregate(), 1.0);
    }

    #[test]
    fn dice_partial_overlap() {
        // P = {0,1}, G = {1,2} on channel 1 → 2*1/(2+2) = 0.5
        let p = volume(&[&[0.0, 0.0, 1.0], &[1.0, 1.0, 0.0]]);
        let g = volume(&[&[1.0, 0.0, 0.0], &[0.0, 1.0, 1.0]]);
        let d = dice_per_channel(&p, &g);
        assert_abs_diff_eq!(d[1], 0.5);
        assert_abs_diff_eq!(d[0], 0.0);
    }

    #[test]
    fn aggregate_of_nothing_is_nan() {
        assert!(DiceMetric::new().aggregate().is_nan());
        assert!(nanmean(vec![f64::NAN, f64::NAN]).is_nan());
    }

    #[test]
    fn buffer_mean_propagates_nan() {
        let mut b = MetricBuffer::new();
        b.push(0.5);
        b.push(f64::NAN);
        assert!(b.mean().is_nan());
    }

    #[test]
    fn best_metric_ignores_nan() {
        let mut best = BestMetric::new();
        assert!(matches!(best.observe(f64::NAN), Improvement::NoImprovement { .. }));
        assert_eq!(best.value(), 0.0);
        assert!(matches!(best.observe(0.2), Improvement::Improved { previous } if previous == 0.0));
        assert!(matches!(best.observe(0.2), Improvement::NoImprovement { .. }));
    }
}
