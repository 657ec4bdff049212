//! Gradient reversal and its warm-up schedule for domain-adversarial
//! training.
//!
//! Components: [`GradientReversalLayer`], [`grl_lambda`] and
//! [`AdversarialSchedule`].
//!
//! The slice-level `forward`/`backward` pair states the layer's contract
//! without autograd; under the `tch-backend` feature
//! [`GradientReversalLayer::apply`] realises the same contract inside a
//! libtorch graph.

#[cfg(feature = "tch-backend")]
use tch::Tensor;

// ---------------------------------------------------------------------------
// GradientReversalLayer
// ---------------------------------------------------------------------------

/// Gradient Reversal Layer (Ganin & Lempitsky, ICML 2015).
///
/// Forward: identity. Backward: `-alpha * grad`. The scale can be changed
/// between steps with [`set_alpha`](Self::set_alpha); the next backward
/// pass sees the new value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientReversalLayer {
    alpha: f64,
}

impl Default for GradientReversalLayer {
    fn default() -> Self {
        GradientReversalLayer { alpha: 1.0 }
    }
}

impl GradientReversalLayer {
    /// Create a new GRL with scale `alpha`.
    pub fn new(alpha: f64) -> Self {
        Self { alpha }
    }

    /// Current reversal scale.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Replace the reversal scale.
    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha;
    }

    /// Forward pass (identity).
    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        x.to_vec()
    }

    /// Backward pass: returns `-alpha * grad`.
    pub fn backward(&self, grad: &[f32]) -> Vec<f32> {
        let a = self.alpha as f32;
        grad.iter().map(|g| -a * g).collect()
    }

    /// Apply the layer inside an autograd graph.
    ///
    /// `x.detach() + (x - x.detach()) * (-alpha)`: the value equals `x`
    /// exactly, and the derivative with respect to `x` is `-alpha`.
    #[cfg(feature = "tch-backend")]
    pub fn apply(&self, x: &Tensor) -> Tensor {
        let frozen = x.detach();
        (x - &frozen) * (-self.alpha) + frozen
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Adversarial warm-up: `2 / (1 + exp(-10 p)) - 1` with `p = step / max_iter`.
///
/// `grl_lambda(0, n) == 0` and `grl_lambda(n, n) ≈ 1`. A zero `max_iter`
/// yields `1.0`.
pub fn grl_lambda(step: usize, max_iter: usize) -> f64 {
    if max_iter == 0 {
        return 1.0;
    }
    let p = step as f64 / max_iter as f64;
    2.0 / (1.0 + (-10.0 * p).exp()) - 1.0
}

/// [`grl_lambda`] bound to a fixed iteration budget.
#[derive(Debug, Clone, Copy)]
pub struct AdversarialSchedule {
    /// Total optimisation steps.
    pub max_iter: usize,
}

impl AdversarialSchedule {
    /// Create schedule.
    pub fn new(max_iter: usize) -> Self {
        Self { max_iter }
    }

    /// Reversal scale for `step`, in `[0, 1)`.
    pub fn alpha(&self, step: usize) -> f64 {
        grl_lambda(step, self.max_iter)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grl_forward_is_identity() {
        let grl = GradientReversalLayer::new(0.5);
        let x = vec![1.0, -2.0, 3.0, 0.0, -0.5];
        assert_eq!(grl.forward(&x), x);
    }

    #[test]
    fn grl_backward_negates_with_alpha() {
        let grad = vec![1.0, -2.0, 3.0, 0.0, 4.0];
        for alpha in [0.0, 0.5, 1.0] {
            let grl = GradientReversalLayer::new(alpha);
            let rev = grl.backward(&grad);
            for (r, g) in rev.iter().zip(&grad) {
                assert!((r - (-(alpha as f32) * g)).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn set_alpha_affects_next_backward() {
        let mut grl = GradientReversalLayer::default();
        assert_eq!(grl.backward(&[2.0]), vec![-2.0]);
        grl.set_alpha(0.25);
        assert_eq!(grl.backward(&[2.0]), vec![-0.5]);
    }

    #[test]
    fn lambda_endpoints() {
        for n in [1, 10, 40_000] {
            assert_eq!(grl_lambda(0, n), 0.0);
            let end = 2.0 / (1.0 + (-10.0_f64).exp()) - 1.0;
            assert!((grl_lambda(n, n) - end).abs() < 1e-12, "lambda(n, n) = {end}");
        }
    }

    #[test]
    fn lambda_at_half() {
        let half = 2.0 / (1.0 + (-5.0_f64).exp()) - 1.0;
        assert!((grl_lambda(50, 100) - half).abs() < 1e-12);
    }

    #[test]
    fn schedule_monotonically_increasing() {
        let s = AdversarialSchedule::new(100);
        let mut prev = s.alpha(0);
        for step in 1..=100 {
            let cur = s.alpha(step);
            assert!(cur >= prev, "not monotone at step {step}");
            prev = cur;
        }
    }

    #[test]
    fn zero_budget_is_full_strength() {
        assert_eq!(grl_lambda(0, 0), 1.0);
    }
}
