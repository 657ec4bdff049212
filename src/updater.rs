//! One gradient step per call.
//!
//! An [`Updater`] owns the logic of a single optimisation step for a module
//! type `M`: the plain segmentation step, or the two-stream adversarial
//! step. Before the first step the trainer calls
//! [`Updater::check_module`], so a module missing a required component is
//! rejected before any compute happens.

use std::fmt;

use crate::error::TrainResult;

/// Named scalar losses produced by one step, in reporting order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepLosses {
    entries: Vec<(String, f64)>,
}

impl StepLosses {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// A single named loss.
    pub fn single(name: impl Into<String>, value: f64) -> Self {
        let mut out = Self::new();
        out.push(name, value);
        out
    }

    /// Append a named loss.
    pub fn push(&mut self, name: impl Into<String>, value: f64) {
        self.entries.push((name.into(), value));
    }

    /// Value of the loss called `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    /// `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    /// Number of losses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no loss was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for StepLosses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{name}={value:.5}")?;
        }
        Ok(())
    }
}

/// A single optimisation step over a module of type `M`.
pub trait Updater<M> {
    /// What one step consumes: one batch, or a `(ct, mr)` pair.
    type Batch;

    /// Name used in error messages.
    fn name(&self) -> &'static str;

    /// Verify that `module` exposes everything [`update`](Self::update)
    /// needs.
    ///
    /// # Errors
    ///
    /// [`TrainError::MissingComponents`] or a configuration error.
    ///
    /// [`TrainError::MissingComponents`]: crate::error::TrainError::MissingComponents
    fn check_module(&self, module: &M) -> TrainResult<()>;

    /// Run one step at global index `step` of a `max_iter`-step run.
    fn update(
        &mut self,
        module: &mut M,
        batch: &Self::Batch,
        step: usize,
        max_iter: usize,
    ) -> TrainResult<StepLosses>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn losses_keep_order_and_lookup() {
        let mut l = StepLosses::new();
        l.push("seg_loss", 0.5);
        l.push("adv_loss", 0.25);
        assert_eq!(l.len(), 2);
        assert_eq!(l.get("adv_loss"), Some(0.25));
        assert_eq!(l.get("missing"), None);
        assert_eq!(l.to_string(), "seg_loss=0.50000 adv_loss=0.25000");
    }
}
