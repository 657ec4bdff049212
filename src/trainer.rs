//! Iteration-based training loop with periodic validation and best-model
//! checkpointing.
//!
//! The loop is generic over the module, the per-step [`Updater`], the batch
//! source and the [`Validate`] implementation. It runs exactly `max_iter`
//! steps. Validation happens when `(step + 1) % eval_step == 0` and on the
//! last step. The module is saved into the run directory whenever the
//! combined validation metric strictly beats the best seen so far (which
//! starts at `0.0`).

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::error::{ConfigError, TrainResult};
use crate::logger::TrainLogger;
use crate::metrics::{BestMetric, Improvement, ValidationReport};
use crate::module::SegmentationModel;
use crate::updater::Updater;
use crate::validation::Validate;

// ---------------------------------------------------------------------------
// BatchSource
// ---------------------------------------------------------------------------

/// An endless supply of training batches.
pub trait BatchSource {
    /// What one step consumes.
    type Batch;

    /// Fetch the next batch, starting a new epoch when needed.
    fn next_batch(&mut self) -> TrainResult<Self::Batch>;
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Outcome of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    /// Steps executed.
    pub steps: usize,
    /// Best combined validation metric (`0.0` if nothing improved on it).
    pub best_metric: f64,
    /// Steps at which the module was saved.
    pub saved_at_steps: Vec<usize>,
    /// Report of the final validation pass.
    pub last_report: Option<ValidationReport>,
}

/// Orchestrates the training loop.
#[derive(Debug, Clone)]
pub struct Trainer {
    max_iter: usize,
    eval_step: usize,
    show_progress: bool,
}

impl Trainer {
    /// Create a trainer running `max_iter` steps, validating every
    /// `eval_step` steps.
    ///
    /// # Errors
    ///
    /// Either count is zero.
    pub fn new(max_iter: usize, eval_step: usize) -> Result<Self, ConfigError> {
        if max_iter == 0 {
            return Err(ConfigError::invalid_value("max_iter", "must be > 0"));
        }
        if eval_step == 0 {
            return Err(ConfigError::invalid_value("eval_step", "must be > 0"));
        }
        Ok(Trainer { max_iter, eval_step, show_progress: true })
    }

    /// Enable or disable the terminal progress bar. Default: **enabled**.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Total steps.
    pub fn max_iter(&self) -> usize {
        self.max_iter
    }

    /// Validation interval.
    pub fn eval_step(&self) -> usize {
        self.eval_step
    }

    /// `true` when validation runs after `step`.
    pub fn is_eval_step(&self, step: usize) -> bool {
        (step + 1) % self.eval_step == 0 || step + 1 == self.max_iter
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(self.max_iter as u64);
        if let Ok(style) = ProgressStyle::with_template("{prefix} [{bar:40}] {pos}/{len} {msg}") {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_prefix("Training");
        pb
    }

    /// Run the loop.
    ///
    /// `updater.check_module` is called before the first step; its error is
    /// returned without any step being taken. Checkpoints are written into
    /// `logger.run_dir()`.
    pub fn train<M, U, S, V>(
        &self,
        module: &mut M,
        updater: &mut U,
        source: &mut S,
        validator: &mut V,
        logger: &mut TrainLogger,
    ) -> TrainResult<TrainSummary>
    where
        M: SegmentationModel,
        U: Updater<M>,
        S: BatchSource<Batch = U::Batch>,
        V: Validate<M>,
    {
        updater.check_module(module)?;
        info!("Max iteration: {} steps (validates per {} steps)", self.max_iter, self.eval_step);

        let checkpoint_dir = logger.run_dir().to_path_buf();
        let pb = self.progress_bar();
        let mut best = BestMetric::new();
        let mut saved_at_steps = Vec::new();
        let mut last_report = None;

        for step in 0..self.max_iter {
            let batch = source.next_batch()?;
            let losses = updater.update(module, &batch, step, self.max_iter)?;
            for (name, value) in losses.iter() {
                logger.log_train(name, value, step);
            }
            pb.set_message(losses.to_string());
            pb.inc(1);

            if !self.is_eval_step(step) {
                continue;
            }

            let report = validator.validate(module, Some(step))?;
            logger.log_val(validator.metric_name(), &report, step);
            debug!("step {step}: {}", report.summary());

            let metric = report.combined();
            let detail = per_modality_detail(&report);
            match best.observe(metric) {
                Improvement::Improved { previous } => {
                    module.save(&checkpoint_dir)?;
                    saved_at_steps.push(step);
                    let msg = format!("Model saved! Validation: (New) {metric:2.7} > (Old) {previous:2.7}{detail}");
                    pb.suspend(|| logger.success(&msg));
                }
                Improvement::NoImprovement { best } => {
                    let msg = format!("No improvement. Validation: (New) {metric:2.7} <= (Old) {best:2.7}{detail}");
                    pb.suspend(|| logger.info(&msg));
                }
            }
            last_report = Some(report);
        }

        pb.finish_and_clear();
        logger.flush();
        Ok(TrainSummary { steps: self.max_iter, best_metric: best.value(), saved_at_steps, last_report })
    }
}

/// Score a module once, outside training. Every class is scored; the report
/// is logged at step `0`.
pub fn evaluate<M, V>(module: &M, validator: &mut V, logger: &mut TrainLogger) -> TrainResult<ValidationReport>
where
    M: SegmentationModel,
    V: Validate<M>,
{
    let report = validator.validate(module, None)?;
    logger.log_val(validator.metric_name(), &report, 0);
    logger.info(&format!("Test: {}", report.summary()));
    logger.flush();
    Ok(report)
}

fn per_modality_detail(report: &ValidationReport) -> String {
    match (report.ct, report.mr) {
        (Some(ct), Some(mr)) => format!(" (CT) {ct:2.7} (MR) {mr:2.7}"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_cadence_includes_last_step() {
        let t = Trainer::new(10, 3).unwrap();
        let steps: Vec<usize> = (0..10).filter(|&s| t.is_eval_step(s)).collect();
        assert_eq!(steps, vec![2, 5, 8, 9]);
    }

    #[test]
    fn eval_cadence_no_duplicate_on_aligned_end() {
        let t = Trainer::new(9, 3).unwrap();
        let steps: Vec<usize> = (0..9).filter(|&s| t.is_eval_step(s)).collect();
        assert_eq!(steps, vec![2, 5, 8]);
    }

    #[test]
    fn zero_counts_rejected() {
        assert!(Trainer::new(0, 1).is_err());
        assert!(Trainer::new(1, 0).is_err());
    }

    #[test]
    fn detail_only_for_dual_reports() {
        assert_eq!(per_modality_detail(&ValidationReport::single(0.5)), "");
        assert!(per_modality_detail(&ValidationReport::dual(0.1, 0.2, 0.15)).contains("(CT) 0.1000000"));
    }
}
