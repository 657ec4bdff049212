//! Validation passes over one or two held-out streams.
//!
//! A pass runs whole-volume inference on every batch, turns logits and labels
//! into one-hot masks, optionally hides the classes the batch's modality does
//! not annotate, and records the batch-level Dice score. Batches are
//! averaged with an ordinary mean, so a batch whose Dice is `NaN` (empty
//! ground truth in every channel) makes the stream mean `NaN`.
//!
//! Masking is applied only while training (`global_step` is `Some`). At test
//! time every class is scored.

use ndarray::Axis;
use tracing::debug;

use crate::dataset::{DataLoader, VolumeBatch};
use crate::error::{TrainError, TrainResult};
use crate::metrics::{DiceMetric, MetricBuffer, ValidationReport};
use crate::modality::Modality;
use crate::module::SegmentationModel;
use crate::partial::{postprocess_sample, ClassPartition};

/// A validation pass over module type `M`.
pub trait Validate<M> {
    /// Metric name used in log tags.
    fn metric_name(&self) -> &'static str;

    /// Score `module`. `global_step` is the current training step, or
    /// `None` outside training.
    fn validate(&mut self, module: &M, global_step: Option<usize>) -> TrainResult<ValidationReport>;
}

/// Held-out data, either one mixed stream or separate CT and MR streams.
pub enum ValidationStreams<'a> {
    /// One stream; reported as a single mean.
    Single(DataLoader<'a>),
    /// Separate streams; reported per modality plus an overall mean.
    Dual {
        /// CT stream.
        ct: DataLoader<'a>,
        /// MR stream.
        mr: DataLoader<'a>,
    },
}

/// Dice validator.
pub struct Validator<'a> {
    streams: ValidationStreams<'a>,
    num_classes: usize,
    partition: Option<ClassPartition>,
}

impl<'a> Validator<'a> {
    /// Create a validator. With a `partition`, training-time passes score
    /// only the classes annotated for each batch's modality.
    pub fn new(
        streams: ValidationStreams<'a>,
        num_classes: usize,
        partition: Option<ClassPartition>,
    ) -> TrainResult<Self> {
        if let Some(p) = &partition {
            if p.num_classes() != num_classes {
                return Err(TrainError::shape_mismatch(vec![num_classes], vec![p.num_classes()]));
            }
        }
        Ok(Validator { streams, num_classes, partition })
    }

    /// `true` when CT and MR are validated separately.
    pub fn is_dual(&self) -> bool {
        matches!(self.streams, ValidationStreams::Dual { .. })
    }

    fn score_batch<M: SegmentationModel>(
        &self,
        module: &M,
        batch: &VolumeBatch,
        masked: bool,
    ) -> TrainResult<f64> {
        let logits = module.predict(&batch.image)?;
        if logits.len_of(Axis(0)) != batch.len() {
            return Err(TrainError::shape_mismatch(vec![batch.len()], vec![logits.len_of(Axis(0))]));
        }
        let mut dice = DiceMetric::new();
        for (i, sample_logits) in logits.axis_iter(Axis(0)).enumerate() {
            let map = match (&self.partition, masked) {
                (Some(p), true) => Some(p.background_map(batch.modalities[i])),
                _ => None,
            };
            let (pred, gt) = postprocess_sample(
                sample_logits,
                batch.sample_label(i),
                self.num_classes,
                map.as_ref(),
            )?;
            dice.update(&pred, &gt);
        }
        Ok(dice.aggregate())
    }

    fn run_stream<M: SegmentationModel>(
        &self,
        module: &M,
        loader: &DataLoader<'_>,
        masked: bool,
        overall: &mut MetricBuffer,
    ) -> TrainResult<f64> {
        let mut scores = MetricBuffer::new();
        for batch in loader.iter() {
            let batch = batch?;
            let score = self.score_batch(module, &batch, masked)?;
            debug!("{} [{}]: Dice = {score:.5}", loader.dataset().name(), batch.case_ids.join(","));
            scores.push(score);
            overall.push(score);
        }
        Ok(scores.mean())
    }
}

impl<M: SegmentationModel> Validate<M> for Validator<'_> {
    fn metric_name(&self) -> &'static str {
        DiceMetric::NAME
    }

    fn validate(&mut self, module: &M, global_step: Option<usize>) -> TrainResult<ValidationReport> {
        let masked = global_step.is_some();
        let mut overall = MetricBuffer::new();
        match &self.streams {
            ValidationStreams::Single(loader) => {
                let mean = self.run_stream(module, loader, masked, &mut overall)?;
                Ok(ValidationReport::single(mean))
            }
            ValidationStreams::Dual { ct, mr } => {
                let ct_mean = self.run_stream(module, ct, masked, &mut overall)?;
                let mr_mean = self.run_stream(module, mr, masked, &mut overall)?;
                debug!(
                    "{}: {ct_mean:.5}  {}: {mr_mean:.5}",
                    Modality::Ct.tag_suffix(),
                    Modality::Mr.tag_suffix()
                );
                Ok(ValidationReport::dual(ct_mean, mr_mean, overall.mean()))
            }
        }
    }
}
