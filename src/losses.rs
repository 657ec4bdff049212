//! Segmentation and adversarial losses.
//!
//! - **DiceCE**: soft Dice (softmax probabilities against one-hot targets,
//!   background included, smoothed by `1e-5`) plus voxel-wise cross-entropy.
//! - **Target-adaptive**: DiceCE restricted to the background channel and a
//!   modality's annotated foreground channels. Other channels are never read,
//!   so their logits receive exactly zero gradient. Target voxels of
//!   unannotated classes count as background.
//! - **Adversarial**: binary cross-entropy with logits for the domain
//!   classifier.
//!
//! ```text
//! L_dicece = mean_{n,c}(1 − (2·Σ p·g + ε) / (Σ p + Σ g + ε)) + CE(logits, target)
//! ```

use tch::{Device, Kind, Reduction, Tensor};

use crate::config::{LossKind, ModuleKind, TrainingConfig};
use crate::error::{ConfigError, TrainError, TrainResult};
use crate::modality::Modality;
use crate::partial::{validate_foreground, ClassPartition, BACKGROUND};

/// Smoothing term of the soft Dice ratio.
pub const DICE_SMOOTH: f64 = 1e-5;

/// Bring a label tensor to `[N, D, H, W]` int64.
fn class_map(target: &Tensor) -> Tensor {
    let t = if target.dim() == 5 { target.squeeze_dim(1) } else { target.shallow_clone() };
    t.to_kind(Kind::Int64)
}

// ─────────────────────────────────────────────────────────────────────────────
// DiceCeLoss
// ─────────────────────────────────────────────────────────────────────────────

/// Soft Dice + cross-entropy over all channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiceCeLoss;

impl DiceCeLoss {
    /// Name used in log tags.
    pub const NAME: &'static str = "DiceCELoss";

    /// Scalar loss for `logits` `[N, C, D, H, W]` and integer labels
    /// `[N, 1, D, H, W]` or `[N, D, H, W]` with values in `0..C`.
    pub fn forward(&self, logits: &Tensor, target: &Tensor) -> TrainResult<Tensor> {
        let n_classes = logits.size()[1];
        let target = class_map(target);
        let onehot = target.f_one_hot(n_classes)?.permute([0, 4, 1, 2, 3]).to_kind(Kind::Float);
        let probs = logits.softmax(1, Kind::Float);

        let spatial = [2_i64, 3, 4];
        let inter = (&probs * &onehot).sum_dim_intlist(&spatial[..], false, Kind::Float);
        let denom = probs.sum_dim_intlist(&spatial[..], false, Kind::Float)
            + onehot.sum_dim_intlist(&spatial[..], false, Kind::Float);
        let ratio = (inter * 2.0 + DICE_SMOOTH) / (denom + DICE_SMOOTH);
        let dice = -ratio.mean(Kind::Float) + 1.0;

        let ce = logits.f_cross_entropy_loss::<Tensor>(&target, None, Reduction::Mean, -100, 0.0)?;
        Ok(dice + ce)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TargetAdaptiveLoss
// ─────────────────────────────────────────────────────────────────────────────

/// DiceCE restricted to `{0} ∪ foreground`.
#[derive(Debug)]
pub struct TargetAdaptiveLoss {
    num_classes: usize,
    foreground: Vec<usize>,
    /// Logit channels kept, background first.
    channels: Tensor,
    /// Class → position in `channels`; unannotated classes map to 0.
    lut: Tensor,
}

impl TargetAdaptiveLoss {
    /// Name used in log tags.
    pub const NAME: &'static str = "TargetAdaptiveLoss";

    /// Create the loss for `foreground` classes out of `num_classes`.
    ///
    /// # Errors
    ///
    /// The set is empty, or contains `0`, a duplicate or an index
    /// `>= num_classes`.
    pub fn new(num_classes: usize, foreground: &[usize], device: Device) -> Result<Self, ConfigError> {
        validate_foreground(num_classes, foreground)?;
        let mut kept = vec![BACKGROUND as i64];
        kept.extend(foreground.iter().map(|&c| c as i64));

        let mut lut = vec![0_i64; num_classes];
        for (pos, &class) in kept.iter().enumerate() {
            lut[class as usize] = pos as i64;
        }
        Ok(TargetAdaptiveLoss {
            num_classes,
            foreground: foreground.to_vec(),
            channels: Tensor::from_slice(&kept).to_device(device),
            lut: Tensor::from_slice(&lut).to_device(device),
        })
    }

    /// Annotated classes.
    pub fn foreground(&self) -> &[usize] {
        &self.foreground
    }

    /// Scalar loss over the kept channels.
    pub fn forward(&self, logits: &Tensor, target: &Tensor) -> TrainResult<Tensor> {
        let c = logits.size()[1];
        if c != self.num_classes as i64 {
            return Err(TrainError::shape_mismatch(vec![self.num_classes], vec![c as usize]));
        }
        let kept = logits.f_index_select(1, &self.channels)?;
        let target = class_map(target);
        let shape = target.size();
        let remapped = self.lut.f_index_select(0, &target.flatten(0, -1))?.reshape(shape);
        DiceCeLoss.forward(&kept, &remapped)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SegmentationLoss / Criterion
// ─────────────────────────────────────────────────────────────────────────────

/// One segmentation loss.
#[derive(Debug)]
pub enum SegmentationLoss {
    /// Full-label DiceCE.
    DiceCe(DiceCeLoss),
    /// Partial-label DiceCE.
    TargetAdaptive(TargetAdaptiveLoss),
}

impl SegmentationLoss {
    /// Name used in log tags.
    pub fn name(&self) -> &'static str {
        match self {
            SegmentationLoss::DiceCe(_) => DiceCeLoss::NAME,
            SegmentationLoss::TargetAdaptive(_) => TargetAdaptiveLoss::NAME,
        }
    }

    /// Scalar loss.
    pub fn forward(&self, logits: &Tensor, target: &Tensor) -> TrainResult<Tensor> {
        match self {
            SegmentationLoss::DiceCe(l) => l.forward(logits, target),
            SegmentationLoss::TargetAdaptive(l) => l.forward(logits, target),
        }
    }
}

/// The module's criterion: one loss, or one per modality.
#[derive(Debug)]
pub enum Criterion {
    /// Used for every batch.
    Single(SegmentationLoss),
    /// Chosen by the batch's modality.
    PerModality {
        /// CT loss.
        ct: SegmentationLoss,
        /// MR loss.
        mr: SegmentationLoss,
    },
}

impl Criterion {
    /// Target-adaptive pair over `partition`.
    pub fn tal_pair(partition: &ClassPartition, device: Device) -> Result<Self, ConfigError> {
        let n = partition.num_classes();
        Ok(Criterion::PerModality {
            ct: SegmentationLoss::TargetAdaptive(TargetAdaptiveLoss::new(
                n,
                partition.foreground(Modality::Ct),
                device,
            )?),
            mr: SegmentationLoss::TargetAdaptive(TargetAdaptiveLoss::new(
                n,
                partition.foreground(Modality::Mr),
                device,
            )?),
        })
    }

    /// Criterion implied by a run configuration.
    ///
    /// - DANN: a target-adaptive pair when `loss = tal` or `masked`, else a
    ///   DiceCE pair.
    /// - Segmentation: DiceCE; target-adaptive on the single modality; a
    ///   target-adaptive pair on `ct+mr`.
    pub fn from_config(cfg: &TrainingConfig, partition: &ClassPartition, device: Device) -> Result<Self, ConfigError> {
        let tal = cfg.loss == LossKind::TargetAdaptive;
        match cfg.module {
            ModuleKind::Dann if tal || cfg.masked => Self::tal_pair(partition, device),
            ModuleKind::Dann => Ok(Criterion::PerModality {
                ct: SegmentationLoss::DiceCe(DiceCeLoss),
                mr: SegmentationLoss::DiceCe(DiceCeLoss),
            }),
            ModuleKind::Segmentation if !tal => Ok(Criterion::Single(SegmentationLoss::DiceCe(DiceCeLoss))),
            ModuleKind::Segmentation => match cfg.modality.single() {
                Some(m) => Ok(Criterion::Single(SegmentationLoss::TargetAdaptive(TargetAdaptiveLoss::new(
                    partition.num_classes(),
                    partition.foreground(m),
                    device,
                )?))),
                None => Self::tal_pair(partition, device),
            },
        }
    }

    /// Loss for a batch of `modality`.
    ///
    /// # Errors
    ///
    /// A per-modality criterion given no modality.
    pub fn select(&self, modality: Option<Modality>) -> TrainResult<&SegmentationLoss> {
        match (self, modality) {
            (Criterion::Single(loss), _) => Ok(loss),
            (Criterion::PerModality { ct, .. }, Some(Modality::Ct)) => Ok(ct),
            (Criterion::PerModality { mr, .. }, Some(Modality::Mr)) => Ok(mr),
            (Criterion::PerModality { .. }, None) => {
                Err(TrainError::training_step("per-modality criterion needs the batch modality"))
            }
        }
    }

    /// `true` for a per-modality pair.
    pub fn is_per_modality(&self) -> bool {
        matches!(self, Criterion::PerModality { .. })
    }

    /// Loss name used in `train/<name>` tags.
    pub fn name(&self) -> &'static str {
        match self {
            Criterion::Single(l) => l.name(),
            Criterion::PerModality { ct, .. } => ct.name(),
        }
    }

    /// Human-readable description.
    pub fn describe(&self) -> String {
        match self {
            Criterion::Single(l) => l.name().to_string(),
            Criterion::PerModality { ct, mr } => format!("{} (ct), {} (mr)", ct.name(), mr.name()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AdversarialLoss
// ─────────────────────────────────────────────────────────────────────────────

/// Binary cross-entropy with logits, mean-reduced.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdversarialLoss;

impl AdversarialLoss {
    /// Scalar loss of domain `logits` against `target` (same shape, CT = 1,
    /// MR = 0).
    pub fn forward(&self, logits: &Tensor, target: &Tensor) -> TrainResult<Tensor> {
        if logits.size() != target.size() {
            return Err(TrainError::shape_mismatch(
                logits.size().iter().map(|&s| s as usize).collect(),
                target.size().iter().map(|&s| s as usize).collect(),
            ));
        }
        Ok(logits.f_binary_cross_entropy_with_logits::<Tensor>(target, None, None, Reduction::Mean)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu() -> Device {
        Device::Cpu
    }

    #[test]
    fn dicece_is_small_for_confident_correct_logits() {
        let target = Tensor::from_slice(&[0_i64, 1, 2, 1, 0, 2, 2, 1]).reshape([1, 1, 2, 2, 2]);
        let logits = target.squeeze_dim(1).one_hot(3).permute([0, 4, 1, 2, 3]).to_kind(Kind::Float) * 20.0;
        let good = DiceCeLoss.forward(&logits, &target).unwrap().double_value(&[]);
        let bad = DiceCeLoss.forward(&(-&logits), &target).unwrap().double_value(&[]);
        assert!(good < 0.01, "good = {good}");
        assert!(bad > good);
    }

    #[test]
    fn tal_rejects_bad_foreground() {
        assert!(TargetAdaptiveLoss::new(6, &[], cpu()).is_err());
        assert!(TargetAdaptiveLoss::new(6, &[1, 6], cpu()).is_err());
        assert!(TargetAdaptiveLoss::new(6, &[0, 1], cpu()).is_err());
        assert!(TargetAdaptiveLoss::new(6, &[1, 3, 5], cpu()).is_ok());
    }

    #[test]
    fn per_modality_select() {
        let p = ClassPartition::amos_default(6).unwrap();
        let c = Criterion::tal_pair(&p, cpu()).unwrap();
        assert!(c.is_per_modality());
        assert!(c.select(None).is_err());
        match c.select(Some(Modality::Mr)).unwrap() {
            SegmentationLoss::TargetAdaptive(t) => assert_eq!(t.foreground(), p.foreground(Modality::Mr)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn adversarial_loss_shape_check() {
        let a = Tensor::zeros([4, 1], (Kind::Float, cpu()));
        let b = Tensor::zeros([4], (Kind::Float, cpu()));
        assert!(AdversarialLoss.forward(&a, &b).is_err());
        let l = AdversarialLoss.forward(&a, &a.ones_like()).unwrap().double_value(&[]);
        assert!((l - std::f64::consts::LN_2).abs() < 1e-6);
    }
}
