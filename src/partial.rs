//! Partial-label class partitions and validation postprocessing.
//!
//! In the partially-labelled setting each modality annotates only a subset of
//! the anatomical classes. A [`ClassPartition`] records which classes are
//! foreground for CT and which for MR; the complement of a modality's
//! foreground set is its [`BackgroundMap`], which folds unannotated classes
//! into background.
//!
//! The postprocessing used by validation lives here as pure functions over
//! channel-first `ndarray` volumes (`[C, D, H, W]`):
//!
//! ```text
//! logits ──► as_discrete_argmax ──┐
//!                                  ├──► mask_partial_labels ──► DiceMetric
//! label  ──► one_hot ─────────────┘       (optional)
//! ```
//!
//! Background masking is idempotent and never changes a voxel that is
//! already background.

use ndarray::{Array4, ArrayView4, ArrayViewMutD, Axis, Zip};
use std::collections::BTreeMap;

use crate::error::{ConfigError, TrainError, TrainResult};
use crate::modality::Modality;

/// Index of the implicit background class.
pub const BACKGROUND: usize = 0;

// ---------------------------------------------------------------------------
// BackgroundMap
// ---------------------------------------------------------------------------

/// Mapping from unannotated class index to the class it is folded into
/// (background, in every map built by [`ClassPartition`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundMap {
    num_classes: usize,
    mapping: BTreeMap<usize, usize>,
}

impl BackgroundMap {
    /// Build a map sending every class in `classes` to background.
    ///
    /// # Errors
    ///
    /// Fails if a class is `0` or `>= num_classes`.
    pub fn to_background(num_classes: usize, classes: &[usize]) -> Result<Self, ConfigError> {
        let mut mapping = BTreeMap::new();
        for &c in classes {
            if c == BACKGROUND || c >= num_classes {
                return Err(ConfigError::invalid_value(
                    "background_map",
                    format!("class {c} must be in [1, {num_classes})"),
                ));
            }
            mapping.insert(c, BACKGROUND);
        }
        Ok(BackgroundMap { num_classes, mapping })
    }

    /// Number of classes of the label space.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Folded classes in ascending order.
    pub fn classes(&self) -> impl Iterator<Item = usize> + '_ {
        self.mapping.keys().copied()
    }

    /// `true` if `class` is folded by this map.
    pub fn contains(&self, class: usize) -> bool {
        self.mapping.contains_key(&class)
    }

    /// `(class, substitute)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.mapping.iter().map(|(&c, &t)| (c, t))
    }

    /// `true` when nothing is folded.
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Relabel an integer class map in place.
    pub fn apply_to_label(&self, mut label: ArrayViewMutD<'_, i64>) {
        label.mapv_inplace(|v| {
            if v < 0 {
                return v;
            }
            match self.mapping.get(&(v as usize)) {
                Some(&t) => t as i64,
                None => v,
            }
        });
    }
}

// ---------------------------------------------------------------------------
// ClassPartition
// ---------------------------------------------------------------------------

/// Per-modality foreground class sets over a shared label space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassPartition {
    num_classes: usize,
    ct: Vec<usize>,
    mr: Vec<usize>,
}

impl ClassPartition {
    /// Create a partition from explicit foreground sets.
    ///
    /// # Errors
    ///
    /// Each set must be non-empty, free of duplicates, and contain only
    /// indices in `[1, num_classes)`.
    pub fn new(num_classes: usize, ct: Vec<usize>, mr: Vec<usize>) -> Result<Self, ConfigError> {
        validate_foreground(num_classes, &ct)?;
        validate_foreground(num_classes, &mr)?;
        Ok(ClassPartition { num_classes, ct, mr })
    }

    /// The AMOS convention: CT annotates the odd classes, MR the even ones.
    pub fn amos_default(num_classes: usize) -> Result<Self, ConfigError> {
        let ct = (1..num_classes).filter(|c| c % 2 == 1).collect();
        let mr = (1..num_classes).filter(|c| c % 2 == 0).collect();
        Self::new(num_classes, ct, mr)
    }

    /// Size of the label space, background included.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Annotated classes of `modality`.
    pub fn foreground(&self, modality: Modality) -> &[usize] {
        match modality {
            Modality::Ct => &self.ct,
            Modality::Mr => &self.mr,
        }
    }

    /// Background map of `modality`: every non-zero class outside its
    /// foreground set.
    pub fn background_map(&self, modality: Modality) -> BackgroundMap {
        let fg = self.foreground(modality);
        let mapping = (1..self.num_classes)
            .filter(|c| !fg.contains(c))
            .map(|c| (c, BACKGROUND))
            .collect();
        BackgroundMap { num_classes: self.num_classes, mapping }
    }

    /// [`mask_partial_labels`] with the map of `modality`.
    pub fn mask(
        &self,
        prediction: &Array4<f32>,
        ground_truth: &Array4<f32>,
        modality: Modality,
    ) -> (Array4<f32>, Array4<f32>) {
        mask_partial_labels(prediction, ground_truth, &self.background_map(modality))
    }
}

/// Check a foreground set against a label space.
pub fn validate_foreground(num_classes: usize, foreground: &[usize]) -> Result<(), ConfigError> {
    if foreground.is_empty() {
        return Err(ConfigError::invalid_value("foreground", "must not be empty"));
    }
    for (i, &c) in foreground.iter().enumerate() {
        if c >= num_classes {
            return Err(ConfigError::invalid_value(
                "foreground",
                format!("class {c} is out of range for {num_classes} classes"),
            ));
        }
        if c == BACKGROUND {
            return Err(ConfigError::invalid_value(
                "foreground",
                "class 0 is the implicit background",
            ));
        }
        if foreground[..i].contains(&c) {
            return Err(ConfigError::invalid_value(
                "foreground",
                format!("class {c} listed twice"),
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Postprocessing
// ---------------------------------------------------------------------------

/// Discretise `[C, D, H, W]` logits into a one-hot volume by argmax over
/// channels. Ties go to the lowest channel.
pub fn as_discrete_argmax(logits: ArrayView4<'_, f32>) -> Array4<f32> {
    let mut out = Array4::<f32>::zeros(logits.raw_dim());
    Zip::from(out.lanes_mut(Axis(0)))
        .and(logits.lanes(Axis(0)))
        .for_each(|mut o, l| {
            let mut best = 0;
            for (k, &v) in l.iter().enumerate() {
                if v > l[best] {
                    best = k;
                }
            }
            o[best] = 1.0;
        });
    out
}

/// One-hot encode a `[1, D, H, W]` class map into `[num_classes, D, H, W]`.
///
/// # Errors
///
/// Fails if the label has more than one channel or a value outside
/// `[0, num_classes)`.
pub fn one_hot(label: ArrayView4<'_, i64>, num_classes: usize) -> TrainResult<Array4<f32>> {
    let (c, d, h, w) = label.dim();
    if c != 1 {
        return Err(TrainError::shape_mismatch(vec![1, d, h, w], label.shape().to_vec()));
    }
    if let Some(&bad) = label.iter().find(|&&v| v < 0 || v as usize >= num_classes) {
        return Err(TrainError::training_step(format!(
            "label value {bad} outside [0, {num_classes})"
        )));
    }
    let mut out = Array4::<f32>::zeros((num_classes, d, h, w));
    Zip::from(out.lanes_mut(Axis(0)))
        .and(label.lanes(Axis(0)))
        .for_each(|mut o, l| o[l[0] as usize] = 1.0);
    Ok(out)
}

/// Fold the channels named by `map` into their substitute channel and zero
/// them. Classes beyond the channel count are ignored.
pub fn backgroundify(onehot: &mut Array4<f32>, map: &BackgroundMap) {
    let channels = onehot.len_of(Axis(0));
    for (class, target) in map.iter() {
        if class >= channels || target >= channels {
            continue;
        }
        let folded = onehot.index_axis(Axis(0), class).to_owned();
        Zip::from(onehot.index_axis_mut(Axis(0), target))
            .and(&folded)
            .for_each(|t, &f| *t = t.max(f));
        onehot.index_axis_mut(Axis(0), class).fill(0.0);
    }
}

/// Mask unannotated classes out of both prediction and ground truth.
///
/// Pure: inputs are untouched, masked copies are returned.
pub fn mask_partial_labels(
    prediction: &Array4<f32>,
    ground_truth: &Array4<f32>,
    map: &BackgroundMap,
) -> (Array4<f32>, Array4<f32>) {
    let mut pred = prediction.clone();
    let mut gt = ground_truth.clone();
    backgroundify(&mut pred, map);
    backgroundify(&mut gt, map);
    (pred, gt)
}

/// Full per-sample postprocessing: argmax + one-hot on the prediction,
/// one-hot on the label, then optional background masking.
pub fn postprocess_sample(
    logits: ArrayView4<'_, f32>,
    label: ArrayView4<'_, i64>,
    num_classes: usize,
    background: Option<&BackgroundMap>,
) -> TrainResult<(Array4<f32>, Array4<f32>)> {
    if logits.len_of(Axis(0)) != num_classes {
        return Err(TrainError::shape_mismatch(
            vec![num_classes],
            vec![logits.len_of(Axis(0))],
        ));
    }
    if logits.shape()[1..] != label.shape()[1..] {
        return Err(TrainError::shape_mismatch(
            logits.shape()[1..].to_vec(),
            label.shape()[1..].to_vec(),
        ));
    }
    let mut pred = as_discrete_argmax(logits);
    let mut gt = one_hot(label, num_classes)?;
    if let Some(map) = background {
        backgroundify(&mut pred, map);
        backgroundify(&mut gt, map);
    }
    Ok((pred, gt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn amos_partition_splits_odd_and_even() {
        let p = ClassPartition::amos_default(6).unwrap();
        assert_eq!(p.foreground(Modality::Ct), &[1, 3, 5]);
        assert_eq!(p.foreground(Modality::Mr), &[2, 4]);
        let ct_bg: Vec<usize> = p.background_map(Modality::Ct).classes().collect();
        assert_eq!(ct_bg, vec![2, 4]);
    }

    #[test]
    fn foreground_validation() {
        assert!(validate_foreground(6, &[]).is_err());
        assert!(validate_foreground(6, &[6]).is_err());
        assert!(validate_foreground(6, &[0, 1]).is_err());
        assert!(validate_foreground(6, &[1, 1]).is_err());
        assert!(validate_foreground(6, &[1, 3, 5]).is_ok());
    }

    #[test]
    fn argmax_prefers_first_on_ties() {
        let logits = Array4::from_shape_vec((3, 1, 1, 2), vec![1.0, 0.0, 1.0, 2.0, 0.5, 2.0]).unwrap();
        let out = as_discrete_argmax(logits.view());
        assert_eq!(out[[0, 0, 0, 0]], 1.0);
        assert_eq!(out[[1, 0, 0, 1]], 1.0);
        assert_eq!(out[[2, 0, 0, 1]], 0.0);
        assert_eq!(out.sum(), 2.0);
    }

    #[test]
    fn one_hot_rejects_out_of_range() {
        let label = Array4::from_shape_vec((1, 1, 1, 2), vec![0_i64, 4]).unwrap();
        assert!(one_hot(label.view(), 4).is_err());
        assert!(one_hot(label.view(), 5).is_ok());
    }

    #[test]
    fn backgroundify_moves_mass_to_background() {
        let label = Array4::from_shape_vec((1, 1, 1, 3), vec![0_i64, 2, 3]).unwrap();
        let mut oh = one_hot(label.view(), 4).unwrap();
        let map = BackgroundMap::to_background(4, &[2]).unwrap();
        backgroundify(&mut oh, &map);
        assert_eq!(oh[[0, 0, 0, 1]], 1.0);
        assert_eq!(oh[[2, 0, 0, 1]], 0.0);
        assert_eq!(oh[[3, 0, 0, 2]], 1.0);
    }

    #[test]
    fn label_relabel_keeps_foreground() {
        let mut label = Array4::from_shape_vec((1, 1, 1, 4), vec![0_i64, 1, 2, 3]).unwrap().into_dyn();
        let map = ClassPartition::amos_default(4).unwrap().background_map(Modality::Ct);
        map.apply_to_label(label.view_mut());
        assert_eq!(label.iter().copied().collect::<Vec<_>>(), vec![0, 1, 0, 3]);
    }
}
