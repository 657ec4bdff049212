//! Integration tests for [`medseg_dann::partial`]: class partitions,
//! background maps and validation postprocessing.

use ndarray::{Array4, Axis};

use medseg_dann::modality::Modality;
use medseg_dann::partial::{
    as_discrete_argmax, mask_partial_labels, one_hot, postprocess_sample, BackgroundMap, ClassPartition,
};

/// `[C, 1, 1, n]` one-hot volume from a class per voxel.
fn onehot_of(classes: &[i64], num_classes: usize) -> Array4<f32> {
    let label = Array4::from_shape_vec((1, 1, 1, classes.len()), classes.to_vec()).unwrap();
    one_hot(label.view(), num_classes).unwrap()
}

fn argmax_classes(onehot: &Array4<f32>) -> Vec<usize> {
    onehot
        .lanes(Axis(0))
        .into_iter()
        .map(|l| l.iter().position(|&v| v == 1.0).unwrap())
        .collect()
}

// ---------------------------------------------------------------------------
// Partitions
// ---------------------------------------------------------------------------

#[test]
fn amos_partition_is_odd_even() {
    let p = ClassPartition::amos_default(6).unwrap();
    assert_eq!(p.foreground(Modality::Ct), &[1, 3, 5]);
    assert_eq!(p.foreground(Modality::Mr), &[2, 4]);

    let ct_bg: Vec<usize> = p.background_map(Modality::Ct).classes().collect();
    assert_eq!(ct_bg, vec![2, 4]);
}

#[test]
fn invalid_foreground_sets_rejected() {
    assert!(ClassPartition::new(4, vec![], vec![1]).is_err());
    assert!(ClassPartition::new(4, vec![0, 1], vec![2]).is_err());
    assert!(ClassPartition::new(4, vec![1, 4], vec![2]).is_err());
    assert!(ClassPartition::new(4, vec![1, 1], vec![2]).is_err());
    assert!(BackgroundMap::to_background(4, &[0]).is_err());
}

// ---------------------------------------------------------------------------
// Masking
// ---------------------------------------------------------------------------

/// Masked classes end up as background in both prediction and ground truth.
#[test]
fn masking_folds_unannotated_classes_into_background() {
    let p = ClassPartition::amos_default(4).unwrap();
    let pred = onehot_of(&[0, 1, 2, 3], 4);
    let gt = onehot_of(&[2, 1, 2, 0], 4);

    let (mp, mg) = p.mask(&pred, &gt, Modality::Ct);
    assert_eq!(argmax_classes(&mp), vec![0, 1, 0, 3]);
    assert_eq!(argmax_classes(&mg), vec![0, 1, 0, 0]);
    assert!(mp.index_axis(Axis(0), 2).iter().all(|&v| v == 0.0));
}

/// Applying the same mask twice changes nothing more.
#[test]
fn masking_is_idempotent() {
    let map = BackgroundMap::to_background(6, &[2, 4]).unwrap();
    let pred = onehot_of(&[0, 1, 2, 3, 4, 5], 6);
    let gt = onehot_of(&[5, 4, 3, 2, 1, 0], 6);

    let (p1, g1) = mask_partial_labels(&pred, &gt, &map);
    let (p2, g2) = mask_partial_labels(&p1, &g1, &map);
    assert_eq!(p1, p2);
    assert_eq!(g1, g2);
}

/// Each modality keeps its own classes untouched and never touches
/// existing background.
#[test]
fn masking_keeps_foreground_and_background() {
    let p = ClassPartition::amos_default(6).unwrap();
    let gt = onehot_of(&[0, 1, 2, 3, 4, 5], 6);
    let (_, ct) = p.mask(&gt, &gt, Modality::Ct);
    let (_, mr) = p.mask(&gt, &gt, Modality::Mr);
    assert_eq!(argmax_classes(&ct), vec![0, 1, 0, 3, 0, 5]);
    assert_eq!(argmax_classes(&mr), vec![0, 0, 2, 0, 4, 0]);
}

/// Inputs are not modified.
#[test]
fn masking_is_pure() {
    let map = BackgroundMap::to_background(3, &[2]).unwrap();
    let pred = onehot_of(&[2, 2], 3);
    let before = pred.clone();
    let _ = mask_partial_labels(&pred, &pred, &map);
    assert_eq!(pred, before);
}

#[test]
fn label_relabelling_matches_onehot_masking() {
    let map = BackgroundMap::to_background(4, &[1, 3]).unwrap();
    let mut label = Array4::from_shape_vec((1, 1, 1, 4), vec![0_i64, 1, 2, 3]).unwrap();
    map.apply_to_label(label.view_mut().into_dyn());
    assert_eq!(label.iter().copied().collect::<Vec<_>>(), vec![0, 0, 2, 0]);
}

// ---------------------------------------------------------------------------
// Postprocessing
// ---------------------------------------------------------------------------

#[test]
fn argmax_ties_go_to_lowest_channel() {
    let logits = Array4::from_shape_vec((3, 1, 1, 2), vec![0.5, 0.1, 0.5, 0.9, 0.2, 0.9]).unwrap();
    let out = as_discrete_argmax(logits.view());
    assert_eq!(argmax_classes(&out), vec![0, 1]);
}

#[test]
fn postprocess_checks_shapes() {
    let logits = Array4::<f32>::zeros((3, 1, 2, 2));
    let label = Array4::<i64>::zeros((1, 1, 2, 2));
    assert!(postprocess_sample(logits.view(), label.view(), 3, None).is_ok());
    assert!(postprocess_sample(logits.view(), label.view(), 4, None).is_err());

    let wrong = Array4::<i64>::zeros((1, 1, 2, 3));
    assert!(postprocess_sample(logits.view(), wrong.view(), 3, None).is_err());

    let out_of_range = Array4::from_elem((1, 1, 2, 2), 7_i64);
    assert!(postprocess_sample(logits.view(), out_of_range.view(), 3, None).is_err());
}
