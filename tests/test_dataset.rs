//! Integration tests for [`medseg_dann::dataset`].
//!
//! On-disk tests write small `.npy` volumes into a temporary directory laid
//! out as `<root>/<modality>/<stage>/<case>/{image,label}.npy`.

use ndarray::{Array3, Array4};
use ndarray_npy::write_npy;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use medseg_dann::dataset::{
    split_tail, ConcatDataset, CyclicLoader, DataLoader, NpyVolumeDataset, PairedLoaders, Stage, Subset,
    SyntheticVolumeConfig, SyntheticVolumeDataset, VolumeDataset, VolumeSample,
};
use medseg_dann::error::DatasetError;
use medseg_dann::modality::Modality;
use medseg_dann::partial::ClassPartition;
use medseg_dann::trainer::BatchSource;

fn synthetic(modality: Modality, n: usize) -> SyntheticVolumeDataset {
    SyntheticVolumeDataset::new(
        n,
        SyntheticVolumeConfig { spatial: [6, 6, 6], num_classes: 4, ..SyntheticVolumeConfig::new(modality) },
    )
}

fn write_case(root: &Path, modality: &str, stage: &str, case: &str, fill: i64) {
    let dir = root.join(modality).join(stage).join(case);
    std::fs::create_dir_all(&dir).unwrap();
    let image = Array3::<f32>::from_elem((2, 3, 4), fill as f32 * 0.5);
    let label = Array3::<i64>::from_shape_fn((2, 3, 4), |(d, _, _)| if d == 0 { 0 } else { fill });
    write_npy(dir.join("image.npy"), &image).unwrap();
    write_npy(dir.join("label.npy"), &label).unwrap();
}

// ---------------------------------------------------------------------------
// Synthetic data
// ---------------------------------------------------------------------------

/// The same index always produces the same case.
#[test]
fn synthetic_is_deterministic() {
    let ds = synthetic(Modality::Ct, 3);
    let a = ds.get(1).unwrap();
    let b = ds.get(1).unwrap();
    assert_eq!(a.image, b.image);
    assert_eq!(a.label, b.label);
    assert_eq!(a.spatial(), [6, 6, 6]);
    assert!(matches!(ds.get(3), Err(DatasetError::IndexOutOfBounds { idx: 3, len: 3 })));
}

/// CT and MR phantoms occupy separate intensity ranges.
#[test]
fn synthetic_modalities_are_separable() {
    let ct = synthetic(Modality::Ct, 1).get(0).unwrap();
    let mr = synthetic(Modality::Mr, 1).get(0).unwrap();
    let ct_min = ct.image.iter().cloned().fold(f32::INFINITY, f32::min);
    let mr_max = mr.image.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    assert!(ct_min > mr_max, "ct min {ct_min} must exceed mr max {mr_max}");
}

/// A mask map relabels unannotated classes on load.
#[test]
fn synthetic_mask_mapping_applies() {
    let p = ClassPartition::amos_default(4).unwrap();
    let cfg = SyntheticVolumeConfig {
        spatial: [8, 8, 8],
        num_classes: 4,
        mask_mapping: Some(p.background_map(Modality::Ct)),
        ..SyntheticVolumeConfig::new(Modality::Ct)
    };
    let sample = SyntheticVolumeDataset::new(1, cfg).get(0).unwrap();
    assert!(sample.label.iter().all(|&c| c != 2), "class 2 is MR-only and must be masked");
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

#[test]
fn split_tail_keeps_order_and_minimum() {
    let ds: Arc<dyn VolumeDataset> = Arc::new(synthetic(Modality::Ct, 10));
    let (train, val) = split_tail(Arc::clone(&ds), 0.2).unwrap();
    assert_eq!(train.len(), 8);
    assert_eq!(val.len(), 2);
    assert_eq!(val.get(0).unwrap().case_id, "synthetic_0008");

    let (train, val) = split_tail(Arc::clone(&ds), 0.01).unwrap();
    assert_eq!((train.len(), val.len()), (9, 1));

    // 19 * 0.1 = 1.9 cases: the tail is floored, not rounded.
    let nineteen: Arc<dyn VolumeDataset> = Arc::new(synthetic(Modality::Ct, 19));
    let (train, val) = split_tail(nineteen, 0.1).unwrap();
    assert_eq!((train.len(), val.len()), (18, 1));

    let one: Arc<dyn VolumeDataset> = Arc::new(synthetic(Modality::Ct, 1));
    assert!(split_tail(one, 0.5).is_err());
}

#[test]
fn concat_and_head() {
    let ct: Arc<dyn VolumeDataset> = Arc::new(synthetic(Modality::Ct, 2));
    let mr: Arc<dyn VolumeDataset> = Arc::new(synthetic(Modality::Mr, 3));
    let both = ConcatDataset::new(vec![ct, Arc::clone(&mr)]);
    assert_eq!(both.len(), 5);
    assert_eq!(both.get(1).unwrap().modality, Modality::Ct);
    assert_eq!(both.get(2).unwrap().modality, Modality::Mr);
    assert!(both.get(5).is_err());

    let head = Subset::head(mr, 2);
    assert_eq!(head.len(), 2);
    assert_eq!(head.get(1).unwrap().case_id, "synthetic_0001");
}

// ---------------------------------------------------------------------------
// Loaders
// ---------------------------------------------------------------------------

#[test]
fn loader_batches_and_tags_modality() {
    let ds = synthetic(Modality::Mr, 5);
    let loader = DataLoader::new(&ds, 2, false, 0);
    assert_eq!(loader.num_batches(), 3);
    let batches: Vec<_> = loader.iter().map(|b| b.unwrap()).collect();
    assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![2, 2, 1]);
    assert_eq!(batches[0].image.shape(), &[2, 1, 6, 6, 6]);
    assert_eq!(batches[0].modality(), Modality::Mr);
}

/// A batch drawn across a CT+MR concatenation is tagged by its first sample
/// and reports that it is mixed.
#[test]
fn mixed_batch_tagged_by_first_sample() {
    let ct: Arc<dyn VolumeDataset> = Arc::new(synthetic(Modality::Ct, 1));
    let mr: Arc<dyn VolumeDataset> = Arc::new(synthetic(Modality::Mr, 2));
    let both = ConcatDataset::new(vec![ct, mr]);
    let batches: Vec<_> = DataLoader::new(&both, 2, false, 0).iter().map(|b| b.unwrap()).collect();

    assert!(batches[0].is_mixed());
    assert_eq!(batches[0].modality(), Modality::Ct);
    assert_eq!(batches[0].modalities, vec![Modality::Ct, Modality::Mr]);
    assert!(!batches[1].is_mixed());
    assert_eq!(batches[1].modality(), Modality::Mr);
}

/// Shuffling is a deterministic permutation of the dataset.
#[test]
fn shuffle_is_seeded_permutation() {
    let ds = synthetic(Modality::Ct, 6);
    let ids = |seed| {
        DataLoader::new(&ds, 1, true, seed)
            .iter()
            .map(|b| b.unwrap().case_ids[0].clone())
            .collect::<Vec<_>>()
    };
    let a = ids(7);
    assert_eq!(a, ids(7));
    let mut sorted = a.clone();
    sorted.sort();
    assert_eq!(sorted, (0..6).map(|i| format!("synthetic_{i:04}")).collect::<Vec<_>>());
}

/// Cyclic loaders restart after an epoch; paired loaders cycle independently.
#[test]
fn cyclic_and_paired_loaders_roll_over() {
    let ct = synthetic(Modality::Ct, 2);
    let mr = synthetic(Modality::Mr, 3);

    let mut cyc = CyclicLoader::new(DataLoader::new(&ct, 1, false, 0));
    for _ in 0..5 {
        cyc.next_batch().unwrap();
    }
    assert_eq!(cyc.epoch(), 2);

    let mut paired = PairedLoaders::new(DataLoader::new(&ct, 1, false, 0), DataLoader::new(&mr, 1, false, 0));
    for _ in 0..4 {
        let (c, m) = BatchSource::next_batch(&mut paired).unwrap();
        assert_eq!(c.modality(), Modality::Ct);
        assert_eq!(m.modality(), Modality::Mr);
    }
    assert_eq!(paired.ct.epoch(), 1);
    assert_eq!(paired.mr.epoch(), 1);
}

#[test]
fn cyclic_loader_on_empty_dataset_errors() {
    let empty = synthetic(Modality::Ct, 0);
    let mut cyc = CyclicLoader::new(DataLoader::new(&empty, 1, false, 0));
    assert!(cyc.next_batch().is_err());
}

/// Synthetic cases, except that case `broken` cannot be read.
struct BrokenCase {
    inner: SyntheticVolumeDataset,
    broken: usize,
}

impl VolumeDataset for BrokenCase {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, idx: usize) -> Result<VolumeSample, DatasetError> {
        if idx == self.broken {
            return Err(DatasetError::npy_read(format!("case_{idx}/image.npy"), "truncated file"));
        }
        self.inner.get(idx)
    }

    fn name(&self) -> &str {
        "broken"
    }
}

/// A case that fails to load fails its batch instead of silently shrinking it.
#[test]
fn loader_surfaces_failed_case() {
    let ds = BrokenCase { inner: synthetic(Modality::Ct, 4), broken: 2 };
    let batches: Vec<_> = DataLoader::new(&ds, 2, false, 0).iter().collect();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].as_ref().unwrap().len(), 2);
    assert!(matches!(batches[1], Err(DatasetError::NpyReadError { .. })));

    let ds = BrokenCase { inner: synthetic(Modality::Mr, 3), broken: 0 };
    let mut cyc = CyclicLoader::new(DataLoader::new(&ds, 1, false, 0));
    assert!(cyc.next_batch().is_err());
    assert!(cyc.next_batch().is_ok());
}

// ---------------------------------------------------------------------------
// .npy directories
// ---------------------------------------------------------------------------

#[test]
fn npy_discovery_and_loading() {
    let tmp = TempDir::new().unwrap();
    write_case(tmp.path(), "ct", "train", "case_b", 3);
    write_case(tmp.path(), "ct", "train", "case_a", 1);
    std::fs::create_dir_all(tmp.path().join("ct/train/incomplete")).unwrap();

    let ds = NpyVolumeDataset::discover(tmp.path(), Modality::Ct, Stage::Train, None).unwrap();
    assert_eq!(ds.len(), 2);
    let first = ds.get(0).unwrap();
    assert_eq!(first.case_id, "case_a");
    assert_eq!(first.image.shape(), &[1, 2, 3, 4]);
    assert_eq!(first.label.shape(), &[1, 2, 3, 4]);
    assert_eq!(first.modality, Modality::Ct);
}

#[test]
fn npy_masked_labels() {
    let tmp = TempDir::new().unwrap();
    write_case(tmp.path(), "ct", "train", "case_0", 2);
    let p = ClassPartition::amos_default(4).unwrap();
    let ds = NpyVolumeDataset::discover(tmp.path(), Modality::Ct, Stage::Train, Some(p.background_map(Modality::Ct)))
        .unwrap();
    assert!(ds.get(0).unwrap().label.iter().all(|&c| c == 0));
}

#[test]
fn npy_missing_stage_directory() {
    let tmp = TempDir::new().unwrap();
    let err = NpyVolumeDataset::discover(tmp.path(), Modality::Mr, Stage::Validation, None).err();
    assert!(matches!(err, Some(DatasetError::DirectoryNotFound { .. })));
}

#[test]
fn npy_rejects_mismatched_shapes() {
    let tmp = TempDir::new().unwrap();
    write_case(tmp.path(), "mr", "validation", "bad", 1);
    let dir = tmp.path().join("mr/validation/bad");
    write_npy(dir.join("label.npy"), &Array4::<i64>::zeros((1, 2, 3, 5))).unwrap();
    let ds = NpyVolumeDataset::discover(tmp.path(), Modality::Mr, Stage::Validation, None).unwrap();
    assert!(ds.get(0).is_err());
}
