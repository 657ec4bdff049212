//! Dataset abstractions and concrete implementations for volumetric training.
//!
//! This module defines the [`VolumeDataset`] trait plus two concrete
//! implementations:
//!
//! - [`NpyVolumeDataset`]: reads `.npy` image/label pairs from disk.
//! - [`SyntheticVolumeDataset`]: generates deterministic phantoms (nested
//!   shells with modality-specific contrast); used by tests, benches and
//!   smoke runs. **Never uses random data.**
//!
//! [`Subset`] and [`ConcatDataset`] compose datasets (train/validation
//! splits, CT+MR pooling). A [`DataLoader`] wraps any dataset and yields
//! collated [`VolumeBatch`]es with an optional deterministic per-epoch
//! shuffle; [`CyclicLoader`] turns it into the endless stream the trainer
//! pulls from, and [`PairedLoaders`] cycles a CT and an MR stream
//! independently.
//!
//! # Directory layout expected by `NpyVolumeDataset`
//!
//! ```text
//! <root>/
//!   ct/
//!     train/
//!       amos_0001/
//!         image.npy    # float32 [D, H, W] or [C, D, H, W]
//!         label.npy    # integer [D, H, W] or [1, D, H, W]
//!       ...
//!     validation/
//!       ...
//!   mr/
//!     ...
//! ```
//!
//! # Example
//!
//! ```rust
//! use medseg_dann::dataset::{DataLoader, SyntheticVolumeConfig, SyntheticVolumeDataset, VolumeDataset};
//! use medseg_dann::modality::Modality;
//!
//! let cfg = SyntheticVolumeConfig { spatial: [8, 8, 8], ..SyntheticVolumeConfig::new(Modality::Ct) };
//! let ds = SyntheticVolumeDataset::new(4, cfg);
//! assert_eq!(ds.len(), 4);
//!
//! let loader = DataLoader::new(&ds, 2, false, 0);
//! let batch = loader.iter().next().unwrap().unwrap();
//! assert_eq!(batch.image.shape(), &[2, 1, 8, 8, 8]);
//! ```

use ndarray::{Array4, Array5, ArrayD, ArrayView4, Axis, Dimension, Ix4};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{DatasetError, TrainError, TrainResult};
use crate::modality::Modality;
use crate::partial::BackgroundMap;
use crate::trainer::BatchSource;

// ---------------------------------------------------------------------------
// VolumeSample / VolumeBatch
// ---------------------------------------------------------------------------

/// One image/label volume pair.
#[derive(Debug, Clone)]
pub struct VolumeSample {
    /// Image intensities, shape `[C, D, H, W]`.
    pub image: Array4<f32>,
    /// Integer class map, shape `[1, D, H, W]`.
    pub label: Array4<i64>,
    /// Modality of the scan.
    pub modality: Modality,
    /// Case identifier (directory name for on-disk data).
    pub case_id: String,
}

impl VolumeSample {
    /// Build a sample, checking that image and label share spatial size.
    pub fn new(
        image: Array4<f32>,
        label: Array4<i64>,
        modality: Modality,
        case_id: impl Into<String>,
    ) -> Result<Self, DatasetError> {
        let case_id = case_id.into();
        if image.shape()[1..] != label.shape()[1..] || label.shape()[0] != 1 {
            return Err(DatasetError::SpatialMismatch {
                case_id,
                image: image.shape()[1..].to_vec(),
                label: label.shape().to_vec(),
            });
        }
        Ok(VolumeSample { image, label, modality, case_id })
    }

    /// Spatial size `[D, H, W]`.
    pub fn spatial(&self) -> [usize; 3] {
        let s = self.image.shape();
        [s[1], s[2], s[3]]
    }
}

/// A stacked batch of samples.
#[derive(Debug, Clone)]
pub struct VolumeBatch {
    /// Images, shape `[N, C, D, H, W]`.
    pub image: Array5<f32>,
    /// Labels, shape `[N, 1, D, H, W]`.
    pub label: Array5<i64>,
    /// Modality of each sample.
    pub modalities: Vec<Modality>,
    /// Case identifier of each sample.
    pub case_ids: Vec<String>,
}

impl VolumeBatch {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.modalities.len()
    }

    /// `true` when the batch holds no samples.
    pub fn is_empty(&self) -> bool {
        self.modalities.is_empty()
    }

    /// Batch-level modality tag: the modality of the first sample.
    ///
    /// A shuffled `ct+mr` concatenation can yield batches that mix
    /// modalities. A per-modality loss then applies the first sample's
    /// foreground set to every sample; see [`VolumeBatch::is_mixed`].
    pub fn modality(&self) -> Modality {
        self.modalities.first().copied().unwrap_or(Modality::Ct)
    }

    /// `true` when the samples do not all share one modality.
    pub fn is_mixed(&self) -> bool {
        self.modalities.windows(2).any(|w| w[0] != w[1])
    }

    /// Label of sample `i`, shape `[1, D, H, W]`.
    pub fn sample_label(&self, i: usize) -> ArrayView4<'_, i64> {
        self.label.index_axis(Axis(0), i)
    }
}

/// Stack samples into a batch.
///
/// # Errors
///
/// Returns [`DatasetError::Collate`] if `samples` is empty or the shapes
/// differ.
pub fn collate(samples: Vec<VolumeSample>) -> Result<VolumeBatch, DatasetError> {
    let first = samples
        .first()
        .ok_or_else(|| DatasetError::Collate("no samples".into()))?;
    let img_shape = first.image.raw_dim();
    let lbl_shape = first.label.raw_dim();
    for s in &samples[1..] {
        if s.image.raw_dim() != img_shape || s.label.raw_dim() != lbl_shape {
            return Err(DatasetError::Collate(format!(
                "case `{}` has shape {:?}, expected {:?}",
                s.case_id,
                s.image.shape(),
                img_shape.slice()
            )));
        }
    }

    let image_views: Vec<_> = samples.iter().map(|s| s.image.view()).collect();
    let label_views: Vec<_> = samples.iter().map(|s| s.label.view()).collect();
    let image = ndarray::stack(Axis(0), &image_views)
        .map_err(|e| DatasetError::Collate(e.to_string()))?;
    let label = ndarray::stack(Axis(0), &label_views)
        .map_err(|e| DatasetError::Collate(e.to_string()))?;

    Ok(VolumeBatch {
        image,
        label,
        modalities: samples.iter().map(|s| s.modality).collect(),
        case_ids: samples.into_iter().map(|s| s.case_id).collect(),
    })
}

// ---------------------------------------------------------------------------
// VolumeDataset trait
// ---------------------------------------------------------------------------

/// Common interface for all volume datasets.
///
/// Implementations must be `Send + Sync` so they can be shared behind an
/// [`Arc`] by subsets and concatenations.
pub trait VolumeDataset: Send + Sync {
    /// Total number of cases.
    fn len(&self) -> usize;

    /// Load the case at position `idx`.
    ///
    /// # Errors
    ///
    /// [`DatasetError::IndexOutOfBounds`] past the end. File-backed datasets
    /// also surface read and shape errors here.
    fn get(&self, idx: usize) -> Result<VolumeSample, DatasetError>;

    /// Returns `true` when the dataset contains no cases.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// DataLoader
// ---------------------------------------------------------------------------

/// Batched, optionally-shuffled iterator over a [`VolumeDataset`].
///
/// The shuffle order is fully deterministic: epoch `e` is shuffled with seed
/// `seed + e`, so the same seed always replays the same sequence of epochs.
pub struct DataLoader<'a> {
    dataset: &'a dyn VolumeDataset,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl<'a> DataLoader<'a> {
    /// Batches of `batch_size` cases (at least one); the final batch of an
    /// epoch holds the remainder. With `shuffle`, epoch `e` uses seed
    /// `seed + e`.
    pub fn new(dataset: &'a dyn VolumeDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        DataLoader { dataset, batch_size: batch_size.max(1), shuffle, seed }
    }

    /// The wrapped dataset.
    pub fn dataset(&self) -> &'a dyn VolumeDataset {
        self.dataset
    }

    /// Batches per epoch, counting a short final batch.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Iterate the first epoch.
    pub fn iter(&self) -> DataLoaderIter<'a> {
        self.iter_epoch(0)
    }

    /// Iterate epoch `epoch`.
    ///
    /// A case that fails to load, or a batch that cannot be stacked, comes
    /// back as `Err`. Iteration may continue with the next batch.
    pub fn iter_epoch(&self, epoch: u64) -> DataLoaderIter<'a> {
        let n = self.dataset.len();
        let mut indices: Vec<usize> = (0..n).collect();
        if self.shuffle {
            xorshift_shuffle(&mut indices, self.seed.wrapping_add(epoch));
        }
        DataLoaderIter { dataset: self.dataset, indices, batch_size: self.batch_size, cursor: 0 }
    }
}

/// Iterator returned by [`DataLoader::iter_epoch`].
pub struct DataLoaderIter<'a> {
    dataset: &'a dyn VolumeDataset,
    indices: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for DataLoaderIter<'_> {
    type Item = Result<VolumeBatch, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.cursor..end];
        self.cursor = end;

        let mut samples = Vec::with_capacity(batch_indices.len());
        for &idx in batch_indices {
            match self.dataset.get(idx) {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    warn!("Failed to load sample {idx} of {}: {e}", self.dataset.name());
                    return Some(Err(e));
                }
            }
        }
        Some(collate(samples))
    }
}

// ---------------------------------------------------------------------------
// Cyclic iteration
// ---------------------------------------------------------------------------

/// Endless batch stream over a [`DataLoader`]; starts a freshly shuffled
/// epoch whenever the current one is exhausted.
pub struct CyclicLoader<'a> {
    loader: DataLoader<'a>,
    epoch: u64,
    current: DataLoaderIter<'a>,
}

impl<'a> CyclicLoader<'a> {
    /// Wrap `loader`, starting at epoch 0.
    pub fn new(loader: DataLoader<'a>) -> Self {
        let current = loader.iter_epoch(0);
        CyclicLoader { loader, epoch: 0, current }
    }

    /// Number of epochs started so far, minus one.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Next batch, rolling over into a new epoch when needed.
    ///
    /// # Errors
    ///
    /// [`TrainError::EmptyDataset`] if the dataset is empty. Load and
    /// collation errors of the batch are returned as they are.
    pub fn next_batch(&mut self) -> TrainResult<VolumeBatch> {
        if self.loader.dataset.is_empty() {
            return Err(TrainError::EmptyDataset);
        }
        if let Some(batch) = self.current.next() {
            return Ok(batch?);
        }
        self.epoch += 1;
        debug!("{}: starting epoch {}", self.loader.dataset.name(), self.epoch);
        self.current = self.loader.iter_epoch(self.epoch);
        match self.current.next() {
            Some(batch) => Ok(batch?),
            None => Err(TrainError::EmptyDataset),
        }
    }
}

impl BatchSource for CyclicLoader<'_> {
    type Batch = VolumeBatch;

    fn next_batch(&mut self) -> TrainResult<VolumeBatch> {
        CyclicLoader::next_batch(self)
    }
}

/// Independently cycling CT and MR streams; each step yields one batch of
/// each. The two streams roll over epochs on their own schedule.
pub struct PairedLoaders<'a> {
    /// CT stream.
    pub ct: CyclicLoader<'a>,
    /// MR stream.
    pub mr: CyclicLoader<'a>,
}

impl<'a> PairedLoaders<'a> {
    /// Pair two loaders.
    pub fn new(ct: DataLoader<'a>, mr: DataLoader<'a>) -> Self {
        PairedLoaders { ct: CyclicLoader::new(ct), mr: CyclicLoader::new(mr) }
    }
}

impl BatchSource for PairedLoaders<'_> {
    type Batch = (VolumeBatch, VolumeBatch);

    fn next_batch(&mut self) -> TrainResult<Self::Batch> {
        let ct = self.ct.next_batch()?;
        let mr = self.mr.next_batch()?;
        Ok((ct, mr))
    }
}

// ---------------------------------------------------------------------------
// Shuffle
// ---------------------------------------------------------------------------

/// Fisher-Yates over a xorshift64 stream; seed 0 maps to a fixed non-zero state.
fn xorshift_shuffle(indices: &mut [usize], seed: u64) {
    let n = indices.len();
    if n <= 1 {
        return;
    }
    let mut state = if seed == 0 { 0x853c49e6748fea9b } else { seed };
    for i in (1..n).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let j = (state as usize) % (i + 1);
        indices.swap(i, j);
    }
}

// ---------------------------------------------------------------------------
// Subset / ConcatDataset / splits
// ---------------------------------------------------------------------------

/// A view on selected indices of another dataset.
pub struct Subset {
    inner: Arc<dyn VolumeDataset>,
    indices: Vec<usize>,
    name: String,
}

impl Subset {
    /// Subset of `inner` at `indices`.
    pub fn new(inner: Arc<dyn VolumeDataset>, indices: Vec<usize>, label: &str) -> Self {
        let name = format!("{}[{label}]", inner.name());
        Subset { inner, indices, name }
    }

    /// The first `limit` cases of `inner`.
    pub fn head(inner: Arc<dyn VolumeDataset>, limit: usize) -> Self {
        let n = inner.len().min(limit);
        Subset::new(inner, (0..n).collect(), &format!(":{n}"))
    }
}

impl VolumeDataset for Subset {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, idx: usize) -> Result<VolumeSample, DatasetError> {
        let inner_idx = *self
            .indices
            .get(idx)
            .ok_or(DatasetError::IndexOutOfBounds { idx, len: self.indices.len() })?;
        self.inner.get(inner_idx)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Several datasets read back to back.
pub struct ConcatDataset {
    parts: Vec<Arc<dyn VolumeDataset>>,
    /// Prefix sums of part lengths, length `parts.len() + 1`.
    cumulative: Vec<usize>,
    name: String,
}

impl ConcatDataset {
    /// Concatenate `parts` in order.
    pub fn new(parts: Vec<Arc<dyn VolumeDataset>>) -> Self {
        let mut cumulative = vec![0usize; parts.len() + 1];
        for (i, p) in parts.iter().enumerate() {
            cumulative[i + 1] = cumulative[i] + p.len();
        }
        let name = parts.iter().map(|p| p.name()).collect::<Vec<_>>().join(" + ");
        ConcatDataset { parts, cumulative, name }
    }
}

impl VolumeDataset for ConcatDataset {
    fn len(&self) -> usize {
        self.cumulative.last().copied().unwrap_or(0)
    }

    fn get(&self, idx: usize) -> Result<VolumeSample, DatasetError> {
        let len = self.len();
        if idx >= len {
            return Err(DatasetError::IndexOutOfBounds { idx, len });
        }
        let part = self.cumulative.partition_point(|&c| c <= idx).saturating_sub(1);
        self.parts[part].get(idx - self.cumulative[part])
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Split `dataset` into a training head and a validation tail holding
/// `floor(len * val_fraction)` cases (at least one).
///
/// # Errors
///
/// Returns [`DatasetError::IndexOutOfBounds`] when fewer than two cases are
/// available.
pub fn split_tail(
    dataset: Arc<dyn VolumeDataset>,
    val_fraction: f64,
) -> Result<(Subset, Subset), DatasetError> {
    let n = dataset.len();
    if n < 2 {
        return Err(DatasetError::IndexOutOfBounds { idx: 1, len: n });
    }
    let n_val = ((n as f64 * val_fraction).floor() as usize).clamp(1, n - 1);
    let cut = n - n_val;
    let train = Subset::new(Arc::clone(&dataset), (0..cut).collect(), "train");
    let val = Subset::new(dataset, (cut..n).collect(), "val");
    Ok((train, val))
}

// ---------------------------------------------------------------------------
// NpyVolumeDataset
// ---------------------------------------------------------------------------

/// Which stage directory to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// `train/`
    Train,
    /// `validation/`
    Validation,
}

impl Stage {
    /// Directory name of the stage.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Train => "train",
            Stage::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone)]
struct NpyCase {
    case_id: String,
    image_path: PathBuf,
    label_path: PathBuf,
}

/// Dataset of `.npy` volumes for one modality and stage.
///
/// Scanning is performed once at construction via
/// [`NpyVolumeDataset::discover`]. Volumes are loaded lazily on each
/// [`VolumeDataset::get`] call. When a `mask_mapping` is supplied, labels are
/// relabelled through it on load (annotation-masked training).
pub struct NpyVolumeDataset {
    cases: Vec<NpyCase>,
    modality: Modality,
    mask_mapping: Option<BackgroundMap>,
    name: String,
}

impl NpyVolumeDataset {
    /// Scan `<root>/<modality>/<stage>/` for case directories containing
    /// `image.npy` and `label.npy`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::DirectoryNotFound`] if the stage directory
    /// does not exist, or [`DatasetError::Io`] for any filesystem access
    /// failure.
    pub fn discover(
        root: &Path,
        modality: Modality,
        stage: Stage,
        mask_mapping: Option<BackgroundMap>,
    ) -> Result<Self, DatasetError> {
        let stage_dir = root.join(modality.as_str()).join(stage.dir_name());
        if !stage_dir.is_dir() {
            return Err(DatasetError::DirectoryNotFound { path: stage_dir.display().to_string() });
        }

        let mut case_dirs: Vec<PathBuf> = std::fs::read_dir(&stage_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        case_dirs.sort();

        let mut cases = Vec::with_capacity(case_dirs.len());
        for dir in case_dirs {
            let image_path = dir.join("image.npy");
            let label_path = dir.join("label.npy");
            if !image_path.exists() || !label_path.exists() {
                debug!("Skipping {}: missing image.npy or label.npy", dir.display());
                continue;
            }
            let case_id = dir.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
            cases.push(NpyCase { case_id, image_path, label_path });
        }

        info!(
            "NpyVolumeDataset: {} {} cases under {}",
            cases.len(),
            modality,
            stage_dir.display()
        );

        Ok(NpyVolumeDataset {
            cases,
            modality,
            mask_mapping,
            name: format!("{}/{}", modality, stage.dir_name()),
        })
    }
}

impl VolumeDataset for NpyVolumeDataset {
    fn len(&self) -> usize {
        self.cases.len()
    }

    fn get(&self, idx: usize) -> Result<VolumeSample, DatasetError> {
        let case = self
            .cases
            .get(idx)
            .ok_or(DatasetError::IndexOutOfBounds { idx, len: self.cases.len() })?;
        let image = load_image(&case.image_path)?;
        let mut label = load_label(&case.label_path)?;
        if let Some(map) = &self.mask_mapping {
            map.apply_to_label(label.view_mut().into_dyn());
        }
        VolumeSample::new(image, label, self.modality, case.case_id.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// NPY helpers
// ---------------------------------------------------------------------------

/// Promote a `[D, H, W]` array to `[1, D, H, W]`; pass 4-D through.
fn to_channel_first<T>(arr: ArrayD<T>, path: &Path) -> Result<Array4<T>, DatasetError> {
    let arr = match arr.ndim() {
        3 => arr.insert_axis(Axis(0)),
        4 => arr,
        n => {
            return Err(DatasetError::invalid_format(
                path,
                format!("expected a 3-D or 4-D array, got {n}-D"),
            ))
        }
    };
    arr.into_dimensionality::<Ix4>()
        .map_err(|e| DatasetError::invalid_format(path, e.to_string()))
}

fn read_npy<T: ndarray_npy::ReadableElement>(path: &Path) -> Result<ArrayD<T>, DatasetError> {
    use ndarray_npy::ReadNpyExt;
    let file = std::fs::File::open(path)?;
    ArrayD::<T>::read_npy(file).map_err(|e| DatasetError::npy_read(path, e.to_string()))
}

/// Load a float32 image volume.
fn load_image(path: &Path) -> Result<Array4<f32>, DatasetError> {
    let arr = match read_npy::<f32>(path) {
        Ok(a) => a,
        Err(_) => read_npy::<f64>(path)?.mapv(|v| v as f32),
    };
    to_channel_first(arr, path)
}

/// Load an integer label volume stored as i64, i32, u8 or float.
fn load_label(path: &Path) -> Result<Array4<i64>, DatasetError> {
    let arr = read_npy::<i64>(path)
        .or_else(|_| read_npy::<i32>(path).map(|a| a.mapv(i64::from)))
        .or_else(|_| read_npy::<u8>(path).map(|a| a.mapv(i64::from)))
        .or_else(|_| read_npy::<f32>(path).map(|a| a.mapv(|v| v.round() as i64)))?;
    let label = to_channel_first(arr, path)?;
    if label.shape()[0] != 1 {
        return Err(DatasetError::invalid_format(
            path,
            format!("label must have one channel, got {}", label.shape()[0]),
        ));
    }
    Ok(label)
}

// ---------------------------------------------------------------------------
// SyntheticVolumeDataset
// ---------------------------------------------------------------------------

/// Configuration for [`SyntheticVolumeDataset`].
///
/// Phantoms are a pure function of these values and the case index.
#[derive(Debug, Clone)]
pub struct SyntheticVolumeConfig {
    /// Spatial size `[D, H, W]`. Default: **[32, 32, 32]**.
    pub spatial: [usize; 3],
    /// Number of classes including background. Default: **16**.
    pub num_classes: usize,
    /// Image channels. Default: **1**.
    pub in_channels: usize,
    /// Modality the phantoms imitate.
    pub modality: Modality,
    /// Optional label relabelling applied on load.
    pub mask_mapping: Option<BackgroundMap>,
}

impl SyntheticVolumeConfig {
    /// Default configuration for `modality`.
    pub fn new(modality: Modality) -> Self {
        SyntheticVolumeConfig {
            spatial: [32, 32, 32],
            num_classes: 16,
            in_channels: 1,
            modality,
            mask_mapping: None,
        }
    }
}

/// Fully-deterministic phantom dataset.
///
/// Every case at index `idx` is computed analytically from `idx` alone.
///
/// ## Label model
///
/// With `r` the normalised distance of a voxel from a centre that drifts
/// with `idx`, voxels with `r >= 0.9` are background and the rest fall into
/// `num_classes - 1` equal-width shells, innermost shell = highest class.
///
/// ## Intensity model
///
/// ```text
/// I = base + 0.25 × class / (num_classes − 1) + 0.05 × sin(idx + d + h + w)
/// base = +0.75 for CT, −0.75 for MR
/// ```
///
/// so CT and MR form two well-separated intensity clusters.
pub struct SyntheticVolumeDataset {
    num_cases: usize,
    config: SyntheticVolumeConfig,
    name: String,
}

impl SyntheticVolumeDataset {
    /// Create a dataset with `num_cases` phantoms.
    pub fn new(num_cases: usize, config: SyntheticVolumeConfig) -> Self {
        let name = format!("synthetic/{}", config.modality);
        SyntheticVolumeDataset { num_cases, config, name }
    }

    fn label_value(&self, idx: usize, d: usize, h: usize, w: usize) -> i64 {
        let [sd, sh, sw] = self.config.spatial;
        let shift = (idx % 3) as f32 - 1.0;
        let centre = |n: usize| (n as f32 - 1.0) / 2.0 + shift * 0.1 * n as f32;
        let norm = |x: usize, n: usize| (x as f32 - centre(n)) / (n as f32 / 2.0).max(1.0);
        let r = (norm(d, sd).powi(2) + norm(h, sh).powi(2) + norm(w, sw).powi(2)).sqrt();
        if r >= 0.9 {
            return 0;
        }
        let n_fg = (self.config.num_classes - 1).max(1);
        let shell = ((r / 0.9) * n_fg as f32).floor() as usize;
        (n_fg - shell.min(n_fg - 1)) as i64
    }
}

impl VolumeDataset for SyntheticVolumeDataset {
    fn len(&self) -> usize {
        self.num_cases
    }

    fn get(&self, idx: usize) -> Result<VolumeSample, DatasetError> {
        if idx >= self.num_cases {
            return Err(DatasetError::IndexOutOfBounds { idx, len: self.num_cases });
        }
        let [d, h, w] = self.config.spatial;
        let base = match self.config.modality {
            Modality::Ct => 0.75_f32,
            Modality::Mr => -0.75_f32,
        };
        let denom = (self.config.num_classes.max(2) - 1) as f32;

        let label_full =
            Array4::from_shape_fn((1, d, h, w), |(_, z, y, x)| self.label_value(idx, z, y, x));
        let image = Array4::from_shape_fn((self.config.in_channels, d, h, w), |(c, z, y, x)| {
            let class = label_full[[0, z, y, x]] as f32;
            let texture = ((idx + c + z + y + x) as f32).sin();
            base + 0.25 * class / denom + 0.05 * texture
        });

        let mut label = label_full;
        if let Some(map) = &self.config.mask_mapping {
            map.apply_to_label(label.view_mut().into_dyn());
        }
        VolumeSample::new(image, label, self.config.modality, format!("synthetic_{idx:04}"))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(modality: Modality) -> SyntheticVolumeConfig {
        SyntheticVolumeConfig { spatial: [6, 6, 6], num_classes: 4, ..SyntheticVolumeConfig::new(modality) }
    }

    #[test]
    fn synthetic_sample_shapes() {
        let ds = SyntheticVolumeDataset::new(3, tiny(Modality::Ct));
        let s = ds.get(0).unwrap();
        assert_eq!(s.image.shape(), &[1, 6, 6, 6]);
        assert_eq!(s.label.shape(), &[1, 6, 6, 6]);
        assert_eq!(s.modality, Modality::Ct);
    }

    #[test]
    fn synthetic_labels_in_range_and_nontrivial() {
        let ds = SyntheticVolumeDataset::new(3, tiny(Modality::Mr));
        let s = ds.get(1).unwrap();
        assert!(s.label.iter().all(|&v| (0..4).contains(&v)));
        assert!(s.label.iter().any(|&v| v == 0));
        assert!(s.label.iter().any(|&v| v > 0));
    }

    #[test]
    fn synthetic_modalities_are_separated() {
        let ct = SyntheticVolumeDataset::new(1, tiny(Modality::Ct)).get(0).unwrap();
        let mr = SyntheticVolumeDataset::new(1, tiny(Modality::Mr)).get(0).unwrap();
        let ct_min = ct.image.iter().cloned().fold(f32::INFINITY, f32::min);
        let mr_max = mr.image.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        assert!(ct_min > mr_max);
    }

    #[test]
    fn synthetic_out_of_bounds() {
        let ds = SyntheticVolumeDataset::new(2, tiny(Modality::Ct));
        assert!(matches!(ds.get(2), Err(DatasetError::IndexOutOfBounds { idx: 2, len: 2 })));
    }

    #[test]
    fn collate_rejects_mixed_shapes() {
        let a = SyntheticVolumeDataset::new(1, tiny(Modality::Ct)).get(0).unwrap();
        let mut cfg = tiny(Modality::Ct);
        cfg.spatial = [4, 4, 4];
        let b = SyntheticVolumeDataset::new(1, cfg).get(0).unwrap();
        assert!(collate(vec![a, b]).is_err());
        assert!(collate(vec![]).is_err());
    }

    #[test]
    fn xorshift_shuffle_is_permutation() {
        let mut indices: Vec<usize> = (0..20).collect();
        xorshift_shuffle(&mut indices, 42);
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn split_tail_holds_out_the_end() {
        let ds: Arc<dyn VolumeDataset> = Arc::new(SyntheticVolumeDataset::new(20, tiny(Modality::Ct)));
        let (train, val) = split_tail(ds, 0.1).unwrap();
        assert_eq!(train.len(), 18);
        assert_eq!(val.len(), 2);
        assert_eq!(val.get(0).unwrap().case_id, "synthetic_0018");
    }

    #[test]
    fn split_tail_keeps_one_validation_case() {
        let ds: Arc<dyn VolumeDataset> = Arc::new(SyntheticVolumeDataset::new(5, tiny(Modality::Ct)));
        let (train, val) = split_tail(ds, 0.1).unwrap();
        assert_eq!((train.len(), val.len()), (4, 1));
    }
}
