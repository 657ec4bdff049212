//! Training configuration for cross-modality segmentation.
//!
//! [`TrainingConfig`] is the single source of truth for run selectors
//! (mode, module, modality, loss, optimiser), hyper-parameters, the
//! sliding-window inference settings and infrastructure settings. It is
//! serializable via [`serde`] so it can be stored to / restored from JSON;
//! every run writes it to `args.json` inside its run directory.
//!
//! # Example
//!
//! ```rust
//! use medseg_dann::config::{ModuleKind, ModalitySelection, TrainingConfig};
//!
//! let mut cfg = TrainingConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! cfg.module = ModuleKind::Dann;
//! assert!(cfg.validate().is_err(), "DANN needs both modalities");
//!
//! cfg.modality = ModalitySelection::CtMr;
//! cfg.validate().expect("DANN on ct+mr is valid");
//! ```

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;
use crate::modality::Modality;

/// File name of the serialized run configuration inside a run directory.
pub const ARGS_FILE: &str = "args.json";

// ---------------------------------------------------------------------------
// Selectors
// ---------------------------------------------------------------------------

/// Whether the run trains a model or only evaluates a pretrained one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Train, then evaluate on the test streams if present.
    Train,
    /// Load `pretrained` and evaluate only.
    Test,
}

/// Which module/updater pair drives training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// Plain supervised segmentation.
    Segmentation,
    /// Domain-adversarial training over paired CT/MR streams.
    Dann,
}

/// Modalities that take part in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModalitySelection {
    /// CT only.
    #[serde(rename = "ct")]
    Ct,
    /// MR only.
    #[serde(rename = "mr")]
    Mr,
    /// Both modalities.
    #[serde(rename = "ct+mr")]
    CtMr,
}

impl ModalitySelection {
    /// Modalities covered by this selection, CT first.
    pub fn modalities(self) -> Vec<Modality> {
        match self {
            ModalitySelection::Ct => vec![Modality::Ct],
            ModalitySelection::Mr => vec![Modality::Mr],
            ModalitySelection::CtMr => vec![Modality::Ct, Modality::Mr],
        }
    }

    /// `true` for `ct+mr`.
    pub fn is_dual(self) -> bool {
        matches!(self, ModalitySelection::CtMr)
    }

    /// The single modality, if exactly one is selected.
    pub fn single(self) -> Option<Modality> {
        match self {
            ModalitySelection::Ct => Some(Modality::Ct),
            ModalitySelection::Mr => Some(Modality::Mr),
            ModalitySelection::CtMr => None,
        }
    }
}

/// Segmentation loss selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    /// Dice + cross-entropy over all classes.
    #[serde(rename = "dice2", alias = "dicece")]
    DiceCe,
    /// Dice + cross-entropy restricted to the modality's annotated classes.
    #[serde(rename = "tal")]
    TargetAdaptive,
}

/// Optimiser selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// Adam.
    Adam,
    /// Adam with decoupled weight decay.
    AdamW,
    /// Stochastic gradient descent.
    #[serde(rename = "SGD", alias = "Sgd")]
    Sgd,
}

/// How training/validation/test splits are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainData {
    /// Train on the full training stage, validate on the validation stage.
    All,
    /// Hold out the tail of the training stage for validation and use the
    /// validation stage as an unmasked test set.
    Split,
}

/// Where volumes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSource {
    /// `.npy` volumes laid out as `<root>/<modality>/<stage>/<case>/`.
    Directory {
        /// Dataset root.
        root: PathBuf,
    },
    /// Deterministic synthetic phantoms, for smoke tests.
    Synthetic {
        /// Cases per modality and stage.
        cases: usize,
        /// Spatial size `[D, H, W]` of each phantom.
        spatial: [usize; 3],
    },
}

// ---------------------------------------------------------------------------
// TrainingConfig
// ---------------------------------------------------------------------------

/// Complete configuration for a training or evaluation run.
///
/// Defaults reproduce the AMOS CT/MR setup. JSON files may list only the
/// keys they change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // -----------------------------------------------------------------------
    // Run selectors
    // -----------------------------------------------------------------------
    /// Train or test. Default: **train**.
    pub mode: RunMode,

    /// Module/updater pair. Default: **segmentation**.
    pub module: ModuleKind,

    /// Modalities taking part. Default: **ct**.
    pub modality: ModalitySelection,

    /// Train on annotation-masked labels (partial-label mode). Default: **false**.
    pub masked: bool,

    /// Split policy. Default: **all**.
    pub train_data: TrainData,

    /// Volume source. Default: directory `data`.
    pub data: DataSource,

    // -----------------------------------------------------------------------
    // Model
    // -----------------------------------------------------------------------
    /// Number of output classes including background. Default: **16** (AMOS).
    pub num_classes: usize,

    /// Number of image channels. Default: **1**.
    pub in_channels: usize,

    /// Channels of the first encoder stage. Default: **16**.
    pub base_channels: usize,

    /// Number of down-sampling stages in the backbone. Default: **3**.
    pub depth: usize,

    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    /// Segmentation loss. Default: **dice2**.
    pub loss: LossKind,

    /// Optimiser. Default: **AdamW**.
    pub optimizer: OptimizerKind,

    /// Learning rate. Default: **1e-4**.
    pub learning_rate: f64,

    /// Total number of optimisation steps. Default: **40000**.
    pub max_iter: usize,

    /// Validate every N steps (and always on the last step). Default: **500**.
    pub eval_step: usize,

    /// Volumes per batch. Default: **1**.
    pub batch_size: usize,

    // -----------------------------------------------------------------------
    // Sliding-window inference
    // -----------------------------------------------------------------------
    /// Window size `[D, H, W]`. Default: **[96, 96, 96]**.
    pub roi_size: [usize; 3],

    /// Windows forwarded per network call. Default: **2**.
    pub sw_batch_size: usize,

    /// Fractional overlap between neighbouring windows. Default: **0.25**.
    pub sw_overlap: f64,

    // -----------------------------------------------------------------------
    // Data split / checkpointing
    // -----------------------------------------------------------------------
    /// Fraction of the training stage held out when `train_data = split`.
    /// Default: **0.1**.
    pub val_fraction: f64,

    /// Directory under which timestamped run directories are created.
    pub checkpoint_dir: PathBuf,

    /// Checkpoint directory to load before training/testing.
    pub pretrained: Option<PathBuf>,

    // -----------------------------------------------------------------------
    // Device / reproducibility
    // -----------------------------------------------------------------------
    /// Use a CUDA GPU when available. Default: **false**.
    pub use_gpu: bool,

    /// CUDA ordinal, read only with `use_gpu`. Default: **0**.
    pub gpu_device_id: i64,

    /// Seed for parameter initialisation and data shuffling. Default: **42**.
    pub seed: u64,

    /// Request deterministic kernels. Default: **false**.
    pub deterministic: bool,

    /// Development mode: tiny budget, `debug` output, truncated datasets.
    pub dev: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            mode: RunMode::Train,
            module: ModuleKind::Segmentation,
            modality: ModalitySelection::Ct,
            masked: false,
            train_data: TrainData::All,
            data: DataSource::Directory { root: PathBuf::from("data") },
            num_classes: 16,
            in_channels: 1,
            base_channels: 16,
            depth: 3,
            loss: LossKind::DiceCe,
            optimizer: OptimizerKind::AdamW,
            learning_rate: 1e-4,
            max_iter: 40_000,
            eval_step: 500,
            batch_size: 1,
            roi_size: [96, 96, 96],
            sw_batch_size: 2,
            sw_overlap: 0.25,
            val_fraction: 0.1,
            checkpoint_dir: PathBuf::from("checkpoints"),
            pretrained: None,
            use_gpu: false,
            gpu_device_id: 0,
            seed: 42,
            deterministic: false,
            dev: false,
        }
    }
}

impl TrainingConfig {
    /// Read and validate a JSON config.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened,
    /// [`ConfigError::ParseError`] if the JSON is malformed, and any
    /// validation error otherwise.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: TrainingConfig = serde_json::from_str(&contents).map_err(|source| {
            ConfigError::ParseError { path: path.to_path_buf(), source }
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write pretty JSON to `path` (this is how `args.json` is produced).
    /// Missing parent directories are created.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Write `args.json` into `run_dir`.
    pub fn write_args(&self, run_dir: &Path) -> Result<PathBuf, ConfigError> {
        let path = run_dir.join(ARGS_FILE);
        self.to_json(&path)?;
        Ok(path)
    }

    /// Timestamped run directory `<checkpoint_dir>/<YYYYmmdd-HHMMSS>`.
    pub fn run_dir<Tz: TimeZone>(&self, started: &DateTime<Tz>) -> PathBuf
    where
        Tz::Offset: fmt::Display,
    {
        self.checkpoint_dir.join(started.format("%Y%m%d-%H%M%S").to_string())
    }

    /// Shrink the run for development: 10 steps, validation every 3 steps,
    /// output under `debug`.
    pub fn apply_dev_mode(&mut self) {
        if !self.dev {
            return;
        }
        self.max_iter = 10;
        self.eval_step = 3;
        self.checkpoint_dir = PathBuf::from("debug");
    }

    /// Maximum number of cases per dataset, set in development mode.
    pub fn case_limit(&self) -> Option<usize> {
        self.dev.then_some(4)
    }

    /// Whether training loaders shuffle.
    pub fn shuffle(&self) -> bool {
        !self.dev
    }

    /// Resolve the compute device.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] when `use_gpu` is set and CUDA device
    /// `gpu_device_id` does not exist. There is no CPU fallback.
    #[cfg(feature = "tch-backend")]
    pub fn device(&self) -> Result<tch::Device, ConfigError> {
        if !self.use_gpu {
            return Ok(tch::Device::Cpu);
        }
        let available = tch::Cuda::device_count();
        if self.gpu_device_id >= available {
            return Err(ConfigError::invalid_value(
                "gpu_device_id",
                format!("CUDA device {} requested but {available} device(s) are available", self.gpu_device_id),
            ));
        }
        Ok(tch::Device::Cuda(self.gpu_device_id as usize))
    }

    /// First problem found, if any.
    ///
    /// # Checks
    ///
    /// - Sizes (`num_classes >= 2`, channels, depth, batch sizes, ROI) are
    ///   non-zero.
    /// - `learning_rate > 0`, `max_iter > 0`, `eval_step > 0`.
    /// - `sw_overlap` in `[0, 1)` and `val_fraction` in `(0, 1)`.
    /// - `module = dann` requires `modality = ct+mr`.
    /// - Segmentation with `loss = tal` on `ct+mr` requires `masked`.
    /// - Partial-label settings need at least one foreground class per
    ///   modality (`num_classes >= 3`).
    /// - `mode = test` requires `pretrained`.
    /// - `gpu_device_id >= 0`. Whether the device exists is checked by
    ///   [`TrainingConfig::device`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_classes < 2 {
            return Err(ConfigError::invalid_value("num_classes", "must be >= 2"));
        }
        if self.in_channels == 0 {
            return Err(ConfigError::invalid_value("in_channels", "must be > 0"));
        }
        if self.base_channels == 0 {
            return Err(ConfigError::invalid_value("base_channels", "must be > 0"));
        }
        if self.depth == 0 {
            return Err(ConfigError::invalid_value("depth", "must be > 0"));
        }

        // Optimisation
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return Err(ConfigError::invalid_value("learning_rate", "must be > 0.0"));
        }
        if self.max_iter == 0 {
            return Err(ConfigError::invalid_value("max_iter", "must be > 0"));
        }
        if self.eval_step == 0 {
            return Err(ConfigError::invalid_value("eval_step", "must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be > 0"));
        }

        // Sliding window
        if self.roi_size.iter().any(|&r| r == 0) {
            return Err(ConfigError::invalid_value("roi_size", "all dimensions must be > 0"));
        }
        if self.sw_batch_size == 0 {
            return Err(ConfigError::invalid_value("sw_batch_size", "must be > 0"));
        }
        if !(0.0..1.0).contains(&self.sw_overlap) {
            return Err(ConfigError::invalid_value("sw_overlap", "must be in [0.0, 1.0)"));
        }

        // Data
        if !(self.val_fraction > 0.0 && self.val_fraction < 1.0) {
            return Err(ConfigError::invalid_value("val_fraction", "must be in (0.0, 1.0)"));
        }
        if let DataSource::Synthetic { cases, spatial } = &self.data {
            if *cases == 0 {
                return Err(ConfigError::invalid_value("data.cases", "must be > 0"));
            }
            if spatial.iter().any(|&s| s == 0) {
                return Err(ConfigError::invalid_value(
                    "data.spatial",
                    "all dimensions must be > 0",
                ));
            }
        }

        // Selector combinations
        if self.module == ModuleKind::Dann && !self.modality.is_dual() {
            return Err(ConfigError::unsupported(format!(
                "module `dann` needs modality `ct+mr`, got `{}`",
                self.modality
            )));
        }
        if self.module == ModuleKind::Segmentation
            && self.loss == LossKind::TargetAdaptive
            && self.modality.is_dual()
            && !self.masked
        {
            return Err(ConfigError::unsupported(
                "loss `tal` on `ct+mr` segmentation requires masked labels",
            ));
        }
        if (self.masked || self.loss == LossKind::TargetAdaptive) && self.num_classes < 3 {
            return Err(ConfigError::invalid_value(
                "num_classes",
                "partial-label training needs at least one foreground class per modality",
            ));
        }
        if self.gpu_device_id < 0 {
            return Err(ConfigError::invalid_value("gpu_device_id", "must be >= 0"));
        }
        if self.mode == RunMode::Test && self.pretrained.is_none() {
            return Err(ConfigError::invalid_value("pretrained", "required when mode is `test`"));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// String forms (CLI parsing / logging)
// ---------------------------------------------------------------------------

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(RunMode::Train),
            "test" => Ok(RunMode::Test),
            other => Err(ConfigError::invalid_value("mode", format!("`{other}` (expected train / test)"))),
        }
    }
}

impl FromStr for ModuleKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "segmentation" => Ok(ModuleKind::Segmentation),
            "dann" => Ok(ModuleKind::Dann),
            other => Err(ConfigError::invalid_value(
                "module",
                format!("`{other}` (expected segmentation / dann)"),
            )),
        }
    }
}

impl FromStr for ModalitySelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ct" => Ok(ModalitySelection::Ct),
            "mr" => Ok(ModalitySelection::Mr),
            "ct+mr" => Ok(ModalitySelection::CtMr),
            other => Err(ConfigError::invalid_value(
                "modality",
                format!("`{other}` (expected ct / mr / ct+mr)"),
            )),
        }
    }
}

impl fmt::Display for ModalitySelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModalitySelection::Ct => "ct",
            ModalitySelection::Mr => "mr",
            ModalitySelection::CtMr => "ct+mr",
        })
    }
}

impl FromStr for LossKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dice2" | "dicece" => Ok(LossKind::DiceCe),
            "tal" => Ok(LossKind::TargetAdaptive),
            other => Err(ConfigError::invalid_value("loss", format!("`{other}` (expected dice2 / tal)"))),
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LossKind::DiceCe => "DiceCELoss",
            LossKind::TargetAdaptive => "TargetAdaptiveLoss",
        })
    }
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "adamw" => Ok(OptimizerKind::AdamW),
            "sgd" => Ok(OptimizerKind::Sgd),
            other => Err(ConfigError::invalid_value(
                "optimizer",
                format!("`{other}` (expected Adam / AdamW / SGD)"),
            )),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OptimizerKind::Adam => "Adam",
            OptimizerKind::AdamW => "AdamW",
            OptimizerKind::Sgd => "SGD",
        })
    }
}

impl FromStr for TrainData {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(TrainData::All),
            "split" => Ok(TrainData::Split),
            other => Err(ConfigError::invalid_value(
                "train_data",
                format!("`{other}` (expected all / split)"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        TrainingConfig::default().validate().expect("default config should be valid");
    }

    #[test]
    fn json_round_trip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.json");

        let mut original = TrainingConfig::default();
        original.modality = ModalitySelection::CtMr;
        original.module = ModuleKind::Dann;
        original.data = DataSource::Synthetic { cases: 3, spatial: [8, 8, 8] };
        original.to_json(&path).expect("serialization should succeed");

        let loaded = TrainingConfig::from_json(&path).expect("deserialization should succeed");
        assert_eq!(loaded.modality, ModalitySelection::CtMr);
        assert_eq!(loaded.module, ModuleKind::Dann);
        assert_eq!(loaded.data, original.data);
        assert_eq!(loaded.roi_size, original.roi_size);
        assert_eq!(loaded.seed, original.seed);
    }

    #[test]
    fn modality_serializes_with_plus() {
        let json = serde_json::to_string(&ModalitySelection::CtMr).unwrap();
        assert_eq!(json, "\"ct+mr\"");
        let loss = serde_json::to_string(&LossKind::DiceCe).unwrap();
        assert_eq!(loss, "\"dice2\"");
    }

    #[test]
    fn dev_mode_shrinks_budget() {
        let mut cfg = TrainingConfig { dev: true, ..TrainingConfig::default() };
        cfg.apply_dev_mode();
        assert_eq!(cfg.max_iter, 10);
        assert_eq!(cfg.eval_step, 3);
        assert_eq!(cfg.checkpoint_dir, PathBuf::from("debug"));
        assert_eq!(cfg.case_limit(), Some(4));
        assert!(!cfg.shuffle());
    }

    #[test]
    fn dev_mode_is_noop_when_disabled() {
        let mut cfg = TrainingConfig::default();
        cfg.apply_dev_mode();
        assert_eq!(cfg.max_iter, 40_000);
        assert_eq!(cfg.case_limit(), None);
    }

    #[test]
    fn run_dir_is_timestamped() {
        let cfg = TrainingConfig::default();
        let t = chrono::Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(cfg.run_dir(&t), PathBuf::from("checkpoints/20240305-070809"));
    }

    #[test]
    fn unknown_selector_is_rejected() {
        assert!("sgd".parse::<OptimizerKind>().is_ok());
        assert!("rmsprop".parse::<OptimizerKind>().is_err());
        assert!("ct+mr".parse::<ModalitySelection>().is_ok());
        assert!("pet".parse::<ModalitySelection>().is_err());
        assert!("resume".parse::<RunMode>().is_err());
        assert!("half".parse::<TrainData>().is_err());
    }
}
