//! Errors raised while configuring, loading data for, training and
//! evaluating segmentation modules.
//!
//! Every fallible function in the crate returns one of the three enums
//! defined here:
//!
//! ```text
//! TrainError
//! ├── ConfigError   selectors, config files, unsupported combinations
//! ├── DatasetError  volume discovery, .npy reads, collation
//! └── TchError      libtorch (tch-backend only)
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Result alias for training, validation and orchestration code.
pub type TrainResult<T> = Result<T, TrainError>;

// ---------------------------------------------------------------------------
// TrainError
// ---------------------------------------------------------------------------

/// Failure of a training run.
///
/// [`ConfigError`] and [`DatasetError`] convert into this with `?`.
#[derive(Debug, Error)]
pub enum TrainError {
    /// See [`ConfigError`].
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// See [`DatasetError`].
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// Writing `args.json` or a report failed to serialise.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run directory, `train.log` or event-file I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// libtorch rejected an operation.
    #[cfg(feature = "tch-backend")]
    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    /// A loader or stream has no cases to draw from.
    #[error("Dataset is empty")]
    EmptyDataset,

    /// Logits, labels or weights disagree on shape.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Shape the receiving side requires.
        expected: Vec<usize>,
        /// Shape it was given.
        actual: Vec<usize>,
    },

    /// An input tensor is not on the module's device.
    #[error("Device mismatch: module is on {expected}, tensor is on {actual}")]
    DeviceMismatch {
        /// Module device, e.g. `Cpu` or `Cuda(0)`.
        expected: String,
        /// Device of the rejected tensor.
        actual: String,
    },

    /// The module handed to an updater lacks parts the updater needs.
    ///
    /// `missing` lists component names in the order the updater checks them.
    #[error("{updater} requires missing module components: {missing:?}")]
    MissingComponents {
        /// Updater that ran the check.
        updater: &'static str,
        /// Absent components.
        missing: Vec<&'static str>,
    },

    /// A step produced no usable loss.
    #[error("Training step failed: {0}")]
    TrainingStep(String),

    /// Saving or restoring module state failed.
    #[error("Checkpoint error: {message} (path: {path:?})")]
    Checkpoint {
        /// What went wrong.
        message: String,
        /// Checkpoint directory or file.
        path: PathBuf,
    },
}

impl TrainError {
    /// [`TrainError::TrainingStep`] from any message.
    pub fn training_step<S: Into<String>>(msg: S) -> Self {
        TrainError::TrainingStep(msg.into())
    }

    /// [`TrainError::Checkpoint`] for `path`.
    pub fn checkpoint<S: Into<String>>(msg: S, path: impl Into<PathBuf>) -> Self {
        TrainError::Checkpoint { message: msg.into(), path: path.into() }
    }

    /// [`TrainError::ShapeMismatch`].
    pub fn shape_mismatch(expected: Vec<usize>, actual: Vec<usize>) -> Self {
        TrainError::ShapeMismatch { expected, actual }
    }

    /// [`TrainError::MissingComponents`] reported by `updater`.
    pub fn missing_components(updater: &'static str, missing: Vec<&'static str>) -> Self {
        TrainError::MissingComponents { updater, missing }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// A [`TrainingConfig`] that cannot be read or does not describe a runnable
/// experiment.
///
/// [`TrainingConfig`]: crate::config::TrainingConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One field is out of range on its own.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Config key, as spelled in JSON.
        field: &'static str,
        /// Accepted range or form.
        reason: String,
    },

    /// Each selector is valid but the combination is not, e.g. a DANN run on
    /// a single modality.
    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    /// The config file could not be opened.
    #[error("Cannot read config file `{path}`: {source}")]
    FileRead {
        /// Config file path.
        path: PathBuf,
        /// OS error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not a valid `TrainingConfig` document.
    #[error("Cannot parse config file `{path}`: {source}")]
    ParseError {
        /// Config file path.
        path: PathBuf,
        /// serde_json diagnostic with line and column.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// [`ConfigError::InvalidValue`] for `field`.
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }

    /// [`ConfigError::Unsupported`].
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        ConfigError::Unsupported(msg.into())
    }
}

// ---------------------------------------------------------------------------
// DatasetError
// ---------------------------------------------------------------------------

/// Failure to discover, read or batch volume cases.
///
/// Never skipped: a case that fails to load fails its batch, and the batch
/// error propagates to the caller of the loader.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A volume file exists but has the wrong rank or dtype.
    #[error("Invalid data format in `{path}`: {message}")]
    InvalidFormat {
        /// Offending file.
        path: PathBuf,
        /// Found versus expected.
        message: String,
    },

    /// `ndarray-npy` could not decode a file.
    #[error("NumPy read error in `{path}`: {message}")]
    NpyReadError {
        /// Offending file.
        path: PathBuf,
        /// Decoder message.
        message: String,
    },

    /// Case index past the end of a dataset.
    #[error("Index {idx} out of bounds (dataset has {len} samples)")]
    IndexOutOfBounds {
        /// Requested case.
        idx: usize,
        /// Number of cases.
        len: usize,
    },

    /// Image and label of one case have different `D×H×W`.
    #[error("Case `{case_id}`: image spatial shape {image:?} != label spatial shape {label:?}")]
    SpatialMismatch {
        /// Case identifier.
        case_id: String,
        /// Image `D×H×W`.
        image: Vec<usize>,
        /// Label `D×H×W`.
        label: Vec<usize>,
    },

    /// Cases of one batch cannot be stacked along the batch axis.
    #[error("Cannot collate batch: {0}")]
    Collate(String),

    /// `<data_dir>/<modality>/<stage>` does not exist.
    #[error("Directory not found: {path}")]
    DirectoryNotFound {
        /// Missing directory.
        path: String,
    },

    /// Filesystem failure while listing or opening cases.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DatasetError {
    /// [`DatasetError::InvalidFormat`] for `path`.
    pub fn invalid_format<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DatasetError::InvalidFormat { path: path.into(), message: msg.into() }
    }

    /// [`DatasetError::NpyReadError`] for `path`.
    pub fn npy_read<S: Into<String>>(path: impl Into<PathBuf>, msg: S) -> Self {
        DatasetError::NpyReadError { path: path.into(), message: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_coerces_into_train_error() {
        let err: TrainError = ConfigError::invalid_value("lr", "must be > 0.0").into();
        assert!(matches!(err, TrainError::Config(ConfigError::InvalidValue { field: "lr", .. })));
        assert!(err.to_string().contains("lr"));
    }

    #[test]
    fn missing_components_lists_names() {
        let err = TrainError::missing_components("DannUpdater", vec!["dom_classifier", "adv_loss"]);
        let msg = err.to_string();
        assert!(msg.contains("DannUpdater"));
        assert!(msg.contains("dom_classifier"));
        assert!(msg.contains("adv_loss"));
    }
}
