//! # Cross-modality volumetric segmentation training
//!
//! This crate trains CT/MR segmentation networks on partially labelled data,
//! either with a plain segmentation objective or with domain-adversarial
//! (DANN) training that pushes a shared feature extractor towards
//! modality-invariant features. It includes configuration management,
//! `.npy` and synthetic volume datasets, partial-label masking, Dice
//! validation, logging and the iteration-based training loop.
//!
//! ## Architecture
//!
//! ```text
//! TrainingConfig ──► run ──► Trainer ──► Updater ──► Module
//!       │                     │  │       (Segmentation | Dann)
//!       │                     │  │                      │
//!       │          BatchSource  Validator ◄─────────────┘
//!       │      (CyclicLoader | PairedLoaders)    │
//!       │                     │          partial::mask_partial_labels
//!       │           VolumeDataset                │
//!       │  (NpyVolumeDataset | SyntheticVolumeDataset)
//!       │                                   metrics::DiceMetric
//!       └──► TrainLogger (train.log + TensorBoard)
//! ```
//!
//! The host-side pieces (datasets, masking, metrics, validation, the loop)
//! always compile. Networks, losses, the two concrete modules and the
//! training binary need libtorch and live behind the `tch-backend` feature.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use medseg_dann::config::TrainingConfig;
//! use medseg_dann::dataset::{SyntheticVolumeConfig, SyntheticVolumeDataset, VolumeDataset};
//! use medseg_dann::modality::Modality;
//!
//! let config = TrainingConfig::default();
//! config.validate().expect("config is valid");
//!
//! let dataset = SyntheticVolumeDataset::new(8, SyntheticVolumeConfig::new(Modality::Ct));
//! let sample = dataset.get(0).unwrap();
//! println!("image shape: {:?}", sample.image.shape());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod inference;
pub mod logger;
pub mod metrics;
pub mod modality;
pub mod module;
pub mod partial;
pub mod trainer;
pub mod updater;
pub mod validation;

#[cfg(feature = "tch-backend")]
pub mod dann;
#[cfg(feature = "tch-backend")]
pub mod losses;
#[cfg(feature = "tch-backend")]
pub mod networks;
#[cfg(feature = "tch-backend")]
pub mod run;
#[cfg(feature = "tch-backend")]
pub mod segmentation;

// Convenient re-exports at the crate root.
pub use config::{ModalitySelection, ModuleKind, TrainingConfig};
pub use dataset::{
    DataLoader, NpyVolumeDataset, SyntheticVolumeConfig, SyntheticVolumeDataset, VolumeBatch, VolumeDataset,
    VolumeSample,
};
pub use domain::{grl_lambda, GradientReversalLayer};
pub use error::{ConfigError, DatasetError, TrainError, TrainResult};
pub use metrics::{BestMetric, DiceMetric, ValidationReport};
pub use modality::Modality;
pub use partial::{mask_partial_labels, BackgroundMap, ClassPartition};
pub use trainer::{BatchSource, TrainSummary, Trainer};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
