//! The model-container interface shared by the plain segmentation module and
//! the domain-adversarial module.
//!
//! The trainer and the validator only need a small surface: whole-volume
//! inference on host arrays, checkpoint save/load and an info dump. Both
//! concrete modules (`SegmentationModule` and `DannModule`, `tch-backend`
//! only) implement [`SegmentationModel`]; their tensor-level `forward`,
//! `update` and `inference` stay inherent because they speak `tch::Tensor`.

use ndarray::Array5;
use std::fmt;
use std::path::Path;
use tracing::info;

use crate::error::TrainResult;
#[cfg(feature = "tch-backend")]
use crate::error::TrainError;
#[cfg(feature = "tch-backend")]
use tch::{Device, Kind, Tensor};

/// Host-side interface of a trainable segmentation module.
pub trait SegmentationModel {
    /// Number of output classes (logit channels).
    fn num_classes(&self) -> usize;

    /// Whole-volume inference without gradient tracking.
    ///
    /// Input `[N, C, D, H, W]`, output logits `[N, num_classes, D, H, W]`.
    fn predict(&self, image: &Array5<f32>) -> TrainResult<Array5<f32>>;

    /// Write the module's parameter files into `dir`, creating it if absent.
    fn save(&self, dir: &Path) -> TrainResult<()>;

    /// Restore parameters from `dir`.
    ///
    /// # Errors
    ///
    /// Fails if a required file is missing or a tensor shape does not match.
    fn load(&mut self, dir: &Path) -> TrainResult<()>;

    /// Description of the module's parts.
    fn info(&self) -> ModuleInfo;

    /// Log [`info`](Self::info) at `INFO` level.
    fn print_info(&self) {
        for line in self.info().to_string().lines() {
            info!("{line}");
        }
    }
}

/// Structured summary of a module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleInfo {
    /// Module kind, e.g. `SegmentationModule`.
    pub kind: &'static str,
    /// `(role, network name)` for every trained part.
    pub networks: Vec<(&'static str, String)>,
    /// Optimiser name.
    pub optimizer: String,
    /// Learning rate.
    pub learning_rate: f64,
    /// Loss description.
    pub criterion: String,
    /// Trainable parameter count.
    pub num_parameters: usize,
}

impl fmt::Display for ModuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Module: {}", self.kind)?;
        for (role, name) in &self.networks {
            writeln!(f, "  {role:<15}: {name}")?;
        }
        writeln!(f, "Optimizer: {} (lr = {})", self.optimizer, self.learning_rate)?;
        writeln!(f, "Criterion: {}", self.criterion)?;
        write!(f, "Trainable parameters: {}", self.num_parameters)
    }
}

// ---------------------------------------------------------------------------
// Host ↔ tensor conversion
// ---------------------------------------------------------------------------

/// Copy an image batch onto `device`.
#[cfg(feature = "tch-backend")]
pub fn image_to_tensor(image: &Array5<f32>, device: Device) -> Tensor {
    let shape: Vec<i64> = image.shape().iter().map(|&s| s as i64).collect();
    let data: Vec<f32> = image.iter().copied().collect();
    Tensor::from_slice(&data).reshape(shape).to_device(device)
}

/// Copy a label batch onto `device`.
#[cfg(feature = "tch-backend")]
pub fn label_to_tensor(label: &Array5<i64>, device: Device) -> Tensor {
    let shape: Vec<i64> = label.shape().iter().map(|&s| s as i64).collect();
    let data: Vec<i64> = label.iter().copied().collect();
    Tensor::from_slice(&data).reshape(shape).to_device(device)
}

/// Copy a `[N, C, D, H, W]` tensor back to the host as `f32`.
#[cfg(feature = "tch-backend")]
pub fn tensor_to_array(t: &Tensor) -> TrainResult<Array5<f32>> {
    let size: Vec<usize> = t.size().iter().map(|&s| s as usize).collect();
    if size.len() != 5 {
        return Err(TrainError::shape_mismatch(vec![0; 5], size));
    }
    let flat = t.to_device(Device::Cpu).to_kind(Kind::Float).contiguous().flatten(0, -1);
    let data = Vec::<f32>::try_from(&flat)?;
    Array5::from_shape_vec((size[0], size[1], size[2], size[3], size[4]), data)
        .map_err(|e| TrainError::training_step(format!("tensor to array: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_display_lists_parts() {
        let info = ModuleInfo {
            kind: "DannModule",
            networks: vec![("feat_extractor", "Encoder3d".into()), ("predictor", "Decoder3d".into())],
            optimizer: "AdamW".into(),
            learning_rate: 1e-4,
            criterion: "TargetAdaptiveLoss (ct, mr)".into(),
            num_parameters: 1234,
        };
        let text = info.to_string();
        assert!(text.starts_with("Module: DannModule"));
        assert!(text.contains("Encoder3d"));
        assert!(text.contains("AdamW (lr = 0.0001)"));
        assert!(text.ends_with("1234"));
    }
}
