//! 3-D encoder/decoder backbone and domain classifier using tch-rs.
//!
//! # Architecture
//!
//! ```text
//! image [N, C_in, D, H, W]
//!       │
//!       ▼
//! ┌──────────────────┐   skips: level 0 .. depth-1
//! │   Encoder3d      │ ───────────────────────────┐
//! │ (conv-conv,      │                            │
//! │  max-pool ×depth)│                            │
//! └──────────────────┘                            │
//!       │ bottleneck [N, base·2^depth, D/2^depth, …]
//!       ├───────────────────────┐                 │
//!       ▼                       ▼                 ▼
//! ┌──────────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ DomainClassifier │   │  Decoder3d  │◄──│ skip concat  │
//! └──────────────────┘   └─────────────┘   └──────────────┘
//!   [N, 1] logits           [N, num_classes, D, H, W]
//! ```
//!
//! Every layer is built once at construction and registered under a named
//! sub-path of the caller's `VarStore`, so each part can be saved to and
//! restored from its own file (see [`save_part`] / [`load_part`]).
//!
//! The blocks use convolution + ReLU without normalisation layers, so
//! training and evaluation forward passes are identical.

use std::path::Path;
use tch::nn::{self, Module};
use tch::{Kind, TchError, Tensor};

use crate::config::{OptimizerKind, TrainingConfig};
use crate::error::{TrainError, TrainResult};

// ---------------------------------------------------------------------------
// BackboneConfig
// ---------------------------------------------------------------------------

/// Shape of the encoder/decoder pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackboneConfig {
    /// Image channels. Default: **1**.
    pub in_channels: usize,
    /// Channels of the first level; doubled at every level. Default: **16**.
    pub base_channels: usize,
    /// Number of down-sampling steps. Default: **3**.
    pub depth: usize,
    /// Output classes including background. Default: **16**.
    pub num_classes: usize,
}

impl BackboneConfig {
    /// Take the backbone fields of a [`TrainingConfig`].
    pub fn from_training(cfg: &TrainingConfig) -> Self {
        BackboneConfig {
            in_channels: cfg.in_channels,
            base_channels: cfg.base_channels,
            depth: cfg.depth,
            num_classes: cfg.num_classes,
        }
    }

    /// Channels at encoder level `level`.
    pub fn channels(&self, level: usize) -> i64 {
        (self.base_channels << level) as i64
    }

    /// Spatial sizes must be a multiple of this.
    pub fn spatial_multiple(&self) -> i64 {
        1_i64 << self.depth
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        BackboneConfig { in_channels: 1, base_channels: 16, depth: 3, num_classes: 16 }
    }
}

// ---------------------------------------------------------------------------
// Building blocks
// ---------------------------------------------------------------------------

fn conv3(p: nn::Path, in_ch: i64, out_ch: i64) -> nn::Conv3D {
    nn::conv3d(p, in_ch, out_ch, 3, nn::ConvConfig { padding: 1, ..Default::default() })
}

/// Two 3×3×3 convolutions, each followed by ReLU.
#[derive(Debug)]
struct DoubleConv {
    conv1: nn::Conv3D,
    conv2: nn::Conv3D,
}

impl DoubleConv {
    fn new(p: &nn::Path, in_ch: i64, out_ch: i64) -> Self {
        DoubleConv { conv1: conv3(p / "conv1", in_ch, out_ch), conv2: conv3(p / "conv2", out_ch, out_ch) }
    }
}

impl Module for DoubleConv {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv1).relu().apply(&self.conv2).relu()
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Encoder output: one skip tensor per level above the bottleneck, shallowest
/// first, plus the bottleneck features.
#[derive(Debug)]
pub struct Features {
    /// Skip connections, level 0 first.
    pub skips: Vec<Tensor>,
    /// Deepest feature map.
    pub bottleneck: Tensor,
}

/// Feature extractor: `depth + 1` levels of double convolutions with 2×
/// max-pooling in between.
#[derive(Debug)]
pub struct Encoder3d {
    levels: Vec<DoubleConv>,
}

impl Encoder3d {
    /// Build the encoder under `p`.
    pub fn new(p: &nn::Path, cfg: &BackboneConfig) -> Self {
        let mut levels = Vec::with_capacity(cfg.depth + 1);
        let mut in_ch = cfg.in_channels as i64;
        for level in 0..=cfg.depth {
            let out_ch = cfg.channels(level);
            levels.push(DoubleConv::new(&(p / format!("level{level}")), in_ch, out_ch));
            in_ch = out_ch;
        }
        Encoder3d { levels }
    }

    /// Run the encoder. Spatial sizes must be divisible by `2^depth`.
    pub fn forward(&self, xs: &Tensor) -> Features {
        let mut skips = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut h = xs.shallow_clone();
        let last = self.levels.len() - 1;
        for (i, level) in self.levels.iter().enumerate() {
            h = level.forward(&h);
            if i < last {
                skips.push(h.shallow_clone());
                h = h.max_pool3d([2, 2, 2], [2, 2, 2], [0, 0, 0], [1, 1, 1], false);
            }
        }
        Features { skips, bottleneck: h }
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct UpLevel {
    up: nn::ConvTranspose3D,
    conv: DoubleConv,
}

/// Segmentation head: transposed-convolution up-sampling, skip
/// concatenation, double convolution, then a 1×1×1 classifier.
#[derive(Debug)]
pub struct Decoder3d {
    ups: Vec<UpLevel>,
    head: nn::Conv3D,
}

impl Decoder3d {
    /// Build the decoder under `p`.
    pub fn new(p: &nn::Path, cfg: &BackboneConfig) -> Self {
        let ups = (0..cfg.depth)
            .rev()
            .map(|level| {
                let lp = p / format!("up{level}");
                let (deep, shallow) = (cfg.channels(level + 1), cfg.channels(level));
                UpLevel {
                    up: nn::conv_transpose3d(
                        &lp / "up",
                        deep,
                        shallow,
                        2,
                        nn::ConvTransposeConfig { stride: 2, ..Default::default() },
                    ),
                    conv: DoubleConv::new(&(&lp / "block"), 2 * shallow, shallow),
                }
            })
            .collect();
        let head = nn::conv3d(p / "head", cfg.channels(0), cfg.num_classes as i64, 1, Default::default());
        Decoder3d { ups, head }
    }

    /// Logits `[N, num_classes, D, H, W]` from encoder features.
    pub fn forward(&self, features: &Features) -> TrainResult<Tensor> {
        if features.skips.len() != self.ups.len() {
            return Err(TrainError::shape_mismatch(vec![self.ups.len()], vec![features.skips.len()]));
        }
        let mut h = features.bottleneck.shallow_clone();
        for (up, skip) in self.ups.iter().zip(features.skips.iter().rev()) {
            let upsampled = h.apply(&up.up);
            h = up.conv.forward(&Tensor::cat(&[&upsampled, skip], 1));
        }
        Ok(h.apply(&self.head))
    }
}

// ---------------------------------------------------------------------------
// Fused network
// ---------------------------------------------------------------------------

/// Encoder and decoder trained and saved as a single network.
#[derive(Debug)]
pub struct UNet3d {
    encoder: Encoder3d,
    decoder: Decoder3d,
}

impl UNet3d {
    /// Build under `p` (`p/encoder`, `p/decoder`).
    pub fn new(p: &nn::Path, cfg: &BackboneConfig) -> Self {
        UNet3d { encoder: Encoder3d::new(&(p / "encoder"), cfg), decoder: Decoder3d::new(&(p / "decoder"), cfg) }
    }

    /// Logits `[N, num_classes, D, H, W]`.
    pub fn forward(&self, xs: &Tensor) -> TrainResult<Tensor> {
        self.decoder.forward(&self.encoder.forward(xs))
    }
}

// ---------------------------------------------------------------------------
// Domain classifier
// ---------------------------------------------------------------------------

/// Predicts the modality of bottleneck features: conv → ReLU → global
/// average pool → linear, one logit per sample (`[N, 1]`).
#[derive(Debug)]
pub struct DomainClassifier {
    conv: nn::Conv3D,
    fc: nn::Linear,
}

impl DomainClassifier {
    /// Build under `p` for bottleneck features of `cfg`.
    pub fn new(p: &nn::Path, cfg: &BackboneConfig) -> Self {
        let in_ch = cfg.channels(cfg.depth);
        let hidden = cfg.channels(0);
        DomainClassifier {
            conv: conv3(p / "conv", in_ch, hidden),
            fc: nn::linear(p / "fc", hidden, 1, Default::default()),
        }
    }
}

impl Module for DomainClassifier {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv)
            .relu()
            .adaptive_avg_pool3d([1, 1, 1])
            .flatten(1, -1)
            .apply(&self.fc)
    }
}

// ---------------------------------------------------------------------------
// Spatial padding
// ---------------------------------------------------------------------------

/// Zero-pad the end of each spatial axis of `[N, C, D, H, W]` up to a
/// multiple of `multiple`. Returns the padded tensor and the original sizes.
pub fn pad_to_multiple(xs: &Tensor, multiple: i64) -> TrainResult<(Tensor, [i64; 3])> {
    let size = xs.size();
    if size.len() != 5 {
        return Err(TrainError::shape_mismatch(vec![0; 5], size.iter().map(|&s| s as usize).collect()));
    }
    let orig = [size[2], size[3], size[4]];
    let extra = orig.map(|s| (multiple - s % multiple) % multiple);
    if extra.iter().all(|&e| e == 0) {
        return Ok((xs.shallow_clone(), orig));
    }
    let padded = xs.constant_pad_nd([0, extra[2], 0, extra[1], 0, extra[0]]);
    Ok((padded, orig))
}

/// Inverse of [`pad_to_multiple`].
pub fn crop_spatial(xs: &Tensor, orig: [i64; 3]) -> Tensor {
    xs.narrow(2, 0, orig[0]).narrow(3, 0, orig[1]).narrow(4, 0, orig[2])
}

// ---------------------------------------------------------------------------
// VarStore helpers
// ---------------------------------------------------------------------------

/// Build the configured optimiser over every trainable variable of `vs`.
pub fn build_optimizer(vs: &nn::VarStore, kind: OptimizerKind, lr: f64) -> Result<nn::Optimizer, TchError> {
    use nn::OptimizerConfig;
    match kind {
        OptimizerKind::Adam => nn::Adam::default().build(vs, lr),
        OptimizerKind::AdamW => nn::AdamW::default().build(vs, lr),
        OptimizerKind::Sgd => nn::Sgd::default().build(vs, lr),
    }
}

/// Variables of `vs` under `prefix`, with the prefix stripped.
pub fn part_variables(vs: &nn::VarStore, prefix: &str) -> Vec<(String, Tensor)> {
    let dotted = format!("{prefix}.");
    let mut vars: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .filter_map(|(name, t)| name.strip_prefix(&dotted).map(|n| (n.to_string(), t)))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

/// Number of elements across the variables under `prefix`.
pub fn part_num_parameters(vs: &nn::VarStore, prefix: &str) -> usize {
    part_variables(vs, prefix).iter().map(|(_, t)| t.numel() as usize).sum()
}

/// Stop gradients for every variable under `prefix`.
pub fn freeze_part(vs: &nn::VarStore, prefix: &str) {
    for (_, t) in part_variables(vs, prefix) {
        let _ = t.set_requires_grad(false);
    }
}

/// Write the variables under `prefix` to `path`.
pub fn save_part(vs: &nn::VarStore, prefix: &str, path: &Path) -> TrainResult<()> {
    let vars = part_variables(vs, prefix);
    if vars.is_empty() {
        return Err(TrainError::checkpoint(format!("no variables under `{prefix}`"), path));
    }
    Tensor::save_multi(&vars, path).map_err(|e| TrainError::checkpoint(e.to_string(), path))
}

/// Copy tensors from `path` into the variables under `prefix`.
///
/// Every variable must be present with an identical shape.
pub fn load_part(vs: &nn::VarStore, prefix: &str, path: &Path) -> TrainResult<()> {
    if !path.is_file() {
        return Err(TrainError::checkpoint("file not found", path));
    }
    let loaded = Tensor::load_multi(path).map_err(|e| TrainError::checkpoint(e.to_string(), path))?;
    let vars = part_variables(vs, prefix);
    if vars.is_empty() {
        return Err(TrainError::checkpoint(format!("no variables under `{prefix}`"), path));
    }
    for (name, mut var) in vars {
        let src = loaded
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| t)
            .ok_or_else(|| TrainError::checkpoint(format!("missing tensor `{name}`"), path))?;
        if src.size() != var.size() {
            return Err(TrainError::checkpoint(
                format!("tensor `{name}`: expected shape {:?}, found {:?}", var.size(), src.size()),
                path,
            ));
        }
        tch::no_grad(|| var.f_copy_(&src.to_device(var.device()).to_kind(Kind::Float)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn tiny() -> BackboneConfig {
        BackboneConfig { in_channels: 1, base_channels: 2, depth: 2, num_classes: 4 }
    }

    #[test]
    fn unet_output_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = UNet3d::new(&(vs.root() / "net"), &tiny());
        let x = Tensor::zeros([2, 1, 8, 8, 4], (Kind::Float, Device::Cpu));
        let y = net.forward(&x).unwrap();
        assert_eq!(y.size(), vec![2, 4, 8, 8, 4]);
    }

    #[test]
    fn classifier_emits_one_logit() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = tiny();
        let enc = Encoder3d::new(&(vs.root() / "feat_extractor"), &cfg);
        let cls = DomainClassifier::new(&(vs.root() / "dom_classifier"), &cfg);
        let x = Tensor::zeros([3, 1, 8, 8, 8], (Kind::Float, Device::Cpu));
        let f = enc.forward(&x);
        assert_eq!(f.skips.len(), 2);
        assert_eq!(cls.forward(&f.bottleneck).size(), vec![3, 1]);
    }

    #[test]
    fn padding_round_trip() {
        let x = Tensor::ones([1, 1, 5, 8, 3], (Kind::Float, Device::Cpu));
        let (p, orig) = pad_to_multiple(&x, 4).unwrap();
        assert_eq!(p.size(), vec![1, 1, 8, 8, 4]);
        assert_eq!(crop_spatial(&p, orig).size(), x.size());
    }

    #[test]
    fn parts_are_namespaced() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cfg = tiny();
        let _enc = Encoder3d::new(&(vs.root() / "feat_extractor"), &cfg);
        let _dec = Decoder3d::new(&(vs.root() / "predictor"), &cfg);
        let enc_vars = part_variables(&vs, "feat_extractor");
        let dec_vars = part_variables(&vs, "predictor");
        assert!(!enc_vars.is_empty() && !dec_vars.is_empty());
        assert_eq!(enc_vars.len() + dec_vars.len(), vs.variables().len());
    }
}
