//! Plain segmentation module and its one-step updater.
//!
//! The module owns either a fused [`UNet3d`] or a split
//! [`Encoder3d`] + [`Decoder3d`] pair, all registered in one `VarStore`, plus
//! the optimiser and the criterion. Checkpoints are one file per part:
//!
//! ```text
//! <dir>/net.ot                                  (fused)
//! <dir>/feat_extractor_state.ot, predictor_state.ot   (split)
//! ```

use std::path::Path;
use tch::{nn, Device, Tensor};
use tracing::{info, warn};

use crate::config::{OptimizerKind, TrainingConfig};
use crate::dataset::VolumeBatch;
use crate::error::{ConfigError, TrainError, TrainResult};
use crate::inference::sliding_window_inference;
use crate::losses::Criterion;
use crate::modality::Modality;
use crate::module::{image_to_tensor, label_to_tensor, tensor_to_array, ModuleInfo, SegmentationModel};
use crate::networks::{
    build_optimizer, crop_spatial, freeze_part, load_part, pad_to_multiple, save_part, BackboneConfig, Decoder3d,
    Encoder3d, UNet3d,
};
use crate::partial::ClassPartition;
use crate::updater::{StepLosses, Updater};

/// Fused network file.
pub const NET_FILE: &str = "net.ot";
/// Feature-extractor file.
pub const FEAT_EXTRACTOR_FILE: &str = "feat_extractor_state.ot";
/// Predictor file.
pub const PREDICTOR_FILE: &str = "predictor_state.ot";

pub(crate) const NET_PREFIX: &str = "net";
pub(crate) const FEAT_EXTRACTOR_PREFIX: &str = "feat_extractor";
pub(crate) const PREDICTOR_PREFIX: &str = "predictor";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Sliding-window inference parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceSettings {
    /// Window size. Default: **[96, 96, 96]**.
    pub roi_size: [usize; 3],
    /// Windows per forward pass. Default: **2**.
    pub sw_batch_size: usize,
    /// Fractional overlap. Default: **0.25**.
    pub overlap: f64,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        InferenceSettings { roi_size: [96; 3], sw_batch_size: 2, overlap: 0.25 }
    }
}

impl InferenceSettings {
    /// Take the sliding-window fields of a [`TrainingConfig`].
    pub fn from_training(cfg: &TrainingConfig) -> Self {
        InferenceSettings { roi_size: cfg.roi_size, sw_batch_size: cfg.sw_batch_size, overlap: cfg.sw_overlap }
    }
}

/// Networks handed to [`SegmentationModule::new`]. Supply `net`, or both
/// `feat_extractor` and `predictor`.
#[derive(Debug, Default)]
pub struct NetworkParts {
    /// Fused network, built under `net`.
    pub net: Option<UNet3d>,
    /// Encoder, built under `feat_extractor`.
    pub feat_extractor: Option<Encoder3d>,
    /// Decoder, built under `predictor`.
    pub predictor: Option<Decoder3d>,
}

impl NetworkParts {
    /// A fused network registered in `vs`.
    pub fn fused(vs: &nn::VarStore, cfg: &BackboneConfig) -> Self {
        NetworkParts { net: Some(UNet3d::new(&(vs.root() / NET_PREFIX), cfg)), ..Default::default() }
    }

    /// An encoder/decoder pair registered in `vs`.
    pub fn split(vs: &nn::VarStore, cfg: &BackboneConfig) -> Self {
        NetworkParts {
            net: None,
            feat_extractor: Some(Encoder3d::new(&(vs.root() / FEAT_EXTRACTOR_PREFIX), cfg)),
            predictor: Some(Decoder3d::new(&(vs.root() / PREDICTOR_PREFIX), cfg)),
        }
    }
}

// ---------------------------------------------------------------------------
// SegmentationModule
// ---------------------------------------------------------------------------

/// Segmentation network, optimiser and criterion.
pub struct SegmentationModule {
    vs: nn::VarStore,
    backbone: BackboneConfig,
    net: Option<UNet3d>,
    feat_extractor: Option<Encoder3d>,
    predictor: Option<Decoder3d>,
    optimizer: nn::Optimizer,
    optimizer_kind: OptimizerKind,
    learning_rate: f64,
    criterion: Criterion,
    inference: InferenceSettings,
}

impl SegmentationModule {
    /// Assemble a module from networks already registered in `vs`.
    ///
    /// With both a fused network and split parts, a warning is logged and
    /// only the fused network is trained.
    ///
    /// # Errors
    ///
    /// Neither a fused network nor a complete split pair is given, or the
    /// optimiser cannot be built.
    pub fn new(
        vs: nn::VarStore,
        backbone: BackboneConfig,
        parts: NetworkParts,
        optimizer_kind: OptimizerKind,
        learning_rate: f64,
        criterion: Criterion,
        inference: InferenceSettings,
    ) -> TrainResult<Self> {
        let NetworkParts { net, feat_extractor, predictor } = parts;
        match (&net, &feat_extractor, &predictor) {
            (Some(_), None, None) | (None, Some(_), Some(_)) => {}
            (Some(_), _, _) => {
                warn!("Both a fused network and split parts were given; only the fused network is trained");
                freeze_part(&vs, FEAT_EXTRACTOR_PREFIX);
                freeze_part(&vs, PREDICTOR_PREFIX);
            }
            (None, _, _) => {
                return Err(ConfigError::unsupported(
                    "segmentation module needs `net` or both `feat_extractor` and `predictor`",
                )
                .into());
            }
        }
        let optimizer = build_optimizer(&vs, optimizer_kind, learning_rate)?;
        Ok(SegmentationModule {
            vs,
            backbone,
            net,
            feat_extractor,
            predictor,
            optimizer,
            optimizer_kind,
            learning_rate,
            criterion,
            inference,
        })
    }

    /// Split encoder/decoder module configured from `cfg`.
    pub fn from_config(cfg: &TrainingConfig, partition: &ClassPartition, device: Device) -> TrainResult<Self> {
        let vs = nn::VarStore::new(device);
        let backbone = BackboneConfig::from_training(cfg);
        let parts = NetworkParts::split(&vs, &backbone);
        let criterion = Criterion::from_config(cfg, partition, device)?;
        Self::new(
            vs,
            backbone,
            parts,
            cfg.optimizer,
            cfg.learning_rate,
            criterion,
            InferenceSettings::from_training(cfg),
        )
    }

    /// Device holding the parameters.
    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// The parameter store.
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// The loss.
    pub fn criterion(&self) -> &Criterion {
        &self.criterion
    }

    /// Sliding-window parameters.
    pub fn inference_settings(&self) -> InferenceSettings {
        self.inference
    }

    fn check_device(&self, x: &Tensor) -> TrainResult<()> {
        if x.device() != self.device() {
            return Err(TrainError::DeviceMismatch {
                expected: format!("{:?}", self.device()),
                actual: format!("{:?}", x.device()),
            });
        }
        Ok(())
    }

    /// Logits `[N, num_classes, D, H, W]`, through the fused network when
    /// present.
    pub fn forward(&self, x: &Tensor) -> TrainResult<Tensor> {
        self.check_device(x)?;
        let (padded, orig) = pad_to_multiple(x, self.backbone.spatial_multiple())?;
        let logits = match (&self.net, &self.feat_extractor, &self.predictor) {
            (Some(net), _, _) => net.forward(&padded)?,
            (None, Some(fe), Some(pred)) => pred.forward(&fe.forward(&padded))?,
            _ => return Err(TrainError::training_step("module has no complete network")),
        };
        Ok(crop_spatial(&logits, orig))
    }

    /// One optimisation step; returns the loss value.
    ///
    /// With a per-modality criterion, `modality` picks the loss.
    pub fn update(&mut self, x: &Tensor, y: &Tensor, modality: Option<Modality>) -> TrainResult<f64> {
        self.optimizer.zero_grad();
        let logits = self.forward(x)?;
        let loss = self.criterion.select(modality)?.forward(&logits, &y.to_device(self.device()))?;
        loss.backward();
        self.optimizer.step();
        Ok(loss.double_value(&[]))
    }

    /// No-grad sliding-window inference.
    pub fn inference(&self, x: &Tensor) -> TrainResult<Tensor> {
        let s = self.inference;
        tch::no_grad(|| sliding_window_inference(x, s.roi_size, s.sw_batch_size, s.overlap, |w| self.forward(w)))
    }

    fn trainable_parameters(&self) -> usize {
        self.vs
            .trainable_variables()
            .iter()
            .filter(|t| t.requires_grad())
            .map(|t| t.numel() as usize)
            .sum()
    }
}

impl SegmentationModel for SegmentationModule {
    fn num_classes(&self) -> usize {
        self.backbone.num_classes
    }

    fn predict(&self, image: &ndarray::Array5<f32>) -> TrainResult<ndarray::Array5<f32>> {
        let x = image_to_tensor(image, self.device());
        tensor_to_array(&self.inference(&x)?)
    }

    fn save(&self, dir: &Path) -> TrainResult<()> {
        std::fs::create_dir_all(dir)?;
        if self.net.is_some() {
            save_part(&self.vs, NET_PREFIX, &dir.join(NET_FILE))
        } else {
            save_part(&self.vs, FEAT_EXTRACTOR_PREFIX, &dir.join(FEAT_EXTRACTOR_FILE))?;
            save_part(&self.vs, PREDICTOR_PREFIX, &dir.join(PREDICTOR_FILE))
        }
    }

    fn load(&mut self, dir: &Path) -> TrainResult<()> {
        if self.net.is_some() {
            load_part(&self.vs, NET_PREFIX, &dir.join(NET_FILE))?;
        } else {
            load_part(&self.vs, FEAT_EXTRACTOR_PREFIX, &dir.join(FEAT_EXTRACTOR_FILE))?;
            load_part(&self.vs, PREDICTOR_PREFIX, &dir.join(PREDICTOR_FILE))?;
        }
        info!("Loaded segmentation module from {}", dir.display());
        Ok(())
    }

    fn info(&self) -> ModuleInfo {
        let networks = if self.net.is_some() {
            vec![(NET_PREFIX, "UNet3d".to_string())]
        } else {
            vec![(FEAT_EXTRACTOR_PREFIX, "Encoder3d".to_string()), (PREDICTOR_PREFIX, "Decoder3d".to_string())]
        };
        ModuleInfo {
            kind: "SegmentationModule",
            networks,
            optimizer: self.optimizer_kind.to_string(),
            learning_rate: self.learning_rate,
            criterion: self.criterion.describe(),
            num_parameters: self.trainable_parameters(),
        }
    }
}

// ---------------------------------------------------------------------------
// SegmentationUpdater
// ---------------------------------------------------------------------------

/// Single-stream step: the batch's modality picks the loss.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentationUpdater;

impl Updater<SegmentationModule> for SegmentationUpdater {
    type Batch = VolumeBatch;

    fn name(&self) -> &'static str {
        "SegmentationUpdater"
    }

    fn check_module(&self, module: &SegmentationModule) -> TrainResult<()> {
        let complete = module.net.is_some() || (module.feat_extractor.is_some() && module.predictor.is_some());
        if !complete {
            return Err(TrainError::missing_components(self.name(), vec!["net"]));
        }
        Ok(())
    }

    fn update(
        &mut self,
        module: &mut SegmentationModule,
        batch: &VolumeBatch,
        _step: usize,
        _max_iter: usize,
    ) -> TrainResult<StepLosses> {
        let device = module.device();
        let x = image_to_tensor(&batch.image, device);
        let y = label_to_tensor(&batch.label, device);
        if batch.is_mixed() && module.criterion().is_per_modality() {
            warn!(
                "Batch mixes modalities {:?}; using the {} loss for every sample",
                batch.modalities,
                batch.modality()
            );
        }
        let loss = module.update(&x, &y, Some(batch.modality()))?;
        Ok(StepLosses::single(module.criterion().name(), loss))
    }
}
