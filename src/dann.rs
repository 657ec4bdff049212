//! Domain-adversarial module and its two-stream updater.
//!
//! The module shares one encoder between CT and MR, segments both with one
//! decoder, and trains a domain classifier on the encoder's bottleneck
//! through a [`GradientReversalLayer`]. Each step:
//!
//! ```text
//! alpha = grl_lambda(step, max_iter)         → grl.set_alpha(alpha)
//! zero grads
//! seg  = L_ct(dec(enc(x_ct)), y_ct) + L_mr(dec(enc(x_mr)), y_mr)
//! ∂seg → grads                               (graph retained)
//! adv  = BCE(cls(grl(f_ct)) ⧺ cls(grl(f_mr)), 1 ⧺ 0)
//! ∂adv → grads                               (accumulated)
//! optimizer step over encoder, decoder and classifier
//! ```
//!
//! Checkpoints add `dom_classifier_state.ot` to the split-part files. On
//! load that file is optional, so a segmentation checkpoint can seed a
//! DANN run.

use std::path::Path;
use tch::{nn, nn::Module, Device, Tensor};
use tracing::info;

use crate::config::{OptimizerKind, TrainingConfig};
use crate::dataset::VolumeBatch;
use crate::domain::{grl_lambda, GradientReversalLayer};
use crate::error::{TrainError, TrainResult};
use crate::inference::sliding_window_inference;
use crate::losses::{AdversarialLoss, Criterion, SegmentationLoss};
use crate::modality::Modality;
use crate::module::{image_to_tensor, label_to_tensor, tensor_to_array, ModuleInfo, SegmentationModel};
use crate::networks::{
    build_optimizer, crop_spatial, load_part, pad_to_multiple, part_variables, save_part, BackboneConfig,
    Decoder3d, DomainClassifier, Encoder3d, Features,
};
use crate::partial::ClassPartition;
use crate::segmentation::{
    InferenceSettings, FEAT_EXTRACTOR_FILE, FEAT_EXTRACTOR_PREFIX, PREDICTOR_FILE, PREDICTOR_PREFIX,
};
use crate::updater::{StepLosses, Updater};

/// Domain-classifier file.
pub const DOM_CLASSIFIER_FILE: &str = "dom_classifier_state.ot";

const DOM_CLASSIFIER_PREFIX: &str = "dom_classifier";

/// Component names checked by [`DannUpdater::check_module`].
pub const REQUIRED_COMPONENTS: [&str; 8] = [
    "ct_criterion",
    "mr_criterion",
    "optimizer",
    "feat_extractor",
    "predictor",
    "dom_classifier",
    "grl",
    "adv_loss",
];

/// Parts handed to [`DannModule::new`]. Any may be left out; the updater
/// refuses a module with missing parts.
#[derive(Debug, Default)]
pub struct DannComponents {
    /// Shared encoder.
    pub feat_extractor: Option<Encoder3d>,
    /// Segmentation decoder.
    pub predictor: Option<Decoder3d>,
    /// Domain classifier on bottleneck features.
    pub dom_classifier: Option<DomainClassifier>,
    /// Optimiser over every variable of the store.
    pub optimizer: Option<OptimizerKind>,
    /// Per-modality segmentation losses.
    pub criterion: Option<Criterion>,
    /// Domain loss.
    pub adv_loss: Option<AdversarialLoss>,
}

impl DannComponents {
    /// Every network registered in `vs`, no optimiser or losses.
    pub fn networks(vs: &nn::VarStore, cfg: &BackboneConfig) -> Self {
        DannComponents {
            feat_extractor: Some(Encoder3d::new(&(vs.root() / FEAT_EXTRACTOR_PREFIX), cfg)),
            predictor: Some(Decoder3d::new(&(vs.root() / PREDICTOR_PREFIX), cfg)),
            dom_classifier: Some(DomainClassifier::new(&(vs.root() / DOM_CLASSIFIER_PREFIX), cfg)),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// DannModule
// ---------------------------------------------------------------------------

/// Shared encoder, decoder, domain classifier, GRL, optimiser and losses.
pub struct DannModule {
    vs: nn::VarStore,
    backbone: BackboneConfig,
    feat_extractor: Option<Encoder3d>,
    predictor: Option<Decoder3d>,
    dom_classifier: Option<DomainClassifier>,
    grl: GradientReversalLayer,
    optimizer: Option<nn::Optimizer>,
    optimizer_kind: Option<OptimizerKind>,
    learning_rate: f64,
    criterion: Option<Criterion>,
    adv_loss: Option<AdversarialLoss>,
    inference: InferenceSettings,
}

/// Borrowed view of a complete module for one step.
struct StepParts<'m> {
    vs: &'m nn::VarStore,
    multiple: i64,
    feat_extractor: &'m Encoder3d,
    predictor: &'m Decoder3d,
    dom_classifier: &'m DomainClassifier,
    grl: &'m mut GradientReversalLayer,
    optimizer: &'m mut nn::Optimizer,
    ct_criterion: &'m SegmentationLoss,
    mr_criterion: &'m SegmentationLoss,
    adv_loss: &'m AdversarialLoss,
}

impl DannModule {
    /// Assemble a module from parts registered in `vs`.
    pub fn new(
        vs: nn::VarStore,
        backbone: BackboneConfig,
        components: DannComponents,
        learning_rate: f64,
        inference: InferenceSettings,
    ) -> TrainResult<Self> {
        let DannComponents { feat_extractor, predictor, dom_classifier, optimizer, criterion, adv_loss } =
            components;
        let built = match optimizer {
            Some(kind) => Some(build_optimizer(&vs, kind, learning_rate)?),
            None => None,
        };
        Ok(DannModule {
            vs,
            backbone,
            feat_extractor,
            predictor,
            dom_classifier,
            grl: GradientReversalLayer::default(),
            optimizer: built,
            optimizer_kind: optimizer,
            learning_rate,
            criterion,
            adv_loss,
            inference,
        })
    }

    /// Complete module configured from `cfg`.
    pub fn from_config(cfg: &TrainingConfig, partition: &ClassPartition, device: Device) -> TrainResult<Self> {
        let vs = nn::VarStore::new(device);
        let backbone = BackboneConfig::from_training(cfg);
        let components = DannComponents {
            optimizer: Some(cfg.optimizer),
            criterion: Some(Criterion::from_config(cfg, partition, device)?),
            adv_loss: Some(AdversarialLoss),
            ..DannComponents::networks(&vs, &backbone)
        };
        Self::new(vs, backbone, components, cfg.learning_rate, InferenceSettings::from_training(cfg))
    }

    /// Device holding the parameters.
    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// The parameter store.
    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// The gradient-reversal layer.
    pub fn grl(&self) -> &GradientReversalLayer {
        &self.grl
    }

    /// Names of required parts that are absent, in check order.
    pub fn missing_components(&self) -> Vec<&'static str> {
        let per_modality = matches!(self.criterion, Some(Criterion::PerModality { .. }));
        REQUIRED_COMPONENTS
            .iter()
            .copied()
            .filter(|name| match *name {
                "ct_criterion" | "mr_criterion" => !per_modality,
                "optimizer" => self.optimizer.is_none(),
                "feat_extractor" => self.feat_extractor.is_none(),
                "predictor" => self.predictor.is_none(),
                "dom_classifier" => self.dom_classifier.is_none(),
                "adv_loss" => self.adv_loss.is_none(),
                _ => false,
            })
            .collect()
    }

    fn step_parts(&mut self) -> Option<StepParts<'_>> {
        let (ct_criterion, mr_criterion) = match self.criterion.as_ref()? {
            Criterion::PerModality { ct, mr } => (ct, mr),
            Criterion::Single(_) => return None,
        };
        Some(StepParts {
            vs: &self.vs,
            multiple: self.backbone.spatial_multiple(),
            feat_extractor: self.feat_extractor.as_ref()?,
            predictor: self.predictor.as_ref()?,
            dom_classifier: self.dom_classifier.as_ref()?,
            grl: &mut self.grl,
            optimizer: self.optimizer.as_mut()?,
            ct_criterion,
            mr_criterion,
            adv_loss: self.adv_loss.as_ref()?,
        })
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

    /// Segmentation logits through encoder and decoder.
    pub fn forward(&self, x: &Tensor) -> TrainResult<Tensor> {
        self.check_device(x)?;
        let (fe, pred) = match (&self.feat_extractor, &self.predictor) {
            (Some(fe), Some(pred)) => (fe, pred),
            _ => return Err(TrainError::missing_components("DannModule::forward", self.missing_components())),
        };
        let (padded, orig) = pad_to_multiple(x, self.backbone.spatial_multiple())?;
        Ok(crop_spatial(&pred.forward(&fe.forward(&padded))?, orig))
    }

    /// Domain logits `[N, 1]` for `x`, through the GRL.
    pub fn domain_logits(&self, x: &Tensor) -> TrainResult<Tensor> {
        self.check_device(x)?;
        let (fe, cls) = match (&self.feat_extractor, &self.dom_classifier) {
            (Some(fe), Some(cls)) => (fe, cls),
            _ => return Err(TrainError::missing_components("DannModule::domain_logits", self.missing_components())),
        };
        let (padded, _) = pad_to_multiple(x, self.backbone.spatial_multiple())?;
        Ok(cls.forward(&self.grl.apply(&fe.forward(&padded).bottleneck)))
    }

    /// No-grad sliding-window inference.
    pub fn inference(&self, x: &Tensor) -> TrainResult<Tensor> {
        let s = self.inference;
        tch::no_grad(|| sliding_window_inference(x, s.roi_size, s.sw_batch_size, s.overlap, |w| self.forward(w)))
    }

    /// One adversarial step on a CT and an MR batch; returns
    /// `(seg_loss, adv_loss)`.
    pub fn update(
        &mut self,
        ct: (&Tensor, &Tensor),
        mr: (&Tensor, &Tensor),
        alpha: f64,
    ) -> TrainResult<(f64, f64)> {
        self.check_device(ct.0)?;
        self.check_device(mr.0)?;
        let device = self.device();
        let missing = self.missing_components();
        let mut parts = self
            .step_parts()
            .ok_or_else(|| TrainError::missing_components("DannModule::update", missing))?;

        parts.grl.set_alpha(alpha);
        parts.optimizer.zero_grad();

        let forward = |x: &Tensor| -> TrainResult<(Features, Tensor)> {
            let (padded, orig) = pad_to_multiple(x, parts.multiple)?;
            let features = parts.feat_extractor.forward(&padded);
            let logits = crop_spatial(&parts.predictor.forward(&features)?, orig);
            Ok((features, logits))
        };
        let (ct_features, ct_out) = forward(ct.0)?;
        let (mr_features, mr_out) = forward(mr.0)?;

        let ct_seg = parts.ct_criterion.forward(&ct_out, &ct.1.to_device(device))?;
        let mr_seg = parts.mr_criterion.forward(&mr_out, &mr.1.to_device(device))?;
        let seg_loss = ct_seg + mr_seg;
        accumulate_retained(&seg_loss, parts.vs)?;

        let ct_dom = parts.dom_classifier.forward(&parts.grl.apply(&ct_features.bottleneck));
        let mr_dom = parts.dom_classifier.forward(&parts.grl.apply(&mr_features.bottleneck));
        let dom_logits = Tensor::cat(&[&ct_dom, &mr_dom], 0);
        let dom_labels = Tensor::cat(
            &[ct_dom.full_like(Modality::Ct.domain_label() as f64), mr_dom.full_like(Modality::Mr.domain_label() as f64)],
            0,
        );
        let adv_loss = parts.adv_loss.forward(&dom_logits, &dom_labels)?;
        adv_loss.backward();

        parts.optimizer.step();
        Ok((seg_loss.double_value(&[]), adv_loss.double_value(&[])))
    }
}

/// Back-propagate `loss` into the encoder and decoder `.grad` buffers while
/// keeping the graph alive for a second backward pass.
fn accumulate_retained(loss: &Tensor, vs: &nn::VarStore) -> TrainResult<()> {
    let params: Vec<Tensor> = [FEAT_EXTRACTOR_PREFIX, PREDICTOR_PREFIX]
        .iter()
        .flat_map(|prefix| part_variables(vs, prefix))
        .map(|(_, t)| t)
        .filter(|t| t.requires_grad())
        .collect();
    if params.is_empty() {
        return Ok(());
    }
    let grads = Tensor::f_run_backward(&[loss], &params, true, false)?;
    let terms: Vec<Tensor> = params
        .iter()
        .zip(grads.iter())
        .map(|(p, g)| (p * g.detach()).sum(tch::Kind::Float))
        .collect();
    Tensor::stack(&terms, 0).sum(tch::Kind::Float).backward();
    Ok(())
}

impl SegmentationModel for DannModule {
    fn num_classes(&self) -> usize {
        self.backbone.num_classes
    }

    fn predict(&self, image: &ndarray::Array5<f32>) -> TrainResult<ndarray::Array5<f32>> {
        let x = image_to_tensor(image, self.device());
        tensor_to_array(&self.inference(&x)?)
    }

    fn save(&self, dir: &Path) -> TrainResult<()> {
        std::fs::create_dir_all(dir)?;
        save_part(&self.vs, FEAT_EXTRACTOR_PREFIX, &dir.join(FEAT_EXTRACTOR_FILE))?;
        save_part(&self.vs, PREDICTOR_PREFIX, &dir.join(PREDICTOR_FILE))?;
        if self.dom_classifier.is_some() {
            save_part(&self.vs, DOM_CLASSIFIER_PREFIX, &dir.join(DOM_CLASSIFIER_FILE))?;
        }
        Ok(())
    }

    fn load(&mut self, dir: &Path) -> TrainResult<()> {
        load_part(&self.vs, FEAT_EXTRACTOR_PREFIX, &dir.join(FEAT_EXTRACTOR_FILE))?;
        load_part(&self.vs, PREDICTOR_PREFIX, &dir.join(PREDICTOR_FILE))?;
        let cls_path = dir.join(DOM_CLASSIFIER_FILE);
        if self.dom_classifier.is_some() && cls_path.is_file() {
            load_part(&self.vs, DOM_CLASSIFIER_PREFIX, &cls_path)?;
        } else if self.dom_classifier.is_some() {
            info!("No {DOM_CLASSIFIER_FILE} in {}; domain classifier keeps its initialisation", dir.display());
        }
        info!("Loaded DANN module from {}", dir.display());
        Ok(())
    }

    fn info(&self) -> ModuleInfo {
        let mut networks = Vec::new();
        if self.feat_extractor.is_some() {
            networks.push((FEAT_EXTRACTOR_PREFIX, "Encoder3d".to_string()));
        }
        if self.predictor.is_some() {
            networks.push((PREDICTOR_PREFIX, "Decoder3d".to_string()));
        }
        if self.dom_classifier.is_some() {
            networks.push((DOM_CLASSIFIER_PREFIX, "DomainClassifier".to_string()));
        }
        ModuleInfo {
            kind: "DannModule",
            networks,
            optimizer: self.optimizer_kind.map_or_else(|| "none".to_string(), |k| k.to_string()),
            learning_rate: self.learning_rate,
            criterion: self.criterion.as_ref().map_or_else(|| "none".to_string(), Criterion::describe),
            num_parameters: self.vs.trainable_variables().iter().map(|t| t.numel() as usize).sum(),
        }
    }
}

// ---------------------------------------------------------------------------
// DannUpdater
// ---------------------------------------------------------------------------

/// Two-stream adversarial step with the [`grl_lambda`] warm-up.
#[derive(Debug, Clone, Copy, Default)]
pub struct DannUpdater;

impl DannUpdater {
    /// Loss name of the segmentation term.
    pub const SEG_LOSS: &'static str = "seg_loss";
    /// Loss name of the adversarial term.
    pub const ADV_LOSS: &'static str = "adv_loss";
}

impl Updater<DannModule> for DannUpdater {
    type Batch = (VolumeBatch, VolumeBatch);

    fn name(&self) -> &'static str {
        "DannUpdater"
    }

    fn check_module(&self, module: &DannModule) -> TrainResult<()> {
        let missing = module.missing_components();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(TrainError::missing_components(self.name(), missing))
        }
    }

    fn update(
        &mut self,
        module: &mut DannModule,
        batch: &Self::Batch,
        step: usize,
        max_iter: usize,
    ) -> TrainResult<StepLosses> {
        let (ct, mr) = batch;
        let device = module.device();
        let ct_x = image_to_tensor(&ct.image, device);
        let ct_y = label_to_tensor(&ct.label, device);
        let mr_x = image_to_tensor(&mr.image, device);
        let mr_y = label_to_tensor(&mr.label, device);

        let alpha = grl_lambda(step, max_iter);
        let (seg, adv) = module.update((&ct_x, &ct_y), (&mr_x, &mr_y), alpha)?;

        let mut losses = StepLosses::new();
        losses.push(Self::SEG_LOSS, seg);
        losses.push(Self::ADV_LOSS, adv);
        Ok(losses)
    }
}
