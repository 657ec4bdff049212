//! Config-driven orchestration: datasets, loaders, module, training and
//! testing for one run.
//!
//! ```text
//! TrainingConfig ──► build_datasets ──► loaders ──► Trainer::train ──► evaluate(test)
//!        │                                             ▲
//!        └──► SegmentationModule | DannModule ─────────┘
//! ```
//!
//! Split policy:
//!
//! | `train_data` | train                 | validation            | test               |
//! |--------------|-----------------------|-----------------------|--------------------|
//! | `all`        | train stage           | validation stage      | –                  |
//! | `split`      | train stage minus tail| tail of train stage   | validation stage   |
//!
//! Test mode only reads the validation stage and scores it unmasked.

use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::{DataSource, ModuleKind, RunMode, TrainData, TrainingConfig};
use crate::dann::{DannModule, DannUpdater};
use crate::dataset::{
    split_tail, ConcatDataset, CyclicLoader, DataLoader, NpyVolumeDataset, PairedLoaders, Stage, Subset,
    SyntheticVolumeConfig, SyntheticVolumeDataset, VolumeDataset,
};
use crate::error::{TrainError, TrainResult};
use crate::logger::TrainLogger;
use crate::metrics::ValidationReport;
use crate::modality::Modality;
use crate::module::SegmentationModel;
use crate::partial::{BackgroundMap, ClassPartition};
use crate::segmentation::{SegmentationModule, SegmentationUpdater};
use crate::trainer::{evaluate, BatchSource, TrainSummary, Trainer};
use crate::updater::Updater;
use crate::validation::{ValidationStreams, Validator};

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

/// One dataset per modality for a single stage.
#[derive(Clone, Default)]
pub struct StageSets {
    sets: Vec<(Modality, Arc<dyn VolumeDataset>)>,
}

impl StageSets {
    /// Add the dataset of `modality`.
    pub fn push(&mut self, modality: Modality, dataset: Arc<dyn VolumeDataset>) {
        self.sets.push((modality, dataset));
    }

    /// Dataset of `modality`.
    pub fn get(&self, modality: Modality) -> Option<&Arc<dyn VolumeDataset>> {
        self.sets.iter().find(|(m, _)| *m == modality).map(|(_, d)| d)
    }

    /// Every modality's cases, back to back.
    pub fn concat(&self) -> Arc<dyn VolumeDataset> {
        if let [(_, only)] = self.sets.as_slice() {
            return Arc::clone(only);
        }
        Arc::new(ConcatDataset::new(self.sets.iter().map(|(_, d)| Arc::clone(d)).collect()))
    }

    /// Total cases.
    pub fn len(&self) -> usize {
        self.sets.iter().map(|(_, d)| d.len()).sum()
    }

    /// `true` when no modality has any case.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn require(&self, modality: Modality) -> TrainResult<&Arc<dyn VolumeDataset>> {
        self.get(modality).ok_or(TrainError::EmptyDataset)
    }
}

/// Datasets of a run.
#[derive(Clone, Default)]
pub struct RunDatasets {
    /// Training cases (empty in test mode).
    pub train: StageSets,
    /// Validation cases.
    pub val: StageSets,
    /// Test cases, when `train_data = split` or in test mode.
    pub test: Option<StageSets>,
}

fn load_stage(
    cfg: &TrainingConfig,
    modality: Modality,
    stage: Stage,
    mask_mapping: Option<BackgroundMap>,
) -> TrainResult<Arc<dyn VolumeDataset>> {
    let dataset: Arc<dyn VolumeDataset> = match &cfg.data {
        DataSource::Directory { root } => Arc::new(NpyVolumeDataset::discover(root, modality, stage, mask_mapping)?),
        DataSource::Synthetic { cases, spatial } => Arc::new(SyntheticVolumeDataset::new(
            *cases,
            SyntheticVolumeConfig {
                spatial: *spatial,
                num_classes: cfg.num_classes,
                in_channels: cfg.in_channels,
                modality,
                mask_mapping,
            },
        )),
    };
    Ok(match cfg.case_limit() {
        Some(limit) => Arc::new(Subset::head(dataset, limit)),
        None => dataset,
    })
}

/// Build every dataset the run needs.
///
/// With `masked`, training labels of each modality are relabelled through
/// that modality's background map.
pub fn build_datasets(cfg: &TrainingConfig, partition: &ClassPartition) -> TrainResult<RunDatasets> {
    let mut out = RunDatasets::default();
    for modality in cfg.modality.modalities() {
        if cfg.mode == RunMode::Test {
            let test = out.test.get_or_insert_with(StageSets::default);
            test.push(modality, load_stage(cfg, modality, Stage::Validation, None)?);
            continue;
        }
        let train_map = cfg.masked.then(|| partition.background_map(modality));
        let train_stage = load_stage(cfg, modality, Stage::Train, train_map)?;
        let val_stage = load_stage(cfg, modality, Stage::Validation, None)?;
        match cfg.train_data {
            TrainData::All => {
                out.train.push(modality, train_stage);
                out.val.push(modality, val_stage);
            }
            TrainData::Split => {
                let (train, val) = split_tail(train_stage, cfg.val_fraction)?;
                out.train.push(modality, Arc::new(train));
                out.val.push(modality, Arc::new(val));
                out.test.get_or_insert_with(StageSets::default).push(modality, val_stage);
            }
        }
    }
    info!(
        "Datasets: train {} / val {} / test {}",
        out.train.len(),
        out.val.len(),
        out.test.as_ref().map_or(0, StageSets::len)
    );
    Ok(out)
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// What a run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Timestamped run directory.
    pub run_dir: PathBuf,
    /// Training summary (train mode only).
    pub summary: Option<TrainSummary>,
    /// Test report, when a test set exists.
    pub test_report: Option<ValidationReport>,
}

/// Execute a full run described by `cfg`.
///
/// Development mode is applied first, then the configuration is validated.
pub fn run(mut cfg: TrainingConfig) -> TrainResult<RunOutcome> {
    cfg.apply_dev_mode();
    cfg.validate()?;
    tch::manual_seed(cfg.seed as i64);
    if cfg.deterministic {
        tch::Cuda::cudnn_set_benchmark(false);
    }
    let device = cfg.device()?;
    info!("Device: {device:?}");

    let partition = ClassPartition::amos_default(cfg.num_classes)?;
    let datasets = build_datasets(&cfg, &partition)?;

    let run_dir = cfg.run_dir(&Local::now());
    std::fs::create_dir_all(&run_dir)?;
    let args_path = cfg.write_args(&run_dir)?;
    info!("Run directory: {} ({} written)", run_dir.display(), args_path.display());
    let mut logger = TrainLogger::new(&run_dir)?;

    let (summary, test_report) = match cfg.module {
        ModuleKind::Segmentation => {
            let mut module = SegmentationModule::from_config(&cfg, &partition, device)?;
            let source = if cfg.mode == RunMode::Train {
                Some(datasets.train.concat())
            } else {
                None
            };
            let mut loader = source
                .as_deref()
                .map(|d| CyclicLoader::new(DataLoader::new(d, cfg.batch_size, cfg.shuffle(), cfg.seed)));
            execute(&cfg, &partition, &datasets, &mut module, &mut SegmentationUpdater, loader.as_mut(), &mut logger)?
        }
        ModuleKind::Dann => {
            let mut module = DannModule::from_config(&cfg, &partition, device)?;
            let mut loaders = if cfg.mode == RunMode::Train {
                let ct = datasets.train.require(Modality::Ct)?;
                let mr = datasets.train.require(Modality::Mr)?;
                Some(PairedLoaders::new(
                    DataLoader::new(ct.as_ref(), cfg.batch_size, cfg.shuffle(), cfg.seed),
                    DataLoader::new(mr.as_ref(), cfg.batch_size, cfg.shuffle(), cfg.seed.wrapping_add(1)),
                ))
            } else {
                None
            };
            execute(&cfg, &partition, &datasets, &mut module, &mut DannUpdater, loaders.as_mut(), &mut logger)?
        }
    };

    Ok(RunOutcome { run_dir, summary, test_report })
}

fn validator_for<'a>(
    cfg: &TrainingConfig,
    sets: &'a StageSets,
    concat: &'a dyn VolumeDataset,
    partition: Option<ClassPartition>,
) -> TrainResult<Validator<'a>> {
    let streams = if cfg.module == ModuleKind::Dann {
        ValidationStreams::Dual {
            ct: DataLoader::new(sets.require(Modality::Ct)?.as_ref(), 1, false, 0),
            mr: DataLoader::new(sets.require(Modality::Mr)?.as_ref(), 1, false, 0),
        }
    } else {
        ValidationStreams::Single(DataLoader::new(concat, 1, false, 0))
    };
    Validator::new(streams, cfg.num_classes, partition)
}

fn execute<M, U, S>(
    cfg: &TrainingConfig,
    partition: &ClassPartition,
    datasets: &RunDatasets,
    module: &mut M,
    updater: &mut U,
    source: Option<&mut S>,
    logger: &mut TrainLogger,
) -> TrainResult<(Option<TrainSummary>, Option<ValidationReport>)>
where
    M: SegmentationModel,
    U: Updater<M>,
    S: BatchSource<Batch = U::Batch>,
{
    if let Some(dir) = &cfg.pretrained {
        module.load(dir)?;
    }
    module.print_info();

    let summary = match (cfg.mode, source) {
        (RunMode::Train, Some(source)) => {
            let val_concat = datasets.val.concat();
            let mut validator =
                validator_for(cfg, &datasets.val, val_concat.as_ref(), cfg.masked.then(|| partition.clone()))?;
            let trainer = Trainer::new(cfg.max_iter, cfg.eval_step)?;
            Some(trainer.train(module, updater, source, &mut validator, logger)?)
        }
        (RunMode::Train, None) => return Err(TrainError::EmptyDataset),
        (RunMode::Test, _) => None,
    };

    let test_report = match &datasets.test {
        Some(test) if !test.is_empty() => {
            // Score the best checkpoint of this run, if one was written.
            if summary.as_ref().is_some_and(|s| !s.saved_at_steps.is_empty()) {
                module.load(logger.run_dir())?;
            }
            let test_concat = test.concat();
            let mut validator = validator_for(cfg, test, test_concat.as_ref(), None)?;
            Some(evaluate(&*module, &mut validator, logger)?)
        }
        _ => None,
    };
    Ok((summary, test_report))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_cfg() -> TrainingConfig {
        TrainingConfig {
            data: DataSource::Synthetic { cases: 5, spatial: [4, 4, 4] },
            num_classes: 4,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn split_moves_validation_stage_to_test() {
        let cfg = TrainingConfig { train_data: TrainData::Split, ..synthetic_cfg() };
        let p = ClassPartition::amos_default(4).unwrap();
        let d = build_datasets(&cfg, &p).unwrap();
        assert_eq!(d.train.len(), 4);
        assert_eq!(d.val.len(), 1);
        assert_eq!(d.test.as_ref().map(StageSets::len), Some(5));
    }

    #[test]
    fn dev_mode_truncates() {
        let mut cfg = TrainingConfig { dev: true, ..synthetic_cfg() };
        cfg.modality = crate::config::ModalitySelection::CtMr;
        let p = ClassPartition::amos_default(4).unwrap();
        let d = build_datasets(&cfg, &p).unwrap();
        assert_eq!(d.train.get(Modality::Mr).map(|s| s.len()), Some(4));
        assert_eq!(d.train.len(), 8);
        assert!(d.test.is_none());
    }
}
