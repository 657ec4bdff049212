//! `train` binary: entry point for cross-modality segmentation training.
//!
//! # Usage
//!
//! ```bash
//! cargo run --features tch-backend --bin train -- --config config.json
//! cargo run --features tch-backend --bin train -- --module dann --modality ct+mr --cuda
//! cargo run --features tch-backend --bin train -- --dry-run --dev
//! ```

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use medseg_dann::config::{
    DataSource, LossKind, ModalitySelection, ModuleKind, OptimizerKind, RunMode, TrainData, TrainingConfig,
};
use medseg_dann::run::run;

/// Command-line arguments for the training binary.
#[derive(Parser, Debug)]
#[command(
    name = "train",
    version,
    about = "Domain-adversarial CT/MR segmentation training",
    long_about = None
)]
struct Args {
    /// Path to the JSON configuration file.
    ///
    /// If not provided, the default `TrainingConfig` is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the dataset root from the config.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Override the checkpoint directory from the config.
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Checkpoint directory to load before training or testing.
    #[arg(long, value_name = "DIR")]
    pretrained: Option<PathBuf>,

    /// `train` or `test`.
    #[arg(long)]
    mode: Option<RunMode>,

    /// `segmentation` or `dann`.
    #[arg(long)]
    module: Option<ModuleKind>,

    /// `ct`, `mr` or `ct+mr`.
    #[arg(long)]
    modality: Option<ModalitySelection>,

    /// Train on annotation-masked labels.
    #[arg(long, default_value_t = false)]
    masked: bool,

    /// `all` or `split`.
    #[arg(long)]
    train_data: Option<TrainData>,

    /// `dice2` or `tal`.
    #[arg(long)]
    loss: Option<LossKind>,

    /// `Adam`, `AdamW` or `SGD`.
    #[arg(long)]
    optimizer: Option<OptimizerKind>,

    /// Learning rate.
    #[arg(long)]
    lr: Option<f64>,

    /// Total optimisation steps.
    #[arg(long)]
    max_iter: Option<usize>,

    /// Validate every N steps.
    #[arg(long)]
    eval_step: Option<usize>,

    /// Volumes per batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Enable CUDA training (overrides config `use_gpu`).
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// Request deterministic kernels.
    #[arg(long, default_value_t = false)]
    deterministic: bool,

    /// Development mode: 10 steps, truncated datasets, output under `debug`.
    #[arg(long, default_value_t = false)]
    dev: bool,

    /// Use deterministic synthetic phantoms instead of real data.
    ///
    /// This is intended for pipeline smoke-tests only.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Number of synthetic cases per modality and stage when `--dry-run` is active.
    #[arg(long, default_value_t = 64)]
    dry_run_samples: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(self, config: &mut TrainingConfig) {
        if let Some(root) = self.data_dir {
            config.data = DataSource::Directory { root };
        }
        if self.dry_run {
            config.data = DataSource::Synthetic { cases: self.dry_run_samples, spatial: [32, 32, 32] };
        }
        if let Some(dir) = self.checkpoint_dir {
            config.checkpoint_dir = dir;
        }
        if self.pretrained.is_some() {
            config.pretrained = self.pretrained;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(module) = self.module {
            config.module = module;
        }
        if let Some(modality) = self.modality {
            config.modality = modality;
        }
        if let Some(train_data) = self.train_data {
            config.train_data = train_data;
        }
        if let Some(loss) = self.loss {
            config.loss = loss;
        }
        if let Some(optimizer) = self.optimizer {
            config.optimizer = optimizer;
        }
        if let Some(lr) = self.lr {
            config.learning_rate = lr;
        }
        if let Some(n) = self.max_iter {
            config.max_iter = n;
        }
        if let Some(n) = self.eval_step {
            config.eval_step = n;
        }
        if let Some(n) = self.batch_size {
            config.batch_size = n;
        }
        config.masked |= self.masked;
        config.use_gpu |= self.cuda;
        config.deterministic |= self.deterministic;
        config.dev |= self.dev;
    }
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("Cross-modality segmentation training v{}", medseg_dann::VERSION);

    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            match TrainingConfig::from_json(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("No configuration file provided, using defaults");
            TrainingConfig::default()
        }
    };

    if args.dry_run {
        info!("DRY RUN: synthetic phantoms ({} cases per stage)", args.dry_run_samples);
    }
    args.apply(&mut config);

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    info!("Configuration validated successfully");
    info!("  mode         : {:?}", config.mode);
    info!("  module       : {:?}", config.module);
    info!("  modality     : {}", config.modality);
    info!("  masked       : {}", config.masked);
    info!("  loss         : {}", config.loss);
    info!("  optimizer    : {} (lr = {})", config.optimizer, config.learning_rate);
    info!("  max iter     : {} (eval every {})", config.max_iter, config.eval_step);
    info!("  batch size   : {}", config.batch_size);
    info!("  device       : {}", if config.use_gpu { "GPU" } else { "CPU" });

    match run(config) {
        Ok(outcome) => {
            if let Some(summary) = &outcome.summary {
                info!(
                    "Training finished: {} steps, best {:.7}, {} checkpoint(s)",
                    summary.steps,
                    summary.best_metric,
                    summary.saved_at_steps.len()
                );
            }
            if let Some(report) = &outcome.test_report {
                info!("Test: {}", report.summary());
            }
            info!("Run directory: {}", outcome.run_dir.display());
        }
        Err(e) => {
            error!("Run failed: {e}");
            std::process::exit(1);
        }
    }
}
