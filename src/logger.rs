//! Run logger: scalar events for TensorBoard plus a plain-text `train.log`.
//!
//! Every scalar goes to both sinks. The text file gets one line per event:
//!
//! ```text
//! 2024-03-05 07:08:09 | Step 499 | train/DiceCELoss = 0.734211
//! 2024-03-05 07:09:40 | Step 499 | val/DiceMetric:CT = 0.512000
//! 2024-03-05 07:09:40 | Model saved! Validation: (New) 0.5120 > (Old) 0.0000
//! ```
//!
//! Status messages are also forwarded to `tracing`.

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use tensorboard_rs::summary_writer::SummaryWriter;
use tracing::{info, warn};

use crate::error::TrainResult;
use crate::metrics::ValidationReport;

/// File name of the text log inside the run directory.
pub const LOG_FILE: &str = "train.log";

/// Prefix of training-loss tags.
pub const TRAIN_PREFIX: &str = "train";

/// Prefix of validation-metric tags.
pub const VAL_PREFIX: &str = "val";

/// `prefix/metric`, with `:suffix` appended when given.
pub fn metric_tag(metric: &str, prefix: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(s) => format!("{prefix}/{metric}:{s}"),
        None => format!("{prefix}/{metric}"),
    }
}

/// Scalar and message sink for one run directory.
pub struct TrainLogger {
    run_dir: PathBuf,
    file: LineWriter<File>,
    writer: SummaryWriter,
}

impl TrainLogger {
    /// Open (append) `train.log` and a TensorBoard writer in `run_dir`,
    /// creating the directory if needed.
    pub fn new(run_dir: &Path) -> TrainResult<Self> {
        std::fs::create_dir_all(run_dir)?;
        let file = OpenOptions::new().create(true).append(true).open(run_dir.join(LOG_FILE))?;
        let writer = SummaryWriter::new(run_dir);
        Ok(TrainLogger { run_dir: run_dir.to_path_buf(), file: LineWriter::new(file), writer })
    }

    /// The run directory.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn write_line(&mut self, line: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Err(e) = writeln!(self.file, "{stamp} | {line}") {
            warn!("Failed to write {}: {e}", LOG_FILE);
        }
    }

    /// Record one scalar under `tag`.
    pub fn scalar(&mut self, tag: &str, value: f64, step: usize) {
        self.writer.add_scalar(tag, value as f32, step);
        self.write_line(&format!("Step {step} | {tag} = {value:.6}"));
    }

    /// Record a training loss as `train/<name>`.
    pub fn log_train(&mut self, name: &str, value: f64, step: usize) {
        self.scalar(&metric_tag(name, TRAIN_PREFIX, None), value, step);
    }

    /// Record every entry of a validation report as
    /// `val/<metric>:<Average|CT|MR>`.
    pub fn log_val(&mut self, metric: &str, report: &ValidationReport, step: usize) {
        for (suffix, value) in report.entries() {
            self.scalar(&metric_tag(metric, VAL_PREFIX, Some(suffix)), value, step);
        }
    }

    /// Status message, logged at `INFO` and written to the text log.
    pub fn info(&mut self, message: &str) {
        info!("{message}");
        self.write_line(message);
    }

    /// Checkpoint notice. Same sinks as [`info`](Self::info).
    pub fn success(&mut self, message: &str) {
        info!(target: "checkpoint", "{message}");
        self.write_line(message);
    }

    /// Flush both sinks.
    pub fn flush(&mut self) {
        self.writer.flush();
        if let Err(e) = self.file.flush() {
            warn!("Failed to flush {}: {e}", LOG_FILE);
        }
    }
}

impl Drop for TrainLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tags() {
        assert_eq!(metric_tag("DiceCELoss", TRAIN_PREFIX, None), "train/DiceCELoss");
        assert_eq!(metric_tag("DiceMetric", VAL_PREFIX, Some("CT")), "val/DiceMetric:CT");
    }

    #[test]
    fn writes_text_log() {
        let tmp = TempDir::new().unwrap();
        let run = tmp.path().join("run");
        {
            let mut logger = TrainLogger::new(&run).unwrap();
            logger.log_train("seg_loss", 0.5, 3);
            logger.log_val("DiceMetric", &ValidationReport::dual(0.4, 0.6, 0.5), 3);
            logger.success("Model saved!");
        }
        let text = std::fs::read_to_string(run.join(LOG_FILE)).unwrap();
        assert!(text.contains("Step 3 | train/seg_loss = 0.500000"));
        assert!(text.contains("val/DiceMetric:Average = 0.500000"));
        assert!(text.contains("val/DiceMetric:CT = 0.400000"));
        assert!(text.contains("val/DiceMetric:MR = 0.600000"));
        assert!(text.lines().last().unwrap().ends_with("Model saved!"));
    }
}
