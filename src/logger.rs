//! Training Metrics Logger
//!
//! Writes one CSV row per epoch so a run can be analyzed after the fact.
//! Columns: epoch, elapsed seconds, train loss, eval loss, and the
//! perplexities `exp(loss)` of both. Perplexity reads as "how many tokens
//! the model is effectively choosing between": 1.0 for a perfect model,
//! the vocabulary size for uniform guessing.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

/// CSV logger for per-epoch training records.
pub struct TrainingLogger {
    log_file: File,
    start_time: Instant,
}

impl TrainingLogger {
    /// Create the CSV file and write its header.
    pub fn new<P: AsRef<Path>>(log_path: P) -> std::io::Result<Self> {
        let mut log_file = File::create(log_path)?;
        writeln!(
            log_file,
            "epoch,elapsed_seconds,train_loss,eval_loss,train_perplexity,eval_perplexity"
        )?;
        Ok(Self {
            log_file,
            start_time: Instant::now(),
        })
    }

    /// Append one epoch record and flush, so a crashed run keeps its rows.
    pub fn log_epoch(
        &mut self,
        epoch: usize,
        train_loss: f32,
        eval_loss: f32,
    ) -> std::io::Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        writeln!(
            self.log_file,
            "{},{:.2},{:.4},{:.4},{:.2},{:.2}",
            epoch,
            elapsed,
            train_loss,
            eval_loss,
            train_loss.exp(),
            eval_loss.exp()
        )?;
        self.log_file.flush()
    }
}
