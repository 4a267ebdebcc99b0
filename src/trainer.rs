//! Training Loop and Data Streams
//!
//! The [`Trainer`] drives epochs over a [`BatchStream`]: every batch window
//! becomes a teacher-forced `(inputs, targets)` pair with the targets
//! shifted one position to the right, runs forward and backward through the
//! model, and applies one AdamW step. After each epoch an evaluation pass
//! runs over a held-out stream with dropout inert and no parameter updates.
//!
//! ## How training pairs are derived
//!
//! ```text
//! window:  [5, 2, 9, 1]
//! inputs:  [5, 2, 9]      window[..len-1]
//! targets: [2, 9, 1]      window[1..]
//! ```
//!
//! ## Data boundary
//!
//! The trainer consumes token ids only. Where those ids come from (files,
//! an external tokenizer, a download step) is a collaborator's concern;
//! [`TokenDataset`] adapts an in-memory token slice into the stream shape.

use crate::config::TrainerConfig;
use crate::gradients::clip_gradients;
use crate::layers::Mode;
use crate::logger::TrainingLogger;
use crate::model::LanguageModel;
use crate::optimizer::AdamW;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};
use tracing::info;

/// One batch at the data boundary.
///
/// `input_ids` and `attention_mask` have identical `[batch, len]` shape and
/// a fixed length per batch. The mask marks valid (non-pad) positions; it
/// travels with the batch but is not consumed by the model forward pass,
/// and the loss is computed over all positions. A padding-aware loss would
/// start by consuming this field.
pub struct TokenBatch {
    pub input_ids: Vec<Vec<usize>>,
    pub attention_mask: Vec<Vec<u8>>,
}

/// A resettable stream of token batches.
pub trait BatchStream {
    /// The next batch, or `None` when the stream is exhausted for this
    /// epoch. Returning `None` rewinds the stream for the next epoch.
    fn next_batch(&mut self) -> Option<TokenBatch>;

    /// Rewind to the beginning.
    fn reset(&mut self);
}

/// In-memory batch stream over a token slice.
///
/// Cuts the tokens into consecutive non-overlapping windows of `seq_len`
/// and groups them `batch_size` at a time.
pub struct TokenDataset {
    tokens: Vec<usize>,
    seq_len: usize,
    batch_size: usize,
    position: usize,
}

impl TokenDataset {
    /// Create a dataset over already-tokenized data.
    ///
    /// `seq_len` must be at least 2 so a window can be split into an
    /// input and a shifted target.
    pub fn new(tokens: &[usize], seq_len: usize, batch_size: usize) -> Self {
        assert!(seq_len >= 2, "seq_len must be at least 2, got {seq_len}");
        assert!(batch_size > 0, "batch_size must be positive");
        Self {
            tokens: tokens.to_vec(),
            seq_len,
            batch_size,
            position: 0,
        }
    }

    /// Number of full batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.tokens.len() / (self.batch_size * self.seq_len)
    }
}

impl BatchStream for TokenDataset {
    fn next_batch(&mut self) -> Option<TokenBatch> {
        let mut input_ids = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            if self.position + self.seq_len > self.tokens.len() {
                break;
            }
            input_ids.push(self.tokens[self.position..self.position + self.seq_len].to_vec());
            self.position += self.seq_len;
        }

        if input_ids.is_empty() {
            self.position = 0;
            return None;
        }

        let attention_mask = input_ids.iter().map(|row| vec![1u8; row.len()]).collect();
        Some(TokenBatch {
            input_ids,
            attention_mask,
        })
    }

    fn reset(&mut self) {
        self.position = 0;
    }
}

/// Split tokens into training and validation slices.
///
/// The validation slice is the tail of the data, keeping the split
/// temporally clean for sequential text.
///
/// ```rust
/// use fabula::train_val_split;
///
/// let tokens = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
/// let (train, val) = train_val_split(&tokens, 0.2);
/// assert_eq!(train.len(), 8);
/// assert_eq!(val.len(), 2);
/// ```
pub fn train_val_split(tokens: &[usize], val_fraction: f32) -> (&[usize], &[usize]) {
    let split_idx = ((tokens.len() as f32) * (1.0 - val_fraction)) as usize;
    (&tokens[..split_idx], &tokens[split_idx..])
}

/// Per-epoch training record.
#[derive(Clone, Copy, Debug)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f32,
    pub eval_loss: f32,
    pub duration: Duration,
}

/// Drives the epoch/batch training sequence for a model.
pub struct Trainer {
    model: LanguageModel,
    optimizer: AdamW,
    config: TrainerConfig,
    rng: StdRng,
    logger: Option<TrainingLogger>,
}

impl Trainer {
    pub fn new(model: LanguageModel, config: TrainerConfig) -> Self {
        let optimizer = AdamW::new(&model);
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            model,
            optimizer,
            config,
            rng,
            logger: None,
        }
    }

    /// Attach a CSV logger that receives each epoch record.
    pub fn with_logger(mut self, logger: TrainingLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn model(&self) -> &LanguageModel {
        &self.model
    }

    /// Hand the trained model back to the caller.
    pub fn into_model(self) -> LanguageModel {
        self.model
    }

    /// Run the configured number of epochs.
    ///
    /// Per batch: derive the shifted `(inputs, targets)` pair, forward,
    /// backward, optional gradient clipping, one optimizer step. Per epoch:
    /// an evaluation pass over `eval_stream` with no parameter updates,
    /// then an [`EpochStats`] record. Batch losses are logged at the
    /// configured `report_every` cadence.
    ///
    /// The only error source is the attached logger's file I/O.
    pub fn train(
        &mut self,
        train_stream: &mut dyn BatchStream,
        eval_stream: &mut dyn BatchStream,
    ) -> std::io::Result<Vec<EpochStats>> {
        info!(
            epochs = self.config.epochs,
            device = ?self.config.device,
            "starting training"
        );

        let mut stats = Vec::with_capacity(self.config.epochs);
        for epoch in 0..self.config.epochs {
            let start = Instant::now();
            let mut total_loss = 0.0;
            let mut batches = 0usize;

            while let Some(batch) = train_stream.next_batch() {
                let (inputs, targets) = shift_targets(&batch);
                let (logits, loss, cache) =
                    self.model
                        .forward(&inputs, Some(&targets), Mode::Train, &mut self.rng);
                let loss = loss.expect("targets were supplied");

                let mut grads = self.model.backward(&logits, &targets, &cache);
                if let Some(max_norm) = self.config.grad_clip {
                    clip_gradients(&mut grads, max_norm);
                }
                self.optimizer.step(
                    &mut self.model,
                    &grads,
                    self.config.learning_rate,
                    self.config.weight_decay,
                );

                total_loss += loss;
                batches += 1;
                if self.config.report_every > 0 && batches % self.config.report_every == 0 {
                    info!(epoch, batch = batches, loss, "training batch");
                }
            }

            let train_loss = if batches > 0 {
                total_loss / batches as f32
            } else {
                0.0
            };
            let eval_loss = self.evaluate(eval_stream);
            let duration = start.elapsed();

            info!(
                epoch,
                train_loss,
                eval_loss,
                seconds = duration.as_secs_f32(),
                "epoch complete"
            );
            if let Some(logger) = &mut self.logger {
                logger.log_epoch(epoch, train_loss, eval_loss)?;
            }

            stats.push(EpochStats {
                epoch,
                train_loss,
                eval_loss,
                duration,
            });
        }

        Ok(stats)
    }

    /// Mean loss over a stream with gradients and dropout disabled.
    ///
    /// Parameters are untouched; this is safe to call mid-training.
    pub fn evaluate(&mut self, stream: &mut dyn BatchStream) -> f32 {
        let mut total = 0.0;
        let mut batches = 0usize;
        while let Some(batch) = stream.next_batch() {
            let (inputs, targets) = shift_targets(&batch);
            let (_, loss, _) =
                self.model
                    .forward(&inputs, Some(&targets), Mode::Eval, &mut self.rng);
            total += loss.expect("targets were supplied");
            batches += 1;
        }
        if batches > 0 {
            total / batches as f32
        } else {
            0.0
        }
    }
}

/// Teacher forcing: targets are the window shifted one to the right, both
/// truncated to `len - 1`.
fn shift_targets(batch: &TokenBatch) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
    let inputs = batch
        .input_ids
        .iter()
        .map(|row| {
            assert!(row.len() >= 2, "Windows must hold at least 2 tokens");
            row[..row.len() - 1].to_vec()
        })
        .collect();
    let targets = batch
        .input_ids
        .iter()
        .map(|row| row[1..].to_vec())
        .collect();
    (inputs, targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn tiny_model(seed: u64) -> LanguageModel {
        let config = ModelConfig {
            vocab_size: 10,
            embedding_width: 8,
            context_length: 8,
            n_layers: 1,
            n_heads: 2,
            dropout_rate: 0.1,
        };
        let mut rng = StdRng::seed_from_u64(seed);
        LanguageModel::new(&config, &mut rng).unwrap()
    }

    fn cyclic_tokens(len: usize) -> Vec<usize> {
        (0..len).map(|i| i % 10).collect()
    }

    fn quick_config() -> TrainerConfig {
        TrainerConfig {
            epochs: 1,
            batch_size: 2,
            report_every: 0,
            ..TrainerConfig::default()
        }
    }

    #[test]
    fn test_shift_targets() {
        let batch = TokenBatch {
            input_ids: vec![vec![5, 2, 9, 1]],
            attention_mask: vec![vec![1; 4]],
        };
        let (inputs, targets) = shift_targets(&batch);
        assert_eq!(inputs, vec![vec![5, 2, 9]]);
        assert_eq!(targets, vec![vec![2, 9, 1]]);
    }

    #[test]
    fn test_dataset_windows_and_rewind() {
        let tokens: Vec<usize> = (0..20).collect();
        let mut dataset = TokenDataset::new(&tokens, 4, 2);
        assert_eq!(dataset.num_batches(), 2);

        let first = dataset.next_batch().unwrap();
        assert_eq!(first.input_ids, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
        assert_eq!(first.attention_mask, vec![vec![1; 4], vec![1; 4]]);

        let second = dataset.next_batch().unwrap();
        assert_eq!(second.input_ids[0], vec![8, 9, 10, 11]);

        // 4 tokens remain, enough for one more window
        let third = dataset.next_batch().unwrap();
        assert_eq!(third.input_ids.len(), 1);

        // Exhausted; the stream rewinds itself
        assert!(dataset.next_batch().is_none());
        let again = dataset.next_batch().unwrap();
        assert_eq!(again.input_ids[0], vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_dataset_reset_rewinds() {
        let tokens: Vec<usize> = (0..12).collect();
        let mut dataset = TokenDataset::new(&tokens, 4, 1);
        let first = dataset.next_batch().unwrap();
        dataset.next_batch().unwrap();
        dataset.reset();
        let again = dataset.next_batch().unwrap();
        assert_eq!(first.input_ids, again.input_ids);
    }

    #[test]
    fn test_train_val_split_fractions() {
        let tokens: Vec<usize> = (0..100).collect();
        let (train, val) = train_val_split(&tokens, 0.1);
        assert_eq!(train.len(), 90);
        assert_eq!(val.len(), 10);
        assert_eq!(val[0], 90);
    }

    #[test]
    fn test_one_epoch_produces_stats() {
        let tokens = cyclic_tokens(120);
        let (train_tokens, val_tokens) = train_val_split(&tokens, 0.2);
        let mut train_stream = TokenDataset::new(train_tokens, 5, 2);
        let mut eval_stream = TokenDataset::new(val_tokens, 5, 2);

        let mut trainer = Trainer::new(tiny_model(0), quick_config());
        let stats = trainer.train(&mut train_stream, &mut eval_stream).unwrap();

        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].epoch, 0);
        assert!(stats[0].train_loss.is_finite() && stats[0].train_loss >= 0.0);
        assert!(stats[0].eval_loss.is_finite() && stats[0].eval_loss >= 0.0);
    }

    #[test]
    fn test_evaluate_leaves_parameters_untouched() {
        let tokens = cyclic_tokens(60);
        let mut stream = TokenDataset::new(&tokens, 5, 2);
        let mut trainer = Trainer::new(tiny_model(1), quick_config());

        let before: Vec<Vec<f32>> = trainer
            .model()
            .named_parameters()
            .iter()
            .map(|(_, t)| t.data.clone())
            .collect();

        let loss = trainer.evaluate(&mut stream);
        assert!(loss.is_finite());

        let after: Vec<Vec<f32>> = trainer
            .model()
            .named_parameters()
            .iter()
            .map(|(_, t)| t.data.clone())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_training_changes_parameters() {
        let tokens = cyclic_tokens(120);
        let mut train_stream = TokenDataset::new(&tokens, 5, 2);
        let mut eval_stream = TokenDataset::new(&tokens[..30], 5, 2);
        let mut trainer = Trainer::new(tiny_model(2), quick_config());

        let before = trainer.model().named_parameters()[0].1.data.clone();
        trainer.train(&mut train_stream, &mut eval_stream).unwrap();
        let after = &trainer.model().named_parameters()[0].1.data;
        assert_ne!(&before, after);
    }
}
