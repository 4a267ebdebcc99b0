//! Model and Training Configuration
//!
//! All hyperparameters live in explicit configuration structs handed to
//! constructors; no component reads ambient or global state. Configuration
//! errors are rejected when a model is built, not discovered mid-training.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Architecture hyperparameters for the language model.
///
/// # Fields
///
/// - `vocab_size`: number of token ids the model can embed and predict
/// - `embedding_width`: width of the residual stream
/// - `context_length`: maximum sequence length the causal mask covers
/// - `n_layers`: number of transformer blocks
/// - `n_heads`: attention heads per block (`embedding_width` must divide evenly)
/// - `dropout_rate`: probability of dropping an activation during training
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embedding_width: usize,
    pub context_length: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub dropout_rate: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50257,
            embedding_width: 512,
            context_length: 128,
            n_layers: 6,
            n_heads: 8,
            dropout_rate: 0.1,
        }
    }
}

impl ModelConfig {
    /// Width of a single attention head.
    pub fn head_width(&self) -> usize {
        self.embedding_width / self.n_heads
    }

    /// Check the invariants a model construction relies on.
    ///
    /// Called by `LanguageModel::new`; callers building configs by hand can
    /// use it to fail early.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.vocab_size > 0, "vocab_size must be positive");
        ensure!(self.embedding_width > 0, "embedding_width must be positive");
        ensure!(self.context_length > 0, "context_length must be positive");
        ensure!(self.n_layers > 0, "n_layers must be positive");
        ensure!(self.n_heads > 0, "n_heads must be positive");
        ensure!(
            self.embedding_width % self.n_heads == 0,
            "embedding_width ({}) must be divisible by n_heads ({})",
            self.embedding_width,
            self.n_heads
        );
        ensure!(
            (0.0..1.0).contains(&self.dropout_rate),
            "dropout_rate must be in [0, 1), got {}",
            self.dropout_rate
        );
        Ok(())
    }

    /// A tiny configuration for tests and quick experiments.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            embedding_width: 16,
            context_length: 32,
            n_layers: 2,
            n_heads: 2,
            dropout_rate: 0.1,
        }
    }
}

/// Execution backend selector.
///
/// `Cpu` runs on the Rayon thread pool and is the only implemented backend;
/// the selector exists so callers configure the device explicitly rather
/// than the model assuming one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
}

/// Hyperparameters for the training loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// AdamW learning rate
    pub learning_rate: f32,
    /// Decoupled weight decay, applied to weight matrices only
    pub weight_decay: f32,
    /// Number of passes over the training stream
    pub epochs: usize,
    /// Sequences per batch, consumed by the data stream
    pub batch_size: usize,
    /// Log the running batch loss every N batches
    pub report_every: usize,
    /// Clip the global gradient norm to this value; `None` disables clipping
    pub grad_clip: Option<f32>,
    /// Execution backend
    pub device: Device,
    /// Seed for initialization, dropout, and sampling
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            weight_decay: 0.1,
            epochs: 1,
            batch_size: 8,
            report_every: 100,
            grad_clip: Some(1.0),
            device: Device::Cpu,
            seed: 42,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ModelConfig::default().validate().is_ok());
        assert!(ModelConfig::tiny(512).validate().is_ok());
    }

    #[test]
    fn test_head_split_must_divide() {
        let config = ModelConfig {
            embedding_width: 10,
            n_heads: 3,
            ..ModelConfig::tiny(64)
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("divisible"), "unexpected error: {err}");
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let config = ModelConfig {
            vocab_size: 0,
            ..ModelConfig::tiny(64)
        };
        assert!(config.validate().is_err());

        let config = ModelConfig {
            n_layers: 0,
            ..ModelConfig::tiny(64)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dropout_range_rejected() {
        let config = ModelConfig {
            dropout_rate: 1.0,
            ..ModelConfig::tiny(64)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_head_width() {
        let config = ModelConfig {
            embedding_width: 8,
            n_heads: 2,
            ..ModelConfig::tiny(10)
        };
        assert_eq!(config.head_width(), 4);
    }
}
