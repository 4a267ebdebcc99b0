//! Fabula: a decoder-only transformer language model from scratch
//!
//! A causal transformer trained on the CPU with hand-written backward
//! passes: token and position embeddings, multi-head causal self-attention,
//! pre-norm residual blocks, a teacher-forced AdamW training loop, and
//! autoregressive sampling.
//!
//! The crate starts and ends at token ids. Tokenization, dataset
//! acquisition, checkpoint encoding, and plotting belong to external
//! collaborators: batches come in through [`BatchStream`], losses go out as
//! [`EpochStats`] records, and the parameter set is exposed as a named
//! mapping via [`LanguageModel::named_parameters`].
//!
//! # Example
//!
//! ```rust,no_run
//! use fabula::{
//!     train_val_split, LanguageModel, ModelConfig, TokenDataset, Trainer, TrainerConfig,
//! };
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! // Token ids from an external tokenizer
//! let tokens: Vec<usize> = std::fs::read_to_string("tokens.txt")
//!     .unwrap()
//!     .split_whitespace()
//!     .map(|t| t.parse().unwrap())
//!     .collect();
//! let (train_tokens, val_tokens) = train_val_split(&tokens, 0.1);
//!
//! let model_config = ModelConfig::tiny(512);
//! let trainer_config = TrainerConfig::default();
//!
//! let mut rng = StdRng::seed_from_u64(trainer_config.seed);
//! let model = LanguageModel::new(&model_config, &mut rng).unwrap();
//!
//! let mut train_stream = TokenDataset::new(train_tokens, 64, trainer_config.batch_size);
//! let mut eval_stream = TokenDataset::new(val_tokens, 64, trainer_config.batch_size);
//!
//! let mut trainer = Trainer::new(model, trainer_config);
//! let stats = trainer.train(&mut train_stream, &mut eval_stream).unwrap();
//! println!("final eval loss: {}", stats.last().unwrap().eval_loss);
//!
//! let sampled = trainer.model().generate(&[1, 2, 3], 32, &mut rng);
//! println!("{sampled:?}");
//! ```

pub mod config;
pub mod gradients;
pub mod layers;
pub mod logger;
pub mod model;
pub mod optimizer;
pub mod tensor;
pub mod trainer;

pub use config::{Device, ModelConfig, TrainerConfig};
pub use gradients::{clip_gradients, grad_norm};
pub use layers::Mode;
pub use logger::TrainingLogger;
pub use model::{cross_entropy_mean, LanguageModel, ModelCache, ModelGradients};
pub use optimizer::AdamW;
pub use tensor::Tensor;
pub use trainer::{train_val_split, BatchStream, EpochStats, TokenBatch, TokenDataset, Trainer};
