//! Language Model
//!
//! The full decoder-only model: token and position embeddings feed a stack
//! of pre-norm transformer blocks, a final layer norm, and a weight-only
//! projection to vocabulary logits.
//!
//! ```text
//! token ids [batch, seq]
//!     |  token embedding + position embedding
//!     v
//! residual stream [batch, seq, E]
//!     |  block 1 .. block N   (strictly sequential)
//!     v
//! LayerNorm -> lm_head -> logits [batch, seq, vocab]
//! ```
//!
//! Training uses the hand-written backward passes of every layer; there is
//! no autograd. `forward` optionally computes the mean cross-entropy loss
//! against a target batch, `backward` walks the stack in reverse and
//! scatter-adds into the embedding tables, and `generate` samples new
//! tokens autoregressively with a sliding context window.
//!
//! ## Initialization policy
//!
//! Every linear and embedding weight matrix is drawn from N(0, 0.02);
//! every bias starts at exactly zero; LayerNorm starts at gamma = 1,
//! beta = 0. One rule, applied uniformly.

use crate::config::ModelConfig;
use crate::layers::{
    normal_init, BlockCache, BlockGradients, LayerNorm, LayerNormCache, Mode, TransformerBlock,
};
use crate::tensor::Tensor;
use anyhow::Result;
use rand::rngs::StdRng;
use rand_distr::weighted::WeightedIndex;
use rand_distr::Distribution;
use tracing::warn;

/// Decoder-only causal transformer language model.
pub struct LanguageModel {
    pub(crate) token_embedding: Tensor,
    pub(crate) position_embedding: Tensor,
    pub(crate) blocks: Vec<TransformerBlock>,
    pub(crate) ln_final: LayerNorm,
    /// Output projection `[embedding_width, vocab_size]`, no bias
    pub(crate) lm_head: Tensor,
    config: ModelConfig,
}

impl LanguageModel {
    /// Build a model from a validated configuration.
    ///
    /// Rejects invalid configurations (head split, zero dimensions) before
    /// any allocation. All randomness comes from the caller's seeded RNG.
    pub fn new(config: &ModelConfig, rng: &mut StdRng) -> Result<Self> {
        config.validate()?;

        let vocab_size = config.vocab_size;
        let width = config.embedding_width;

        let token_embedding = Tensor::new(
            normal_init(vocab_size * width, rng),
            vec![vocab_size, width],
        );
        let position_embedding = Tensor::new(
            normal_init(config.context_length * width, rng),
            vec![config.context_length, width],
        );

        let blocks = (0..config.n_layers)
            .map(|_| TransformerBlock::new(config, rng))
            .collect();

        let lm_head = Tensor::new(normal_init(width * vocab_size, rng), vec![width, vocab_size]);

        Ok(Self {
            token_embedding,
            position_embedding,
            blocks,
            ln_final: LayerNorm::new(width),
            lm_head,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Forward pass over a batch of token-id sequences.
    ///
    /// Returns the `[batch, seq, vocab]` logits, the mean cross-entropy
    /// loss when `targets` is given, and the cache needed by [`backward`].
    ///
    /// Sequences longer than `context_length` are truncated to their first
    /// `context_length` ids; the truncation is surfaced as a warning event,
    /// not an error.
    ///
    /// The loss averages over every position of every sequence jointly.
    /// Padded positions are not masked out; callers feeding padded batches
    /// see the pad token weighted into the loss.
    ///
    /// [`backward`]: LanguageModel::backward
    pub fn forward(
        &self,
        input_ids: &[Vec<usize>],
        targets: Option<&[Vec<usize>]>,
        mode: Mode,
        rng: &mut StdRng,
    ) -> (Tensor, Option<f32>, ModelCache) {
        assert!(!input_ids.is_empty(), "Empty batch");
        let seq_len = input_ids[0].len();
        assert!(seq_len > 0, "Empty sequence");
        assert!(
            input_ids.iter().all(|row| row.len() == seq_len),
            "All sequences in a batch must share one length"
        );

        let context_length = self.config.context_length;
        let (input_ids, targets) = if seq_len > context_length {
            warn!(
                seq_len,
                context_length, "Truncating over-long sequences to the context length"
            );
            let inputs: Vec<Vec<usize>> = input_ids
                .iter()
                .map(|row| row[..context_length].to_vec())
                .collect();
            let targets: Option<Vec<Vec<usize>>> = targets.map(|t| {
                t.iter().map(|row| row[..context_length].to_vec()).collect()
            });
            (inputs, targets)
        } else {
            (input_ids.to_vec(), targets.map(|t| t.to_vec()))
        };

        let mut x = self.embed(&input_ids);

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (x_next, cache) = block.forward(&x, mode, rng);
            block_caches.push(cache);
            x = x_next;
        }

        let (x_normed, ln_final_cache) = self.ln_final.forward(&x);
        let logits = x_normed.matmul(&self.lm_head);

        let loss = targets.as_ref().map(|targets| {
            assert_eq!(
                targets.len(),
                input_ids.len(),
                "Targets must match the batch size"
            );
            let flat = flatten_ids(targets);
            cross_entropy_mean(&logits, &flat)
        });

        let cache = ModelCache {
            input_ids,
            block_caches,
            ln_final_cache,
            x_normed,
        };

        (logits, loss, cache)
    }

    /// Sum of token and position embeddings, `[batch, seq, E]`.
    ///
    /// Out-of-range token ids are clamped to the last vocabulary entry.
    fn embed(&self, input_ids: &[Vec<usize>]) -> Tensor {
        let batch = input_ids.len();
        let seq_len = input_ids[0].len();
        let width = self.config.embedding_width;
        let vocab_size = self.config.vocab_size;

        let mut data = Vec::with_capacity(batch * seq_len * width);
        for row in input_ids {
            for (pos, &token_id) in row.iter().enumerate() {
                let token_id = token_id.min(vocab_size - 1);
                let tok = &self.token_embedding.data[token_id * width..(token_id + 1) * width];
                let p = &self.position_embedding.data[pos * width..(pos + 1) * width];
                data.extend(tok.iter().zip(p.iter()).map(|(t, p)| t + p));
            }
        }
        Tensor::new(data, vec![batch, seq_len, width])
    }

    /// Backward pass from the logits down to the embedding tables.
    pub fn backward(
        &self,
        logits: &Tensor,
        targets: &[Vec<usize>],
        cache: &ModelCache,
    ) -> ModelGradients {
        let vocab_size = self.config.vocab_size;
        let width = self.config.embedding_width;
        let flat_targets = flatten_ids(targets);
        let rows = flat_targets.len();
        assert_eq!(
            logits.data.len(),
            rows * vocab_size,
            "Logit and target shapes disagree"
        );

        // dL/dlogits for mean cross-entropy: softmax(row) minus the one-hot
        // target, divided by the number of positions.
        let probs = logits.reshape(&[rows, vocab_size]).softmax_last();
        let mut grad_logits = probs.data;
        for (r, &target) in flat_targets.iter().enumerate() {
            let target = target.min(vocab_size - 1);
            grad_logits[r * vocab_size + target] -= 1.0;
        }
        let inv = 1.0 / rows as f32;
        for g in grad_logits.iter_mut() {
            *g *= inv;
        }
        let grad_logits = Tensor::new(grad_logits, vec![rows, vocab_size]);

        // Output projection: logits = x_normed @ lm_head
        let x_normed_2d = cache.x_normed.reshape(&[rows, width]);
        let grad_lm_head = x_normed_2d.transpose_last().matmul(&grad_logits);
        let grad_x_normed = grad_logits
            .matmul(&self.lm_head.transpose_last())
            .reshape(&cache.x_normed.shape);

        let ln_final_grads = self.ln_final.backward(&grad_x_normed, &cache.ln_final_cache);
        let mut grad_x = ln_final_grads.x;

        // Blocks in reverse order
        let mut block_grads = Vec::with_capacity(self.blocks.len());
        for (block, block_cache) in self.blocks.iter().zip(&cache.block_caches).rev() {
            let grads = block.backward(&grad_x, block_cache);
            grad_x = grads.x.clone();
            block_grads.push(grads);
        }
        block_grads.reverse();

        // Scatter-add into the embedding tables
        let mut grad_token = vec![0.0; vocab_size * width];
        let mut grad_position = vec![0.0; self.config.context_length * width];
        for (b, row) in cache.input_ids.iter().enumerate() {
            let seq_len = row.len();
            for (pos, &token_id) in row.iter().enumerate() {
                let token_id = token_id.min(vocab_size - 1);
                let base = (b * seq_len + pos) * width;
                for i in 0..width {
                    let g = grad_x.data[base + i];
                    grad_token[token_id * width + i] += g;
                    grad_position[pos * width + i] += g;
                }
            }
        }

        ModelGradients {
            token_embedding: Tensor::new(grad_token, vec![vocab_size, width]),
            position_embedding: Tensor::new(
                grad_position,
                vec![self.config.context_length, width],
            ),
            blocks: block_grads,
            ln_final_gamma: ln_final_grads.gamma,
            ln_final_beta: ln_final_grads.beta,
            lm_head: grad_lm_head,
        }
    }

    /// Autoregressively sample `max_new_tokens` ids after the prefix.
    ///
    /// Runs entirely in eval mode: dropout is inert and no parameter is
    /// touched. Each iteration feeds the last `context_length` ids through
    /// the model, converts the final position's logits to a distribution
    /// with the same stable softmax used in attention, and draws one id by
    /// weighted sampling. Always appends exactly `max_new_tokens` ids; no
    /// end-of-sequence token stops the loop early.
    pub fn generate(
        &self,
        prefix: &[usize],
        max_new_tokens: usize,
        rng: &mut StdRng,
    ) -> Vec<usize> {
        assert!(!prefix.is_empty(), "Generation requires a non-empty prefix");

        let vocab_size = self.config.vocab_size;
        let mut tokens = prefix.to_vec();

        for _ in 0..max_new_tokens {
            let start = tokens.len().saturating_sub(self.config.context_length);
            let window = tokens[start..].to_vec();
            let seq_len = window.len();

            let (logits, _, _) = self.forward(&[window], None, Mode::Eval, rng);

            let last = &logits.data[(seq_len - 1) * vocab_size..seq_len * vocab_size];
            let max = last.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut probs: Vec<f32> = last.iter().map(|&x| (x - max).exp()).collect();
            let sum: f32 = probs.iter().sum();
            for p in probs.iter_mut() {
                *p /= sum;
            }

            let dist = WeightedIndex::new(&probs).expect("softmax yields a valid distribution");
            tokens.push(dist.sample(rng));
        }

        tokens
    }

    /// The full parameter set as a stable path -> tensor mapping.
    ///
    /// This is the persistence boundary: an external component serializes
    /// these however it likes. Paths and shapes are stable across calls for
    /// a given configuration.
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params: Vec<(String, &Tensor)> = Vec::new();
        params.push(("token_embedding".into(), &self.token_embedding));
        params.push(("position_embedding".into(), &self.position_embedding));
        for (i, block) in self.blocks.iter().enumerate() {
            params.push((format!("blocks.{i}.ln1.gamma"), &block.ln1.gamma));
            params.push((format!("blocks.{i}.ln1.beta"), &block.ln1.beta));
            for (h, head) in block.attn.heads.iter().enumerate() {
                params.push((
                    format!("blocks.{i}.attn.heads.{h}.key.weight"),
                    &head.key.weight,
                ));
                params.push((
                    format!("blocks.{i}.attn.heads.{h}.query.weight"),
                    &head.query.weight,
                ));
                params.push((
                    format!("blocks.{i}.attn.heads.{h}.value.weight"),
                    &head.value.weight,
                ));
            }
            params.push((format!("blocks.{i}.attn.proj.weight"), &block.attn.proj.weight));
            params.push((
                format!("blocks.{i}.attn.proj.bias"),
                block
                    .attn
                    .proj
                    .bias
                    .as_ref()
                    .expect("combining projection carries a bias"),
            ));
            params.push((format!("blocks.{i}.ln2.gamma"), &block.ln2.gamma));
            params.push((format!("blocks.{i}.ln2.beta"), &block.ln2.beta));
            params.push((format!("blocks.{i}.ffwd.fc1.weight"), &block.ffwd.fc1.weight));
            params.push((
                format!("blocks.{i}.ffwd.fc1.bias"),
                block.ffwd.fc1.bias.as_ref().expect("fc1 carries a bias"),
            ));
            params.push((format!("blocks.{i}.ffwd.fc2.weight"), &block.ffwd.fc2.weight));
            params.push((
                format!("blocks.{i}.ffwd.fc2.bias"),
                block.ffwd.fc2.bias.as_ref().expect("fc2 carries a bias"),
            ));
        }
        params.push(("ln_final.gamma".into(), &self.ln_final.gamma));
        params.push(("ln_final.beta".into(), &self.ln_final.beta));
        params.push(("lm_head.weight".into(), &self.lm_head));
        params
    }

    /// Mutable parameter walk in the same order as [`named_parameters`],
    /// with the weight-decay eligibility of each parameter.
    ///
    /// Decay applies to weight matrices only: not to embeddings, biases, or
    /// LayerNorm parameters.
    ///
    /// [`named_parameters`]: LanguageModel::named_parameters
    pub(crate) fn parameters_mut(&mut self) -> Vec<(String, bool, &mut Tensor)> {
        let mut params: Vec<(String, bool, &mut Tensor)> = Vec::new();
        params.push(("token_embedding".into(), false, &mut self.token_embedding));
        params.push((
            "position_embedding".into(),
            false,
            &mut self.position_embedding,
        ));
        for (i, block) in self.blocks.iter_mut().enumerate() {
            params.push((format!("blocks.{i}.ln1.gamma"), false, &mut block.ln1.gamma));
            params.push((format!("blocks.{i}.ln1.beta"), false, &mut block.ln1.beta));
            for (h, head) in block.attn.heads.iter_mut().enumerate() {
                params.push((
                    format!("blocks.{i}.attn.heads.{h}.key.weight"),
                    true,
                    &mut head.key.weight,
                ));
                params.push((
                    format!("blocks.{i}.attn.heads.{h}.query.weight"),
                    true,
                    &mut head.query.weight,
                ));
                params.push((
                    format!("blocks.{i}.attn.heads.{h}.value.weight"),
                    true,
                    &mut head.value.weight,
                ));
            }
            params.push((
                format!("blocks.{i}.attn.proj.weight"),
                true,
                &mut block.attn.proj.weight,
            ));
            params.push((
                format!("blocks.{i}.attn.proj.bias"),
                false,
                block
                    .attn
                    .proj
                    .bias
                    .as_mut()
                    .expect("combining projection carries a bias"),
            ));
            params.push((format!("blocks.{i}.ln2.gamma"), false, &mut block.ln2.gamma));
            params.push((format!("blocks.{i}.ln2.beta"), false, &mut block.ln2.beta));
            params.push((
                format!("blocks.{i}.ffwd.fc1.weight"),
                true,
                &mut block.ffwd.fc1.weight,
            ));
            params.push((
                format!("blocks.{i}.ffwd.fc1.bias"),
                false,
                block.ffwd.fc1.bias.as_mut().expect("fc1 carries a bias"),
            ));
            params.push((
                format!("blocks.{i}.ffwd.fc2.weight"),
                true,
                &mut block.ffwd.fc2.weight,
            ));
            params.push((
                format!("blocks.{i}.ffwd.fc2.bias"),
                false,
                block.ffwd.fc2.bias.as_mut().expect("fc2 carries a bias"),
            ));
        }
        params.push(("ln_final.gamma".into(), false, &mut self.ln_final.gamma));
        params.push(("ln_final.beta".into(), false, &mut self.ln_final.beta));
        params.push(("lm_head.weight".into(), true, &mut self.lm_head));
        params
    }
}

/// Mean cross-entropy over flattened `(position, vocab)` rows.
///
/// Numerically stable log-softmax: the row maximum is factored out before
/// exponentiation. Uniform logits over a vocabulary of size V give exactly
/// `ln(V)`.
pub fn cross_entropy_mean(logits: &Tensor, targets: &[usize]) -> f32 {
    let vocab_size = logits.last_dim();
    assert_eq!(
        logits.data.len(),
        targets.len() * vocab_size,
        "Logit rows must match target count"
    );

    let mut total = 0.0;
    for (r, &target) in targets.iter().enumerate() {
        let row = &logits.data[r * vocab_size..(r + 1) * vocab_size];
        let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp_sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
        let target = target.min(vocab_size - 1);
        let log_prob = (row[target] - max) - exp_sum.ln();
        total -= log_prob;
    }
    total / targets.len() as f32
}

fn flatten_ids(rows: &[Vec<usize>]) -> Vec<usize> {
    rows.iter().flatten().copied().collect()
}

/// Cache for the model backward pass.
pub struct ModelCache {
    /// The (possibly truncated) input ids the forward actually consumed
    pub input_ids: Vec<Vec<usize>>,
    pub block_caches: Vec<BlockCache>,
    pub ln_final_cache: LayerNormCache,
    /// Residual stream after the final layer norm
    pub x_normed: Tensor,
}

/// Gradients for every model parameter.
pub struct ModelGradients {
    pub token_embedding: Tensor,
    pub position_embedding: Tensor,
    pub blocks: Vec<BlockGradients>,
    pub ln_final_gamma: Tensor,
    pub ln_final_beta: Tensor,
    pub lm_head: Tensor,
}

impl ModelGradients {
    /// Gradient walk in the canonical parameter order (see
    /// `LanguageModel::parameters_mut`).
    pub(crate) fn flatten(&self) -> Vec<(String, &Tensor)> {
        let mut grads: Vec<(String, &Tensor)> = Vec::new();
        grads.push(("token_embedding".into(), &self.token_embedding));
        grads.push(("position_embedding".into(), &self.position_embedding));
        for (i, block) in self.blocks.iter().enumerate() {
            grads.push((format!("blocks.{i}.ln1.gamma"), &block.ln1_gamma));
            grads.push((format!("blocks.{i}.ln1.beta"), &block.ln1_beta));
            for (h, head) in block.attn.heads.iter().enumerate() {
                grads.push((
                    format!("blocks.{i}.attn.heads.{h}.key.weight"),
                    &head.key_weight,
                ));
                grads.push((
                    format!("blocks.{i}.attn.heads.{h}.query.weight"),
                    &head.query_weight,
                ));
                grads.push((
                    format!("blocks.{i}.attn.heads.{h}.value.weight"),
                    &head.value_weight,
                ));
            }
            grads.push((format!("blocks.{i}.attn.proj.weight"), &block.attn.proj_weight));
            grads.push((format!("blocks.{i}.attn.proj.bias"), &block.attn.proj_bias));
            grads.push((format!("blocks.{i}.ln2.gamma"), &block.ln2_gamma));
            grads.push((format!("blocks.{i}.ln2.beta"), &block.ln2_beta));
            grads.push((format!("blocks.{i}.ffwd.fc1.weight"), &block.ffwd.fc1_weight));
            grads.push((format!("blocks.{i}.ffwd.fc1.bias"), &block.ffwd.fc1_bias));
            grads.push((format!("blocks.{i}.ffwd.fc2.weight"), &block.ffwd.fc2_weight));
            grads.push((format!("blocks.{i}.ffwd.fc2.bias"), &block.ffwd.fc2_bias));
        }
        grads.push(("ln_final.gamma".into(), &self.ln_final_gamma));
        grads.push(("ln_final.beta".into(), &self.ln_final_beta));
        grads.push(("lm_head.weight".into(), &self.lm_head));
        grads
    }

    /// Mutable tensor walk in the canonical order, for clipping.
    pub(crate) fn flatten_mut(&mut self) -> Vec<&mut Tensor> {
        let mut grads: Vec<&mut Tensor> = Vec::new();
        grads.push(&mut self.token_embedding);
        grads.push(&mut self.position_embedding);
        for block in self.blocks.iter_mut() {
            grads.push(&mut block.ln1_gamma);
            grads.push(&mut block.ln1_beta);
            for head in block.attn.heads.iter_mut() {
                grads.push(&mut head.key_weight);
                grads.push(&mut head.query_weight);
                grads.push(&mut head.value_weight);
            }
            grads.push(&mut block.attn.proj_weight);
            grads.push(&mut block.attn.proj_bias);
            grads.push(&mut block.ln2_gamma);
            grads.push(&mut block.ln2_beta);
            grads.push(&mut block.ffwd.fc1_weight);
            grads.push(&mut block.ffwd.fc1_bias);
            grads.push(&mut block.ffwd.fc2_weight);
            grads.push(&mut block.ffwd.fc2_bias);
        }
        grads.push(&mut self.ln_final_gamma);
        grads.push(&mut self.ln_final_beta);
        grads.push(&mut self.lm_head);
        grads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn scenario_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 10,
            embedding_width: 8,
            context_length: 4,
            n_layers: 1,
            n_heads: 2,
            dropout_rate: 0.1,
        }
    }

    fn scenario_model(seed: u64) -> LanguageModel {
        let mut rng = StdRng::seed_from_u64(seed);
        LanguageModel::new(&scenario_config(), &mut rng).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let config = ModelConfig {
            embedding_width: 10,
            n_heads: 3,
            ..scenario_config()
        };
        let mut rng = StdRng::seed_from_u64(0);
        assert!(LanguageModel::new(&config, &mut rng).is_err());
    }

    #[test]
    fn test_forward_scenario() {
        let model = scenario_model(0);
        let mut rng = StdRng::seed_from_u64(1);

        let inputs = vec![vec![1, 2, 3]];
        let targets = vec![vec![2, 3, 4]];
        let (logits, loss, _) = model.forward(&inputs, Some(&targets), Mode::Eval, &mut rng);

        assert_eq!(logits.shape, vec![1, 3, 10]);
        let loss = loss.unwrap();
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
    }

    #[test]
    fn test_forward_without_targets_has_no_loss() {
        let model = scenario_model(0);
        let mut rng = StdRng::seed_from_u64(1);
        let (_, loss, _) = model.forward(&[vec![1, 2, 3]], None, Mode::Eval, &mut rng);
        assert!(loss.is_none());
    }

    #[test]
    fn test_forward_is_deterministic_under_a_seed() {
        let a = scenario_model(7);
        let b = scenario_model(7);
        let inputs = vec![vec![1, 2, 3]];
        let targets = vec![vec![2, 3, 4]];

        let (la, lossa, _) =
            a.forward(&inputs, Some(&targets), Mode::Eval, &mut StdRng::seed_from_u64(3));
        let (lb, lossb, _) =
            b.forward(&inputs, Some(&targets), Mode::Eval, &mut StdRng::seed_from_u64(3));

        assert_eq!(la.data, lb.data);
        assert_eq!(lossa, lossb);
    }

    #[test]
    fn test_overlong_sequence_is_truncated() {
        let model = scenario_model(0);
        let mut rng = StdRng::seed_from_u64(1);
        // context_length is 4, feed 6 tokens
        let (logits, _, cache) =
            model.forward(&[vec![1, 2, 3, 4, 5, 6]], None, Mode::Eval, &mut rng);
        assert_eq!(logits.shape, vec![1, 4, 10]);
        assert_eq!(cache.input_ids[0], vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_cross_entropy_of_uniform_logits_is_ln_vocab() {
        let vocab = 10;
        let logits = Tensor::zeros(vec![3, vocab]);
        let loss = cross_entropy_mean(&logits, &[1, 5, 9]);
        assert!((loss - (vocab as f32).ln()).abs() < 1e-5);
    }

    #[test]
    fn test_cross_entropy_of_confident_correct_prediction_is_near_zero() {
        let vocab = 10;
        let mut logits = Tensor::zeros(vec![2, vocab]);
        logits.data[3] = 50.0;
        logits.data[vocab + 7] = 50.0;
        let loss = cross_entropy_mean(&logits, &[3, 7]);
        assert!(loss >= 0.0);
        assert!(loss < 1e-4, "loss {loss}");
    }

    #[test]
    fn test_backward_gradient_shapes() {
        let model = scenario_model(0);
        let mut rng = StdRng::seed_from_u64(1);
        let inputs = vec![vec![1, 2, 3]];
        let targets = vec![vec![2, 3, 4]];
        let (logits, _, cache) = model.forward(&inputs, Some(&targets), Mode::Train, &mut rng);
        let grads = model.backward(&logits, &targets, &cache);

        assert_eq!(grads.token_embedding.shape, vec![10, 8]);
        assert_eq!(grads.position_embedding.shape, vec![4, 8]);
        assert_eq!(grads.lm_head.shape, vec![8, 10]);
        assert_eq!(grads.blocks.len(), 1);
    }

    #[test]
    fn test_gradient_walks_align_with_parameters() {
        let mut model = scenario_model(0);
        let mut rng = StdRng::seed_from_u64(1);
        let inputs = vec![vec![1, 2, 3]];
        let targets = vec![vec![2, 3, 4]];
        let (logits, _, cache) = model.forward(&inputs, Some(&targets), Mode::Train, &mut rng);
        let grads = model.backward(&logits, &targets, &cache);

        let flat = grads.flatten();
        let params = model.parameters_mut();
        assert_eq!(flat.len(), params.len());
        for ((gp, gt), (pp, _, pt)) in flat.iter().zip(params.iter()) {
            assert_eq!(gp, pp, "gradient/parameter order diverged");
            assert_eq!(gt.shape, pt.shape, "shape mismatch at {gp}");
        }
    }

    #[test]
    fn test_generate_extends_prefix_by_exactly_k() {
        let model = scenario_model(0);
        let mut rng = StdRng::seed_from_u64(9);
        let out = model.generate(&[1, 2, 3], 2, &mut rng);
        assert_eq!(out.len(), 5);
        assert_eq!(&out[..3], &[1, 2, 3]);
        assert!(out[3..].iter().all(|&id| id < 10));
    }

    #[test]
    fn test_generate_is_deterministic_under_a_seed() {
        let model = scenario_model(4);
        let a = model.generate(&[1, 2, 3], 8, &mut StdRng::seed_from_u64(5));
        let b = model.generate(&[1, 2, 3], 8, &mut StdRng::seed_from_u64(5));
        assert_eq!(a, b);
    }

    #[test]
    fn test_generate_windows_past_the_context_length() {
        let model = scenario_model(0);
        let mut rng = StdRng::seed_from_u64(2);
        // 6 new tokens from a 3-token prefix crosses the context length of 4
        let out = model.generate(&[1, 2, 3], 6, &mut rng);
        assert_eq!(out.len(), 9);
        assert!(out.iter().all(|&id| id < 10));
    }

    #[test]
    fn test_named_parameters_are_stable_and_complete() {
        let model = scenario_model(0);
        let params = model.named_parameters();
        let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();

        assert!(names.contains(&"token_embedding"));
        assert!(names.contains(&"blocks.0.attn.heads.1.value.weight"));
        assert!(names.contains(&"blocks.0.ffwd.fc2.bias"));
        assert!(names.contains(&"lm_head.weight"));

        // Shape stability across calls
        let again = model.named_parameters();
        for ((n1, t1), (n2, t2)) in params.iter().zip(again.iter()) {
            assert_eq!(n1, n2);
            assert_eq!(t1.shape, t2.shape);
        }
    }
}
