//! Transformer Block
//!
//! Residual composition of the two sublayers, with pre-normalization:
//!
//! ```text
//! x = x + attn(ln1(x))
//! x = x + ffwd(ln2(x))
//! ```
//!
//! Normalization is applied to the sublayer *input*, not its output. The
//! ordering is load-bearing for training stability; post-norm is not an
//! equivalent formulation and must not be substituted.
//!
//! ## Backward Pass
//!
//! At each residual join the gradient splits into two paths that must be
//! summed: one straight through the skip connection, one through the
//! sublayer.

use super::attention::{MhaCache, MhaGradients, MultiHeadAttention};
use super::dropout::Mode;
use super::feed_forward::{FeedForward, FeedForwardCache, FeedForwardGradients};
use super::layer_norm::{LayerNorm, LayerNormCache};
use crate::config::ModelConfig;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Pre-norm transformer block: attention then feed-forward, each behind a
/// residual connection.
pub struct TransformerBlock {
    pub ln1: LayerNorm,
    pub attn: MultiHeadAttention,
    pub ln2: LayerNorm,
    pub ffwd: FeedForward,
}

impl TransformerBlock {
    pub fn new(config: &ModelConfig, rng: &mut StdRng) -> Self {
        Self {
            ln1: LayerNorm::new(config.embedding_width),
            attn: MultiHeadAttention::new(config, rng),
            ln2: LayerNorm::new(config.embedding_width),
            ffwd: FeedForward::new(config.embedding_width, config.dropout_rate, rng),
        }
    }

    /// Forward pass. Input and output are `[batch, seq, embedding_width]`.
    pub fn forward(&self, x: &Tensor, mode: Mode, rng: &mut StdRng) -> (Tensor, BlockCache) {
        let (ln1_out, ln1_cache) = self.ln1.forward(x);
        let (attn_out, attn_cache) = self.attn.forward(&ln1_out, mode, rng);
        let x_after_attn = x.add(&attn_out); // residual

        let (ln2_out, ln2_cache) = self.ln2.forward(&x_after_attn);
        let (ffwd_out, ffwd_cache) = self.ffwd.forward(&ln2_out, mode, rng);
        let y = x_after_attn.add(&ffwd_out); // residual

        let cache = BlockCache {
            ln1_cache,
            attn_cache,
            ln2_cache,
            ffwd_cache,
        };
        (y, cache)
    }

    /// Backward pass.
    pub fn backward(&self, grad_out: &Tensor, cache: &BlockCache) -> BlockGradients {
        // Second residual join: gradient flows both into the feed-forward
        // path and straight through.
        let ffwd_grads = self.ffwd.backward(grad_out, &cache.ffwd_cache);
        let ln2_grads = self.ln2.backward(&ffwd_grads.x, &cache.ln2_cache);

        let mut grad_after_attn = grad_out.clone();
        grad_after_attn.add_assign(&ln2_grads.x);

        // First residual join, same shape.
        let attn_grads = self.attn.backward(&grad_after_attn, &cache.attn_cache);
        let ln1_grads = self.ln1.backward(&attn_grads.x, &cache.ln1_cache);

        let mut grad_x = grad_after_attn;
        grad_x.add_assign(&ln1_grads.x);

        BlockGradients {
            ln1_gamma: ln1_grads.gamma,
            ln1_beta: ln1_grads.beta,
            attn: attn_grads,
            ln2_gamma: ln2_grads.gamma,
            ln2_beta: ln2_grads.beta,
            ffwd: ffwd_grads,
            x: grad_x,
        }
    }
}

/// Cache for the block backward pass.
pub struct BlockCache {
    pub ln1_cache: LayerNormCache,
    pub attn_cache: MhaCache,
    pub ln2_cache: LayerNormCache,
    pub ffwd_cache: FeedForwardCache,
}

/// Gradients for a transformer block.
pub struct BlockGradients {
    pub ln1_gamma: Tensor,
    pub ln1_beta: Tensor,
    pub attn: MhaGradients,
    pub ln2_gamma: Tensor,
    pub ln2_beta: Tensor,
    pub ffwd: FeedForwardGradients,
    pub x: Tensor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn test_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 10,
            embedding_width: 8,
            context_length: 16,
            n_layers: 1,
            n_heads: 2,
            dropout_rate: 0.1,
        }
    }

    fn random_input(shape: Vec<usize>, seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        let size = shape.iter().product();
        let data = (0..size).map(|_| rng.random::<f32>() - 0.5).collect();
        Tensor::new(data, shape)
    }

    #[test]
    fn test_shape_preserved_through_block() {
        let mut rng = StdRng::seed_from_u64(0);
        let block = TransformerBlock::new(&test_config(), &mut rng);
        let x = random_input(vec![2, 5, 8], 1);
        let (y, _) = block.forward(&x, Mode::Eval, &mut rng);
        assert_eq!(y.shape, x.shape);
    }

    #[test]
    fn test_block_is_causal() {
        let mut rng = StdRng::seed_from_u64(0);
        let block = TransformerBlock::new(&test_config(), &mut rng);

        let x1 = random_input(vec![1, 4, 8], 2);
        let mut x2 = x1.clone();
        for j in 0..8 {
            x2.data[3 * 8 + j] = 99.0;
        }

        let (y1, _) = block.forward(&x1, Mode::Eval, &mut rng);
        let (y2, _) = block.forward(&x2, Mode::Eval, &mut rng);
        assert_eq!(&y1.data[..3 * 8], &y2.data[..3 * 8]);
    }

    #[test]
    fn test_backward_gradient_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let block = TransformerBlock::new(&test_config(), &mut rng);
        let x = random_input(vec![2, 4, 8], 3);
        let (y, cache) = block.forward(&x, Mode::Train, &mut rng);

        let grads = block.backward(&Tensor::new(vec![1.0; y.data.len()], y.shape), &cache);
        assert_eq!(grads.x.shape, x.shape);
        assert_eq!(grads.ln1_gamma.shape, vec![8]);
        assert_eq!(grads.ln2_beta.shape, vec![8]);
        assert_eq!(grads.ffwd.fc1_weight.shape, vec![8, 32]);
    }
}
