//! Causal Self-Attention
//!
//! Each position builds its output as a weighted sum over the values of
//! positions at or before it:
//!
//! ```text
//! Q, K, V = x @ Wq, x @ Wk, x @ Wv        (no bias)
//! scores  = (Q @ K^T) / sqrt(head_width)
//! weights = softmax(causal_mask(scores))
//! out     = dropout(weights) @ V
//! ```
//!
//! The `1/sqrt(head_width)` scaling keeps the dot products from saturating
//! softmax. The causal mask sets every score that looks at a future position
//! to `-inf` before normalization, so those positions receive exactly zero
//! weight. Dropout is applied to the attention weights themselves during
//! training; the rows are not renormalized afterwards (inverted-dropout
//! convention, see the dropout module).
//!
//! [`MultiHeadAttention`] runs several independent heads over the same
//! input, concatenates their outputs in ascending head order, and applies a
//! single combining projection.
//!
//! ## Backward Pass
//!
//! The softmax backward is the delicate step: softmax couples all entries
//! of a row, giving `grad_s = w * (grad_w - sum(grad_w * w))` per row.

use super::dropout::{Dropout, DropoutCache, Mode};
use super::linear::{Linear, LinearCache};
use crate::config::ModelConfig;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Fixed lower-triangular attention constraint.
///
/// Stored as a `[context_length, context_length]` indicator that is 1.0
/// exactly where the key position lies after the query position. Built once
/// at construction, sliced to the live sequence length per use, never
/// trained.
pub struct CausalMask {
    mask: Tensor,
    context_length: usize,
}

impl CausalMask {
    pub fn new(context_length: usize) -> Self {
        let mut data = vec![0.0; context_length * context_length];
        for i in 0..context_length {
            for j in i + 1..context_length {
                data[i * context_length + j] = 1.0;
            }
        }
        Self {
            mask: Tensor::new(data, vec![context_length, context_length]),
            context_length,
        }
    }

    /// The `[seq_len, seq_len]` top-left corner of the full mask.
    ///
    /// # Panics
    ///
    /// Panics if `seq_len` exceeds the configured context length.
    pub fn slice(&self, seq_len: usize) -> Tensor {
        assert!(
            seq_len <= self.context_length,
            "Sequence length {} exceeds context length {}",
            seq_len,
            self.context_length
        );
        let mut data = Vec::with_capacity(seq_len * seq_len);
        for i in 0..seq_len {
            let base = i * self.context_length;
            data.extend_from_slice(&self.mask.data[base..base + seq_len]);
        }
        Tensor::new(data, vec![seq_len, seq_len])
    }
}

/// One head of causal self-attention: `[batch, seq, E]` in,
/// `[batch, seq, head_width]` out.
pub struct AttentionHead {
    pub key: Linear,
    pub query: Linear,
    pub value: Linear,
    pub dropout: Dropout,
    pub head_width: usize,
}

impl AttentionHead {
    pub fn new(
        embedding_width: usize,
        head_width: usize,
        dropout_rate: f32,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            key: Linear::new_unbiased(embedding_width, head_width, rng),
            query: Linear::new_unbiased(embedding_width, head_width, rng),
            value: Linear::new_unbiased(embedding_width, head_width, rng),
            dropout: Dropout::new(dropout_rate),
            head_width,
        }
    }

    /// Forward pass.
    ///
    /// `mask` is the `[seq, seq]` slice of the causal mask for the current
    /// sequence length.
    ///
    /// # Panics
    ///
    /// Panics if the input feature width does not match the projections'
    /// configured input width. This is a configuration error, not a
    /// recoverable condition.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        mode: Mode,
        rng: &mut StdRng,
    ) -> (Tensor, HeadCache) {
        assert_eq!(
            x.last_dim(),
            self.key.weight.shape[0],
            "Input width {} doesn't match head projection width {}",
            x.last_dim(),
            self.key.weight.shape[0]
        );

        let k = self.key.apply(x);
        let q = self.query.apply(x);
        let v = self.value.apply(x);

        let scale = 1.0 / (self.head_width as f32).sqrt();
        let scores = q.matmul(&k.transpose_last()).mul_scalar(scale);
        let masked = scores.masked_fill(mask, f32::NEG_INFINITY);
        let weights = masked.softmax_last();

        let (dropped, dropout_cache) = self.dropout.forward(&weights, mode, rng);
        let out = dropped.matmul(&v);

        let cache = HeadCache {
            q,
            k,
            v,
            weights,
            dropped,
            dropout_cache,
        };
        (out, cache)
    }

    /// Backward pass.
    ///
    /// `x` is the head's original input (shared across the key, query, and
    /// value projections, so the multi-head layer caches it once).
    pub fn backward(&self, grad_out: &Tensor, x: &Tensor, cache: &HeadCache) -> HeadGradients {
        // out = dropped @ v
        let grad_dropped = grad_out.matmul(&cache.v.transpose_last());
        let grad_v = cache.dropped.transpose_last().matmul(grad_out);

        let grad_weights = self.dropout.backward(&grad_dropped, &cache.dropout_cache);
        let grad_scores = softmax_backward(&cache.weights, &grad_weights);

        let scale = 1.0 / (self.head_width as f32).sqrt();
        let grad_q = grad_scores.matmul(&cache.k).mul_scalar(scale);
        let grad_k = grad_scores.transpose_last().matmul(&cache.q).mul_scalar(scale);

        let q_grads = self.query.backward_from(&grad_q, x);
        let k_grads = self.key.backward_from(&grad_k, x);
        let v_grads = self.value.backward_from(&grad_v, x);

        // The three projections read the same input
        let mut grad_x = q_grads.x;
        grad_x.add_assign(&k_grads.x);
        grad_x.add_assign(&v_grads.x);

        HeadGradients {
            key_weight: k_grads.weight,
            query_weight: q_grads.weight,
            value_weight: v_grads.weight,
            x: grad_x,
        }
    }
}

/// Softmax backward over the last dimension:
/// `grad_s = w * (grad_w - sum_j(grad_w[j] * w[j]))` per row.
fn softmax_backward(weights: &Tensor, grad_weights: &Tensor) -> Tensor {
    let cols = weights.last_dim();
    let rows = weights.data.len() / cols;

    let mut grad = vec![0.0; weights.data.len()];
    for r in 0..rows {
        let w_row = &weights.data[r * cols..(r + 1) * cols];
        let g_row = &grad_weights.data[r * cols..(r + 1) * cols];
        let dot: f32 = w_row.iter().zip(g_row.iter()).map(|(w, g)| w * g).sum();
        for j in 0..cols {
            grad[r * cols + j] = w_row[j] * (g_row[j] - dot);
        }
    }
    Tensor::new(grad, weights.shape.clone())
}

/// Cache for the head backward pass.
pub struct HeadCache {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    /// Attention weights after softmax, before dropout
    pub weights: Tensor,
    /// Attention weights after dropout (what actually multiplied V)
    pub dropped: Tensor,
    pub dropout_cache: DropoutCache,
}

/// Gradients for a single head.
pub struct HeadGradients {
    pub key_weight: Tensor,
    pub query_weight: Tensor,
    pub value_weight: Tensor,
    pub x: Tensor,
}

/// Several attention heads in parallel over the same input, combined by one
/// linear projection back to the embedding width.
pub struct MultiHeadAttention {
    pub heads: Vec<AttentionHead>,
    pub proj: Linear,
    pub dropout: Dropout,
    pub mask: CausalMask,
}

impl MultiHeadAttention {
    pub fn new(config: &ModelConfig, rng: &mut StdRng) -> Self {
        let head_width = config.head_width();
        let heads = (0..config.n_heads)
            .map(|_| {
                AttentionHead::new(config.embedding_width, head_width, config.dropout_rate, rng)
            })
            .collect();
        Self {
            heads,
            proj: Linear::new(
                config.n_heads * head_width,
                config.embedding_width,
                rng,
            ),
            dropout: Dropout::new(config.dropout_rate),
            mask: CausalMask::new(config.context_length),
        }
    }

    /// Forward pass: heads in ascending index order, concatenation,
    /// combining projection, dropout.
    ///
    /// The head order is fixed so that dropout draws (and therefore entire
    /// training runs) are reproducible under a fixed seed.
    pub fn forward(&self, x: &Tensor, mode: Mode, rng: &mut StdRng) -> (Tensor, MhaCache) {
        let seq_len = x.shape[1];
        let mask = self.mask.slice(seq_len);

        let mut outputs = Vec::with_capacity(self.heads.len());
        let mut head_caches = Vec::with_capacity(self.heads.len());
        for head in &self.heads {
            let (out, cache) = head.forward(x, &mask, mode, rng);
            outputs.push(out);
            head_caches.push(cache);
        }

        let refs: Vec<&Tensor> = outputs.iter().collect();
        let concat = Tensor::cat_last(&refs);

        let (projected, proj_cache) = self.proj.forward(&concat);
        let (y, dropout_cache) = self.dropout.forward(&projected, mode, rng);

        let cache = MhaCache {
            x: x.clone(),
            head_caches,
            proj_cache,
            dropout_cache,
        };
        (y, cache)
    }

    /// Backward pass.
    pub fn backward(&self, grad_out: &Tensor, cache: &MhaCache) -> MhaGradients {
        let grad_projected = self.dropout.backward(grad_out, &cache.dropout_cache);
        let proj_grads = self.proj.backward(&grad_projected, &cache.proj_cache);

        let head_width = self.heads[0].head_width;
        let mut head_grads = Vec::with_capacity(self.heads.len());
        let mut grad_x: Option<Tensor> = None;

        for (h, head) in self.heads.iter().enumerate() {
            let grad_head_out = proj_grads.x.narrow_last(h * head_width, head_width);
            let grads = head.backward(&grad_head_out, &cache.x, &cache.head_caches[h]);
            match grad_x.as_mut() {
                Some(acc) => acc.add_assign(&grads.x),
                None => grad_x = Some(grads.x.clone()),
            }
            head_grads.push(grads);
        }

        MhaGradients {
            heads: head_grads,
            proj_weight: proj_grads.weight,
            proj_bias: proj_grads
                .bias
                .expect("combining projection carries a bias"),
            x: grad_x.expect("at least one attention head"),
        }
    }
}

/// Cache for the multi-head backward pass.
pub struct MhaCache {
    /// Input shared by every head's projections
    pub x: Tensor,
    pub head_caches: Vec<HeadCache>,
    pub proj_cache: LinearCache,
    pub dropout_cache: DropoutCache,
}

/// Gradients for multi-head attention.
pub struct MhaGradients {
    pub heads: Vec<HeadGradients>,
    pub proj_weight: Tensor,
    pub proj_bias: Tensor,
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
    fn test_causal_mask_slice() {
        let mask = CausalMask::new(4);
        let m = mask.slice(3);
        assert_eq!(m.shape, vec![3, 3]);
        // Row 0 may only see position 0
        assert_eq!(m.data, vec![0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    #[should_panic(expected = "exceeds context length")]
    fn test_mask_slice_beyond_context_panics() {
        CausalMask::new(4).slice(5);
    }

    #[test]
    fn test_head_output_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let head = AttentionHead::new(8, 4, 0.0, &mut rng);
        let mask = CausalMask::new(8).slice(5);
        let x = random_input(vec![2, 5, 8], 1);
        let (out, _) = head.forward(&x, &mask, Mode::Eval, &mut rng);
        assert_eq!(out.shape, vec![2, 5, 4]);
    }

    #[test]
    #[should_panic(expected = "doesn't match head projection width")]
    fn test_head_width_mismatch_panics() {
        let mut rng = StdRng::seed_from_u64(0);
        let head = AttentionHead::new(8, 4, 0.0, &mut rng);
        let mask = CausalMask::new(8).slice(3);
        let x = Tensor::zeros(vec![1, 3, 6]);
        head.forward(&x, &mask, Mode::Eval, &mut rng);
    }

    #[test]
    fn test_attention_weights_are_distributions() {
        let mut rng = StdRng::seed_from_u64(0);
        let head = AttentionHead::new(8, 4, 0.0, &mut rng);
        let mask = CausalMask::new(8).slice(4);
        let x = random_input(vec![1, 4, 8], 2);
        let (_, cache) = head.forward(&x, &mask, Mode::Eval, &mut rng);

        for row in cache.weights.data.chunks(4) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "row sum {sum}");
            assert!(row.iter().all(|&w| w >= 0.0));
        }
    }

    #[test]
    fn test_future_positions_get_zero_weight() {
        let mut rng = StdRng::seed_from_u64(0);
        let head = AttentionHead::new(8, 4, 0.0, &mut rng);
        let mask = CausalMask::new(8).slice(3);
        let x = random_input(vec![1, 3, 8], 3);
        let (_, cache) = head.forward(&x, &mask, Mode::Eval, &mut rng);

        for i in 0..3 {
            for j in i + 1..3 {
                assert_eq!(cache.weights.data[i * 3 + j], 0.0);
            }
        }
    }

    #[test]
    fn test_multi_head_preserves_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let mha = MultiHeadAttention::new(&test_config(), &mut rng);
        let x = random_input(vec![2, 6, 8], 4);
        let (y, _) = mha.forward(&x, Mode::Eval, &mut rng);
        assert_eq!(y.shape, x.shape);
    }

    #[test]
    fn test_no_future_leakage() {
        // Perturbing a later position must leave every earlier output
        // bit-identical.
        let mut rng = StdRng::seed_from_u64(0);
        let mha = MultiHeadAttention::new(&test_config(), &mut rng);

        let x1 = random_input(vec![1, 4, 8], 5);
        let mut x2 = x1.clone();
        for j in 0..8 {
            x2.data[3 * 8 + j] += 10.0; // perturb the last position only
        }

        let (y1, _) = mha.forward(&x1, Mode::Eval, &mut rng);
        let (y2, _) = mha.forward(&x2, Mode::Eval, &mut rng);

        assert_eq!(&y1.data[..3 * 8], &y2.data[..3 * 8]);
        assert_ne!(&y1.data[3 * 8..], &y2.data[3 * 8..]);
    }

    #[test]
    fn test_backward_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let mha = MultiHeadAttention::new(&test_config(), &mut rng);
        let x = random_input(vec![2, 4, 8], 6);
        let (y, cache) = mha.forward(&x, Mode::Train, &mut rng);

        let grads = mha.backward(&Tensor::new(vec![1.0; y.data.len()], y.shape), &cache);
        assert_eq!(grads.x.shape, x.shape);
        assert_eq!(grads.heads.len(), 2);
        assert_eq!(grads.heads[0].key_weight.shape, vec![8, 4]);
        assert_eq!(grads.proj_weight.shape, vec![8, 8]);
        assert_eq!(grads.proj_bias.shape, vec![8]);
    }

    #[test]
    fn test_softmax_backward_zero_for_uniform_gradient() {
        // With a uniform upstream gradient, softmax backward is zero:
        // w * (g - sum(w * g)) = w * (g - g) when g is constant per row.
        let w = Tensor::new(vec![0.25; 4], vec![1, 4]).softmax_last();
        let g = Tensor::new(vec![2.0; 4], vec![1, 4]);
        let grad = softmax_backward(&w, &g);
        for v in grad.data {
            assert!(v.abs() < 1e-6);
        }
    }
}
