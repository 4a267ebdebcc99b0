//! Linear Layer
//!
//! An affine transform `y = x @ W (+ b)`, the workhorse of every other
//! layer. The bias is optional: the attention head projections deliberately
//! omit it, while the combining projection and the feed-forward layers keep
//! theirs.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, over rows)
//! grad_x = grad_y @ W^T
//! ```

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Draw `size` values from N(0, 0.02).
///
/// The single initialization rule for every weight matrix in the model:
/// small-variance, zero-mean. Biases are zeroed separately.
pub fn normal_init(size: usize, rng: &mut StdRng) -> Vec<f32> {
    let normal = Normal::new(0.0, 0.02).unwrap();
    (0..size).map(|_| normal.sample(rng)).collect()
}

/// Linear layer with an optional bias.
pub struct Linear {
    /// Weight matrix `[in_features, out_features]`
    pub weight: Tensor,
    /// Bias vector `[out_features]`, absent for the bias-free projections
    pub bias: Option<Tensor>,
}

impl Linear {
    /// Create a linear layer with weights from N(0, 0.02) and a zero bias.
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        Self {
            weight: Tensor::new(
                normal_init(in_features * out_features, rng),
                vec![in_features, out_features],
            ),
            bias: Some(Tensor::zeros(vec![out_features])),
        }
    }

    /// Create a bias-free linear layer (attention key/query/value).
    pub fn new_unbiased(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        Self {
            weight: Tensor::new(
                normal_init(in_features * out_features, rng),
                vec![in_features, out_features],
            ),
            bias: None,
        }
    }

    /// Apply the transform without recording a cache.
    ///
    /// Used where the caller keeps the input itself (the attention head
    /// shares one input across three projections).
    pub fn apply(&self, x: &Tensor) -> Tensor {
        let y = x.matmul(&self.weight);
        match &self.bias {
            Some(bias) => y.add(bias),
            None => y,
        }
    }

    /// Forward pass, caching the input for the backward pass.
    ///
    /// `x` may be `[rows, in]` or `[batch, seq, in]`.
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let y = self.apply(x);
        (y, LinearCache { x: x.clone() })
    }

    /// Backward pass from a cached forward.
    pub fn backward(&self, grad_out: &Tensor, cache: &LinearCache) -> LinearGradients {
        self.backward_from(grad_out, &cache.x)
    }

    /// Backward pass given the original input directly.
    pub fn backward_from(&self, grad_out: &Tensor, x: &Tensor) -> LinearGradients {
        let in_features = self.weight.shape[0];
        let out_features = self.weight.shape[1];

        // Flatten any leading dimensions so the weight gradient is a single
        // [in, out] product regardless of batching.
        let rows = x.data.len() / in_features;
        let x2 = x.reshape(&[rows, in_features]);
        let g2 = grad_out.reshape(&[rows, out_features]);

        let grad_weight = x2.transpose_last().matmul(&g2);

        let grad_bias = self.bias.as_ref().map(|_| {
            let mut sums = vec![0.0; out_features];
            for r in 0..rows {
                for (j, s) in sums.iter_mut().enumerate() {
                    *s += g2.data[r * out_features + j];
                }
            }
            Tensor::new(sums, vec![out_features])
        });

        let grad_x = g2.matmul(&self.weight.transpose_last()).reshape(&x.shape);

        LinearGradients {
            weight: grad_weight,
            bias: grad_bias,
            x: grad_x,
        }
    }
}

/// Cache for the linear backward pass.
pub struct LinearCache {
    pub x: Tensor,
}

/// Gradients for a linear layer.
pub struct LinearGradients {
    pub weight: Tensor,
    /// `None` when the layer has no bias
    pub bias: Option<Tensor>,
    /// Gradient to pass to the previous layer
    pub x: Tensor,
}
