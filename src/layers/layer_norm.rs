//! Layer Normalization
//!
//! Each position's feature vector is re-centered to zero mean and rescaled
//! to unit variance, then passed through a learned affine transform:
//!
//! ```text
//! x_norm = (x - mean) / sqrt(var + eps)
//! y = gamma * x_norm + beta
//! ```
//!
//! The epsilon keeps the division defined when a position's variance is
//! zero.
//!
//! ## Backward Pass
//!
//! The mean and variance couple every feature in a position, so the input
//! gradient carries two correction terms:
//!
//! ```text
//! grad_x = (grad_x_norm - E[grad_x_norm] - x_norm * E[grad_x_norm * x_norm]) / std
//! ```

use crate::tensor::Tensor;
use rayon::prelude::*;

/// Layer normalization over the last (feature) dimension.
pub struct LayerNorm {
    /// Learned scale `[width]`
    pub gamma: Tensor,
    /// Learned shift `[width]`
    pub beta: Tensor,
    /// Numerical stability constant
    pub eps: f32,
}

impl LayerNorm {
    /// Create a layer norm with gamma = 1, beta = 0, eps = 1e-5.
    pub fn new(width: usize) -> Self {
        Self {
            gamma: Tensor::new(vec![1.0; width], vec![width]),
            beta: Tensor::new(vec![0.0; width], vec![width]),
            eps: 1e-5,
        }
    }

    /// Forward pass over any shape ending in the configured width.
    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let width = self.gamma.data.len();
        assert_eq!(
            x.last_dim(),
            width,
            "LayerNorm width mismatch: input {:?}, expected last dim {}",
            x.shape,
            width
        );
        let rows = x.data.len() / width;

        let mut x_norm = vec![0.0; x.data.len()];
        let mut std = vec![0.0; rows];

        x_norm
            .par_chunks_mut(width)
            .zip(std.par_iter_mut())
            .enumerate()
            .for_each(|(r, (norm_row, std_out))| {
                let row = &x.data[r * width..(r + 1) * width];
                let mean = row.iter().sum::<f32>() / width as f32;
                let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>()
                    / width as f32;
                let s = (var + self.eps).sqrt();
                *std_out = s;
                for (n, &v) in norm_row.iter_mut().zip(row.iter()) {
                    *n = (v - mean) / s;
                }
            });

        let x_norm = Tensor::new(x_norm, x.shape.clone());
        let y = x_norm.mul(&self.gamma).add(&self.beta);

        (
            y,
            LayerNormCache {
                x_norm,
                std,
                shape: x.shape.clone(),
            },
        )
    }

    /// Backward pass.
    pub fn backward(&self, grad_out: &Tensor, cache: &LayerNormCache) -> LayerNormGradients {
        let width = self.gamma.data.len();
        let rows = grad_out.data.len() / width;

        // Parameter gradients accumulate over every position; sequential so
        // the summation order is fixed.
        let mut grad_gamma = vec![0.0; width];
        let mut grad_beta = vec![0.0; width];
        for r in 0..rows {
            for j in 0..width {
                let idx = r * width + j;
                grad_gamma[j] += grad_out.data[idx] * cache.x_norm.data[idx];
                grad_beta[j] += grad_out.data[idx];
            }
        }

        let grad_x_norm = grad_out.mul(&self.gamma);

        let mut grad_x = vec![0.0; grad_out.data.len()];
        grad_x
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(r, out_row)| {
                let g_row = &grad_x_norm.data[r * width..(r + 1) * width];
                let n_row = &cache.x_norm.data[r * width..(r + 1) * width];
                let std = cache.std[r];

                // Corrections for the mean and variance dependencies
                let mean_g = g_row.iter().sum::<f32>() / width as f32;
                let mean_gn = g_row
                    .iter()
                    .zip(n_row.iter())
                    .map(|(g, n)| g * n)
                    .sum::<f32>()
                    / width as f32;

                for (j, o) in out_row.iter_mut().enumerate() {
                    *o = (g_row[j] - mean_g - n_row[j] * mean_gn) / std;
                }
            });

        LayerNormGradients {
            gamma: Tensor::new(grad_gamma, vec![width]),
            beta: Tensor::new(grad_beta, vec![width]),
            x: Tensor::new(grad_x, cache.shape.clone()),
        }
    }
}

/// Cache for the layer norm backward pass.
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// Per-row standard deviation (with epsilon folded in)
    pub std: Vec<f32>,
    pub shape: Vec<usize>,
}

/// Gradients for a layer norm.
pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}
