//! Feed-Forward Sublayer
//!
//! A position-wise two-layer network applied identically and independently
//! to every position:
//!
//! ```text
//! x -> Linear(E, 4E) -> ReLU -> Linear(4E, E) -> Dropout
//! ```
//!
//! The 4x expansion-then-contraction gives the block its per-position
//! capacity. No information crosses positions or batch elements here.

use super::activation::{relu_backward, relu_forward};
use super::dropout::{Dropout, DropoutCache, Mode};
use super::linear::{Linear, LinearCache};
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Hidden width multiplier for the expansion layer.
const EXPANSION_FACTOR: usize = 4;

/// Position-wise feed-forward network with ReLU.
pub struct FeedForward {
    pub fc1: Linear,
    pub fc2: Linear,
    pub dropout: Dropout,
}

impl FeedForward {
    pub fn new(embedding_width: usize, dropout_rate: f32, rng: &mut StdRng) -> Self {
        let hidden = embedding_width * EXPANSION_FACTOR;
        Self {
            fc1: Linear::new(embedding_width, hidden, rng),
            fc2: Linear::new(hidden, embedding_width, rng),
            dropout: Dropout::new(dropout_rate),
        }
    }

    /// Forward pass: expand, clamp, contract, drop.
    pub fn forward(&self, x: &Tensor, mode: Mode, rng: &mut StdRng) -> (Tensor, FeedForwardCache) {
        let (h, fc1_cache) = self.fc1.forward(x);
        let h_activated = relu_forward(&h);
        let (projected, fc2_cache) = self.fc2.forward(&h_activated);
        let (y, dropout_cache) = self.dropout.forward(&projected, mode, rng);

        let cache = FeedForwardCache {
            fc1_cache,
            h,
            fc2_cache,
            dropout_cache,
        };
        (y, cache)
    }

    /// Backward pass through dropout, fc2, ReLU, fc1.
    pub fn backward(&self, grad_out: &Tensor, cache: &FeedForwardCache) -> FeedForwardGradients {
        let grad_projected = self.dropout.backward(grad_out, &cache.dropout_cache);
        let fc2_grads = self.fc2.backward(&grad_projected, &cache.fc2_cache);
        let grad_h = relu_backward(&fc2_grads.x, &cache.h);
        let fc1_grads = self.fc1.backward(&grad_h, &cache.fc1_cache);

        FeedForwardGradients {
            fc1_weight: fc1_grads.weight,
            fc1_bias: fc1_grads.bias.expect("fc1 carries a bias"),
            fc2_weight: fc2_grads.weight,
            fc2_bias: fc2_grads.bias.expect("fc2 carries a bias"),
            x: fc1_grads.x,
        }
    }
}

/// Cache for the feed-forward backward pass.
pub struct FeedForwardCache {
    pub fc1_cache: LinearCache,
    /// Pre-activation hidden state, needed for the ReLU backward
    pub h: Tensor,
    pub fc2_cache: LinearCache,
    pub dropout_cache: DropoutCache,
}

/// Gradients for the feed-forward network.
pub struct FeedForwardGradients {
    pub fc1_weight: Tensor,
    pub fc1_bias: Tensor,
    pub fc2_weight: Tensor,
    pub fc2_bias: Tensor,
    pub x: Tensor,
}
