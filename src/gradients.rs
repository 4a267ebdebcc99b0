//! Gradient Utilities
//!
//! Global gradient-norm computation and clipping. An occasional batch can
//! produce a gradient large enough to destabilize training; clipping scales
//! the whole gradient down so its L2 norm never exceeds a threshold,
//! preserving its direction.
//!
//! ```text
//! norm = sqrt(sum(g^2))            over every parameter
//! if norm > max_norm:
//!     g *= max_norm / norm         applied uniformly
//! ```

use crate::model::ModelGradients;
use rayon::prelude::*;

/// L2 norm over every gradient tensor in the model.
///
/// Summation runs in a fixed order so the result is reproducible.
pub fn grad_norm(grads: &ModelGradients) -> f32 {
    let mut sum_sq = 0.0f32;
    for (_, tensor) in grads.flatten() {
        sum_sq += tensor.data.iter().map(|&g| g * g).sum::<f32>();
    }
    sum_sq.sqrt()
}

/// Scale all gradients uniformly so the global norm is at most `max_norm`.
///
/// A no-op when the norm is already within bounds.
pub fn clip_gradients(grads: &mut ModelGradients, max_norm: f32) {
    let norm = grad_norm(grads);
    if norm > max_norm {
        let scale = max_norm / norm;
        for tensor in grads.flatten_mut() {
            tensor.data.par_iter_mut().for_each(|g| *g *= scale);
        }
    }
}
