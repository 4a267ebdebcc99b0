//! Activation Functions
//!
//! The feed-forward sublayer uses ReLU: values are clamped at zero from
//! below, and the gradient passes through only where the input was
//! positive.

use crate::tensor::Tensor;
use rayon::prelude::*;

/// ReLU forward: `max(0, x)` element-wise.
pub fn relu_forward(x: &Tensor) -> Tensor {
    let result = x.data.par_iter().map(|&v| v.max(0.0)).collect();
    Tensor::new(result, x.shape.clone())
}

/// ReLU backward: gradient flows where the original input was positive.
///
/// `x` is the pre-activation input saved during the forward pass.
pub fn relu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let grad_data: Vec<f32> = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&x_val, &grad_val)| if x_val > 0.0 { grad_val } else { 0.0 })
        .collect();
    Tensor::new(grad_data, x.shape.clone())
}
