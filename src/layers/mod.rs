//! Neural Network Layers
//!
//! Layer implementations for the language model. Each trainable layer
//! provides both a forward and a hand-written backward pass:
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn new(...) -> Self { }
//!     pub fn forward(&self, x: &Tensor, ...) -> (Tensor, Cache) { }
//!     pub fn backward(&self, grad: &Tensor, cache: &Cache) -> Gradients { }
//! }
//! ```
//!
//! The cache stores whatever the backward pass needs from the forward pass;
//! the gradients struct carries one entry per parameter plus the gradient
//! flowing to the previous layer. Execution context (the train/eval `Mode`
//! and the random source) is passed explicitly to the operations that need
//! it rather than stored in the layers.
//!
//! ## Layers
//!
//! - **activation**: ReLU forward and backward
//! - **linear**: affine transform with optional bias
//! - **layer_norm**: per-position normalization
//! - **dropout**: mode-gated inverted dropout
//! - **attention**: causal attention heads and their multi-head combination
//! - **feed_forward**: position-wise expand/contract network
//! - **block**: pre-norm residual transformer block

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;

pub use activation::{relu_backward, relu_forward};
pub use attention::{
    AttentionHead, CausalMask, HeadCache, HeadGradients, MhaCache, MhaGradients,
    MultiHeadAttention,
};
pub use block::{BlockCache, BlockGradients, TransformerBlock};
pub use dropout::{Dropout, DropoutCache, Mode};
pub use feed_forward::{FeedForward, FeedForwardCache, FeedForwardGradients};
pub use layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
pub use linear::{normal_init, Linear, LinearCache, LinearGradients};
