//! Dropout Layer
//!
//! Inverted dropout: during training each activation is zeroed independently
//! with probability `rate` and the survivors are rescaled by `1/(1 - rate)`,
//! so the expected activation is unchanged. Attention rows are NOT
//! renormalized after the drop; that is the documented convention here.
//! In `Mode::Eval` the layer is a deterministic no-op.
//!
//! The mode and the random source are passed in explicitly. There is no
//! hidden training flag and no thread-local RNG, which keeps training runs
//! reproducible under a fixed seed.

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Whether regularizing operations are live (training) or inert (inference).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Dropout with a fixed rate, gated on the execution mode.
pub struct Dropout {
    pub rate: f32,
}

impl Dropout {
    /// Create a dropout layer.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is outside `[0, 1)`.
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&rate),
            "Dropout rate must be in [0, 1), got {rate}"
        );
        Self { rate }
    }

    /// Forward pass; caches the mask for the backward pass.
    pub fn forward(&self, x: &Tensor, mode: Mode, rng: &mut StdRng) -> (Tensor, DropoutCache) {
        if mode == Mode::Eval || self.rate == 0.0 {
            return (
                x.clone(),
                DropoutCache {
                    mask: None,
                    scale: 1.0,
                },
            );
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mut mask = Vec::with_capacity(x.data.len());
        let mut output = Tensor::zeros(x.shape.clone());

        for i in 0..x.data.len() {
            let keep = rng.random::<f32>() > self.rate;
            mask.push(keep);
            if keep {
                output.data[i] = x.data[i] * scale;
            }
        }

        (
            output,
            DropoutCache {
                mask: Some(mask),
                scale,
            },
        )
    }

    /// Backward pass: the same mask and scale applied to the gradient.
    pub fn backward(&self, grad_out: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let mut grad_in = Tensor::zeros(grad_out.shape.clone());
                for (i, &keep) in mask.iter().enumerate() {
                    if keep {
                        grad_in.data[i] = grad_out.data[i] * cache.scale;
                    }
                }
                grad_in
            }
            None => grad_out.clone(),
        }
    }
}

/// Cache for the dropout backward pass.
pub struct DropoutCache {
    /// `true` = kept, `false` = dropped; `None` when dropout was inert
    pub mask: Option<Vec<bool>>,
    /// Rescaling factor applied to kept values
    pub scale: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_eval_mode_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let dropout = Dropout::new(0.5);
        let x = Tensor::new(vec![1.0, 2.0, 3.0], vec![1, 3]);
        let (y, cache) = dropout.forward(&x, Mode::Eval, &mut rng);
        assert_eq!(y.data, x.data);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_zero_rate_is_identity_in_training() {
        let mut rng = StdRng::seed_from_u64(0);
        let dropout = Dropout::new(0.0);
        let x = Tensor::new(vec![1.0, 2.0], vec![1, 2]);
        let (y, _) = dropout.forward(&x, Mode::Train, &mut rng);
        assert_eq!(y.data, x.data);
    }

    #[test]
    fn test_training_drops_and_rescales() {
        let mut rng = StdRng::seed_from_u64(7);
        let dropout = Dropout::new(0.5);
        let x = Tensor::new(vec![1.0; 1000], vec![1000]);
        let (y, cache) = dropout.forward(&x, Mode::Train, &mut rng);

        let mask = cache.mask.unwrap();
        let kept = mask.iter().filter(|&&k| k).count();
        // Roughly half survive at rate 0.5
        assert!(kept > 350 && kept < 650, "kept {kept} of 1000");

        for (i, &keep) in mask.iter().enumerate() {
            if keep {
                assert_eq!(y.data[i], 2.0);
            } else {
                assert_eq!(y.data[i], 0.0);
            }
        }
    }

    #[test]
    fn test_same_seed_same_mask() {
        let dropout = Dropout::new(0.3);
        let x = Tensor::new(vec![1.0; 64], vec![64]);
        let (a, _) = dropout.forward(&x, Mode::Train, &mut StdRng::seed_from_u64(11));
        let (b, _) = dropout.forward(&x, Mode::Train, &mut StdRng::seed_from_u64(11));
        assert_eq!(a.data, b.data);
    }

    #[test]
    fn test_backward_applies_same_mask() {
        let mut rng = StdRng::seed_from_u64(5);
        let dropout = Dropout::new(0.5);
        let x = Tensor::new(vec![1.0; 32], vec![32]);
        let (_, cache) = dropout.forward(&x, Mode::Train, &mut rng);

        let g = Tensor::new(vec![1.0; 32], vec![32]);
        let grad = dropout.backward(&g, &cache);
        let mask = cache.mask.as_ref().unwrap();
        for (i, &keep) in mask.iter().enumerate() {
            assert_eq!(grad.data[i], if keep { 2.0 } else { 0.0 });
        }
    }

    #[test]
    #[should_panic(expected = "Dropout rate")]
    fn test_rate_out_of_range_panics() {
        Dropout::new(1.0);
    }
}
