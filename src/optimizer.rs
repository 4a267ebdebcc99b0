//! AdamW Optimizer
//!
//! Adam with decoupled weight decay, the standard optimizer for transformer
//! training. For each parameter theta with gradient g:
//!
//! ```text
//! theta *= 1 - lr * weight_decay        (weight matrices only)
//! m = beta1 * m + (1 - beta1) * g
//! v = beta2 * v + (1 - beta2) * g^2
//! m_hat = m / (1 - beta1^t)
//! v_hat = v / (1 - beta2^t)
//! theta -= lr * m_hat / (sqrt(v_hat) + eps)
//! ```
//!
//! The bias corrections matter in early steps, when m and v are still
//! biased toward their zero initialization.
//!
//! ## Selective weight decay
//!
//! Decay is applied only to weight matrices. Embeddings, biases, and
//! LayerNorm parameters are exempt; the eligibility of each parameter comes
//! from the model's parameter walk.
//!
//! Moment state is stored per parameter in the model's canonical parameter
//! order, and every step cross-checks the parameter and gradient paths, so
//! a divergence between the walks fails loudly instead of silently updating
//! the wrong tensor.

use crate::model::{LanguageModel, ModelGradients};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// AdamW state: first and second moment estimates per parameter.
pub struct AdamW {
    paths: Vec<String>,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub step: usize,
}

impl AdamW {
    /// Create optimizer state for the given model, all moments zeroed.
    ///
    /// beta2 = 0.95 rather than Adam's 0.999, the usual choice for
    /// transformer training.
    pub fn new(model: &LanguageModel) -> Self {
        let params = model.named_parameters();
        let paths = params.iter().map(|(p, _)| p.clone()).collect();
        let m = params
            .iter()
            .map(|(_, t)| Tensor::zeros(t.shape.clone()))
            .collect();
        let v = params
            .iter()
            .map(|(_, t)| Tensor::zeros(t.shape.clone()))
            .collect();
        Self {
            paths,
            m,
            v,
            beta1: 0.9,
            beta2: 0.95,
            epsilon: 1e-8,
            step: 0,
        }
    }

    /// Apply one optimizer step to every parameter.
    pub fn step(
        &mut self,
        model: &mut LanguageModel,
        grads: &ModelGradients,
        lr: f32,
        weight_decay: f32,
    ) {
        self.step += 1;
        let step = self.step as f32;
        let bias_correction1 = 1.0 - self.beta1.powf(step);
        let bias_correction2 = 1.0 - self.beta2.powf(step);
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        let params = model.parameters_mut();
        let grad_list = grads.flatten();
        assert_eq!(
            params.len(),
            grad_list.len(),
            "Parameter and gradient walks diverged"
        );

        for (i, ((path, decay, param), (grad_path, grad))) in
            params.into_iter().zip(grad_list).enumerate()
        {
            assert_eq!(path, grad_path, "Walk order diverged at index {i}");
            assert_eq!(path, self.paths[i], "Optimizer state belongs to a different model");
            assert_eq!(param.shape, grad.shape, "Shape mismatch at {path}");

            let decay_factor = if decay { 1.0 - lr * weight_decay } else { 1.0 };
            let m = &mut self.m[i];
            let v = &mut self.v[i];

            let update = |((p, &g), (m, v)): ((&mut f32, &f32), (&mut f32, &mut f32))| {
                *p *= decay_factor;
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
            };

            // Parallelize large tensors; small ones aren't worth the overhead
            if param.data.len() > 1000 {
                param
                    .data
                    .par_iter_mut()
                    .zip(grad.data.par_iter())
                    .zip(m.data.par_iter_mut().zip(v.data.par_iter_mut()))
                    .for_each(update);
            } else {
                param
                    .data
                    .iter_mut()
                    .zip(grad.data.iter())
                    .zip(m.data.iter_mut().zip(v.data.iter_mut()))
                    .for_each(update);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::layers::Mode;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_model(seed: u64) -> LanguageModel {
        let config = ModelConfig {
            vocab_size: 10,
            embedding_width: 8,
            context_length: 8,
            n_layers: 1,
            n_heads: 2,
            dropout_rate: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(seed);
        LanguageModel::new(&config, &mut rng).unwrap()
    }

    #[test]
    fn test_state_matches_parameter_count() {
        let model = tiny_model(0);
        let opt = AdamW::new(&model);
        assert_eq!(opt.paths.len(), model.named_parameters().len());
        assert_eq!(opt.step, 0);
    }

    #[test]
    fn test_step_changes_parameters() {
        let mut model = tiny_model(0);
        let mut opt = AdamW::new(&model);
        let mut rng = StdRng::seed_from_u64(1);

        let inputs = vec![vec![1, 2, 3]];
        let targets = vec![vec![2, 3, 4]];
        let before: Vec<f32> = model.named_parameters()[0].1.data.clone();

        let (logits, _, cache) = model.forward(&inputs, Some(&targets), Mode::Train, &mut rng);
        let grads = model.backward(&logits, &targets, &cache);
        opt.step(&mut model, &grads, 1e-3, 0.0);

        let after = &model.named_parameters()[0].1.data;
        assert_ne!(&before, after);
        assert_eq!(opt.step, 1);
    }

    #[test]
    fn test_training_reduces_loss_on_a_memorized_batch() {
        // A few dozen steps on one batch must drive the loss well below
        // its starting point.
        let mut model = tiny_model(3);
        let mut opt = AdamW::new(&model);
        let mut rng = StdRng::seed_from_u64(4);

        let inputs = vec![vec![1, 2, 3, 4]];
        let targets = vec![vec![2, 3, 4, 5]];

        let (logits, first_loss, cache) =
            model.forward(&inputs, Some(&targets), Mode::Train, &mut rng);
        let first_loss = first_loss.unwrap();
        let grads = model.backward(&logits, &targets, &cache);
        opt.step(&mut model, &grads, 1e-2, 0.0);

        let mut last_loss = first_loss;
        for _ in 0..40 {
            let (logits, loss, cache) =
                model.forward(&inputs, Some(&targets), Mode::Train, &mut rng);
            last_loss = loss.unwrap();
            let grads = model.backward(&logits, &targets, &cache);
            opt.step(&mut model, &grads, 1e-2, 0.0);
        }

        assert!(
            last_loss < first_loss * 0.5,
            "loss did not fall: {first_loss} -> {last_loss}"
        );
    }

    #[test]
    fn test_weight_decay_shrinks_unused_weight_matrices() {
        // With zero gradient, decayed parameters shrink toward zero while
        // exempt parameters only follow their (zero) gradient.
        let mut model = tiny_model(0);
        let mut opt = AdamW::new(&model);

        let zero_grads = {
            let mut rng = StdRng::seed_from_u64(1);
            let inputs = vec![vec![1, 2, 3]];
            let targets = vec![vec![2, 3, 4]];
            let (logits, _, cache) = model.forward(&inputs, Some(&targets), Mode::Eval, &mut rng);
            let mut grads = model.backward(&logits, &targets, &cache);
            for t in grads.flatten_mut() {
                t.data.iter_mut().for_each(|g| *g = 0.0);
            }
            grads
        };

        let lm_head_before: f32 = model
            .named_parameters()
            .last()
            .unwrap()
            .1
            .data
            .iter()
            .map(|x| x.abs())
            .sum();

        opt.step(&mut model, &zero_grads, 1e-2, 0.5);

        let lm_head_after: f32 = model
            .named_parameters()
            .last()
            .unwrap()
            .1
            .data
            .iter()
            .map(|x| x.abs())
            .sum();

        assert!(lm_head_after < lm_head_before);
    }
}
