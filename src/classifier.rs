//! Ratio-estimation classifier: a residual MLP over `[θ, x]` producing one logit per pair.

use burn_core as burn;

use burn::module::Module;
use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::nn::Dense;
use crate::{Error, Result};

/// Architecture of the ratio classifier.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Width of every hidden layer.
    pub hidden_features: usize,
    /// Number of two-layer residual blocks.
    pub num_blocks: usize,
    pub seed: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            hidden_features: 50,
            num_blocks: 2,
            seed: 0,
        }
    }
}

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    first: Dense<B>,
    second: Dense<B>,
}

impl<B: Backend> ResidualBlock<B> {
    fn forward(&self, h: Tensor<B, 2>) -> Tensor<B, 2> {
        let update = self.second.forward(relu(self.first.forward(relu(h.clone()))));
        h + update
    }
}

#[derive(Module, Debug)]
pub struct RatioClassifier<B: Backend> {
    input: Dense<B>,
    blocks: Vec<ResidualBlock<B>>,
    output: Dense<B>,
    theta_dim: usize,
    x_dim: usize,
}

impl<B: Backend> RatioClassifier<B> {
    pub fn new(theta_dim: usize, x_dim: usize, config: &ClassifierConfig, device: &B::Device) -> Result<Self> {
        if theta_dim == 0 || x_dim == 0 {
            return Err(Error::Domain("classifier inputs must have positive width"));
        }
        if config.hidden_features == 0 {
            return Err(Error::Config("hidden_features must be >= 1".into()));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let h = config.hidden_features;
        let input = Dense::new(theta_dim + x_dim, h, &mut rng, device);
        let blocks = (0..config.num_blocks)
            .map(|_| ResidualBlock {
                first: Dense::new(h, h, &mut rng, device),
                second: Dense::scaled(h, h, 0.1, &mut rng, device),
            })
            .collect();
        let output = Dense::new(h, 1, &mut rng, device);
        Ok(Self {
            input,
            blocks,
            output,
            theta_dim,
            x_dim,
        })
    }

    pub fn theta_dim(&self) -> usize {
        self.theta_dim
    }

    pub fn x_dim(&self) -> usize {
        self.x_dim
    }

    /// One logit per row of `[θ, x]`, `[n]`.
    pub fn logits(&self, theta: Tensor<B, 2>, x: Tensor<B, 2>) -> Tensor<B, 1> {
        let [n, _] = theta.dims();
        let mut h = self.input.forward(Tensor::cat(vec![theta, x], 1));
        for block in &self.blocks {
            h = block.forward(h);
        }
        self.output.forward(relu(h)).reshape([n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::to_vec;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn one_logit_per_pair_and_seeded() {
        let device = Default::default();
        let cfg = ClassifierConfig {
            hidden_features: 8,
            num_blocks: 2,
            seed: 4,
        };
        let a = RatioClassifier::<B>::new(2, 3, &cfg, &device).unwrap();
        let b = RatioClassifier::<B>::new(2, 3, &cfg, &device).unwrap();
        let theta = Tensor::<B, 2>::ones([5, 2], &device);
        let x = Tensor::<B, 2>::ones([5, 3], &device);
        let la = to_vec(a.logits(theta.clone(), x.clone())).unwrap();
        assert_eq!(la.len(), 5);
        assert_eq!(la, to_vec(b.logits(theta, x)).unwrap());
    }

    #[test]
    fn rejects_empty_inputs() {
        let device = Default::default();
        assert!(RatioClassifier::<B>::new(0, 3, &ClassifierConfig::default(), &device).is_err());
    }
}
