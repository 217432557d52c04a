//! Prior distributions over simulator parameters.
//!
//! A prior is sampled on the host (`ndarray`, seeded RNG) and evaluated on tensors so that it can
//! sit inside a differentiable loss. Outside its support `log_prob` is `-∞`; the contrastive
//! losses turn that into an [`Error::Divergence`](crate::Error::Divergence).

use burn_core as burn;

use burn::tensor::{backend::Backend, Tensor};
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::tensor::row_tensor;
use crate::{Error, Result};

const LN_2PI: f32 = 1.837_877_1;

pub trait Prior {
    /// Parameter dimension.
    fn dim(&self) -> usize;

    /// `n` independent draws, one per row.
    fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Array2<f32>;

    /// Per-row log-density of a `[n, dim]` batch, `[n]`.
    fn log_prob<B: Backend>(&self, theta: Tensor<B, 2>) -> Tensor<B, 1>;
}

/// Independent Gaussian prior `N(loc, diag(scale²))`.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagGaussianPrior {
    loc: Vec<f32>,
    scale: Vec<f32>,
}

impl DiagGaussianPrior {
    pub fn new(loc: Vec<f32>, scale: Vec<f32>) -> Result<Self> {
        if loc.is_empty() {
            return Err(Error::Domain("prior dimension must be >= 1"));
        }
        if loc.len() != scale.len() {
            return Err(Error::Shape("loc and scale must have the same length"));
        }
        if scale.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(Error::Domain("scale entries must be finite and positive"));
        }
        Ok(Self { loc, scale })
    }

    /// `N(0, I_dim)`.
    pub fn standard(dim: usize) -> Result<Self> {
        Self::new(vec![0.0; dim], vec![1.0; dim])
    }

    pub fn loc(&self) -> &[f32] {
        &self.loc
    }

    pub fn scale(&self) -> &[f32] {
        &self.scale
    }
}

impl Prior for DiagGaussianPrior {
    fn dim(&self) -> usize {
        self.loc.len()
    }

    fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Array2<f32> {
        let d = self.dim();
        let mut out = Array2::<f32>::zeros((n, d));
        for i in 0..n {
            for k in 0..d {
                let e: f32 = StandardNormal.sample(rng);
                out[[i, k]] = self.loc[k] + self.scale[k] * e;
            }
        }
        out
    }

    fn log_prob<B: Backend>(&self, theta: Tensor<B, 2>) -> Tensor<B, 1> {
        let device = theta.device();
        let [n, d] = theta.dims();
        let loc = row_tensor::<B>(&self.loc, &device);
        let scale = row_tensor::<B>(&self.scale, &device);
        let log_norm: f32 = self.scale.iter().map(|s| s.ln()).sum::<f32>() + 0.5 * d as f32 * LN_2PI;
        let z = (theta - loc) / scale;
        (z.clone() * z)
            .sum_dim(1)
            .mul_scalar(-0.5)
            .sub_scalar(log_norm)
            .reshape([n])
    }
}

/// Uniform prior on the box `[low, high)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxUniformPrior {
    low: Vec<f32>,
    high: Vec<f32>,
}

impl BoxUniformPrior {
    pub fn new(low: Vec<f32>, high: Vec<f32>) -> Result<Self> {
        if low.is_empty() {
            return Err(Error::Domain("prior dimension must be >= 1"));
        }
        if low.len() != high.len() {
            return Err(Error::Shape("low and high must have the same length"));
        }
        if low.iter().zip(&high).any(|(l, h)| !(l.is_finite() && h.is_finite() && l < h)) {
            return Err(Error::Domain("box bounds must be finite with low < high"));
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> &[f32] {
        &self.low
    }

    pub fn high(&self) -> &[f32] {
        &self.high
    }

    /// Host-side membership test for a single point.
    pub fn contains(&self, theta: &[f32]) -> bool {
        theta.len() == self.low.len()
            && theta
                .iter()
                .zip(self.low.iter().zip(&self.high))
                .all(|(t, (l, h))| *t >= *l && *t < *h)
    }

    fn log_volume(&self) -> f32 {
        self.low.iter().zip(&self.high).map(|(l, h)| (h - l).ln()).sum()
    }
}

impl Prior for BoxUniformPrior {
    fn dim(&self) -> usize {
        self.low.len()
    }

    fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Array2<f32> {
        let d = self.dim();
        let mut out = Array2::<f32>::zeros((n, d));
        for i in 0..n {
            for k in 0..d {
                let u: f32 = rng.random();
                out[[i, k]] = self.low[k] + (self.high[k] - self.low[k]) * u;
            }
        }
        out
    }

    fn log_prob<B: Backend>(&self, theta: Tensor<B, 2>) -> Tensor<B, 1> {
        let device = theta.device();
        let [n, _] = theta.dims();
        let low = row_tensor::<B>(&self.low, &device);
        let high = row_tensor::<B>(&self.high, &device);
        let below = (theta.clone() - low).lower_elem(0.0).float();
        let above = (theta - high).greater_equal_elem(0.0).float();
        let outside = (below + above).sum_dim(1).greater_elem(0.0);
        Tensor::<B, 2>::full([n, 1], -self.log_volume(), &device)
            .mask_fill(outside, f32::NEG_INFINITY)
            .reshape([n])
    }
}
