//! Potential functions for MCMC backends.
//!
//! A ratio estimator turns into an unnormalized log-posterior
//! `log r(θ, x_o) + log p(θ)`. MCMC libraries disagree on conventions, so the factory hands out
//! one of two forms depending on the sampling method:
//!
//! - **numeric** (`slice_np`): host slice in, `f64` log-posterior out,
//! - **gradient** (`slice`, `hmc`, `nuts`): 1-D tensor in, *negated* log-posterior (an energy)
//!   out, staying on the tensor backend so gradients can flow.
//!
//! The factory captures its inputs by value and is meant to be called again whenever the model
//! or the observation changes.

use burn_core as burn;

use std::str::FromStr;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use ndarray::{Array2, ArrayView1};

use crate::classifier::RatioClassifier;
use crate::prior::Prior;
use crate::tensor::to_vec;
use crate::{Error, Result};

/// MCMC method names understood by the potential factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McmcMethod {
    SliceNp,
    Slice,
    Hmc,
    Nuts,
}

impl McmcMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SliceNp => "slice_np",
            Self::Slice => "slice",
            Self::Hmc => "hmc",
            Self::Nuts => "nuts",
        }
    }

    /// Whether this method consumes the gradient-backend form.
    pub fn uses_gradients(&self) -> bool {
        !matches!(self, Self::SliceNp)
    }
}

impl FromStr for McmcMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "slice_np" => Ok(Self::SliceNp),
            "slice" => Ok(Self::Slice),
            "hmc" => Ok(Self::Hmc),
            "nuts" => Ok(Self::Nuts),
            other => Err(Error::Config(format!(
                "unknown MCMC method `{other}`; expected slice_np, slice, hmc or nuts"
            ))),
        }
    }
}

/// A log-ratio model `log r(θ, x)`.
pub trait LogRatioModel<B: Backend> {
    fn log_ratio(&self, theta: Tensor<B, 2>, x: Tensor<B, 2>) -> Tensor<B, 1>;
}

impl<B: Backend> LogRatioModel<B> for RatioClassifier<B> {
    fn log_ratio(&self, theta: Tensor<B, 2>, x: Tensor<B, 2>) -> Tensor<B, 1> {
        self.logits(theta, x)
    }
}

pub type NumericPotential = Box<dyn Fn(&[f32]) -> Result<f64>>;
pub type GradientPotential<B> = Box<dyn Fn(Tensor<B, 1>) -> Result<Tensor<B, 1>>>;

pub enum Potential<B: Backend> {
    /// Returns `log r(θ, x_o) + log p(θ)`.
    Numeric(NumericPotential),
    /// Returns `-(log r(θ, x_o) + log p(θ))` as a one-element tensor.
    Gradient(GradientPotential<B>),
}

impl<B: Backend> std::fmt::Debug for Potential<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Numeric(_) => f.write_str("Potential::Numeric"),
            Self::Gradient(_) => f.write_str("Potential::Gradient"),
        }
    }
}

impl<B: Backend> Potential<B> {
    /// Unnormalized log-posterior at `theta`, whichever form this is.
    pub fn log_posterior(&self, theta: &[f32], device: &B::Device) -> Result<f64> {
        match self {
            Self::Numeric(f) => f(theta),
            Self::Gradient(f) => {
                let t = Tensor::<B, 1>::from_data(TensorData::new(theta.to_vec(), [theta.len()]), device);
                let energy = to_vec(f(t)?)?;
                energy
                    .first()
                    .map(|e| -(*e as f64))
                    .ok_or(Error::Shape("potential returned an empty tensor"))
            }
        }
    }
}

/// Build the potential for `method` from a prior, a log-ratio model and the observation `x_o`.
pub fn potential_function<B, P, M>(
    prior: P,
    model: M,
    x_o: &ArrayView1<'_, f32>,
    method: McmcMethod,
    device: &B::Device,
) -> Potential<B>
where
    B: Backend,
    P: Prior + 'static,
    M: LogRatioModel<B> + 'static,
{
    let dim = prior.dim();
    let x = Tensor::<B, 2>::from_data(
        TensorData::new(x_o.iter().copied().collect::<Vec<f32>>(), [1, x_o.len()]),
        device,
    );
    if method.uses_gradients() {
        Potential::Gradient(Box::new(move |theta: Tensor<B, 1>| {
            if theta.dims()[0] != dim {
                return Err(Error::Shape("theta length must match the prior dimension"));
            }
            let theta = theta.reshape([1, dim]);
            let log_post = model.log_ratio(theta.clone(), x.clone()) + prior.log_prob(theta);
            Ok(log_post.neg())
        }))
    } else {
        let device = device.clone();
        Potential::Numeric(Box::new(move |theta: &[f32]| {
            if theta.len() != dim {
                return Err(Error::Shape("theta length must match the prior dimension"));
            }
            let theta = Tensor::<B, 2>::from_data(TensorData::new(theta.to_vec(), [1, dim]), &device);
            let log_post = model.log_ratio(theta.clone(), x.clone()) + prior.log_prob(theta);
            Ok(to_vec(log_post)?.first().copied().unwrap_or(f32::NAN) as f64)
        }))
    }
}

/// An MCMC backend that can draw from a potential.
pub trait PosteriorSampler<B: Backend> {
    fn method(&self) -> McmcMethod;

    /// `num_samples` draws (one per row) started from `init`.
    fn sample(
        &mut self,
        potential: &Potential<B>,
        init: ArrayView1<'_, f32>,
        num_samples: usize,
        seed: u64,
    ) -> Result<Array2<f32>>;
}
