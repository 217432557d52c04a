//! Trained posteriors.
//!
//! [`DensityPosterior`] wraps a conditional flow `q(θ | x)` and samples it directly, rejecting
//! draws that land outside the prior's support ("leakage"). [`RatioPosterior`] wraps a ratio
//! classifier and only knows `p(θ | x)` up to a constant; sampling goes through a
//! [`PosteriorSampler`] fed by [`potential_function`].
//!
//! Both hold an optional default observation, set by the round driver when `x_o` is known. The
//! networks stored here live on the inner (non-autodiff) backend.

use burn_core as burn;

use burn::tensor::backend::Backend;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::classifier::RatioClassifier;
use crate::flow::Flow;
use crate::potential::{potential_function, McmcMethod, Potential, PosteriorSampler};
use crate::prior::Prior;
use crate::tensor::{burn_to_ndarray_1, ndarray_to_burn_2, to_vec};
use crate::{Error, Result};

/// Acceptance rate below which leakage rejection warns.
pub const LOW_ACCEPTANCE_WARNING: f64 = 1e-2;

/// Per-coordinate z-scoring of observations, fitted once on the first round of data.
#[derive(Debug, Clone, PartialEq)]
pub struct Standardize {
    mean: Array1<f32>,
    std: Array1<f32>,
}

impl Standardize {
    /// Fit mean and standard deviation column-wise; deviations are floored at `min_std`.
    pub fn fit(x: &ArrayView2<'_, f32>, min_std: f32) -> Result<Self> {
        let mean = x
            .mean_axis(Axis(0))
            .ok_or(Error::Domain("cannot standardize an empty batch"))?;
        let ddof = if x.nrows() > 1 { 1.0 } else { 0.0 };
        let std = x.std_axis(Axis(0), ddof).mapv(|s| s.max(min_std));
        Ok(Self { mean, std })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn apply(&self, x: &ArrayView2<'_, f32>) -> Array2<f32> {
        (x - &self.mean) / &self.std
    }

    pub fn apply_row(&self, x: &ArrayView1<'_, f32>) -> Array1<f32> {
        (x - &self.mean) / &self.std
    }
}

fn prepare_observation(
    standardize: Option<&Standardize>,
    explicit: Option<&ArrayView1<'_, f32>>,
    default: Option<&Array1<f32>>,
    x_dim: usize,
) -> Result<Array1<f32>> {
    let x = match (explicit, default) {
        (Some(x), _) => x.to_owned(),
        (None, Some(x)) => x.clone(),
        (None, None) => {
            return Err(Error::Config(
                "no observation given and no default observation set".into(),
            ))
        }
    };
    if x.len() != x_dim {
        return Err(Error::Shape("observation width does not match the trained network"));
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(Error::InvalidData("observation contains NaN or infinite values".into()));
    }
    Ok(match standardize {
        Some(s) => s.apply_row(&x.view()),
        None => x,
    })
}

/// Posterior backed by a conditional density estimator.
#[derive(Debug, Clone)]
pub struct DensityPosterior<B: Backend, P> {
    net: Flow<B>,
    prior: P,
    standardize: Option<Standardize>,
    default_x: Option<Array1<f32>>,
    num_trained_rounds: usize,
    max_sampling_batches: usize,
    device: B::Device,
}

impl<B: Backend, P: Prior> DensityPosterior<B, P> {
    pub fn new(
        net: Flow<B>,
        prior: P,
        standardize: Option<Standardize>,
        default_x: Option<Array1<f32>>,
        num_trained_rounds: usize,
        device: B::Device,
    ) -> Self {
        Self {
            net,
            prior,
            standardize,
            default_x,
            num_trained_rounds,
            max_sampling_batches: 100,
            device,
        }
    }

    /// Cap on flow batches drawn by leakage rejection before giving up.
    pub fn with_max_sampling_batches(mut self, max: usize) -> Self {
        self.max_sampling_batches = max.max(1);
        self
    }

    pub fn net(&self) -> &Flow<B> {
        &self.net
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }

    pub fn default_x(&self) -> Option<&Array1<f32>> {
        self.default_x.as_ref()
    }

    pub fn set_default_x(&mut self, x: Array1<f32>) {
        self.default_x = Some(x);
    }

    pub fn num_trained_rounds(&self) -> usize {
        self.num_trained_rounds
    }

    fn context(&self, x: Option<&ArrayView1<'_, f32>>) -> Result<Array1<f32>> {
        prepare_observation(
            self.standardize.as_ref(),
            x,
            self.default_x.as_ref(),
            self.net.context_dim(),
        )
    }

    /// `log q(θ | x)` per row; rows outside the prior's support get `-∞`.
    pub fn log_prob(&self, theta: &ArrayView2<'_, f32>, x: Option<&ArrayView1<'_, f32>>) -> Result<Array1<f32>> {
        let ctx = self.context(x)?;
        let ctx = ndarray_to_burn_2::<B>(&self.device, &ctx.view().insert_axis(Axis(0)));
        let theta = ndarray_to_burn_2::<B>(&self.device, theta);
        let outside = self.prior.log_prob(theta.clone()).equal_elem(f32::NEG_INFINITY);
        let lp = self.net.log_prob(theta, Some(ctx))?.mask_fill(outside, f32::NEG_INFINITY);
        burn_to_ndarray_1(lp)
    }

    pub fn sample(&self, num_samples: usize, x: Option<&ArrayView1<'_, f32>>, seed: u64) -> Result<Array2<f32>> {
        self.sample_with_acceptance(num_samples, x, seed).map(|(s, _)| s)
    }

    /// Draw `num_samples` rows inside the prior's support, also returning the fraction of flow
    /// draws that were accepted.
    pub fn sample_with_acceptance(
        &self,
        num_samples: usize,
        x: Option<&ArrayView1<'_, f32>>,
        seed: u64,
    ) -> Result<(Array2<f32>, f64)> {
        let d = self.net.event_dim();
        if num_samples == 0 {
            return Ok((Array2::zeros((0, d)), 1.0));
        }
        let ctx = self.context(x)?;
        let ctx = ndarray_to_burn_2::<B>(&self.device, &ctx.view().insert_axis(Axis(0)));
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut kept: Vec<f32> = Vec::with_capacity(num_samples * d);
        let mut num_kept = 0usize;
        let mut num_accepted = 0usize;
        let mut num_drawn = 0usize;
        for _ in 0..self.max_sampling_batches {
            if num_kept >= num_samples {
                break;
            }
            let want = num_samples - num_kept;
            let draws = self.net.sample(want, Some(ctx.clone()), &mut rng, &self.device)?;
            let log_prior = to_vec(self.prior.log_prob(draws.clone()))?;
            let values = to_vec(draws)?;
            num_drawn += want;
            for (i, lp) in log_prior.iter().enumerate() {
                let row = &values[i * d..(i + 1) * d];
                if !lp.is_finite() || row.iter().any(|v| !v.is_finite()) {
                    continue;
                }
                num_accepted += 1;
                if num_kept < num_samples {
                    kept.extend_from_slice(row);
                    num_kept += 1;
                }
            }
        }
        let acceptance = num_accepted as f64 / num_drawn.max(1) as f64;
        if acceptance < LOW_ACCEPTANCE_WARNING {
            log::warn!(
                "only {:.2}% of posterior samples fell inside the prior support; \
                 sampling may be slow and the posterior may be poorly trained",
                100.0 * acceptance
            );
        }
        if num_kept < num_samples {
            return Err(Error::Divergence(
                "leakage rejection could not collect enough samples inside the prior support",
            ));
        }
        let samples = Array2::from_shape_vec((num_samples, d), kept)
            .map_err(|e| Error::Tensor(e.to_string()))?;
        Ok((samples, acceptance))
    }
}

/// Posterior known up to a constant through a ratio classifier.
#[derive(Debug, Clone)]
pub struct RatioPosterior<B: Backend, P> {
    net: RatioClassifier<B>,
    prior: P,
    standardize: Option<Standardize>,
    default_x: Option<Array1<f32>>,
    num_trained_rounds: usize,
    device: B::Device,
}

impl<B, P> RatioPosterior<B, P>
where
    B: Backend,
    P: Prior + Clone + 'static,
{
    pub fn new(
        net: RatioClassifier<B>,
        prior: P,
        standardize: Option<Standardize>,
        default_x: Option<Array1<f32>>,
        num_trained_rounds: usize,
        device: B::Device,
    ) -> Self {
        Self {
            net,
            prior,
            standardize,
            default_x,
            num_trained_rounds,
            device,
        }
    }

    pub fn net(&self) -> &RatioClassifier<B> {
        &self.net
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }

    pub fn default_x(&self) -> Option<&Array1<f32>> {
        self.default_x.as_ref()
    }

    pub fn set_default_x(&mut self, x: Array1<f32>) {
        self.default_x = Some(x);
    }

    pub fn num_trained_rounds(&self) -> usize {
        self.num_trained_rounds
    }

    fn observation(&self, x: Option<&ArrayView1<'_, f32>>) -> Result<Array1<f32>> {
        prepare_observation(self.standardize.as_ref(), x, self.default_x.as_ref(), self.net.x_dim())
    }

    /// `log r(θ, x) + log p(θ)` per row.
    pub fn log_prob_unnormalized(
        &self,
        theta: &ArrayView2<'_, f32>,
        x: Option<&ArrayView1<'_, f32>>,
    ) -> Result<Array1<f32>> {
        let obs = self.observation(x)?;
        let n = theta.nrows();
        let xs = obs
            .view()
            .insert_axis(Axis(0))
            .broadcast((n, obs.len()))
            .ok_or(Error::Shape("cannot broadcast the observation"))?
            .to_owned();
        let theta = ndarray_to_burn_2::<B>(&self.device, theta);
        let x = ndarray_to_burn_2::<B>(&self.device, &xs.view());
        let lp = self.net.logits(theta.clone(), x) + self.prior.log_prob(theta);
        burn_to_ndarray_1(lp)
    }

    /// Potential at the default observation for `method`.
    pub fn potential(&self, method: McmcMethod) -> Result<Potential<B>> {
        let obs = self.observation(None)?;
        Ok(potential_function(
            self.prior.clone(),
            self.net.clone(),
            &obs.view(),
            method,
            &self.device,
        ))
    }

    /// Draw from the posterior at the default observation with `sampler`, started at a prior
    /// draw.
    pub fn sample(
        &self,
        sampler: &mut dyn PosteriorSampler<B>,
        num_samples: usize,
        seed: u64,
    ) -> Result<Array2<f32>> {
        let potential = self.potential(sampler.method())?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let init = self.prior.sample(1, &mut rng);
        let samples = sampler.sample(&potential, init.row(0), num_samples, seed)?;
        if samples.dim() != (num_samples, self.prior.dim()) {
            return Err(Error::Shape("sampler returned the wrong number of rows or columns"));
        }
        Ok(samples)
    }
}
