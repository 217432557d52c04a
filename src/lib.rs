//! # seqinfer
//!
//! Sequential simulation-based inference as a library primitive.
//!
//! Given a stochastic simulator `θ ↦ x` and a prior `p(θ)`, this crate learns either
//!
//! - a conditional density estimator `q(θ | x)` approximating the posterior (SNPE-C / APT), or
//! - a binary classifier whose logit approximates the log likelihood-to-evidence ratio
//!   (SNRE, in the SRE and AALR variants),
//!
//! over several rounds, drawing each round's parameters from the most recent posterior
//! estimate so that the simulation budget concentrates where the observation lives.
//!
//! This crate is intentionally small:
//!
//! - it implements the **round driver**, the **atomic contrastive losses** and the
//!   **normalizing-flow construction** used to build density estimators,
//! - the simulator, the prior and the MCMC backend are collaborators behind traits
//!   ([`simulator::Simulator`], [`prior::Prior`], [`potential::PosteriorSampler`]),
//! - it does not provide a CLI or experiment runner.
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: every config carries a `seed`; network weights,
//!   permutations, data splits, minibatches and atom sets are all drawn from seeded
//!   `ChaCha8Rng` streams.
//! - **Returned θ ordering wins**: simulators may reorder their batch; storage always uses the
//!   `(θ, x)` pairs exactly as the simulator returned them.
//! - **Divergence is fatal**: a non-finite log-density inside a loss aborts training with
//!   [`Error::Divergence`]; nothing is retried or silently clipped.
//! - **Data protocol is `ndarray`, models are `burn`**: the sample bank and atom sampler work on
//!   `Array2<f32>` rows; flows, classifiers and the optimizer run on a `burn` autodiff backend.
//!   Validation, posterior sampling and density evaluation run on the inner backend
//!   (`AutodiffModule::valid`).
//!
//! ## How this maps to the papers
//!
//! - Greenberg et al., *Automatic Posterior Transformation for Likelihood-free Inference*
//!   (ICML 2019): the atomic proposal-posterior loss in [`loss::ProposalPosterior`].
//! - Durkan et al., *On Contrastive Learning for Likelihood-free Inference* (ICML 2020):
//!   the multi-atom classifier loss [`loss::RatioLoss::Sre`].
//! - Hermans et al., *Likelihood-free MCMC with Amortized Approximate Ratio Estimators*
//!   (ICML 2020): the two-atom classifier loss [`loss::RatioLoss::Aalr`].
//! - Papamakarios et al., *Masked Autoregressive Flow for Density Estimation* (NeurIPS 2017)
//!   and Durkan et al., *Neural Spline Flows* (NeurIPS 2019): the `maf`, `nsf`, `mcf` and `scf`
//!   flow builders.
//!
//! ## Module map
//!
//! - `prior`: prior contract + diagonal Gaussian and box-uniform priors
//! - `simulator`: simulator contract and batched simulation
//! - `bank`: append-only sample bank and invalid-simulation filtering
//! - `atoms`: contrastive atom sets shared by both estimator families
//! - `early_stopping`: patience / epoch-ceiling convergence control
//! - `tensor`: `ndarray` ↔ `burn` bridging and numeric guards
//! - `nn`: dense, masked (MADE) and residual building blocks
//! - `spline`: monotone rational-quadratic splines
//! - `transforms`: the invertible flow layers
//! - `link`: support-mapping link transforms
//! - `flow`: base distributions and the composed [`flow::Flow`]
//! - `registry`: transform and flow-builder registries
//! - `classifier`: the ratio-estimation classifier
//! - `loss`: the loss strategies
//! - `train`: minibatch fitting with early stopping
//! - `potential`: potential functions for MCMC backends
//! - `posterior`: fitted posterior objects
//! - `inference`: the sequential round driver (`Snpe`, `Snre`)

pub mod atoms;
pub mod bank;
pub mod classifier;
pub mod early_stopping;
pub mod flow;
pub mod inference;
pub mod link;
pub mod loss;
pub mod nn;
pub mod posterior;
pub mod potential;
pub mod prior;
pub mod registry;
pub mod simulator;
pub mod spline;
pub mod tensor;
pub mod train;
pub mod transforms;

use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;

/// Default training backend: ndarray + autodiff.
pub type DefaultBackend = Autodiff<NdArray<f32>>;

/// Inner (evaluation) backend of [`DefaultBackend`].
pub type DefaultInnerBackend = NdArray<f32>;

/// seqinfer error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("non-finite values during {0}")]
    Divergence(&'static str),
    #[error("invalid simulation output: {0}")]
    InvalidData(String),
    #[error("simulator failed: {0}")]
    Simulator(String),
    #[error("tensor data conversion failed: {0}")]
    Tensor(String),
}

pub type Result<T> = std::result::Result<T, Error>;
