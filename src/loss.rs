//! Loss strategies.
//!
//! An [`Objective`] turns a minibatch into one score per example (a log-probability, higher is
//! better). The trainer minimizes the negated mean of the scores and reports their mean over the
//! validation split. Two families implement it:
//!
//! - [`ProposalPosterior`]: SNPE-C / APT. Round 0 maximizes `log q(θ | x)` directly; later rounds
//!   use the atomic proposal-posterior score
//!   `log q̃(θ_i | x_i) = u_i0 - log Σ_k exp(u_ik)`, `u_ik = log q(θ_ik | x_i) - log p(θ_ik)`.
//! - [`RatioLoss`]: SNRE. Logits of the classifier on the same atom layout, scored either as a
//!   `K`-way softmax (SRE) or as two binary terms (AALR, `K = 2`).

use burn_core as burn;

use burn::module::Module;
use burn::tensor::activation::log_sigmoid;
use burn::tensor::{backend::Backend, Tensor};
use ndarray::ArrayView2;
use rand_chacha::ChaCha8Rng;

use crate::atoms::sample_atoms;
use crate::classifier::RatioClassifier;
use crate::flow::Flow;
use crate::prior::Prior;
use crate::tensor::{ensure_finite, logsumexp_rows, ndarray_to_burn_2};
use crate::{Error, Result};

/// A minibatch as seen by a loss.
#[derive(Debug, Clone, Copy)]
pub struct LossInput<'a> {
    pub theta: ArrayView2<'a, f32>,
    /// Already standardized if the estimator z-scores its inputs.
    pub x: ArrayView2<'a, f32>,
    /// Rows whose θ was drawn from the prior.
    pub prior_mask: &'a [bool],
    /// Round the data is being trained in (0-based).
    pub round: usize,
}

impl LossInput<'_> {
    pub fn len(&self) -> usize {
        self.theta.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.theta.nrows() == 0
    }
}

pub trait Objective {
    /// The trainable network this objective scores.
    type Net<B: Backend>: Module<B>;

    fn name(&self) -> &'static str;

    /// Per-example scores `[n]` for the minibatch. `num_atoms` is already clamped to the batch.
    fn compute_loss<B: Backend>(
        &self,
        net: &Self::Net<B>,
        input: &LossInput<'_>,
        num_atoms: usize,
        rng: &mut ChaCha8Rng,
        device: &B::Device,
    ) -> Result<Tensor<B, 1>>;

    /// Whether the score in `round` contrasts rows against each other (and so needs atoms).
    fn contrastive(&self, _round: usize) -> bool {
        true
    }

    /// Atom count actually used for a requested count.
    fn num_atoms(&self, requested: usize) -> usize {
        requested
    }
}

/// SNPE-C: maximum likelihood in round 0, atomic proposal-posterior score afterwards.
#[derive(Debug, Clone)]
pub struct ProposalPosterior<P> {
    prior: P,
    /// Add `log q(θ | x)` for prior-drawn rows to the atomic score.
    pub use_combined_loss: bool,
}

impl<P: Prior> ProposalPosterior<P> {
    pub fn new(prior: P, use_combined_loss: bool) -> Self {
        Self {
            prior,
            use_combined_loss,
        }
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }
}

impl<P: Prior> Objective for ProposalPosterior<P> {
    type Net<B: Backend> = Flow<B>;

    fn name(&self) -> &'static str {
        "snpe_c"
    }

    fn contrastive(&self, round: usize) -> bool {
        round > 0
    }

    fn compute_loss<B: Backend>(
        &self,
        net: &Flow<B>,
        input: &LossInput<'_>,
        num_atoms: usize,
        rng: &mut ChaCha8Rng,
        device: &B::Device,
    ) -> Result<Tensor<B, 1>> {
        let theta = ndarray_to_burn_2::<B>(device, &input.theta);
        let x = ndarray_to_burn_2::<B>(device, &input.x);
        if input.round == 0 {
            let lp = net.log_prob(theta, Some(x))?;
            ensure_finite(&lp, "posterior evaluation")?;
            return Ok(lp);
        }

        let b = input.len();
        let atoms = sample_atoms(&input.theta, &input.x, num_atoms, rng)?;
        let k = atoms.num_atoms;
        let atomic_theta = ndarray_to_burn_2::<B>(device, &atoms.atomic_theta.view());
        let repeated_x = ndarray_to_burn_2::<B>(device, &atoms.repeated_x.view());

        let log_q = net.log_prob(atomic_theta.clone(), Some(repeated_x))?;
        ensure_finite(&log_q, "posterior evaluation")?;
        let log_prior = self.prior.log_prob(atomic_theta);
        ensure_finite(&log_prior, "prior evaluation")?;

        let unnormalized = (log_q - log_prior).reshape([b, k]);
        let own = unnormalized.clone().slice([0..b, 0..1]).reshape([b]);
        let mut score = own - logsumexp_rows(unnormalized);
        ensure_finite(&score, "proposal posterior evaluation")?;

        if self.use_combined_loss {
            let mask: Vec<f32> = input.prior_mask.iter().map(|&m| if m { 1.0 } else { 0.0 }).collect();
            if mask.len() != b {
                return Err(Error::Shape("prior mask must have one entry per row"));
            }
            let mask = Tensor::<B, 1>::from_data(burn::tensor::TensorData::new(mask, [b]), device);
            let non_atomic = net.log_prob(theta, Some(x))?;
            ensure_finite(&non_atomic, "posterior evaluation")?;
            score = score + mask * non_atomic;
        }
        Ok(score)
    }
}

/// Classifier logits on the atom layout, `[B, K]`; column 0 holds the true pairs.
pub fn classifier_logits<B: Backend>(
    net: &RatioClassifier<B>,
    input: &LossInput<'_>,
    num_atoms: usize,
    rng: &mut ChaCha8Rng,
    device: &B::Device,
) -> Result<Tensor<B, 2>> {
    let atoms = sample_atoms(&input.theta, &input.x, num_atoms, rng)?;
    let theta = ndarray_to_burn_2::<B>(device, &atoms.atomic_theta.view());
    let x = ndarray_to_burn_2::<B>(device, &atoms.repeated_x.view());
    let logits = net.logits(theta, x);
    ensure_finite(&logits, "classifier evaluation")?;
    Ok(logits.reshape([input.len(), atoms.num_atoms]))
}

/// SNRE scoring rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatioLoss {
    /// `K`-way softmax over atoms (Durkan et al., 2020).
    Sre,
    /// Binary classification with one marginal atom (Hermans et al., 2020).
    Aalr,
}

impl Objective for RatioLoss {
    type Net<B: Backend> = RatioClassifier<B>;

    fn name(&self) -> &'static str {
        match self {
            Self::Sre => "snre_b",
            Self::Aalr => "snre_a",
        }
    }

    fn num_atoms(&self, requested: usize) -> usize {
        match self {
            Self::Sre => requested,
            Self::Aalr => 2,
        }
    }

    fn compute_loss<B: Backend>(
        &self,
        net: &RatioClassifier<B>,
        input: &LossInput<'_>,
        num_atoms: usize,
        rng: &mut ChaCha8Rng,
        device: &B::Device,
    ) -> Result<Tensor<B, 1>> {
        let b = input.len();
        let logits = classifier_logits(net, input, self.num_atoms(num_atoms), rng, device)?;
        let score = match self {
            Self::Sre => {
                let own = logits.clone().slice([0..b, 0..1]).reshape([b]);
                own - logsumexp_rows(logits)
            }
            Self::Aalr => {
                let joint = logits.clone().slice([0..b, 0..1]).reshape([b]);
                let marginal = logits.slice([0..b, 1..2]).reshape([b]);
                log_sigmoid(joint) + log_sigmoid(marginal.neg())
            }
        };
        ensure_finite(&score, "ratio loss")?;
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ClassifierConfig;
    use crate::flow::{EventShape, FlowOptions};
    use crate::link::LinkTransform;
    use crate::prior::{BoxUniformPrior, DiagGaussianPrior};
    use crate::registry::{FlowBuilderRegistry, TransformRegistry};
    use crate::tensor::to_vec;
    use burn_ndarray::NdArray;
    use ndarray::Array2;
    use rand::SeedableRng;

    type B = NdArray<f32>;

    fn data(b: usize) -> (Array2<f32>, Array2<f32>) {
        let theta = Array2::from_shape_fn((b, 2), |(i, k)| ((i * 7 + k * 3) % 11) as f32 / 11.0 - 0.5);
        let x = theta.mapv(|v| 2.0 * v + 0.1);
        (theta, x)
    }

    fn flow(device: &<B as Backend>::Device) -> Flow<B> {
        let opts = FlowOptions {
            num_flows: 2,
            context_dim: 2,
            ..FlowOptions::default()
        };
        FlowBuilderRegistry::<B>::with_defaults()
            .build("maf", &EventShape::Dim(2), LinkTransform::Identity, &opts, &TransformRegistry::with_defaults(), device)
            .unwrap()
    }

    #[test]
    fn atomic_scores_are_log_probabilities() {
        let device = Default::default();
        let (theta, x) = data(8);
        let mask = vec![false; 8];
        let input = LossInput {
            theta: theta.view(),
            x: x.view(),
            prior_mask: &mask,
            round: 1,
        };
        let loss = ProposalPosterior::new(DiagGaussianPrior::standard(2).unwrap(), false);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let s = to_vec(loss.compute_loss::<B>(&flow(&device), &input, 4, &mut rng, &device).unwrap()).unwrap();
        assert_eq!(s.len(), 8);
        // A K-way softmax log-probability lies in (-∞, 0].
        assert!(s.iter().all(|&v| v.is_finite() && v <= 1e-6));
    }

    #[test]
    fn atoms_outside_the_prior_support_diverge() {
        let device = Default::default();
        let (theta, x) = data(6);
        let theta = theta.mapv(|v| v + 10.0);
        let mask = vec![false; 6];
        let input = LossInput {
            theta: theta.view(),
            x: x.view(),
            prior_mask: &mask,
            round: 2,
        };
        let prior = BoxUniformPrior::new(vec![-1.0; 2], vec![1.0; 2]).unwrap();
        let loss = ProposalPosterior::new(prior, false);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(
            loss.compute_loss::<B>(&flow(&device), &input, 3, &mut rng, &device),
            Err(Error::Divergence(_))
        ));
    }

    #[test]
    fn combined_loss_adds_prior_rows_only() {
        let device = Default::default();
        let (theta, x) = data(6);
        let net = flow(&device);
        let prior = DiagGaussianPrior::standard(2).unwrap();
        let mask = vec![true, false, true, false, false, false];
        let input = LossInput {
            theta: theta.view(),
            x: x.view(),
            prior_mask: &mask,
            round: 1,
        };
        let plain = ProposalPosterior::new(prior.clone(), false);
        let combined = ProposalPosterior::new(prior, true);
        let a = to_vec(plain.compute_loss::<B>(&net, &input, 3, &mut ChaCha8Rng::seed_from_u64(5), &device).unwrap()).unwrap();
        let b = to_vec(combined.compute_loss::<B>(&net, &input, 3, &mut ChaCha8Rng::seed_from_u64(5), &device).unwrap()).unwrap();
        let direct = to_vec(
            net.log_prob(ndarray_to_burn_2::<B>(&device, &theta.view()), Some(ndarray_to_burn_2::<B>(&device, &x.view())))
                .unwrap(),
        )
        .unwrap();
        for i in 0..6 {
            let expected = if mask[i] { a[i] + direct[i] } else { a[i] };
            assert!((b[i] - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn ratio_scores_match_their_definitions() {
        let device = Default::default();
        let (theta, x) = data(5);
        let mask = vec![true; 5];
        let input = LossInput {
            theta: theta.view(),
            x: x.view(),
            prior_mask: &mask,
            round: 0,
        };
        let cfg = ClassifierConfig {
            hidden_features: 8,
            ..ClassifierConfig::default()
        };
        let net = RatioClassifier::<B>::new(2, 2, &cfg, &device).unwrap();

        let logits = to_vec(classifier_logits(&net, &input, 5, &mut ChaCha8Rng::seed_from_u64(9), &device).unwrap()).unwrap();
        let sre = to_vec(RatioLoss::Sre.compute_loss::<B>(&net, &input, 5, &mut ChaCha8Rng::seed_from_u64(9), &device).unwrap()).unwrap();
        for i in 0..5 {
            let row = &logits[i * 5..(i + 1) * 5];
            let lse = row.iter().map(|v| v.exp()).sum::<f32>().ln();
            assert!((sre[i] - (row[0] - lse)).abs() < 1e-4);
        }

        assert_eq!(RatioLoss::Aalr.num_atoms(10), 2);
        let aalr = to_vec(RatioLoss::Aalr.compute_loss::<B>(&net, &input, 10, &mut ChaCha8Rng::seed_from_u64(9), &device).unwrap()).unwrap();
        assert!(aalr.iter().all(|v| v.is_finite() && *v < 0.0));
    }
}
