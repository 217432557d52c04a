//! The sequential round driver.
//!
//! One call to [`SequentialInference::run`] performs `num_rounds` rounds of
//!
//! 1. **sample**: θ from the prior (first round) or from the latest posterior,
//! 2. **simulate**: in chunks of `simulation_batch_size`, keeping the returned θ order,
//! 3. **filter**: drop non-finite simulations according to [`InvalidXPolicy`],
//! 4. **accumulate**: append the round to the [`SampleBank`],
//! 5. **train**: [`fit`] the estimator on the pooled bank,
//! 6. **summarize**: log and report a [`RoundSummary`].
//!
//! What is trained, and how a posterior is sampled, is decided by a [`Family`]:
//! [`PosteriorFamily`] (SNPE-C, a conditional flow) or [`RatioFamily`] (SNRE, a classifier plus an
//! external MCMC sampler). State persists across calls to `run`, so a second call continues
//! from the last posterior with the bank intact.

use burn_core as burn;

use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use ndarray::{Array1, Array2, ArrayView1};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::bank::{filter_invalid_x, InvalidXPolicy, SampleBank};
use crate::classifier::{ClassifierConfig, RatioClassifier};
use crate::flow::{EventShape, Flow, FlowOptions};
use crate::link::LinkTransform;
use crate::loss::{Objective, ProposalPosterior, RatioLoss};
use crate::posterior::{DensityPosterior, RatioPosterior, Standardize};
use crate::potential::PosteriorSampler;
use crate::prior::Prior;
use crate::registry::{FlowBuilderRegistry, TransformRegistry};
use crate::simulator::{simulate_in_batches, Simulator};
use crate::train::{fit, RoundSummary, TrainConfig, TrainingObserver};
use crate::{DefaultBackend, Error, Result};

/// Per-run options of the round driver.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Rows handed to the simulator per call.
    pub simulation_batch_size: usize,
    /// Rebuild the estimator from its seeded initial weights before every round after the first.
    pub retrain_from_scratch_each_round: bool,
    /// Leave prior-drawn rounds out of training once a posterior proposal exists.
    pub discard_prior_samples: bool,
    pub exclude_invalid_x: InvalidXPolicy,
    /// z-score observations with statistics of the first round.
    pub z_score_x: bool,
    pub z_score_min_std: f32,
    /// Log each round's summary at info level (debug otherwise).
    pub show_round_summary: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            simulation_batch_size: 1,
            retrain_from_scratch_each_round: false,
            discard_prior_samples: false,
            exclude_invalid_x: InvalidXPolicy::Raise,
            z_score_x: true,
            z_score_min_std: 1e-7,
            show_round_summary: false,
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.simulation_batch_size == 0 {
            return Err(Error::Config("simulation_batch_size must be >= 1".into()));
        }
        if !(self.z_score_min_std.is_finite() && self.z_score_min_std > 0.0) {
            return Err(Error::Config("z_score_min_std must be finite and positive".into()));
        }
        Ok(())
    }
}

/// Parameters drawn for the next round.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub theta: Array2<f32>,
    /// Fraction of draws kept by leakage rejection, when the family rejects.
    pub acceptance_rate: Option<f64>,
}

/// Trainable network of a family's objective on backend `B`.
pub type NetOf<F, B, P> = <<F as Family<B, P>>::Objective as Objective>::Net<B>;
/// The same network on the inner (evaluation) backend.
pub type InnerNetOf<F, B, P> = <<F as Family<B, P>>::Objective as Objective>::Net<<B as AutodiffBackend>::InnerBackend>;

/// An estimator family: what gets trained and how its posterior proposes the next round.
pub trait Family<B: AutodiffBackend, P: Prior> {
    type Objective: Objective;
    type Posterior: Clone;

    fn objective(&self) -> &Self::Objective;

    /// A freshly initialized network for `theta_dim` parameters and `x_dim` observations.
    ///
    /// Must be deterministic: retraining from scratch calls it again for every round.
    fn build_net(&self, theta_dim: usize, x_dim: usize, device: &B::Device) -> Result<NetOf<Self, B, P>>;

    /// Reject run configurations this family cannot carry out.
    fn check_rounds(&self, total_rounds: usize) -> Result<()>;

    fn posterior(
        &self,
        net: InnerNetOf<Self, B, P>,
        prior: P,
        standardize: Option<Standardize>,
        x_o: Option<Array1<f32>>,
        num_trained_rounds: usize,
        device: &B::Device,
    ) -> Self::Posterior;

    fn propose(&mut self, posterior: &Self::Posterior, num_samples: usize, seed: u64) -> Result<Proposal>;
}

/// SNPE-C: a conditional flow `q(θ | x)` trained with the proposal-posterior loss.
pub struct PosteriorFamily<B: Backend, P> {
    objective: ProposalPosterior<P>,
    density_estimator: String,
    flow_options: FlowOptions,
    link: LinkTransform,
    transforms: TransformRegistry<B>,
    builders: FlowBuilderRegistry<B>,
    max_sampling_batches: usize,
}

impl<B: Backend, P: Prior> PosteriorFamily<B, P> {
    /// `maf` estimator, identity link, default flow options.
    pub fn new(prior: P) -> Self {
        Self {
            objective: ProposalPosterior::new(prior, false),
            density_estimator: "maf".into(),
            flow_options: FlowOptions::default(),
            link: LinkTransform::Identity,
            transforms: TransformRegistry::with_defaults(),
            builders: FlowBuilderRegistry::with_defaults(),
            max_sampling_batches: 100,
        }
    }

    /// Name of a registered flow builder.
    pub fn with_density_estimator(mut self, name: &str) -> Self {
        self.density_estimator = name.to_lowercase();
        self
    }

    /// `context_dim` is overwritten with the observation width at build time.
    pub fn with_flow_options(mut self, options: FlowOptions) -> Self {
        self.flow_options = options;
        self
    }

    pub fn with_link(mut self, link: LinkTransform) -> Self {
        self.link = link;
        self
    }

    pub fn with_combined_loss(mut self, combined: bool) -> Self {
        self.objective.use_combined_loss = combined;
        self
    }

    pub fn with_max_sampling_batches(mut self, max: usize) -> Self {
        self.max_sampling_batches = max.max(1);
        self
    }

    pub fn transforms_mut(&mut self) -> &mut TransformRegistry<B> {
        &mut self.transforms
    }

    pub fn builders_mut(&mut self) -> &mut FlowBuilderRegistry<B> {
        &mut self.builders
    }
}

impl<B, P> Family<B, P> for PosteriorFamily<B, P>
where
    B: AutodiffBackend,
    P: Prior + Clone,
{
    type Objective = ProposalPosterior<P>;
    type Posterior = DensityPosterior<B::InnerBackend, P>;

    fn objective(&self) -> &ProposalPosterior<P> {
        &self.objective
    }

    fn build_net(&self, theta_dim: usize, x_dim: usize, device: &B::Device) -> Result<Flow<B>> {
        if theta_dim != self.objective.prior().dim() {
            return Err(Error::Shape("simulated theta does not match the prior dimension"));
        }
        let options = FlowOptions {
            context_dim: x_dim,
            ..self.flow_options.clone()
        };
        self.builders.build(
            &self.density_estimator,
            &EventShape::Dim(theta_dim),
            self.link.clone(),
            &options,
            &self.transforms,
            device,
        )
    }

    fn check_rounds(&self, _total_rounds: usize) -> Result<()> {
        if !self.builders.contains(&self.density_estimator) {
            return Err(Error::Config(format!(
                "unknown density estimator `{}`; registered: {}",
                self.density_estimator,
                self.builders.names().join(", ")
            )));
        }
        Ok(())
    }

    fn posterior(
        &self,
        net: Flow<B::InnerBackend>,
        prior: P,
        standardize: Option<Standardize>,
        x_o: Option<Array1<f32>>,
        num_trained_rounds: usize,
        device: &B::Device,
    ) -> DensityPosterior<B::InnerBackend, P> {
        DensityPosterior::new(net, prior, standardize, x_o, num_trained_rounds, device.clone())
            .with_max_sampling_batches(self.max_sampling_batches)
    }

    fn propose(
        &mut self,
        posterior: &DensityPosterior<B::InnerBackend, P>,
        num_samples: usize,
        seed: u64,
    ) -> Result<Proposal> {
        let (theta, acceptance) = posterior.sample_with_acceptance(num_samples, None, seed)?;
        Ok(Proposal {
            theta,
            acceptance_rate: Some(acceptance),
        })
    }
}

/// SNRE: a ratio classifier, sampled through an MCMC backend.
pub struct RatioFamily<B: AutodiffBackend, P> {
    loss: RatioLoss,
    classifier: ClassifierConfig,
    sampler: Option<Box<dyn PosteriorSampler<B::InnerBackend>>>,
    _prior: std::marker::PhantomData<P>,
}

impl<B: AutodiffBackend, P> RatioFamily<B, P> {
    pub fn new(loss: RatioLoss) -> Self {
        Self {
            loss,
            classifier: ClassifierConfig::default(),
            sampler: None,
            _prior: std::marker::PhantomData,
        }
    }

    pub fn with_classifier(mut self, config: ClassifierConfig) -> Self {
        self.classifier = config;
        self
    }

    /// MCMC backend used to draw each later round's parameters.
    pub fn with_sampler(mut self, sampler: Box<dyn PosteriorSampler<B::InnerBackend>>) -> Self {
        self.sampler = Some(sampler);
        self
    }
}

impl<B, P> Family<B, P> for RatioFamily<B, P>
where
    B: AutodiffBackend,
    P: Prior + Clone + 'static,
{
    type Objective = RatioLoss;
    type Posterior = RatioPosterior<B::InnerBackend, P>;

    fn objective(&self) -> &RatioLoss {
        &self.loss
    }

    fn build_net(&self, theta_dim: usize, x_dim: usize, device: &B::Device) -> Result<RatioClassifier<B>> {
        RatioClassifier::new(theta_dim, x_dim, &self.classifier, device)
    }

    fn check_rounds(&self, total_rounds: usize) -> Result<()> {
        if total_rounds > 1 && self.sampler.is_none() {
            return Err(Error::Config(
                "multi-round ratio estimation needs an MCMC sampler to draw proposals".into(),
            ));
        }
        Ok(())
    }

    fn posterior(
        &self,
        net: RatioClassifier<B::InnerBackend>,
        prior: P,
        standardize: Option<Standardize>,
        x_o: Option<Array1<f32>>,
        num_trained_rounds: usize,
        device: &B::Device,
    ) -> RatioPosterior<B::InnerBackend, P> {
        RatioPosterior::new(net, prior, standardize, x_o, num_trained_rounds, device.clone())
    }

    fn propose(
        &mut self,
        posterior: &RatioPosterior<B::InnerBackend, P>,
        num_samples: usize,
        seed: u64,
    ) -> Result<Proposal> {
        let sampler = self
            .sampler
            .as_deref_mut()
            .ok_or_else(|| Error::Config("no MCMC sampler configured".into()))?;
        let theta = posterior.sample(sampler, num_samples, seed)?;
        Ok(Proposal {
            theta,
            acceptance_rate: None,
        })
    }
}

/// Median Euclidean distance of the rows of `x` to `x_o`.
fn median_distance(x: &Array2<f32>, x_o: &ArrayView1<'_, f32>) -> Option<f64> {
    let mut d: Vec<f64> = x
        .outer_iter()
        .map(|row| {
            row.iter()
                .zip(x_o.iter())
                .map(|(a, b)| ((a - b) as f64).powi(2))
                .sum::<f64>()
                .sqrt()
        })
        .collect();
    if d.is_empty() {
        return None;
    }
    d.sort_by(f64::total_cmp);
    let mid = d.len() / 2;
    Some(if d.len() % 2 == 0 {
        0.5 * (d[mid - 1] + d[mid])
    } else {
        d[mid]
    })
}

/// Multi-round simulation-based inference.
pub struct SequentialInference<B, P, F>
where
    B: AutodiffBackend,
    P: Prior,
    F: Family<B, P>,
{
    prior: P,
    family: F,
    config: InferenceConfig,
    bank: SampleBank,
    net: Option<NetOf<F, B, P>>,
    standardize: Option<Standardize>,
    posterior: Option<F::Posterior>,
    summaries: Vec<RoundSummary>,
    device: B::Device,
}

/// SNPE-C on the default backend.
pub type Snpe<P, B = DefaultBackend> = SequentialInference<B, P, PosteriorFamily<B, P>>;
/// SNRE on the default backend.
pub type Snre<P, B = DefaultBackend> = SequentialInference<B, P, RatioFamily<B, P>>;

impl<B, P> SequentialInference<B, P, PosteriorFamily<B, P>>
where
    B: AutodiffBackend,
    P: Prior + Clone,
{
    /// SNPE-C with a `maf` estimator.
    pub fn snpe(prior: P, config: InferenceConfig, device: B::Device) -> Self {
        let family = PosteriorFamily::new(prior.clone());
        Self::new(prior, family, config, device)
    }
}

impl<B, P> SequentialInference<B, P, RatioFamily<B, P>>
where
    B: AutodiffBackend,
    P: Prior + Clone + 'static,
{
    pub fn snre(prior: P, loss: RatioLoss, config: InferenceConfig, device: B::Device) -> Self {
        Self::new(prior, RatioFamily::new(loss), config, device)
    }
}

impl<B, P, F> SequentialInference<B, P, F>
where
    B: AutodiffBackend,
    P: Prior + Clone,
    F: Family<B, P>,
    NetOf<F, B, P>: AutodiffModule<B, InnerModule = InnerNetOf<F, B, P>>,
{
    pub fn new(prior: P, family: F, config: InferenceConfig, device: B::Device) -> Self {
        Self {
            prior,
            family,
            config,
            bank: SampleBank::new(),
            net: None,
            standardize: None,
            posterior: None,
            summaries: Vec::new(),
            device,
        }
    }

    pub fn family(&self) -> &F {
        &self.family
    }

    pub fn family_mut(&mut self) -> &mut F {
        &mut self.family
    }

    pub fn bank(&self) -> &SampleBank {
        &self.bank
    }

    pub fn summaries(&self) -> &[RoundSummary] {
        &self.summaries
    }

    /// Rounds trained so far, across all calls to [`Self::run`].
    pub fn num_trained_rounds(&self) -> usize {
        self.summaries.len()
    }

    /// Latest posterior, if any round has been trained.
    pub fn posterior(&self) -> Option<&F::Posterior> {
        self.posterior.as_ref()
    }

    /// Run `train.num_rounds` rounds and return the final posterior.
    ///
    /// `x_o` is required when more than one round is trained (including rounds from earlier
    /// calls); a single round is amortized and may omit it.
    pub fn run<S: Simulator + ?Sized>(
        &mut self,
        simulator: &mut S,
        train: &TrainConfig,
        x_o: Option<ArrayView1<'_, f32>>,
        observer: &mut dyn TrainingObserver,
    ) -> Result<F::Posterior> {
        train.validate()?;
        self.config.validate()?;
        let budget = train.num_simulations.per_round(train.num_rounds)?;
        let first_round = self.summaries.len();
        let total_rounds = first_round + train.num_rounds;
        self.family.check_rounds(total_rounds)?;
        if total_rounds > 1 && x_o.is_none() {
            return Err(Error::Config(
                "an observation x_o is required for more than one round".into(),
            ));
        }
        if let Some(x) = &x_o {
            if x.iter().any(|v| !v.is_finite()) {
                return Err(Error::InvalidData("x_o contains NaN or infinite values".into()));
            }
        }
        let x_o_owned = x_o.map(|x| x.to_owned());
        let mut rng = ChaCha8Rng::seed_from_u64(train.seed);

        for (offset, &num_simulations) in budget.iter().enumerate() {
            let round = first_round + offset;

            let (theta, from_prior, acceptance_rate) = match &self.posterior {
                None => (self.prior.sample(num_simulations, &mut rng), true, None),
                Some(posterior) => {
                    let proposal = self.family.propose(posterior, num_simulations, rng.next_u64())?;
                    (proposal.theta, false, proposal.acceptance_rate)
                }
            };

            let (theta, x) =
                simulate_in_batches(simulator, &theta.view(), self.config.simulation_batch_size)?;
            let (theta, x, invalid) = filter_invalid_x(theta, x, self.config.exclude_invalid_x)?;
            if invalid.total() > 0 && self.config.exclude_invalid_x == InvalidXPolicy::ExcludeSilently {
                log::debug!("round {round}: silently excluded {} invalid simulations", invalid.total());
            }
            if theta.nrows() == 0 {
                return Err(Error::InvalidData(format!(
                    "round {round}: every simulation was invalid"
                )));
            }
            if let Some(x_o) = &x_o {
                if x_o.len() != x.ncols() {
                    return Err(Error::Shape("x_o width does not match the simulator output"));
                }
            }
            let median_distance_to_observation = x_o.as_ref().and_then(|x_o| median_distance(&x, x_o));
            self.bank.push(theta, x, from_prior)?;

            if self.config.z_score_x && self.standardize.is_none() {
                let first = self
                    .bank
                    .round(0)
                    .ok_or(Error::Domain("sample bank is empty"))?;
                self.standardize = Some(Standardize::fit(&first.x.view(), self.config.z_score_min_std)?);
            }

            // A clone would share running statistics with the trained net; rebuild instead.
            let net = match self.net.take() {
                Some(net) if !self.config.retrain_from_scratch_each_round => net,
                _ => {
                    let theta_dim = self.bank.theta_dim().ok_or(Error::Domain("sample bank is empty"))?;
                    let x_dim = self.bank.x_dim().ok_or(Error::Domain("sample bank is empty"))?;
                    self.family.build_net(theta_dim, x_dim, &self.device)?
                }
            };

            let start = if self.config.discard_prior_samples && self.posterior.is_some() {
                self.bank.rounds().take_while(|r| r.from_prior).count()
            } else {
                0
            };
            let mut data = self.bank.concat(start)?;
            if let Some(s) = &self.standardize {
                data.x = s.apply(&data.x.view());
            }

            let (net, report) = fit::<B, F::Objective>(
                net,
                self.family.objective(),
                &data,
                round,
                train,
                &mut rng,
                &self.device,
                observer,
            )?;

            let posterior = self.family.posterior(
                net.valid(),
                self.prior.clone(),
                self.standardize.clone(),
                x_o_owned.clone(),
                round + 1,
                &self.device,
            );
            self.net = Some(net);
            self.posterior = Some(posterior);

            let summary = RoundSummary {
                round,
                num_simulations,
                num_invalid_excluded: invalid.total(),
                epochs: report.epochs,
                best_validation_log_prob: report.best_validation_log_prob,
                validation_log_probs: report.validation_log_probs,
                converged: report.converged,
                median_distance_to_observation,
                acceptance_rate,
            };
            if self.config.show_round_summary {
                log::info!("{} {summary}", self.family.objective().name());
            } else {
                log::debug!("{} {summary}", self.family.objective().name());
            }
            observer.on_round(&summary);
            self.summaries.push(summary);
        }

        self.posterior
            .clone()
            .ok_or(Error::Domain("no round was trained"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prior::DiagGaussianPrior;
    use crate::train::{NoopObserver, SimulationBudget};
    use ndarray::array;

    fn shift(theta: ndarray::ArrayView2<'_, f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        Ok((theta.to_owned(), theta.mapv(|v| v + 1.0)))
    }

    #[test]
    fn median_distance_of_even_and_odd_batches() {
        let x = array![[0.0f32, 0.0], [3.0, 4.0], [6.0, 8.0]];
        let x_o = array![0.0f32, 0.0];
        assert_eq!(median_distance(&x, &x_o.view()), Some(5.0));
        let x = array![[0.0f32, 0.0], [3.0, 4.0]];
        assert_eq!(median_distance(&x, &x_o.view()), Some(2.5));
    }

    #[test]
    fn multi_round_runs_need_an_observation() {
        let prior = DiagGaussianPrior::standard(2).unwrap();
        let mut snpe: Snpe<DiagGaussianPrior> =
            SequentialInference::snpe(prior, InferenceConfig::default(), Default::default());
        let train = TrainConfig {
            num_rounds: 2,
            num_simulations: SimulationBudget::PerRound(50),
            ..TrainConfig::default()
        };
        let err = snpe.run(&mut shift, &train, None, &mut NoopObserver);
        assert!(matches!(err, Err(Error::Config(_))));
        assert_eq!(snpe.bank().num_rounds(), 0);
    }

    #[test]
    fn multi_round_ratio_estimation_needs_a_sampler() {
        let prior = DiagGaussianPrior::standard(2).unwrap();
        let mut snre: Snre<DiagGaussianPrior> =
            SequentialInference::snre(prior, RatioLoss::Sre, InferenceConfig::default(), Default::default());
        let train = TrainConfig {
            num_rounds: 2,
            ..TrainConfig::default()
        };
        let x_o = array![0.0f32, 0.0];
        let err = snre.run(&mut shift, &train, Some(x_o.view()), &mut NoopObserver);
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn unknown_density_estimator_is_a_config_error() {
        let prior = DiagGaussianPrior::standard(2).unwrap();
        let family = PosteriorFamily::new(prior.clone()).with_density_estimator("made_up");
        let mut snpe: Snpe<DiagGaussianPrior> =
            SequentialInference::new(prior, family, InferenceConfig::default(), Default::default());
        let err = snpe.run(&mut shift, &TrainConfig::default(), None, &mut NoopObserver);
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn single_round_snpe_records_a_summary() {
        let prior = DiagGaussianPrior::standard(2).unwrap();
        let config = InferenceConfig {
            simulation_batch_size: 64,
            ..InferenceConfig::default()
        };
        let family = PosteriorFamily::new(prior.clone()).with_flow_options(FlowOptions {
            num_flows: 2,
            ..FlowOptions::default()
        });
        let mut snpe: Snpe<DiagGaussianPrior> =
            SequentialInference::new(prior, family, config, Default::default());
        let train = TrainConfig {
            num_simulations: SimulationBudget::PerRound(120),
            training_batch_size: 20,
            max_num_epochs: Some(3),
            ..TrainConfig::default()
        };
        let posterior = snpe.run(&mut shift, &train, None, &mut NoopObserver).unwrap();
        assert_eq!(posterior.num_trained_rounds(), 1);
        assert_eq!(snpe.summaries().len(), 1);
        let s = &snpe.summaries()[0];
        assert_eq!(s.num_simulations, 120);
        assert!(s.epochs <= 3);
        assert!(s.median_distance_to_observation.is_none());
        assert_eq!(snpe.bank().len(), 120);
    }

    #[test]
    fn rebuilt_networks_start_from_the_seeded_initial_state() {
        use burn::tensor::{Tensor, TensorData};
        use crate::tensor::to_vec;
        use crate::DefaultInnerBackend;

        let prior = DiagGaussianPrior::standard(2).unwrap();
        let family: PosteriorFamily<DefaultBackend, DiagGaussianPrior> =
            PosteriorFamily::new(prior).with_flow_options(FlowOptions {
                num_flows: 2,
                batch_norm: true,
                ..FlowOptions::default()
            });
        let device = Default::default();
        let query = Tensor::<DefaultInnerBackend, 2>::from_data(TensorData::new(vec![0.2f32, -0.1], [1, 2]), &device);
        let query_x = Tensor::<DefaultInnerBackend, 2>::from_data(TensorData::new(vec![0.5f32], [1, 1]), &device);
        let eval = |f: &Flow<DefaultBackend>| {
            to_vec(f.valid().log_prob(query.clone(), Some(query_x.clone())).unwrap()).unwrap()
        };

        let pristine = family.build_net(2, 1, &device).unwrap();
        let trained = family.build_net(2, 1, &device).unwrap();
        let theta = Tensor::<DefaultBackend, 2>::from_data(TensorData::new(vec![3.0f32, 1.0, 5.0, 2.0, 4.0, 6.0], [3, 2]), &device);
        let x = Tensor::<DefaultBackend, 2>::from_data(TensorData::new(vec![1.0f32, 2.0, 3.0], [3, 1]), &device);
        for _ in 0..4 {
            let _ = trained.log_prob(theta.clone(), Some(x.clone())).unwrap();
        }
        let expected = eval(&pristine);
        assert_ne!(eval(&trained), expected);

        let rebuilt = family.build_net(2, 1, &device).unwrap();
        for (a, b) in eval(&rebuilt).iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6, "rebuilt {a} vs initial {b}");
        }
    }
}
