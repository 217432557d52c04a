//! Minibatch fitting with early stopping.
//!
//! Each call to [`fit`] trains one round:
//!
//! - shuffle the pooled data once and split it into training and validation parts,
//! - iterate epochs of reshuffled, fixed-size minibatches (a short last batch is dropped),
//!   taking one Adam step per batch on the negated mean score,
//! - after each epoch, score the validation split on the inner backend and report the mean
//!   validation score to [`EarlyStopping`],
//! - on convergence, restore the weights of the best epoch.
//!
//! Snapshots are taken as records (`Module::into_record`), never as module clones: a cloned
//! module shares its running statistics (`RunningState`) with the original.

use burn_core as burn;

use burn::module::{AutodiffModule, Module};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn_optim::grad_clipping::GradientClippingConfig;
use burn_optim::{AdamConfig, GradientsParams, Optimizer};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::atoms::clamp_num_atoms;
use crate::bank::TrainingSet;
use crate::early_stopping::EarlyStopping;
use crate::loss::{LossInput, Objective};
use crate::tensor::to_vec;
use crate::{Error, Result};

/// How many simulations to run per round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationBudget {
    /// The same count every round.
    PerRound(usize),
    /// One count per round; its length must equal `num_rounds`.
    Schedule(Vec<usize>),
}

impl SimulationBudget {
    pub fn per_round(&self, num_rounds: usize) -> Result<Vec<usize>> {
        let counts = match self {
            Self::PerRound(n) => vec![*n; num_rounds],
            Self::Schedule(s) => {
                if s.len() != num_rounds {
                    return Err(Error::Config(format!(
                        "simulation schedule has {} entries for {num_rounds} rounds",
                        s.len()
                    )));
                }
                s.clone()
            }
        };
        if counts.contains(&0) {
            return Err(Error::Config("every round needs at least one simulation".into()));
        }
        Ok(counts)
    }
}

/// Training hyperparameters for one call to the round driver.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub num_rounds: usize,
    pub num_simulations: SimulationBudget,
    /// Atoms per contrastive comparison (clamped to the batch size).
    pub num_atoms: usize,
    pub training_batch_size: usize,
    pub learning_rate: f64,
    pub validation_fraction: f64,
    /// Patience: epochs without improvement before stopping.
    pub stop_after_epochs: usize,
    /// Hard epoch ceiling per round; `None` means `2³¹ - 1`.
    pub max_num_epochs: Option<usize>,
    /// Per-tensor gradient-norm clipping (see [`fit`]); `None` disables it.
    pub clip_max_norm: Option<f32>,
    /// Seeds splits, minibatches, atoms and proposal draws.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_rounds: 1,
            num_simulations: SimulationBudget::PerRound(1000),
            num_atoms: 10,
            training_batch_size: 100,
            learning_rate: 5e-4,
            validation_fraction: 0.1,
            stop_after_epochs: 20,
            max_num_epochs: None,
            clip_max_norm: Some(5.0),
            seed: 0,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_rounds == 0 {
            return Err(Error::Config("num_rounds must be >= 1".into()));
        }
        if self.num_atoms < 2 {
            return Err(Error::Config(format!("num_atoms must be >= 2, got {}", self.num_atoms)));
        }
        if self.training_batch_size == 0 {
            return Err(Error::Config("training_batch_size must be >= 1".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::Config("learning_rate must be finite and positive".into()));
        }
        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return Err(Error::Config("validation_fraction must be in (0, 1)".into()));
        }
        if self.stop_after_epochs == 0 {
            return Err(Error::Config("stop_after_epochs must be >= 1".into()));
        }
        if self.max_num_epochs == Some(0) {
            return Err(Error::Config("max_num_epochs must be >= 1".into()));
        }
        if let Some(c) = self.clip_max_norm {
            if !(c.is_finite() && c > 0.0) {
                return Err(Error::Config("clip_max_norm must be finite and positive".into()));
            }
        }
        self.num_simulations.per_round(self.num_rounds)?;
        Ok(())
    }
}

/// Hooks called by the trainer and the round driver. All methods default to no-ops.
pub trait TrainingObserver {
    fn on_epoch(&mut self, _round: usize, _epoch: usize, _validation_log_prob: f64) {}
    fn on_round(&mut self, _summary: &RoundSummary) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl TrainingObserver for NoopObserver {}

/// Outcome of fitting one round.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epochs: usize,
    pub best_validation_log_prob: f64,
    pub validation_log_probs: Vec<f64>,
    /// Stopped by patience (as opposed to the epoch ceiling).
    pub converged: bool,
}

/// Per-round record kept by the round driver.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSummary {
    pub round: usize,
    /// Simulations run this round, before filtering.
    pub num_simulations: usize,
    pub num_invalid_excluded: usize,
    pub epochs: usize,
    pub best_validation_log_prob: f64,
    pub validation_log_probs: Vec<f64>,
    pub converged: bool,
    /// Median Euclidean distance of this round's x to x_o, if x_o is known.
    pub median_distance_to_observation: Option<f64>,
    /// Leakage-rejection acceptance rate of this round's proposal (density family only).
    pub acceptance_rate: Option<f64>,
}

impl std::fmt::Display for RoundSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "round {}: {} simulations ({} excluded), {} epochs, best validation log-prob {:.4}",
            self.round + 1,
            self.num_simulations,
            self.num_invalid_excluded,
            self.epochs,
            self.best_validation_log_prob
        )?;
        if let Some(d) = self.median_distance_to_observation {
            write!(f, ", median distance to x_o {d:.4}")?;
        }
        if let Some(a) = self.acceptance_rate {
            write!(f, ", acceptance {a:.3}")?;
        }
        Ok(())
    }
}

/// Validation batches of at most `batch` rows; a trailing singleton joins the previous batch so
/// that every batch can be contrasted.
fn validation_batches(indices: &[usize], batch: usize) -> Vec<Vec<usize>> {
    let mut out: Vec<Vec<usize>> = indices.chunks(batch).map(<[usize]>::to_vec).collect();
    if out.len() > 1 && out.last().is_some_and(|b| b.len() < 2) {
        if let Some(tail) = out.pop() {
            if let Some(prev) = out.last_mut() {
                prev.extend(tail);
            }
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn score_sum<B: AutodiffBackend, O: Objective>(
    objective: &O,
    net: &O::Net<B::InnerBackend>,
    data: &TrainingSet,
    batch: &[usize],
    round: usize,
    num_atoms: usize,
    rng: &mut ChaCha8Rng,
    device: &B::Device,
) -> Result<f64> {
    let part = data.select(batch);
    let input = LossInput {
        theta: part.theta.view(),
        x: part.x.view(),
        prior_mask: &part.prior_mask,
        round,
    };
    let k = num_atoms.min(part.len());
    let scores = objective.compute_loss::<B::InnerBackend>(net, &input, k, rng, device)?;
    let values = to_vec(scores)?;
    if values.iter().any(|v| !v.is_finite()) {
        return Err(Error::Divergence("validation scoring"));
    }
    Ok(values.iter().map(|&v| v as f64).sum())
}

/// Detached copy of a network's weights and running statistics.
pub(crate) fn snapshot<B: Backend, M: Module<B>>(net: &M) -> M::Record {
    net.clone().into_record()
}

/// Optimizer clipping for `config.clip_max_norm`.
///
/// Each parameter tensor's gradient is clipped to the norm separately; the norm is not
/// pooled across parameters.
fn gradient_clipping(config: &TrainConfig) -> Option<GradientClippingConfig> {
    config.clip_max_norm.map(GradientClippingConfig::Norm)
}

/// Fit `net` on `data` for one round.
#[allow(clippy::too_many_arguments)]
pub fn fit<B, O>(
    mut net: O::Net<B>,
    objective: &O,
    data: &TrainingSet,
    round: usize,
    config: &TrainConfig,
    rng: &mut ChaCha8Rng,
    device: &B::Device,
    observer: &mut dyn TrainingObserver,
) -> Result<(O::Net<B>, EpochReport)>
where
    B: AutodiffBackend,
    O: Objective,
    O::Net<B>: AutodiffModule<B, InnerModule = O::Net<B::InnerBackend>>,
{
    let n = data.len();
    let num_train = ((1.0 - config.validation_fraction) * n as f64).floor() as usize;
    let num_val = n - num_train;
    if num_train == 0 || num_val == 0 {
        return Err(Error::Domain("too few simulations to split into training and validation"));
    }
    let batch = config.training_batch_size.min(num_val);
    if num_train < batch {
        return Err(Error::Domain("too few training examples for a single minibatch"));
    }
    let contrastive = objective.contrastive(round);
    let num_atoms = if contrastive {
        clamp_num_atoms(objective.num_atoms(config.num_atoms), batch)?
    } else {
        objective.num_atoms(config.num_atoms)
    };

    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(rng);
    let mut train_idx = perm[..num_train].to_vec();
    let mut val_idx = perm[num_train..].to_vec();

    let mut optim = AdamConfig::new()
        .with_grad_clipping(gradient_clipping(config))
        .init::<B, O::Net<B>>();
    let mut stopper = EarlyStopping::new(config.stop_after_epochs, config.max_num_epochs);
    let mut best = None;
    let mut curve = Vec::new();

    while stopper.should_continue() {
        train_idx.shuffle(rng);
        for chunk in train_idx.chunks_exact(batch) {
            let part = data.select(chunk);
            let input = LossInput {
                theta: part.theta.view(),
                x: part.x.view(),
                prior_mask: &part.prior_mask,
                round,
            };
            let scores = objective.compute_loss::<B>(&net, &input, num_atoms, rng, device)?;
            let loss = scores.neg().mean();
            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &net);
            net = optim.step(config.learning_rate, net, grads);
        }

        let eval = net.valid();
        val_idx.shuffle(rng);
        let mut total = 0.0;
        for chunk in validation_batches(&val_idx, batch) {
            total += score_sum::<B, O>(objective, &eval, data, &chunk, round, num_atoms, rng, device)?;
        }
        let val_log_prob = total / num_val as f64;
        curve.push(val_log_prob);
        if stopper.observe(val_log_prob) {
            best = Some(snapshot(&net));
        }
        log::debug!(
            "{} round {round} epoch {}: validation log-prob {val_log_prob:.4}",
            objective.name(),
            stopper.epoch()
        );
        observer.on_epoch(round, stopper.epoch(), val_log_prob);
    }

    let converged = stopper.converged();
    if converged {
        if let Some(record) = best {
            net = net.load_record(record);
        }
    } else {
        log::warn!(
            "{} round {round}: reached max_num_epochs={} before converging",
            objective.name(),
            stopper.epoch()
        );
    }

    Ok((
        net,
        EpochReport {
            epochs: stopper.epoch(),
            best_validation_log_prob: stopper.best_val_log_prob(),
            validation_log_probs: curve,
            converged,
        },
    ))
}
