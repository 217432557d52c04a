use burn_ndarray::NdArray;
use ndarray::{array, Array2, ArrayView1, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use seqinfer::inference::{InferenceConfig, RatioFamily, SequentialInference, Snre};
use seqinfer::loss::RatioLoss;
use seqinfer::potential::{McmcMethod, Potential, PosteriorSampler};
use seqinfer::prior::BoxUniformPrior;
use seqinfer::train::{RoundSummary, SimulationBudget, TrainConfig, TrainingObserver};
use seqinfer::{DefaultBackend, Error, Result};

type Inner = NdArray<f32>;

/// Random-walk Metropolis over the numeric potential.
struct Metropolis {
    step: f32,
    burn_in: usize,
}

impl PosteriorSampler<Inner> for Metropolis {
    fn method(&self) -> McmcMethod {
        McmcMethod::SliceNp
    }

    fn sample(
        &mut self,
        potential: &Potential<Inner>,
        init: ArrayView1<'_, f32>,
        num_samples: usize,
        seed: u64,
    ) -> Result<Array2<f32>> {
        let device = Default::default();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let d = init.len();
        let mut current = init.to_vec();
        let mut current_lp = potential.log_posterior(&current, &device)?;
        if !current_lp.is_finite() {
            return Err(Error::Domain("initial point has zero posterior density"));
        }
        let mut out = Array2::<f32>::zeros((num_samples, d));
        for i in 0..(self.burn_in + num_samples) {
            let proposal: Vec<f32> = current
                .iter()
                .map(|v| {
                    let e: f32 = StandardNormal.sample(&mut rng);
                    v + self.step * e
                })
                .collect();
            let lp = potential.log_posterior(&proposal, &device)?;
            let u: f64 = rng.random();
            if lp.is_finite() && u.ln() < lp - current_lp {
                current = proposal;
                current_lp = lp;
            }
            if i >= self.burn_in {
                for (k, v) in current.iter().enumerate() {
                    out[[i - self.burn_in, k]] = *v;
                }
            }
        }
        Ok(out)
    }
}

#[derive(Default)]
struct Recorder {
    epochs: usize,
    rounds: Vec<usize>,
}

impl TrainingObserver for Recorder {
    fn on_epoch(&mut self, _round: usize, _epoch: usize, validation_log_prob: f64) {
        assert!(validation_log_prob.is_finite());
        self.epochs += 1;
    }

    fn on_round(&mut self, summary: &RoundSummary) {
        self.rounds.push(summary.round);
    }
}

fn noisy_identity(theta: ArrayView2<'_, f32>) -> Result<(Array2<f32>, Array2<f32>)> {
    let mut x = theta.to_owned();
    for (i, v) in x.iter_mut().enumerate() {
        *v += 0.05 * ((i as f32) * 1.7).sin();
    }
    Ok((theta.to_owned(), x))
}

#[test]
fn snre_two_rounds_with_an_external_sampler() -> Result<()> {
    let prior = BoxUniformPrior::new(vec![-2.0, -2.0], vec![2.0, 2.0])?;
    let family = RatioFamily::<DefaultBackend, BoxUniformPrior>::new(RatioLoss::Sre).with_sampler(Box::new(Metropolis {
        step: 0.3,
        burn_in: 50,
    }));
    let config = InferenceConfig {
        simulation_batch_size: 100,
        ..InferenceConfig::default()
    };
    let mut snre: Snre<BoxUniformPrior> = SequentialInference::new(prior.clone(), family, config, Default::default());
    let train = TrainConfig {
        num_rounds: 2,
        num_simulations: SimulationBudget::PerRound(200),
        num_atoms: 5,
        training_batch_size: 20,
        max_num_epochs: Some(5),
        seed: 4,
        ..TrainConfig::default()
    };
    let x_o = array![0.3f32, -0.4];
    let mut recorder = Recorder::default();
    let posterior = snre.run(&mut noisy_identity, &train, Some(x_o.view()), &mut recorder)?;

    assert_eq!(posterior.num_trained_rounds(), 2);
    assert_eq!(recorder.rounds, vec![0, 1]);
    let total_epochs: usize = snre.summaries().iter().map(|s| s.epochs).sum();
    assert_eq!(recorder.epochs, total_epochs);

    let second = snre.bank().round(1).map(|r| r.theta.clone()).unwrap_or_default();
    assert_eq!(second.nrows(), 200);
    for row in second.rows() {
        assert!(prior.contains(&row.to_vec()), "proposal left the prior support");
    }

    let theta = array![[0.3f32, -0.4], [1.0, 1.0], [5.0, 0.0]];
    let lp = posterior.log_prob_unnormalized(&theta.view(), None)?;
    assert!(lp[0].is_finite() && lp[1].is_finite());
    assert_eq!(lp[2], f32::NEG_INFINITY);
    Ok(())
}

#[test]
fn aalr_fixes_two_atoms() -> Result<()> {
    let prior = BoxUniformPrior::new(vec![-1.0], vec![1.0])?;
    let mut snre: Snre<BoxUniformPrior> =
        SequentialInference::snre(prior, RatioLoss::Aalr, InferenceConfig::default(), Default::default());
    let train = TrainConfig {
        num_simulations: SimulationBudget::PerRound(100),
        num_atoms: 50,
        training_batch_size: 10,
        max_num_epochs: Some(3),
        ..TrainConfig::default()
    };
    let posterior = snre.run(&mut noisy_identity, &train, None, &mut seqinfer::train::NoopObserver)?;
    assert_eq!(posterior.num_trained_rounds(), 1);
    assert!(snre.summaries()[0].best_validation_log_prob.is_finite());
    Ok(())
}
