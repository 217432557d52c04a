use ndarray::{array, Array2, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use seqinfer::inference::{InferenceConfig, PosteriorFamily, SequentialInference, Snpe};
use seqinfer::prior::{DiagGaussianPrior, Prior};
use seqinfer::train::{NoopObserver, SimulationBudget, TrainConfig};
use seqinfer::Result;

/// Linear-Gaussian simulator `x = θ + 0.1 ε`.
fn gaussian_simulator(seed: u64) -> impl FnMut(ArrayView2<'_, f32>) -> Result<(Array2<f32>, Array2<f32>)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    move |theta: ArrayView2<'_, f32>| {
        let mut x = theta.to_owned();
        for v in x.iter_mut() {
            let e: f32 = StandardNormal.sample(&mut rng);
            *v += 0.1 * e;
        }
        Ok((theta.to_owned(), x))
    }
}

#[test]
fn snpe_single_round_learns_a_usable_posterior() -> Result<()> {
    let prior = DiagGaussianPrior::standard(2)?;
    let config = InferenceConfig {
        simulation_batch_size: 100,
        ..InferenceConfig::default()
    };
    let mut snpe: Snpe<DiagGaussianPrior> = SequentialInference::snpe(prior.clone(), config, Default::default());
    let train = TrainConfig {
        num_simulations: SimulationBudget::PerRound(500),
        training_batch_size: 50,
        learning_rate: 1e-3,
        max_num_epochs: Some(30),
        seed: 11,
        ..TrainConfig::default()
    };
    let mut sim = gaussian_simulator(5);
    let posterior = snpe.run(&mut sim, &train, None, &mut NoopObserver)?;

    let summary = &snpe.summaries()[0];
    assert_eq!(summary.num_simulations, 500);
    assert_eq!(summary.num_invalid_excluded, 0);
    assert!(summary.epochs >= 1 && summary.epochs <= 30, "epochs {}", summary.epochs);
    assert!(
        summary.best_validation_log_prob > summary.validation_log_probs[0],
        "no improvement over the first epoch: best {:.4} first {:.4}",
        summary.best_validation_log_prob,
        summary.validation_log_probs[0]
    );

    let x_o = array![0.5f32, -0.5];
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let theta = prior.sample(64, &mut rng);
    let lp = posterior.log_prob(&theta.view(), Some(&x_o.view()))?;
    assert!(lp.iter().all(|v| v.is_finite()), "non-finite posterior log-prob");

    let near_and_far = array![[0.5f32, -0.5], [3.5, 2.5]];
    let lp = posterior.log_prob(&near_and_far.view(), Some(&x_o.view()))?;
    assert!(lp[0] > lp[1], "near {:.4} far {:.4}", lp[0], lp[1]);

    let samples = posterior.sample(100, Some(&x_o.view()), 3)?;
    assert_eq!(samples.dim(), (100, 2));
    assert!(samples.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn snpe_two_rounds_use_the_posterior_as_proposal() -> Result<()> {
    let prior = DiagGaussianPrior::standard(2)?;
    let config = InferenceConfig {
        simulation_batch_size: 50,
        discard_prior_samples: true,
        ..InferenceConfig::default()
    };
    let family = PosteriorFamily::new(prior.clone()).with_density_estimator("nsf");
    let mut snpe: Snpe<DiagGaussianPrior> = SequentialInference::new(prior, family, config, Default::default());
    let train = TrainConfig {
        num_rounds: 2,
        num_simulations: SimulationBudget::Schedule(vec![200, 100]),
        num_atoms: 5,
        training_batch_size: 20,
        max_num_epochs: Some(5),
        seed: 2,
        ..TrainConfig::default()
    };
    let x_o = array![0.2f32, 0.1];
    let mut sim = gaussian_simulator(9);
    let posterior = snpe.run(&mut sim, &train, Some(x_o.view()), &mut NoopObserver)?;

    assert_eq!(posterior.num_trained_rounds(), 2);
    assert_eq!(snpe.bank().num_rounds(), 2);
    let flags: Vec<bool> = snpe.bank().rounds().map(|r| r.from_prior).collect();
    assert_eq!(flags, vec![true, false]);

    let second = &snpe.summaries()[1];
    assert_eq!(second.num_simulations, 100);
    let acceptance = second.acceptance_rate.unwrap_or(0.0);
    assert!(acceptance > 0.0 && acceptance <= 1.0, "acceptance {acceptance:.4}");
    assert!(second.median_distance_to_observation.is_some());

    let samples = posterior.sample(20, None, 1)?;
    assert_eq!(samples.nrows(), 20);
    Ok(())
}
