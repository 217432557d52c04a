use ndarray::{array, Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use seqinfer::inference::{InferenceConfig, PosteriorFamily, SequentialInference, Snpe};
use seqinfer::prior::DiagGaussianPrior;
use seqinfer::train::{RoundSummary, SimulationBudget, TrainConfig, TrainingObserver};

struct PrintRounds;

impl TrainingObserver for PrintRounds {
    fn on_round(&mut self, summary: &RoundSummary) {
        println!("{summary}");
    }
}

fn main() -> seqinfer::Result<()> {
    // Linear-Gaussian toy problem in R^3: x = θ + 0.1 ε, θ ~ N(0, I).
    let prior = DiagGaussianPrior::standard(3)?;
    let mut noise = ChaCha8Rng::seed_from_u64(42);
    let mut simulator = move |theta: ArrayView2<'_, f32>| -> seqinfer::Result<(Array2<f32>, Array2<f32>)> {
        let mut x = theta.to_owned();
        for v in x.iter_mut() {
            let e: f32 = StandardNormal.sample(&mut noise);
            *v += 0.1 * e;
        }
        Ok((theta.to_owned(), x))
    };

    let config = InferenceConfig {
        simulation_batch_size: 250,
        show_round_summary: true,
        ..InferenceConfig::default()
    };
    let family = PosteriorFamily::new(prior.clone()).with_density_estimator("nsf");
    let mut snpe: Snpe<DiagGaussianPrior> = SequentialInference::new(prior, family, config, Default::default());

    let train = TrainConfig {
        num_rounds: 3,
        num_simulations: SimulationBudget::Schedule(vec![1000, 500, 500]),
        training_batch_size: 50,
        learning_rate: 1e-3,
        max_num_epochs: Some(100),
        seed: 7,
        ..TrainConfig::default()
    };
    let x_o = array![0.4f32, -0.3, 1.1];
    let posterior = snpe.run(&mut simulator, &train, Some(x_o.view()), &mut PrintRounds)?;

    let samples = posterior.sample(2000, None, 1)?;
    let mean = samples.mean_axis(Axis(0)).unwrap_or_default();
    let std = samples.std_axis(Axis(0), 1.0);
    println!("x_o            = {x_o}");
    println!("posterior mean = {mean:.3}");
    println!("posterior std  = {std:.3}");
    // The exact posterior mean is x_o / (1 + 0.01) with std ≈ 0.0995.
    println!("exact mean     = {:.3}", x_o.mapv(|v| v / 1.01));
    Ok(())
}
