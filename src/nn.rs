//! Network building blocks for flows and classifiers.
//!
//! Weights are initialized from a seeded `ChaCha8Rng` on the host, not from the backend RNG,
//! so that two estimators built with the same seed are identical.

use burn_core as burn;

use burn::module::{Module, Param};
use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::Rng;

use crate::{Error, Result};

/// Affine layer `x W + b` with `W: [in, out]`.
#[derive(Module, Debug)]
pub struct Dense<B: Backend> {
    weight: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> Dense<B> {
    /// Uniform `±1/√fan_in` initialization.
    pub fn new<R: Rng + ?Sized>(d_in: usize, d_out: usize, rng: &mut R, device: &B::Device) -> Self {
        Self::scaled(d_in, d_out, 1.0, rng, device)
    }

    /// Like [`Dense::new`] with the bound multiplied by `scale` (small output layers start the
    /// flow close to the identity).
    pub fn scaled<R: Rng + ?Sized>(
        d_in: usize,
        d_out: usize,
        scale: f32,
        rng: &mut R,
        device: &B::Device,
    ) -> Self {
        let bound = scale / (d_in.max(1) as f32).sqrt();
        let w: Vec<f32> = (0..d_in * d_out).map(|_| rng.random_range(-bound..=bound)).collect();
        let b: Vec<f32> = (0..d_out).map(|_| rng.random_range(-bound..=bound)).collect();
        Self::from_values(w, b, d_in, d_out, device)
    }

    /// All-zero layer; used for context projections that must start as a no-op.
    pub fn zeros(d_in: usize, d_out: usize, device: &B::Device) -> Self {
        Self::from_values(vec![0.0; d_in * d_out], vec![0.0; d_out], d_in, d_out, device)
    }

    fn from_values(w: Vec<f32>, b: Vec<f32>, d_in: usize, d_out: usize, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::from_data(TensorData::new(w, [d_in, d_out]), device)),
            bias: Param::from_tensor(Tensor::from_data(TensorData::new(b, [d_out]), device)),
        }
    }

    pub fn d_out(&self) -> usize {
        self.bias.dims()[0]
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        x.matmul(self.weight.val()) + self.bias.val().unsqueeze::<2>()
    }

    fn forward_masked(&self, x: Tensor<B, 2>, mask: Tensor<B, 2>) -> Tensor<B, 2> {
        x.matmul(self.weight.val() * mask) + self.bias.val().unsqueeze::<2>()
    }
}

/// Dense layer whose weight is multiplied by a fixed binary connectivity mask.
#[derive(Module, Debug)]
pub struct MaskedDense<B: Backend> {
    dense: Dense<B>,
    /// Constant; not visited by the optimizer.
    mask: Tensor<B, 2>,
}

impl<B: Backend> MaskedDense<B> {
    fn new<R: Rng + ?Sized>(
        mask: Vec<f32>,
        d_in: usize,
        d_out: usize,
        scale: f32,
        rng: &mut R,
        device: &B::Device,
    ) -> Self {
        Self {
            dense: Dense::scaled(d_in, d_out, scale, rng, device),
            mask: Tensor::from_data(TensorData::new(mask, [d_in, d_out]), device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.dense.forward_masked(x, self.mask.clone())
    }
}

/// MADE degree masks, laid out `[in, out]` row-major.
///
/// Inputs have degrees `1..=d`. Hidden unit `k` has degree `k % d`, so degree-0 units see only
/// the context and make every output conditional. Output column `c` belongs to dimension
/// `c / params_per_dim` and has degree `c / params_per_dim + 1`.
pub(crate) struct MadeMasks {
    pub input: Vec<f32>,
    pub hidden: Vec<Vec<f32>>,
    pub output: Vec<f32>,
}

pub(crate) fn made_masks(features: usize, hidden_dims: &[usize], params_per_dim: usize) -> MadeMasks {
    let in_deg: Vec<usize> = (1..=features).collect();
    let layer_deg: Vec<Vec<usize>> = hidden_dims
        .iter()
        .map(|&h| (0..h).map(|k| k % features).collect())
        .collect();

    let connect = |from: &[usize], to: &[usize], strict: bool| -> Vec<f32> {
        let mut m = Vec::with_capacity(from.len() * to.len());
        for &a in from {
            for &b in to {
                let on = if strict { b > a } else { b >= a };
                m.push(if on { 1.0 } else { 0.0 });
            }
        }
        m
    };

    let input = connect(&in_deg, &layer_deg[0], false);
    let hidden = layer_deg
        .windows(2)
        .map(|w| connect(&w[0], &w[1], false))
        .collect();
    let out_deg: Vec<usize> = (0..features * params_per_dim)
        .map(|c| c / params_per_dim + 1)
        .collect();
    let output = connect(&layer_deg[layer_deg.len() - 1], &out_deg, true);
    MadeMasks {
        input,
        hidden,
        output,
    }
}

/// Masked autoencoder producing `params_per_dim` autoregressive parameters per dimension.
#[derive(Module, Debug)]
pub struct Made<B: Backend> {
    input: MaskedDense<B>,
    context: Option<Dense<B>>,
    hidden: Vec<MaskedDense<B>>,
    output: MaskedDense<B>,
    features: usize,
    params_per_dim: usize,
}

impl<B: Backend> Made<B> {
    pub fn new<R: Rng + ?Sized>(
        features: usize,
        context_dim: usize,
        hidden_dims: &[usize],
        params_per_dim: usize,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        if features == 0 {
            return Err(Error::Domain("autoregressive features must be >= 1"));
        }
        if hidden_dims.is_empty() || hidden_dims.contains(&0) {
            return Err(Error::Config("hidden_dims must be non-empty and positive".into()));
        }
        let masks = made_masks(features, hidden_dims, params_per_dim);
        let input = MaskedDense::new(masks.input, features, hidden_dims[0], 1.0, rng, device);
        let context = (context_dim > 0).then(|| Dense::new(context_dim, hidden_dims[0], rng, device));
        let hidden = masks
            .hidden
            .into_iter()
            .zip(hidden_dims.windows(2))
            .map(|(m, w)| MaskedDense::new(m, w[0], w[1], 1.0, rng, device))
            .collect();
        let last = hidden_dims[hidden_dims.len() - 1];
        let output = MaskedDense::new(
            masks.output,
            last,
            features * params_per_dim,
            0.1,
            rng,
            device,
        );
        Ok(Self {
            input,
            context,
            hidden,
            output,
            features,
            params_per_dim,
        })
    }

    /// `[n, features]` (+ `[n, context_dim]`) → `[n, features, params_per_dim]`.
    pub fn forward(&self, inputs: Tensor<B, 2>, context: Option<Tensor<B, 2>>) -> Tensor<B, 3> {
        let [n, _] = inputs.dims();
        let mut h = self.input.forward(inputs);
        if let (Some(layer), Some(ctx)) = (&self.context, context) {
            h = h + layer.forward(ctx);
        }
        h = relu(h);
        for layer in &self.hidden {
            h = relu(layer.forward(h));
        }
        self.output
            .forward(h)
            .reshape([n, self.features, self.params_per_dim])
    }
}

/// Plain MLP conditioner (coupling layers): `[x_a, ctx] → params`.
#[derive(Module, Debug)]
pub struct MlpConditioner<B: Backend> {
    hidden: Vec<Dense<B>>,
    output: Dense<B>,
}

impl<B: Backend> MlpConditioner<B> {
    pub fn new<R: Rng + ?Sized>(
        d_in: usize,
        hidden_dims: &[usize],
        d_out: usize,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        if hidden_dims.is_empty() || hidden_dims.contains(&0) {
            return Err(Error::Config("hidden_dims must be non-empty and positive".into()));
        }
        let mut hidden = Vec::with_capacity(hidden_dims.len());
        let mut prev = d_in;
        for &h in hidden_dims {
            hidden.push(Dense::new(prev, h, rng, device));
            prev = h;
        }
        let output = Dense::scaled(prev, d_out, 0.1, rng, device);
        Ok(Self { hidden, output })
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut h = x;
        for layer in &self.hidden {
            h = relu(layer.forward(h));
        }
        self.output.forward(h)
    }
}
