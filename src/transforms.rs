//! Invertible flow layers.
//!
//! Every layer maps in two directions:
//!
//! - `to_base(y, ctx)`: data side → base side (the density direction, one parallel pass),
//! - `to_data(z, ctx)`: base side → data side (the sampling direction).
//!
//! Each returns the transformed batch and the per-row `log|det J|` of the direction taken.
//! Autoregressive layers are parallel in the density direction and sequential (one pass per
//! dimension) when sampling.

use burn_core as burn;

use std::marker::PhantomData;

use burn::module::{Ignored, Module, Param, RunningState};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::nn::{Dense, Made, MlpConditioner};
use crate::spline::{monotonic_spline, params_per_element, split_params, SplineOrder};
use crate::tensor::{identity_matrix, index_tensor};
use crate::{Error, Result};

/// Row-wise sum `[n, d] → [n]`.
fn row_sum<B: Backend>(t: Tensor<B, 2>) -> Tensor<B, 1> {
    let [n, _] = t.dims();
    t.sum_dim(1).reshape([n])
}

/// Split a `[n, d, 2]` parameter block into `(shift, log_scale)`, clamping the log-scale.
fn shift_and_log_scale<B: Backend>(
    params: Tensor<B, 3>,
    min_clip: f64,
    max_clip: f64,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let [n, d, _] = params.dims();
    let shift = params.clone().slice([0..n, 0..d, 0..1]).reshape([n, d]);
    let log_scale = params
        .slice([0..n, 0..d, 1..2])
        .reshape([n, d])
        .clamp(min_clip, max_clip);
    (shift, log_scale)
}

#[derive(Module, Debug)]
pub struct AffineAutoregressive<B: Backend> {
    made: Made<B>,
    dim: usize,
    log_scale_min_clip: f64,
    log_scale_max_clip: f64,
}

impl<B: Backend> AffineAutoregressive<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        dim: usize,
        context_dim: usize,
        hidden_dims: &[usize],
        log_scale_min_clip: f64,
        log_scale_max_clip: f64,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        if log_scale_min_clip >= log_scale_max_clip {
            return Err(Error::Config("log_scale_min_clip must be below log_scale_max_clip".into()));
        }
        Ok(Self {
            made: Made::new(dim, context_dim, hidden_dims, 2, rng, device)?,
            dim,
            log_scale_min_clip,
            log_scale_max_clip,
        })
    }

    fn params(&self, y: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        shift_and_log_scale(
            self.made.forward(y, ctx),
            self.log_scale_min_clip,
            self.log_scale_max_clip,
        )
    }

    pub fn to_base(&self, y: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let (shift, log_scale) = self.params(y.clone(), ctx);
        let z = (y - shift) * log_scale.clone().neg().exp();
        (z, row_sum(log_scale).neg())
    }

    pub fn to_data(&self, z: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let mut y = z.clone();
        let mut log_scale = z.zeros_like();
        for _ in 0..self.dim {
            let (shift, ls) = self.params(y.clone(), ctx.clone());
            y = z.clone() * ls.clone().exp() + shift;
            log_scale = ls;
        }
        (y, row_sum(log_scale))
    }
}

#[derive(Module, Debug)]
pub struct SplineAutoregressive<B: Backend> {
    made: Made<B>,
    dim: usize,
    count_bins: usize,
    bound: f64,
    order: Ignored<SplineOrder>,
}

impl<B: Backend> SplineAutoregressive<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        dim: usize,
        context_dim: usize,
        hidden_dims: &[usize],
        count_bins: usize,
        bound: f64,
        order: SplineOrder,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        check_spline_options(count_bins, bound)?;
        let per = params_per_element(count_bins, order);
        Ok(Self {
            made: Made::new(dim, context_dim, hidden_dims, per, rng, device)?,
            dim,
            count_bins,
            bound,
            order: Ignored(order),
        })
    }

    fn apply(&self, cond: Tensor<B, 2>, input: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>, inverse: bool) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let params = split_params(self.made.forward(cond, ctx), self.count_bins, *self.order);
        monotonic_spline(input, params, self.bound, inverse)
    }

    pub fn to_base(&self, y: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let (z, lad) = self.apply(y.clone(), y, ctx, false);
        (z, row_sum(lad))
    }

    pub fn to_data(&self, z: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let mut y = z.clone();
        let mut lad = z.zeros_like();
        for _ in 0..self.dim {
            let (out, l) = self.apply(y.clone(), z.clone(), ctx.clone(), true);
            y = out;
            lad = l;
        }
        (y, row_sum(lad))
    }
}

fn check_spline_options(count_bins: usize, bound: f64) -> Result<()> {
    if count_bins < 2 {
        return Err(Error::Config(format!("count_bins must be >= 2, got {count_bins}")));
    }
    if !(bound.is_finite() && bound > 0.0) {
        return Err(Error::Config(format!("bound must be finite and positive, got {bound}")));
    }
    Ok(())
}

fn check_split(dim: usize, split_dim: usize) -> Result<()> {
    if dim < 2 {
        return Err(Error::Config("coupling transforms need dim >= 2".into()));
    }
    if split_dim == 0 || split_dim >= dim {
        return Err(Error::Config(format!("split_dim must be in 1..{dim}, got {split_dim}")));
    }
    Ok(())
}

/// Split `[n, d]` at column `s` into `([n, s], [n, d - s])`.
fn split_columns<B: Backend>(t: Tensor<B, 2>, s: usize) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let [n, d] = t.dims();
    (t.clone().slice([0..n, 0..s]), t.slice([0..n, s..d]))
}

fn conditioner_input<B: Backend>(fixed: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> Tensor<B, 2> {
    match ctx {
        Some(c) => Tensor::cat(vec![fixed, c], 1),
        None => fixed,
    }
}

/// Coupling layer: the first `split_dim` coordinates pass through and parameterize an affine map
/// of the rest.
#[derive(Module, Debug)]
pub struct AffineCoupling<B: Backend> {
    conditioner: MlpConditioner<B>,
    dim: usize,
    split_dim: usize,
    log_scale_min_clip: f64,
    log_scale_max_clip: f64,
}

impl<B: Backend> AffineCoupling<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        dim: usize,
        context_dim: usize,
        split_dim: usize,
        hidden_dims: &[usize],
        log_scale_min_clip: f64,
        log_scale_max_clip: f64,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        check_split(dim, split_dim)?;
        if log_scale_min_clip >= log_scale_max_clip {
            return Err(Error::Config("log_scale_min_clip must be below log_scale_max_clip".into()));
        }
        let conditioner =
            MlpConditioner::new(split_dim + context_dim, hidden_dims, 2 * (dim - split_dim), rng, device)?;
        Ok(Self {
            conditioner,
            dim,
            split_dim,
            log_scale_min_clip,
            log_scale_max_clip,
        })
    }

    fn params(&self, fixed: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let [n, _] = fixed.dims();
        let out = self.conditioner.forward(conditioner_input(fixed, ctx));
        shift_and_log_scale(
            out.reshape([n, self.dim - self.split_dim, 2]),
            self.log_scale_min_clip,
            self.log_scale_max_clip,
        )
    }

    pub fn to_base(&self, y: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let (fixed, moving) = split_columns(y, self.split_dim);
        let (shift, log_scale) = self.params(fixed.clone(), ctx);
        let z = (moving - shift) * log_scale.clone().neg().exp();
        (Tensor::cat(vec![fixed, z], 1), row_sum(log_scale).neg())
    }

    pub fn to_data(&self, z: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let (fixed, moving) = split_columns(z, self.split_dim);
        let (shift, log_scale) = self.params(fixed.clone(), ctx);
        let y = moving * log_scale.clone().exp() + shift;
        (Tensor::cat(vec![fixed, y], 1), row_sum(log_scale))
    }
}

#[derive(Module, Debug)]
pub struct SplineCoupling<B: Backend> {
    conditioner: MlpConditioner<B>,
    dim: usize,
    split_dim: usize,
    count_bins: usize,
    bound: f64,
    order: Ignored<SplineOrder>,
}

impl<B: Backend> SplineCoupling<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        dim: usize,
        context_dim: usize,
        split_dim: usize,
        hidden_dims: &[usize],
        count_bins: usize,
        bound: f64,
        order: SplineOrder,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        check_split(dim, split_dim)?;
        check_spline_options(count_bins, bound)?;
        let d_out = (dim - split_dim) * params_per_element(count_bins, order);
        Ok(Self {
            conditioner: MlpConditioner::new(split_dim + context_dim, hidden_dims, d_out, rng, device)?,
            dim,
            split_dim,
            count_bins,
            bound,
            order: Ignored(order),
        })
    }

    fn apply(&self, x: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>, inverse: bool) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let (fixed, moving) = split_columns(x, self.split_dim);
        let [n, _] = fixed.dims();
        let params = self
            .conditioner
            .forward(conditioner_input(fixed.clone(), ctx))
            .reshape([n, self.dim - self.split_dim, params_per_element(self.count_bins, *self.order)]);
        let params = split_params(params, self.count_bins, *self.order);
        let (out, lad) = monotonic_spline(moving, params, self.bound, inverse);
        (Tensor::cat(vec![fixed, out], 1), row_sum(lad))
    }

    pub fn to_base(&self, y: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        self.apply(y, ctx, false)
    }

    pub fn to_data(&self, z: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        self.apply(z, ctx, true)
    }
}

/// Elementwise affine map `y = loc + exp(log_scale) ⊙ z`.
///
/// With a context, a zero-initialized linear layer adds context-dependent offsets to both the
/// location and the log-scale.
#[derive(Module, Debug)]
pub struct AffineDiag<B: Backend> {
    loc: Param<Tensor<B, 1>>,
    log_scale: Param<Tensor<B, 1>>,
    context: Option<Dense<B>>,
    dim: usize,
}

impl<B: Backend> AffineDiag<B> {
    pub fn new(dim: usize, context_dim: usize, loc: &[f32], scale: &[f32], device: &B::Device) -> Result<Self> {
        if loc.len() != dim || scale.len() != dim {
            return Err(Error::Config(format!("affine_diag: loc and scale must have length {dim}")));
        }
        if scale.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(Error::Config("affine_diag: scale entries must be positive".into()));
        }
        let log_scale: Vec<f32> = scale.iter().map(|s| s.ln()).collect();
        Ok(Self {
            loc: Param::from_tensor(Tensor::from_data(TensorData::new(loc.to_vec(), [dim]), device)),
            log_scale: Param::from_tensor(Tensor::from_data(TensorData::new(log_scale, [dim]), device)),
            context: (context_dim > 0).then(|| Dense::zeros(context_dim, 2 * dim, device)),
            dim,
        })
    }

    fn params(&self, n: usize, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let loc = self.loc.val().unsqueeze::<2>();
        let log_scale = self.log_scale.val().unsqueeze::<2>();
        let device = loc.device();
        let base = Tensor::<B, 2>::zeros([n, self.dim], &device);
        match (&self.context, ctx) {
            (Some(layer), Some(c)) => {
                let (dl, ds) = split_columns(layer.forward(c), self.dim);
                (base.clone() + loc + dl, base + log_scale + ds)
            }
            _ => (base.clone() + loc, base + log_scale),
        }
    }

    pub fn to_base(&self, y: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let [n, _] = y.dims();
        let (loc, log_scale) = self.params(n, ctx);
        ((y - loc) * log_scale.clone().neg().exp(), row_sum(log_scale).neg())
    }

    pub fn to_data(&self, z: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let [n, _] = z.dims();
        let (loc, log_scale) = self.params(n, ctx);
        (loc + z * log_scale.clone().exp(), row_sum(log_scale))
    }
}

/// Full-covariance affine map `y = loc + L z` with `L` lower-triangular, positive diagonal.
#[derive(Module, Debug)]
pub struct AffineTril<B: Backend> {
    loc: Param<Tensor<B, 1>>,
    /// Only the strictly lower triangle is used.
    lower: Param<Tensor<B, 2>>,
    log_diag: Param<Tensor<B, 1>>,
    strict_mask: Tensor<B, 2>,
    context: Option<Dense<B>>,
    dim: usize,
}

impl<B: Backend> AffineTril<B> {
    pub fn new(dim: usize, context_dim: usize, loc: &[f32], scale_tril: &[f32], device: &B::Device) -> Result<Self> {
        if loc.len() != dim || scale_tril.len() != dim * dim {
            return Err(Error::Config(format!(
                "affine_tril: loc must have length {dim} and scale_tril {}",
                dim * dim
            )));
        }
        let mut log_diag = Vec::with_capacity(dim);
        let mut mask = vec![0.0f32; dim * dim];
        for i in 0..dim {
            let v = scale_tril[i * dim + i];
            if !(v.is_finite() && v > 0.0) {
                return Err(Error::Config("affine_tril: scale_tril diagonal must be positive".into()));
            }
            log_diag.push(v.ln());
            for j in 0..i {
                mask[i * dim + j] = 1.0;
            }
        }
        Ok(Self {
            loc: Param::from_tensor(Tensor::from_data(TensorData::new(loc.to_vec(), [dim]), device)),
            lower: Param::from_tensor(Tensor::from_data(TensorData::new(scale_tril.to_vec(), [dim, dim]), device)),
            log_diag: Param::from_tensor(Tensor::from_data(TensorData::new(log_diag, [dim]), device)),
            strict_mask: Tensor::from_data(TensorData::new(mask, [dim, dim]), device),
            context: (context_dim > 0).then(|| Dense::zeros(context_dim, dim, device)),
            dim,
        })
    }

    /// The lower-triangular scale factor `L`.
    pub fn scale_tril(&self) -> Tensor<B, 2> {
        let lower = self.lower.val() * self.strict_mask.clone();
        let eye = identity_matrix::<B>(self.dim, &lower.device());
        lower + eye * self.log_diag.val().exp().unsqueeze::<2>()
    }

    fn loc(&self, n: usize, ctx: Option<Tensor<B, 2>>) -> Tensor<B, 2> {
        let loc = self.loc.val().unsqueeze::<2>();
        let base = Tensor::<B, 2>::zeros([n, self.dim], &loc.device()) + loc;
        match (&self.context, ctx) {
            (Some(layer), Some(c)) => base + layer.forward(c),
            _ => base,
        }
    }

    fn log_det(&self, n: usize) -> Tensor<B, 1> {
        let total = self.log_diag.val().sum();
        Tensor::<B, 1>::zeros([n], &total.device()) + total
    }

    pub fn to_data(&self, z: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let [n, _] = z.dims();
        let y = self.loc(n, ctx) + z.matmul(self.scale_tril().transpose());
        (y, self.log_det(n))
    }

    /// Forward substitution, one column at a time.
    pub fn to_base(&self, y: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let [n, d] = y.dims();
        let r = y - self.loc(n, ctx);
        let l = self.scale_tril();
        let mut cols: Vec<Tensor<B, 2>> = Vec::with_capacity(d);
        for i in 0..d {
            let r_i = r.clone().slice([0..n, i..i + 1]);
            let l_ii = l.clone().slice([i..i + 1, i..i + 1]);
            let acc = if i == 0 {
                r_i.zeros_like()
            } else {
                let solved = Tensor::cat(cols.clone(), 1);
                let l_row = l.clone().slice([i..i + 1, 0..i]);
                (solved * l_row).sum_dim(1)
            };
            cols.push((r_i - acc) / l_ii);
        }
        (Tensor::cat(cols, 1), self.log_det(n).neg())
    }
}

/// Fixed coordinate permutation. Volume preserving.
#[derive(Module, Debug)]
pub struct Permute<B: Backend> {
    perm: Vec<usize>,
    inverse: Vec<usize>,
    _backend: PhantomData<B>,
}

impl<B: Backend> Permute<B> {
    /// `y_j = z_{perm[j]}`.
    pub fn new(perm: Vec<usize>) -> Result<Self> {
        let mut inverse = vec![usize::MAX; perm.len()];
        for (j, &p) in perm.iter().enumerate() {
            if p >= perm.len() || inverse[p] != usize::MAX {
                return Err(Error::Config("permutation must contain each index exactly once".into()));
            }
            inverse[p] = j;
        }
        Ok(Self {
            perm,
            inverse,
            _backend: PhantomData,
        })
    }

    pub fn random<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Self {
        let mut perm: Vec<usize> = (0..dim).collect();
        perm.shuffle(rng);
        let mut inverse = vec![0; dim];
        for (j, &p) in perm.iter().enumerate() {
            inverse[p] = j;
        }
        Self {
            perm,
            inverse,
            _backend: PhantomData,
        }
    }

    pub fn permutation(&self) -> &[usize] {
        &self.perm
    }

    pub fn to_data(&self, z: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let [n, _] = z.dims();
        let device = z.device();
        (z.select(1, index_tensor::<B>(&self.perm, &device)), Tensor::zeros([n], &device))
    }

    pub fn to_base(&self, y: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let [n, _] = y.dims();
        let device = y.device();
        (y.select(1, index_tensor::<B>(&self.inverse, &device)), Tensor::zeros([n], &device))
    }
}

/// Batch normalization as an invertible layer (Dinh et al., 2017).
///
/// In the density direction, training backends (autodiff enabled) normalize with batch
/// statistics and update the running averages; evaluation backends use the running averages.
/// Sampling always uses the running averages.
#[derive(Module, Debug)]
pub struct BatchNorm<B: Backend> {
    log_gamma: Param<Tensor<B, 1>>,
    beta: Param<Tensor<B, 1>>,
    running_mean: RunningState<Tensor<B, 1>>,
    running_var: RunningState<Tensor<B, 1>>,
    momentum: f64,
    epsilon: f64,
}

impl<B: Backend> BatchNorm<B> {
    pub fn new(dim: usize, device: &B::Device) -> Self {
        Self {
            log_gamma: Param::from_tensor(Tensor::zeros([dim], device)),
            beta: Param::from_tensor(Tensor::zeros([dim], device)),
            running_mean: RunningState::new(Tensor::zeros([dim], device)),
            running_var: RunningState::new(Tensor::ones([dim], device)),
            momentum: 0.1,
            epsilon: 1e-5,
        }
    }

    fn log_det(&self, var: Tensor<B, 2>, n: usize) -> Tensor<B, 1> {
        let per_dim = self.log_gamma.val().unsqueeze::<2>() - var.add_scalar(self.epsilon).log().mul_scalar(0.5);
        let total = per_dim.sum_dim(1).reshape([1]);
        Tensor::<B, 1>::zeros([n], &total.device()) + total
    }

    pub fn to_base(&self, y: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let [n, d] = y.dims();
        let (mean, var) = if B::ad_enabled() {
            let mean = y.clone().mean_dim(0);
            let var = y.clone().var(0);
            let m = self.momentum;
            let new_mean = self.running_mean.value_sync().mul_scalar(1.0 - m) + mean.clone().reshape([d]).mul_scalar(m);
            let new_var = self.running_var.value_sync().mul_scalar(1.0 - m) + var.clone().reshape([d]).mul_scalar(m);
            self.running_mean.update(new_mean.detach());
            self.running_var.update(new_var.detach());
            (mean, var)
        } else {
            (
                self.running_mean.value_sync().unsqueeze::<2>(),
                self.running_var.value_sync().unsqueeze::<2>(),
            )
        };
        let z = (y - mean) * self.log_gamma.val().exp().unsqueeze::<2>()
            / var.clone().add_scalar(self.epsilon).sqrt()
            + self.beta.val().unsqueeze::<2>();
        (z, self.log_det(var, n))
    }

    pub fn to_data(&self, z: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let [n, _] = z.dims();
        let mean = self.running_mean.value_sync().unsqueeze::<2>();
        let var = self.running_var.value_sync().unsqueeze::<2>();
        let y = (z - self.beta.val().unsqueeze::<2>())
            * self.log_gamma.val().neg().exp().unsqueeze::<2>()
            * var.clone().add_scalar(self.epsilon).sqrt()
            + mean;
        (y, self.log_det(var, n).neg())
    }
}

/// One layer of a flow.
#[derive(Module, Debug)]
pub enum FlowTransform<B: Backend> {
    AffineAutoregressive(AffineAutoregressive<B>),
    SplineAutoregressive(SplineAutoregressive<B>),
    AffineCoupling(AffineCoupling<B>),
    SplineCoupling(SplineCoupling<B>),
    AffineDiag(AffineDiag<B>),
    AffineTril(AffineTril<B>),
    Permute(Permute<B>),
    BatchNorm(BatchNorm<B>),
}

impl<B: Backend> FlowTransform<B> {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AffineAutoregressive(_) => "affine_autoregressive",
            Self::SplineAutoregressive(_) => "spline_autoregressive",
            Self::AffineCoupling(_) => "affine_coupling",
            Self::SplineCoupling(_) => "spline_coupling",
            Self::AffineDiag(_) => "affine_diag",
            Self::AffineTril(_) => "affine_tril",
            Self::Permute(_) => "permute",
            Self::BatchNorm(_) => "batch_norm",
        }
    }

    pub fn to_base(&self, y: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        match self {
            Self::AffineAutoregressive(t) => t.to_base(y, ctx),
            Self::SplineAutoregressive(t) => t.to_base(y, ctx),
            Self::AffineCoupling(t) => t.to_base(y, ctx),
            Self::SplineCoupling(t) => t.to_base(y, ctx),
            Self::AffineDiag(t) => t.to_base(y, ctx),
            Self::AffineTril(t) => t.to_base(y, ctx),
            Self::Permute(t) => t.to_base(y),
            Self::BatchNorm(t) => t.to_base(y),
        }
    }

    pub fn to_data(&self, z: Tensor<B, 2>, ctx: Option<Tensor<B, 2>>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        match self {
            Self::AffineAutoregressive(t) => t.to_data(z, ctx),
            Self::SplineAutoregressive(t) => t.to_data(z, ctx),
            Self::AffineCoupling(t) => t.to_data(z, ctx),
            Self::SplineCoupling(t) => t.to_data(z, ctx),
            Self::AffineDiag(t) => t.to_data(z, ctx),
            Self::AffineTril(t) => t.to_data(z, ctx),
            Self::Permute(t) => t.to_data(z),
            Self::BatchNorm(t) => t.to_data(z),
        }
    }
}
