//! Monotone rational splines on `[-bound, bound]` with identity tails.
//!
//! Two orders are supported:
//!
//! - `linear`: linear-rational splines (Dolatabadi et al., 2020), where each bin is split at an
//!   extra learned point `λ` into two linear-rational pieces,
//! - `quadratic`: rational-quadratic splines (Durkan et al., 2019).
//!
//! Parameters arrive unnormalized per element: `K` widths, `K` heights, `K - 1` interior
//! derivatives and, for linear order, `K` split points. Boundary derivatives are fixed to 1 so
//! the spline joins the identity tails smoothly. Bin lookup uses a one-hot built from step
//! functions, so everything stays a plain tensor expression and gradients flow through the
//! selected bin's parameters.

use burn_core as burn;

use std::str::FromStr;

use burn::tensor::activation::{sigmoid, softmax, softplus};
use burn::tensor::{backend::Backend, Tensor};

use crate::tensor::exclusive_cumsum_matrix;
use crate::{Error, Result};

pub const MIN_BIN_WIDTH: f64 = 1e-3;
pub const MIN_BIN_HEIGHT: f64 = 1e-3;
pub const MIN_DERIVATIVE: f64 = 1e-3;
pub const MIN_LAMBDA: f64 = 0.025;

/// Spline family used inside a bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplineOrder {
    #[default]
    Linear,
    Quadratic,
}

impl SplineOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Quadratic => "quadratic",
        }
    }
}

impl FromStr for SplineOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "quadratic" => Ok(Self::Quadratic),
            other => Err(Error::Config(format!(
                "spline order `{other}` is not supported; use `linear` or `quadratic`"
            ))),
        }
    }
}

/// Number of unnormalized spline parameters per element for `count_bins` bins.
pub fn params_per_element(count_bins: usize, order: SplineOrder) -> usize {
    match order {
        SplineOrder::Linear => 4 * count_bins - 1,
        SplineOrder::Quadratic => 3 * count_bins - 1,
    }
}

/// Unnormalized spline parameters, each laid out `[n, d, ·]`.
#[derive(Debug, Clone)]
pub struct SplineParams<B: Backend> {
    pub widths: Tensor<B, 3>,
    pub heights: Tensor<B, 3>,
    pub derivatives: Tensor<B, 3>,
    /// Split points; present only for linear order.
    pub lambdas: Option<Tensor<B, 3>>,
}

/// Split a `[n, d, params_per_element]` block into its parts.
pub fn split_params<B: Backend>(params: Tensor<B, 3>, count_bins: usize, order: SplineOrder) -> SplineParams<B> {
    let [n, d, _] = params.dims();
    let k = count_bins;
    let lambdas = match order {
        SplineOrder::Linear => Some(params.clone().slice([0..n, 0..d, 3 * k - 1..4 * k - 1])),
        SplineOrder::Quadratic => None,
    };
    SplineParams {
        widths: params.clone().slice([0..n, 0..d, 0..k]),
        heights: params.clone().slice([0..n, 0..d, k..2 * k]),
        derivatives: params.slice([0..n, 0..d, 2 * k..3 * k - 1]),
        lambdas,
    }
}

/// Knot positions `[n, d, K + 1]` from normalized bin sizes, spanning `[-bound, bound]`.
fn knots<B: Backend>(sizes: Tensor<B, 3>, bound: f64) -> Tensor<B, 3> {
    let [n, d, k] = sizes.dims();
    let m = exclusive_cumsum_matrix::<B>(k, &sizes.device());
    sizes
        .reshape([n * d, k])
        .matmul(m)
        .mul_scalar(2.0 * bound)
        .sub_scalar(bound)
        .reshape([n, d, k + 1])
}

fn normalize<B: Backend>(raw: Tensor<B, 3>, min_size: f64) -> Tensor<B, 3> {
    let [_, _, k] = raw.dims();
    softmax(raw, 2)
        .mul_scalar(1.0 - min_size * k as f64)
        .add_scalar(min_size)
}

fn pick<B: Backend>(onehot: &Tensor<B, 3>, values: Tensor<B, 3>) -> Tensor<B, 2> {
    let [n, d, _] = values.dims();
    (onehot.clone() * values).sum_dim(2).reshape([n, d])
}

fn last_axis<B: Backend>(t: &Tensor<B, 3>, range: std::ops::Range<usize>) -> Tensor<B, 3> {
    let [n, d, _] = t.dims();
    t.clone().slice([0..n, 0..d, range])
}

fn one_minus<B: Backend>(t: Tensor<B, 2>) -> Tensor<B, 2> {
    t.neg().add_scalar(1.0)
}

/// The bin each element falls in, `[n, d]` per quantity.
struct Bin<B: Backend> {
    cumwidth: Tensor<B, 2>,
    width: Tensor<B, 2>,
    cumheight: Tensor<B, 2>,
    height: Tensor<B, 2>,
    delta: Tensor<B, 2>,
    d0: Tensor<B, 2>,
    d1: Tensor<B, 2>,
}

/// Apply the spline elementwise to `[n, d]` inputs.
///
/// `inverse = false` maps data → base; `inverse = true` maps base → data. Returns the outputs
/// and the elementwise `log|dout/din|` for the direction taken (zero in the tails).
pub fn monotonic_spline<B: Backend>(
    inputs: Tensor<B, 2>,
    params: SplineParams<B>,
    bound: f64,
    inverse: bool,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let [n, d] = inputs.dims();
    let [_, _, k] = params.widths.dims();
    let device = inputs.device();

    let inside = inputs.clone().greater_equal_elem(-bound).float()
        * inputs.clone().lower_equal_elem(bound).float();
    let x = inputs.clone().clamp(-bound, bound);

    let widths = normalize(params.widths, MIN_BIN_WIDTH);
    let heights = normalize(params.heights, MIN_BIN_HEIGHT);
    let edge = Tensor::<B, 3>::ones([n, d, 1], &device);
    let derivatives = Tensor::cat(
        vec![
            edge.clone(),
            softplus(params.derivatives, 1.0).add_scalar(MIN_DERIVATIVE),
            edge.clone(),
        ],
        2,
    );

    let cumwidths = knots(widths, bound);
    let cumheights = knots(heights, bound);
    let bin_widths = last_axis(&cumwidths, 1..k + 1) - last_axis(&cumwidths, 0..k);
    let bin_heights = last_axis(&cumheights, 1..k + 1) - last_axis(&cumheights, 0..k);

    // One-hot over bins: steps[j] = [x >= knot_j] for interior knots.
    let search = if inverse { &cumheights } else { &cumwidths };
    let interior = last_axis(search, 1..k);
    let steps = (x.clone().reshape([n, d, 1]) - interior)
        .greater_equal_elem(0.0)
        .float();
    let s = Tensor::cat(vec![edge, steps, Tensor::zeros([n, d, 1], &device)], 2);
    let onehot = last_axis(&s, 0..k) - last_axis(&s, 1..k + 1);

    let width = pick(&onehot, bin_widths);
    let height = pick(&onehot, bin_heights);
    let bin = Bin {
        cumwidth: pick(&onehot, last_axis(&cumwidths, 0..k)),
        cumheight: pick(&onehot, last_axis(&cumheights, 0..k)),
        delta: height.clone() / width.clone(),
        width,
        height,
        d0: pick(&onehot, last_axis(&derivatives, 0..k)),
        d1: pick(&onehot, last_axis(&derivatives, 1..k + 1)),
    };

    let (spline_out, spline_lad) = match params.lambdas {
        Some(raw) => {
            let lambdas = sigmoid(raw).mul_scalar(1.0 - 2.0 * MIN_LAMBDA).add_scalar(MIN_LAMBDA);
            linear_rational(x, bin, pick(&onehot, lambdas), inverse)
        }
        None => rational_quadratic(x, bin, inverse),
    };

    let outside = one_minus(inside.clone());
    let out = inside.clone() * spline_out + outside * inputs;
    (out, inside * spline_lad)
}

fn rational_quadratic<B: Backend>(x: Tensor<B, 2>, bin: Bin<B>, inverse: bool) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let Bin {
        cumwidth,
        width,
        cumheight,
        height,
        delta,
        d0,
        d1,
    } = bin;
    let slope_sum = d0.clone() + d1.clone() - delta.clone().mul_scalar(2.0);

    if inverse {
        let dy = x - cumheight;
        let a = dy.clone() * slope_sum.clone() + height.clone() * (delta.clone() - d0.clone());
        let b = height * d0.clone() - dy.clone() * slope_sum.clone();
        let c = delta.clone().neg() * dy;
        let disc = (b.clone() * b.clone() - a * c.clone().mul_scalar(4.0)).clamp_min(0.0);
        let root = c.mul_scalar(2.0) / (b.neg() - disc.sqrt());
        let out = root.clone() * width + cumwidth;

        let t1mt = root.clone() * one_minus(root.clone());
        let denominator = delta.clone() + slope_sum * t1mt.clone();
        let rest = one_minus(root.clone());
        let deriv_num = delta.clone()
            * delta.clone()
            * (d1 * root.clone() * root + delta.mul_scalar(2.0) * t1mt + d0 * rest.clone() * rest);
        let lad = denominator.log().mul_scalar(2.0) - deriv_num.log();
        (out, lad)
    } else {
        let theta = (x - cumwidth) / width;
        let rest = one_minus(theta.clone());
        let t1mt = theta.clone() * rest.clone();
        let numerator = height * (delta.clone() * theta.clone() * theta.clone() + d0.clone() * t1mt.clone());
        let denominator = delta.clone() + slope_sum * t1mt.clone();
        let out = cumheight + numerator / denominator.clone();
        let deriv_num = delta.clone()
            * delta.clone()
            * (d1 * theta.clone() * theta + delta.mul_scalar(2.0) * t1mt + d0 * rest.clone() * rest);
        let lad = deriv_num.log() - denominator.log().mul_scalar(2.0);
        (out, lad)
    }
}

/// Two linear-rational pieces per bin, joined at `θ = λ`.
///
/// Weights: `w_a = 1` at the left knot, `w_b = sqrt(d0 / d1)` at the right knot and `w_c` at the
/// split point, chosen so the end slopes match `d0` and `d1`. Numerators and denominators are
/// blended across the two pieces before dividing.
fn linear_rational<B: Backend>(
    x: Tensor<B, 2>,
    bin: Bin<B>,
    lambda: Tensor<B, 2>,
    inverse: bool,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let Bin {
        cumwidth,
        width,
        cumheight,
        height,
        delta,
        d0,
        d1,
    } = bin;
    let rest_l = one_minus(lambda.clone());
    let wb = (d0.clone() / d1.clone()).sqrt();
    let wc = (lambda.clone() * d0 + rest_l.clone() * wb.clone() * d1) / delta;
    let ya = cumheight.clone();
    let yb = cumheight + height;
    let yc = (rest_l.clone() * ya.clone() + lambda.clone() * wb.clone() * yb.clone())
        / (rest_l.clone() + lambda.clone() * wb.clone());

    let left_slope = wc.clone() * lambda.clone() * (yc.clone() - ya.clone());
    let right_slope = wb.clone() * wc.clone() * rest_l * (yb.clone() - yc.clone());

    if inverse {
        let left = x.clone().lower_equal(yc.clone()).float();
        let right = one_minus(left.clone());
        let numerator = left.clone() * lambda.clone() * (ya.clone() - x.clone())
            + right.clone()
                * ((wc.clone() - lambda.clone() * wb.clone()) * x.clone() + lambda * wb.clone() * yb.clone()
                    - wc.clone() * yc.clone());
        let denominator = left.clone() * (wc.clone().sub_scalar(1.0) * x.clone() + ya - wc.clone() * yc.clone())
            + right.clone() * ((wc.clone() - wb.clone()) * x + wb * yb - wc * yc);
        let theta = numerator / denominator.clone();
        let out = theta * width.clone() + cumwidth;
        let deriv = (left * left_slope + right * right_slope) * width;
        let lad = deriv.log() - denominator.abs().log().mul_scalar(2.0);
        (out, lad)
    } else {
        let theta = (x - cumwidth) / width.clone();
        let left = theta.clone().lower_equal(lambda.clone()).float();
        let right = one_minus(left.clone());
        let before = lambda.clone() - theta.clone();
        let after = theta.clone() - lambda;
        let numerator = left.clone() * (ya * before.clone() + wc.clone() * yc.clone() * theta.clone())
            + right.clone() * (wc.clone() * yc * one_minus(theta.clone()) + wb.clone() * yb * after.clone());
        let denominator = left.clone() * (before + wc.clone() * theta.clone())
            + right.clone() * (wc * one_minus(theta) + wb * after);
        let out = numerator / denominator.clone();
        let deriv = (left * left_slope + right * right_slope) / width;
        let lad = deriv.log() - denominator.abs().log().mul_scalar(2.0);
        (out, lad)
    }
}
