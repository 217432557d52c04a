//! Link transforms: the fixed last layer that maps a flow's unconstrained output into the
//! support of the target distribution.
//!
//! A link may change the dimension (stick-breaking maps `k` coordinates onto the `k + 1`-simplex),
//! which is why flows are built in a *working* dimension that the link then maps to the nominal
//! event dimension.

use burn_core as burn;

use burn::tensor::activation::log_sigmoid;
use burn::tensor::{backend::Backend, Tensor};

use crate::tensor::{exclusive_cumsum_matrix, inclusive_cumsum_matrix, row_tensor};
use crate::{Error, Result};

const TINY: f64 = 1e-30;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum LinkTransform {
    /// Unconstrained support.
    #[default]
    Identity,
    /// Positive orthant.
    Exp,
    /// Open box `(low, high)` via a scaled logistic.
    Sigmoid { low: Vec<f32>, high: Vec<f32> },
    /// Probability simplex via stick-breaking; adds one dimension.
    StickBreaking,
}

fn row_sum<B: Backend>(t: Tensor<B, 2>) -> Tensor<B, 1> {
    let [n, _] = t.dims();
    t.sum_dim(1).reshape([n])
}

impl LinkTransform {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Exp => "exp",
            Self::Sigmoid { .. } => "sigmoid",
            Self::StickBreaking => "stick_breaking",
        }
    }

    /// Check that this link can produce a nominal event of dimension `event_dim`.
    pub fn validate(&self, event_dim: usize) -> Result<()> {
        match self {
            Self::Sigmoid { low, high } => {
                if low.len() != event_dim || high.len() != event_dim {
                    return Err(Error::Config(format!(
                        "sigmoid link bounds must have length {event_dim}"
                    )));
                }
                if low.iter().zip(high).any(|(l, h)| !(l.is_finite() && h.is_finite() && l < h)) {
                    return Err(Error::Config("sigmoid link needs finite bounds with low < high".into()));
                }
                Ok(())
            }
            Self::StickBreaking if event_dim < 2 => Err(Error::Config(
                "stick-breaking link needs an event dimension >= 2".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Output dimension when applied to an input of dimension `input_dim`, measured by pushing a
    /// zero probe through the map.
    pub fn probe_output_dim<B: Backend>(&self, input_dim: usize, device: &B::Device) -> usize {
        let probe = Tensor::<B, 2>::zeros([1, input_dim], device);
        let (out, _) = self.to_data(probe);
        out.dims()[1]
    }

    /// Unconstrained → constrained. Returns `log|det J|` per row.
    pub fn to_data<B: Backend>(&self, z: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let [n, k] = z.dims();
        let device = z.device();
        match self {
            Self::Identity => (z, Tensor::zeros([n], &device)),
            Self::Exp => (z.clone().exp(), row_sum(z)),
            Self::Sigmoid { low, high } => {
                let width: Vec<f32> = low.iter().zip(high).map(|(l, h)| h - l).collect();
                let log_width: f32 = width.iter().map(|w| w.ln()).sum();
                let y = row_tensor::<B>(low, &device)
                    + row_tensor::<B>(&width, &device) * burn::tensor::activation::sigmoid(z.clone());
                let lad = row_sum(log_sigmoid(z.clone()) + log_sigmoid(z.neg())).add_scalar(log_width);
                (y, lad)
            }
            Self::StickBreaking => {
                let offset: Vec<f32> = (0..k).map(|i| ((k - i) as f32).ln()).collect();
                let shifted = z - row_tensor::<B>(&offset, &device);
                let log_z = log_sigmoid(shifted.clone());
                let log_one_minus = log_sigmoid(shifted.clone().neg());
                // prefix[i] = Σ_{j<i} log(1 - z_j), i = 0..=k
                let prefix = log_one_minus.matmul(exclusive_cumsum_matrix::<B>(k, &device));
                let y = Tensor::cat(vec![log_z.clone().exp(), Tensor::ones([n, 1], &device)], 1)
                    * prefix.clone().exp();
                let head = prefix.slice([0..n, 0..k]);
                let lad = row_sum(shifted.neg() + log_z.mul_scalar(2.0) + head);
                (y, lad)
            }
        }
    }

    /// Constrained → unconstrained. Returns `log|det J|` per row of this direction.
    pub fn to_base<B: Backend>(&self, y: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let [n, d] = y.dims();
        let device = y.device();
        match self {
            Self::Identity => (y, Tensor::zeros([n], &device)),
            Self::Exp => {
                let z = y.clamp_min(TINY).log();
                let lad = row_sum(z.clone()).neg();
                (z, lad)
            }
            Self::Sigmoid { low, high } => {
                let width: Vec<f32> = low.iter().zip(high).map(|(l, h)| h - l).collect();
                let log_width: f32 = width.iter().map(|w| w.ln()).sum();
                let eps = f32::EPSILON as f64;
                let u = ((y - row_tensor::<B>(low, &device)) / row_tensor::<B>(&width, &device))
                    .clamp(eps, 1.0 - eps);
                let log_u = u.clone().log();
                let log_one_minus = u.neg().add_scalar(1.0).log();
                let z = log_u.clone() - log_one_minus.clone();
                let lad = row_sum(log_u + log_one_minus).add_scalar(log_width).neg();
                (z, lad)
            }
            Self::StickBreaking => {
                let k = d - 1;
                let head = y.slice([0..n, 0..k]).clamp_min(TINY);
                let offset: Vec<f32> = (0..k).map(|i| ((k - i) as f32).ln()).collect();
                let remaining = head
                    .clone()
                    .matmul(inclusive_cumsum_matrix::<B>(k, &device))
                    .neg()
                    .add_scalar(1.0)
                    .clamp_min(TINY);
                let log_head = head.log();
                let shifted = log_head.clone() - remaining.log();
                let z = shifted.clone() + row_tensor::<B>(&offset, &device);
                // log y_i = log σ(x') + Σ_{j<i} log(1 - z_j); the forward log-det is
                // Σ (-x' + log σ(x') + log y_i).
                let lad = row_sum(shifted.clone().neg() + log_sigmoid(shifted) + log_head).neg();
                (z, lad)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::to_vec;
    use burn_core::tensor::TensorData;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn input() -> Tensor<B, 2> {
        Tensor::from_data(
            TensorData::new(vec![0.3f32, -1.2, 0.8, -0.5, 1.4, 0.1], [2, 3]),
            &Default::default(),
        )
    }

    #[test]
    fn stick_breaking_lands_on_the_simplex_and_adds_a_dimension() {
        let device = Default::default();
        let link = LinkTransform::StickBreaking;
        assert_eq!(link.probe_output_dim::<B>(4, &device), 5);
        let (y, _) = link.to_data(input());
        assert_eq!(y.dims(), [2, 4]);
        let y = to_vec(y).unwrap();
        for row in y.chunks(4) {
            assert!(row.iter().all(|&v| v > 0.0));
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn links_invert_with_cancelling_log_dets() {
        let links = [
            LinkTransform::Identity,
            LinkTransform::Exp,
            LinkTransform::Sigmoid {
                low: vec![-1.0, 0.0, 2.0],
                high: vec![1.0, 5.0, 3.0],
            },
            LinkTransform::StickBreaking,
        ];
        for link in &links {
            let z = input();
            let (y, lad_f) = link.to_data(z.clone());
            let (z_back, lad_i) = link.to_base(y);
            for (a, b) in to_vec(z).unwrap().iter().zip(to_vec(z_back).unwrap()) {
                assert!((a - b).abs() < 1e-3, "{}: {a} vs {b}", link.name());
            }
            for (a, b) in to_vec(lad_f).unwrap().iter().zip(to_vec(lad_i).unwrap()) {
                assert!((a + b).abs() < 1e-3, "{}: {a} + {b} != 0", link.name());
            }
        }
    }

    #[test]
    fn validation_catches_mismatched_bounds() {
        let link = LinkTransform::Sigmoid {
            low: vec![0.0],
            high: vec![1.0],
        };
        assert!(link.validate(1).is_ok());
        assert!(link.validate(2).is_err());
        assert!(LinkTransform::StickBreaking.validate(1).is_err());
    }
}
