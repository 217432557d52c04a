//! `ndarray` ↔ `burn` bridging and small numeric guards.
//!
//! Sample storage, atom sampling and simulator I/O stay in `ndarray`; everything that carries
//! gradients lives in `burn`. These helpers are the only place the two meet.

use burn_core as burn;

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::{Error, Result};

/// Row-major copy of a 2-D view into a burn tensor.
///
/// Works for non-contiguous views (e.g. column slices); the logical order is preserved.
pub fn ndarray_to_burn_2<B: Backend>(device: &B::Device, x: &ArrayView2<f32>) -> Tensor<B, 2> {
    let (n, d) = x.dim();
    let data = TensorData::new(x.iter().copied().collect::<Vec<f32>>(), [n, d]);
    Tensor::from_data(data, device)
}

pub fn ndarray_to_burn_1<B: Backend>(device: &B::Device, x: &ArrayView1<f32>) -> Tensor<B, 1> {
    let data = TensorData::new(x.iter().copied().collect::<Vec<f32>>(), [x.len()]);
    Tensor::from_data(data, device)
}

/// `[1, k]` row tensor from a slice.
pub fn row_tensor<B: Backend>(values: &[f32], device: &B::Device) -> Tensor<B, 2> {
    Tensor::from_data(TensorData::new(values.to_vec(), [1, values.len()]), device)
}

/// Integer index tensor, as used by `Tensor::select`.
pub fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let idx: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(idx, [indices.len()]), device)
}

/// Host copy of any float tensor (row-major).
pub fn to_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<Vec<f32>> {
    t.into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Tensor(format!("{e:?}")))
}

pub fn burn_to_ndarray_2<B: Backend>(t: Tensor<B, 2>) -> Result<Array2<f32>> {
    let [n, d] = t.dims();
    Array2::from_shape_vec((n, d), to_vec(t)?)
        .map_err(|_| Error::Shape("tensor data does not match its reported shape"))
}

pub fn burn_to_ndarray_1<B: Backend>(t: Tensor<B, 1>) -> Result<Array1<f32>> {
    Ok(Array1::from_vec(to_vec(t)?))
}

/// Row-wise `log Σ_j exp(x_ij)` for a `[n, k]` tensor, returning `[n]`.
///
/// The row maximum is subtracted (and detached) before exponentiating; the gradient is the
/// row softmax either way.
pub fn logsumexp_rows<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 1> {
    let [n, _] = x.dims();
    let max = x.clone().max_dim(1).detach();
    (x - max.clone()).exp().sum_dim(1).log().add(max).reshape([n])
}

/// Fail with [`Error::Divergence`] if any entry is NaN or ±∞.
pub fn ensure_finite<B: Backend, const D: usize>(t: &Tensor<B, D>, stage: &'static str) -> Result<()> {
    let values = to_vec(t.clone())?;
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(Error::Divergence(stage))
    }
}

/// Broadcast a `[1, c]` context to `[n, c]`; `[n, c]` passes through.
pub fn broadcast_rows<B: Backend>(t: Tensor<B, 2>, n: usize) -> Result<Tensor<B, 2>> {
    let [rows, cols] = t.dims();
    if rows == n {
        Ok(t)
    } else if rows == 1 {
        Ok(Tensor::zeros([n, cols], &t.device()) + t)
    } else {
        Err(Error::Shape("context must have one row or one row per input"))
    }
}

/// `[k, k + 1]` matrix `M[j, i] = 1 if j < i`; `w.matmul(M)` is the exclusive prefix sum
/// padded with the total, i.e. the knot positions of a partition.
pub fn exclusive_cumsum_matrix<B: Backend>(k: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut m = vec![0.0f32; k * (k + 1)];
    for j in 0..k {
        for i in (j + 1)..=k {
            m[j * (k + 1) + i] = 1.0;
        }
    }
    Tensor::from_data(TensorData::new(m, [k, k + 1]), device)
}

/// `[k, k]` upper-triangular ones (inclusive prefix sum via `matmul`).
pub fn inclusive_cumsum_matrix<B: Backend>(k: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut m = vec![0.0f32; k * k];
    for j in 0..k {
        for i in j..k {
            m[j * k + i] = 1.0;
        }
    }
    Tensor::from_data(TensorData::new(m, [k, k]), device)
}

pub fn identity_matrix<B: Backend>(k: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut m = vec![0.0f32; k * k];
    for i in 0..k {
        m[i * k + i] = 1.0;
    }
    Tensor::from_data(TensorData::new(m, [k, k]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn_ndarray::NdArray;
    use ndarray::array;

    type B = NdArray<f32>;

    #[test]
    fn logsumexp_matches_naive_and_survives_large_values() {
        let device = Default::default();
        let x = array![[0.0f32, 1.0, 2.0], [1000.0, 1000.0, 1000.0]];
        let out = to_vec(logsumexp_rows(ndarray_to_burn_2::<B>(&device, &x.view()))).unwrap();
        let naive = (0.0f32.exp() + 1.0f32.exp() + 2.0f32.exp()).ln();
        assert_abs_diff_eq!(out[0], naive, epsilon = 1e-5);
        assert_abs_diff_eq!(out[1], 1000.0 + 3.0f32.ln(), epsilon = 1e-3);
    }

    #[test]
    fn non_contiguous_views_keep_logical_order() {
        let device = Default::default();
        let x = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let col = x.slice(ndarray::s![.., 1..]);
        let t = ndarray_to_burn_2::<B>(&device, &col);
        assert_eq!(to_vec(t).unwrap(), vec![2.0, 3.0, 5.0, 6.0]);
    }

    #[test]
    fn ensure_finite_flags_nan_and_inf() {
        let device = Default::default();
        let ok = row_tensor::<B>(&[1.0, 2.0], &device);
        assert!(ensure_finite(&ok, "test").is_ok());
        let bad = row_tensor::<B>(&[1.0, f32::NAN], &device);
        assert!(matches!(ensure_finite(&bad, "test"), Err(Error::Divergence("test"))));
        let inf = row_tensor::<B>(&[f32::NEG_INFINITY], &device);
        assert!(ensure_finite(&inf, "test").is_err());
    }

    #[test]
    fn exclusive_cumsum_gives_knots() {
        let device = Default::default();
        let w = row_tensor::<B>(&[0.2, 0.3, 0.5], &device);
        let knots = to_vec(w.matmul(exclusive_cumsum_matrix::<B>(3, &device))).unwrap();
        let expected = [0.0, 0.2, 0.5, 1.0];
        for (a, b) in knots.iter().zip(expected) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn broadcast_rows_repeats_single_row() {
        let device = Default::default();
        let c = row_tensor::<B>(&[1.0, 2.0], &device);
        let out = broadcast_rows(c, 3).unwrap();
        assert_eq!(out.dims(), [3, 2]);
        assert_eq!(to_vec(out).unwrap(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        let two = Tensor::<B, 2>::zeros([2, 2], &device);
        assert!(broadcast_rows(two, 3).is_err());
    }
}
