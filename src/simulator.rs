//! Simulator contract and batched simulation.
//!
//! A simulator maps a batch of parameters to a batch of observations. It returns the parameter
//! rows alongside the observations because it may reorder (or re-emit) its batch; the returned
//! pairing is authoritative.

use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::{Error, Result};

pub trait Simulator {
    /// Simulate a `[n, theta_dim]` batch; returns `(theta, x)` with matching row counts.
    fn simulate(&mut self, theta: ArrayView2<'_, f32>) -> Result<(Array2<f32>, Array2<f32>)>;
}

impl<F> Simulator for F
where
    F: FnMut(ArrayView2<'_, f32>) -> Result<(Array2<f32>, Array2<f32>)>,
{
    fn simulate(&mut self, theta: ArrayView2<'_, f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        self(theta)
    }
}

/// Adapts a per-row function `θ ↦ x` into a [`Simulator`] that preserves row order.
pub struct RowSimulator<F> {
    f: F,
}

impl<F> RowSimulator<F>
where
    F: FnMut(ArrayView1<'_, f32>) -> Array1<f32>,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Simulator for RowSimulator<F>
where
    F: FnMut(ArrayView1<'_, f32>) -> Array1<f32>,
{
    fn simulate(&mut self, theta: ArrayView2<'_, f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        let n = theta.nrows();
        let mut rows: Vec<Array1<f32>> = Vec::with_capacity(n);
        for row in theta.outer_iter() {
            rows.push((self.f)(row));
        }
        let x_dim = rows.first().map_or(0, |r| r.len());
        if rows.iter().any(|r| r.len() != x_dim) {
            return Err(Error::Simulator(
                "row simulator returned observations of different lengths".into(),
            ));
        }
        let mut x = Array2::<f32>::zeros((n, x_dim));
        for (i, r) in rows.iter().enumerate() {
            x.row_mut(i).assign(r);
        }
        Ok((theta.to_owned(), x))
    }
}

/// Run `sim` over `theta` in chunks of at most `batch_size` rows and stack the results.
///
/// Each chunk's returned θ replaces the requested one. Row counts must be preserved per chunk.
pub fn simulate_in_batches<S: Simulator + ?Sized>(
    sim: &mut S,
    theta: &ArrayView2<'_, f32>,
    batch_size: usize,
) -> Result<(Array2<f32>, Array2<f32>)> {
    if batch_size == 0 {
        return Err(Error::Domain("simulation_batch_size must be >= 1"));
    }
    let n = theta.nrows();
    let d = theta.ncols();
    if n == 0 {
        return Err(Error::Domain("nothing to simulate: zero parameter rows"));
    }

    let mut thetas = Vec::new();
    let mut xs = Vec::new();
    for start in (0..n).step_by(batch_size) {
        let end = (start + batch_size).min(n);
        let chunk = theta.slice(ndarray::s![start..end, ..]);
        let (t, x) = sim.simulate(chunk)?;
        if t.nrows() != end - start || x.nrows() != end - start {
            return Err(Error::Simulator(format!(
                "expected {} rows back, got theta={} x={}",
                end - start,
                t.nrows(),
                x.nrows()
            )));
        }
        if t.ncols() != d {
            return Err(Error::Simulator(format!(
                "returned theta has {} columns, expected {d}",
                t.ncols()
            )));
        }
        thetas.push(t);
        xs.push(x);
    }

    let theta_views: Vec<_> = thetas.iter().map(|t| t.view()).collect();
    let x_views: Vec<_> = xs.iter().map(|x| x.view()).collect();
    let theta = concatenate(Axis(0), &theta_views)
        .map_err(|_| Error::Shape("simulated theta chunks do not stack"))?;
    let x = concatenate(Axis(0), &x_views)
        .map_err(|_| Error::Shape("observation chunks have different widths"))?;
    Ok((theta, x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s};

    #[test]
    fn row_simulator_preserves_order() {
        let mut sim = RowSimulator::new(|t: ArrayView1<'_, f32>| t.mapv(|v| 2.0 * v));
        let theta = array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let (t, x) = simulate_in_batches(&mut sim, &theta.view(), 2).unwrap();
        assert_eq!(t, theta);
        assert_eq!(x, theta.mapv(|v| 2.0 * v));
    }

    #[test]
    fn returned_theta_ordering_wins() {
        // Reverses each chunk; storage must follow the returned pairing.
        let mut sim = |theta: ArrayView2<'_, f32>| -> Result<(Array2<f32>, Array2<f32>)> {
            let t = theta.slice(s![..;-1, ..]).to_owned();
            let x = t.mapv(|v| v + 100.0);
            Ok((t, x))
        };
        let theta = array![[1.0f32], [2.0], [3.0]];
        let (t, x) = simulate_in_batches(&mut sim, &theta.view(), 3).unwrap();
        assert_eq!(t, array![[3.0f32], [2.0], [1.0]]);
        assert_eq!(x, array![[103.0f32], [102.0], [101.0]]);
    }

    #[test]
    fn dropped_rows_are_an_error() {
        let mut sim = |theta: ArrayView2<'_, f32>| -> Result<(Array2<f32>, Array2<f32>)> {
            let t = theta.slice(s![1.., ..]).to_owned();
            Ok((t.clone(), t))
        };
        let theta = array![[1.0f32], [2.0]];
        assert!(matches!(
            simulate_in_batches(&mut sim, &theta.view(), 2),
            Err(Error::Simulator(_))
        ));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut sim = RowSimulator::new(|t: ArrayView1<'_, f32>| t.to_owned());
        let theta = array![[1.0f32]];
        assert!(simulate_in_batches(&mut sim, &theta.view(), 0).is_err());
    }
}
