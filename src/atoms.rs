//! Contrastive atom sets.
//!
//! Both estimator families score each training pair `(θ_i, x_i)` against `K - 1` contrasting
//! parameters drawn from the *other* rows of the same minibatch:
//!
//! - row `i` of the atom set is `[θ_i, θ_{j_1}, …, θ_{j_{K-1}}]`,
//! - the `j`'s are distinct, never equal to `i`, and drawn uniformly without replacement,
//! - `x_i` is repeated `K` times so atoms and observations line up row for row.
//!
//! Drawing `K - 1` distinct indices uniformly from `{0..B} \ {i}` is the same distribution as
//! a multinomial without replacement over a uniform weight matrix with a zero diagonal.

use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;

use crate::{Error, Result};

/// Clamp `num_atoms` into `[2, batch_size]`.
///
/// Asking for more atoms than rows is recoverable (warns and clamps); fewer than two atoms, or a
/// batch that cannot provide a single contrasting row, is not.
pub fn clamp_num_atoms(num_atoms: usize, batch_size: usize) -> Result<usize> {
    if batch_size < 2 {
        return Err(Error::Domain("contrastive losses need a batch of at least 2 rows"));
    }
    if num_atoms < 2 {
        return Err(Error::Config(format!("num_atoms must be >= 2, got {num_atoms}")));
    }
    if num_atoms > batch_size {
        log::warn!("num_atoms={num_atoms} exceeds batch size {batch_size}; clamping to {batch_size}");
        return Ok(batch_size);
    }
    Ok(num_atoms)
}

/// `[B, K]` index matrix: column 0 is the row itself, the rest are distinct contrasting rows.
///
/// `num_atoms` must already be clamped to `[2, batch_size]`.
pub fn contrastive_indices<R: Rng + ?Sized>(
    batch_size: usize,
    num_atoms: usize,
    rng: &mut R,
) -> Array2<usize> {
    debug_assert!(num_atoms >= 2 && num_atoms <= batch_size);
    let mut out = Array2::<usize>::zeros((batch_size, num_atoms));
    for i in 0..batch_size {
        out[[i, 0]] = i;
        let picks = rand::seq::index::sample(rng, batch_size - 1, num_atoms - 1);
        for (slot, j) in picks.into_iter().enumerate() {
            // Skip over the diagonal.
            out[[i, slot + 1]] = if j >= i { j + 1 } else { j };
        }
    }
    out
}

/// Each row of `x` repeated `k` times in place (`[B, d] → [B·k, d]`).
pub fn repeat_rows(x: &ArrayView2<'_, f32>, k: usize) -> Array2<f32> {
    let idx: Vec<usize> = (0..x.nrows()).flat_map(|i| std::iter::repeat(i).take(k)).collect();
    x.select(Axis(0), &idx)
}

/// Atom set for one minibatch.
#[derive(Debug, Clone)]
pub struct AtomSet {
    /// `[B, K]` row indices into the minibatch.
    pub indices: Array2<usize>,
    /// `[B·K, theta_dim]`: for each row, the true θ first, then its contrasting atoms.
    pub atomic_theta: Array2<f32>,
    /// `[B·K, x_dim]`: each `x_i` repeated `K` times.
    pub repeated_x: Array2<f32>,
    pub num_atoms: usize,
}

/// Build the atom set for a minibatch, clamping `num_atoms` as needed.
pub fn sample_atoms<R: Rng + ?Sized>(
    theta: &ArrayView2<'_, f32>,
    x: &ArrayView2<'_, f32>,
    num_atoms: usize,
    rng: &mut R,
) -> Result<AtomSet> {
    let b = theta.nrows();
    if x.nrows() != b {
        return Err(Error::Shape("theta and x batches must have the same number of rows"));
    }
    let k = clamp_num_atoms(num_atoms, b)?;
    let indices = contrastive_indices(b, k, rng);
    let flat: Vec<usize> = indices.iter().copied().collect();
    Ok(AtomSet {
        atomic_theta: theta.select(Axis(0), &flat),
        repeated_x: repeat_rows(x, k),
        indices,
        num_atoms: k,
    })
}
