//! Append-only store of simulated `(θ, x)` pairs, grouped by round, plus invalid-output filtering.
//!
//! Every round's pairs are kept; training may concatenate from round 0 or, when prior samples
//! are discarded, from round 1 onwards. Each row also carries a flag saying whether its θ came
//! from the prior (needed by the combined SNPE loss).

use ndarray::{concatenate, Array2, ArrayView2, Axis};

use crate::{Error, Result};

/// What to do with simulations that produced NaN or ±∞.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidXPolicy {
    /// Abort the run.
    #[default]
    Raise,
    /// Drop the offending pairs and log a warning.
    ExcludeWithWarning,
    /// Drop the offending pairs without logging.
    ExcludeSilently,
}

/// Per-round count of discarded simulations. A row containing any NaN counts as NaN,
/// otherwise any infinite entry counts as Inf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvalidCounts {
    pub num_nans: usize,
    pub num_infs: usize,
}

impl InvalidCounts {
    pub fn total(&self) -> usize {
        self.num_nans + self.num_infs
    }
}

/// Validity mask over the rows of `x` together with the NaN/Inf breakdown.
pub fn find_invalid_x(x: &ArrayView2<'_, f32>) -> (Vec<bool>, InvalidCounts) {
    let mut counts = InvalidCounts::default();
    let valid = x
        .outer_iter()
        .map(|row| {
            if row.iter().any(|v| v.is_nan()) {
                counts.num_nans += 1;
                false
            } else if row.iter().any(|v| v.is_infinite()) {
                counts.num_infs += 1;
                false
            } else {
                true
            }
        })
        .collect();
    (valid, counts)
}

/// Apply `policy` to a freshly simulated batch.
pub fn filter_invalid_x(
    theta: Array2<f32>,
    x: Array2<f32>,
    policy: InvalidXPolicy,
) -> Result<(Array2<f32>, Array2<f32>, InvalidCounts)> {
    if theta.nrows() != x.nrows() {
        return Err(Error::Shape("theta and x must have the same number of rows"));
    }
    let (valid, counts) = find_invalid_x(&x.view());
    if counts.total() == 0 {
        return Ok((theta, x, counts));
    }
    match policy {
        InvalidXPolicy::Raise => {
            return Err(Error::InvalidData(format!(
                "found {} NaN and {} infinite simulations; set exclude_invalid_x to drop them",
                counts.num_nans, counts.num_infs
            )))
        }
        InvalidXPolicy::ExcludeWithWarning => {
            log::warn!(
                "excluding {} NaN and {} infinite simulations from training",
                counts.num_nans,
                counts.num_infs
            );
        }
        InvalidXPolicy::ExcludeSilently => {}
    }
    let keep: Vec<usize> = valid
        .iter()
        .enumerate()
        .filter_map(|(i, &ok)| ok.then_some(i))
        .collect();
    Ok((theta.select(Axis(0), &keep), x.select(Axis(0), &keep), counts))
}

/// One round's worth of stored simulations.
#[derive(Debug, Clone)]
pub struct BankRound {
    pub round: usize,
    pub theta: Array2<f32>,
    pub x: Array2<f32>,
    /// θ drawn from the prior (true only for round 0 in the sequential scheme).
    pub from_prior: bool,
}

/// Concatenated training view over a range of rounds.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub theta: Array2<f32>,
    pub x: Array2<f32>,
    pub prior_mask: Vec<bool>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.theta.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.theta.nrows() == 0
    }

    /// Gather rows by index, keeping the pairing intact.
    pub fn select(&self, indices: &[usize]) -> TrainingSet {
        TrainingSet {
            theta: self.theta.select(Axis(0), indices),
            x: self.x.select(Axis(0), indices),
            prior_mask: indices.iter().map(|&i| self.prior_mask[i]).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SampleBank {
    rounds: Vec<BankRound>,
}

impl SampleBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a round. Dimensions must agree with previously stored rounds.
    pub fn push(&mut self, theta: Array2<f32>, x: Array2<f32>, from_prior: bool) -> Result<usize> {
        if theta.nrows() != x.nrows() {
            return Err(Error::Shape("theta and x must have the same number of rows"));
        }
        if let Some(first) = self.rounds.first() {
            if theta.ncols() != first.theta.ncols() {
                return Err(Error::Shape("theta dimension changed between rounds"));
            }
            if x.ncols() != first.x.ncols() {
                return Err(Error::Shape("x dimension changed between rounds"));
            }
        }
        let round = self.rounds.len();
        self.rounds.push(BankRound {
            round,
            theta,
            x,
            from_prior,
        });
        Ok(round)
    }

    pub fn num_rounds(&self) -> usize {
        self.rounds.len()
    }

    /// Total stored pairs across all rounds.
    pub fn len(&self) -> usize {
        self.rounds.iter().map(|r| r.theta.nrows()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn round(&self, idx: usize) -> Option<&BankRound> {
        self.rounds.get(idx)
    }

    pub fn rounds(&self) -> impl Iterator<Item = &BankRound> {
        self.rounds.iter()
    }

    pub fn theta_dim(&self) -> Option<usize> {
        self.rounds.first().map(|r| r.theta.ncols())
    }

    pub fn x_dim(&self) -> Option<usize> {
        self.rounds.first().map(|r| r.x.ncols())
    }

    /// Concatenate rounds `start_round..` into one training set.
    pub fn concat(&self, start_round: usize) -> Result<TrainingSet> {
        let rounds = self.rounds.get(start_round..).unwrap_or(&[]);
        if rounds.is_empty() {
            return Err(Error::Domain("no stored rounds in the requested range"));
        }
        let thetas: Vec<_> = rounds.iter().map(|r| r.theta.view()).collect();
        let xs: Vec<_> = rounds.iter().map(|r| r.x.view()).collect();
        let theta = concatenate(Axis(0), &thetas)
            .map_err(|_| Error::Shape("stored theta rounds do not stack"))?;
        let x = concatenate(Axis(0), &xs).map_err(|_| Error::Shape("stored x rounds do not stack"))?;
        let prior_mask = rounds
            .iter()
            .flat_map(|r| std::iter::repeat(r.from_prior).take(r.theta.nrows()))
            .collect();
        Ok(TrainingSet {
            theta,
            x,
            prior_mask,
        })
    }
}
