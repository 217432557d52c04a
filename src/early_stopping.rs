//! Patience-based convergence control.
//!
//! After every epoch the validation log-probability is reported. Training stops when it has not
//! improved for `stop_after_epochs` consecutive epochs (convergence) or when the epoch ceiling is
//! reached. The first reported value always counts as an improvement.

/// Epoch ceiling used when none is configured (`2³¹ - 1`).
pub const DEFAULT_MAX_NUM_EPOCHS: usize = i32::MAX as usize;

#[derive(Debug, Clone)]
pub struct EarlyStopping {
    stop_after_epochs: usize,
    max_num_epochs: usize,
    epoch: usize,
    best_val_log_prob: f64,
    best_epoch: usize,
    epochs_since_last_improvement: usize,
}

impl EarlyStopping {
    pub fn new(stop_after_epochs: usize, max_num_epochs: Option<usize>) -> Self {
        Self {
            stop_after_epochs,
            max_num_epochs: max_num_epochs.unwrap_or(DEFAULT_MAX_NUM_EPOCHS),
            epoch: 0,
            best_val_log_prob: f64::NEG_INFINITY,
            best_epoch: 0,
            epochs_since_last_improvement: 0,
        }
    }

    /// Record one finished epoch. Returns `true` when it set a new best.
    pub fn observe(&mut self, val_log_prob: f64) -> bool {
        self.epoch += 1;
        if self.epoch == 1 || val_log_prob > self.best_val_log_prob {
            self.best_val_log_prob = val_log_prob;
            self.best_epoch = self.epoch;
            self.epochs_since_last_improvement = 0;
            true
        } else {
            self.epochs_since_last_improvement += 1;
            false
        }
    }

    pub fn converged(&self) -> bool {
        self.epoch > 0 && self.epochs_since_last_improvement >= self.stop_after_epochs
    }

    pub fn exhausted(&self) -> bool {
        self.epoch >= self.max_num_epochs
    }

    pub fn should_continue(&self) -> bool {
        !self.converged() && !self.exhausted()
    }

    /// Number of epochs observed so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn best_val_log_prob(&self) -> f64 {
        self.best_val_log_prob
    }

    /// 1-based epoch at which the best value was seen.
    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}
